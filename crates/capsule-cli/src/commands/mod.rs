//! CLI command definitions and dispatch.

pub mod exec;
pub mod plan;
pub mod shell;

use std::path::{Path, PathBuf};

use anyhow::Context;
use capsule_common::config::EngineConfig;
use capsule_common::constants::{CONFIG_ENV, INSTANCE_SCHEME};
use capsule_common::options::OptionMap;
use capsule_runtime::engine::{Engine, report_failure};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Capsule: run programs inside an isolated container environment.
#[derive(Parser, Debug)]
#[command(name = "capsule", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (JSON).
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an interactive shell inside a container.
    Shell(shell::ShellArgs),
    /// Run a command inside a container.
    Exec(exec::ExecArgs),
    /// Print the namespaces and mounts a launch would set up.
    Plan(plan::PlanArgs),
}

/// Options shared by every subcommand that describes a launch.
#[derive(Args, Debug, Default)]
pub struct LaunchArgs {
    /// Root filesystem directory, or `instance://<name>`.
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Writable (`:rw`, default) or read-only (`:ro`) overlay directory.
    #[arg(long, value_name = "PATH[:ro|rw]")]
    pub overlay: Option<String>,

    /// Bind a host path: `src[:dest[:ro|rw]]`. Repeatable, comma-separated.
    #[arg(short = 'B', long, value_name = "SPEC")]
    pub bind: Vec<String>,

    /// Home directory to bind: `src[:dest]`.
    #[arg(short = 'H', long, value_name = "SPEC")]
    pub home: Option<String>,

    /// Host directory backing /tmp, /var/tmp and scratch directories.
    #[arg(short = 'W', long)]
    pub workdir: Option<String>,

    /// Empty writable directory inside the container. Repeatable.
    #[arg(short = 'S', long = "scratch", value_name = "DIR")]
    pub scratchdir: Vec<String>,

    /// Initial working directory inside the container.
    #[arg(long)]
    pub pwd: Option<String>,

    /// App whose environment to select.
    #[arg(long)]
    pub app: Option<String>,

    /// Hostname inside the container; implies a UTS namespace.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Run in a user namespace.
    /// `--userns` enables it, `--userns=false` disables it explicitly.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub userns: Option<bool>,

    /// Run in a PID namespace.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub pid: Option<bool>,

    /// Run in an IPC namespace.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub ipc: Option<bool>,

    /// Run in a network namespace with loopback only.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub net: Option<bool>,

    /// Run in a UTS namespace.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub uts: Option<bool>,

    /// Mount the root filesystem read-only.
    #[arg(long)]
    pub readonly: bool,

    /// Replace shared host directories with private empty ones.
    #[arg(short = 'c', long)]
    pub contain: bool,

    /// Contain files, PID, IPC and environment.
    #[arg(short = 'C', long)]
    pub containall: bool,

    /// Do not inherit the host environment.
    #[arg(short = 'e', long)]
    pub cleanenv: bool,

    /// Pass through NVIDIA device nodes.
    #[arg(long)]
    pub nv: bool,

    /// Run as root inside a user namespace.
    #[arg(short = 'f', long)]
    pub fakeroot: bool,

    /// Keep the capabilities of the invoking process.
    #[arg(long)]
    pub keep_privs: bool,

    /// Drop every capability, including added ones.
    #[arg(long)]
    pub no_privs: bool,

    /// Capabilities to grant, comma-separated.
    #[arg(long, value_name = "CAPS")]
    pub add_caps: Option<String>,

    /// Capabilities to remove, comma-separated.
    #[arg(long, value_name = "CAPS")]
    pub drop_caps: Option<String>,

    /// Allow setuid binaries inside the container.
    #[arg(long)]
    pub allow_setuid: bool,
}

impl LaunchArgs {
    /// Maps the flags given on the command line into an option map.
    ///
    /// Only flags actually given are set, so the resolver can tell an
    /// explicit `--userns=false` from an absent flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the image path cannot be made absolute.
    pub fn to_options(&self) -> anyhow::Result<OptionMap> {
        let image = if self.image.starts_with(INSTANCE_SCHEME) {
            self.image.clone()
        } else {
            std::path::absolute(Path::new(&self.image))
                .with_context(|| format!("cannot resolve image path {}", self.image))?
                .display()
                .to_string()
        };
        let mut options = OptionMap::new().with_value("image", image);

        for (key, value) in [
            ("overlay", &self.overlay),
            ("home", &self.home),
            ("workdir", &self.workdir),
            ("pwd", &self.pwd),
            ("app", &self.app),
            ("hostname", &self.hostname),
            ("add-caps", &self.add_caps),
            ("drop-caps", &self.drop_caps),
        ] {
            if let Some(value) = value {
                options.set_value(key, value.clone());
            }
        }
        for (key, values) in [("bind", &self.bind), ("scratchdir", &self.scratchdir)] {
            for value in values {
                options.push(key, value.clone());
            }
        }
        for (key, toggle) in [
            ("userns", self.userns),
            ("pid", self.pid),
            ("ipc", self.ipc),
            ("net", self.net),
            ("uts", self.uts),
        ] {
            if let Some(on) = toggle {
                options.set_flag(key, on);
            }
        }
        for (key, on) in [
            ("readonly", self.readonly),
            ("contain", self.contain),
            ("containall", self.containall),
            ("cleanenv", self.cleanenv),
            ("nv", self.nv),
            ("fakeroot", self.fakeroot),
            ("keep-privs", self.keep_privs),
            ("no-privs", self.no_privs),
            ("allow-setuid", self.allow_setuid),
        ] {
            if on {
                options.set_flag(key, true);
            }
        }
        Ok(options)
    }
}

/// Loads the engine configuration named by `--config` or the environment.
///
/// # Errors
///
/// Returns an error if the file exists but is unreadable or malformed.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine configuration {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Launches `options` and returns the exit code to terminate with.
fn launch(config: EngineConfig, options: &OptionMap) -> i32 {
    let mut engine = Engine::new(config);
    match engine.run(options) {
        Ok(code) => code,
        Err(e) => {
            report_failure(&e);
            e.exit_code()
        }
    }
}

/// Dispatches the parsed CLI command and returns the process exit code.
///
/// # Errors
///
/// Returns an error for CLI-level failures such as an unreadable
/// configuration file; engine failures are reported and mapped to
/// their exit code instead.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(?config, "engine configuration loaded");
    match cli.command {
        Command::Shell(args) => shell::execute(args, config),
        Command::Exec(args) => exec::execute(args, config),
        Command::Plan(args) => plan::execute(&args, config),
    }
}

#[cfg(test)]
mod tests {
    use capsule_common::options::OptionValue;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn shell_flags_become_options() {
        let cli = parse(&[
            "capsule",
            "shell",
            "-c",
            "--pid",
            "--userns=false",
            "-B",
            "/data:/mnt:ro",
            "--bind",
            "/a",
            "--add-caps",
            "CAP_NET_RAW",
            "/images/alpine",
        ]);
        let Command::Shell(args) = cli.command else {
            panic!("expected shell");
        };
        let options = args.launch.to_options().unwrap();
        assert_eq!(options.get("contain"), Some(&OptionValue::Bool(true)));
        assert_eq!(options.get("pid"), Some(&OptionValue::Bool(true)));
        assert_eq!(options.get("userns"), Some(&OptionValue::Bool(false)));
        assert_eq!(options.get("net"), None);
        assert_eq!(
            options.get("bind"),
            Some(&OptionValue::List(vec!["/data:/mnt:ro".into(), "/a".into()]))
        );
        assert_eq!(
            options.get("image"),
            Some(&OptionValue::Str("/images/alpine".into()))
        );
        assert_eq!(
            options.get("add-caps"),
            Some(&OptionValue::Str("CAP_NET_RAW".into()))
        );
    }

    #[test]
    fn relative_images_are_made_absolute_and_instances_kept() {
        let args = LaunchArgs {
            image: "rootfs".into(),
            ..LaunchArgs::default()
        };
        let Some(OptionValue::Str(image)) = args.to_options().unwrap().get("image").cloned()
        else {
            panic!("image missing");
        };
        assert!(Path::new(&image).is_absolute());
        assert!(image.ends_with("/rootfs"));

        let args = LaunchArgs {
            image: "instance://web".into(),
            ..LaunchArgs::default()
        };
        assert_eq!(
            args.to_options().unwrap().get("image"),
            Some(&OptionValue::Str("instance://web".into()))
        );
    }

    #[test]
    fn exec_takes_the_trailing_command() {
        let cli = parse(&["capsule", "exec", "--cleanenv", "/img", "ls", "-la", "/"]);
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, vec!["ls", "-la", "/"]);
        assert!(args.launch.cleanenv);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }
}
