//! Process launch inside the finished container.
//!
//! [`ProcessLauncher`] is built before any OS state changes, from the
//! spec, the engine configuration and the captured host environment.
//! Everything that inspects the container filesystem (working directory,
//! program lookup, app root) runs only after the root switch.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};

use capsule_common::config::EngineConfig;
use capsule_common::constants::{
    ENV_APPNAME, ENV_CONTAINER, ENV_NAME, ENV_PREFIX, SCIF_APPS_DIR, SCIF_DATA_DIR,
};
use capsule_common::error::LaunchError;
use capsule_common::types::LaunchMode;
use capsule_core::namespace::pid;
use capsule_core::privilege::DroppedPrivileges;
use nix::unistd::{AccessFlags, Pid};

use crate::host::HostContext;
use crate::spec::LaunchSpec;

/// Host variables kept in a scrubbed environment.
const CLEAN_ENV_KEEP: &[&str] = &["TERM", "LANG"];

/// Final program, arguments, environment and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    pwd: Option<PathBuf>,
    home: Option<PathBuf>,
    app: Option<String>,
}

impl ProcessLauncher {
    /// Derives the launch environment for `spec`.
    #[must_use]
    pub fn new(spec: &LaunchSpec, config: &EngineConfig, host: &HostContext) -> Self {
        let home = spec
            .home
            .as_ref()
            .map(|h| h.dest.clone())
            .or_else(|| host.home.clone());
        let env = environment(spec, config, host, home.as_deref());
        Self {
            program: spec.target.program.clone(),
            args: spec.target.args.clone(),
            env,
            pwd: spec.pwd.clone(),
            home,
            app: spec.app.clone(),
        }
    }

    /// Program as requested.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The environment handed to the program.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Verifies the selected app is installed under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::UnknownApp`] if its app root is missing.
    pub fn check_app(&self, root: &Path) -> Result<(), LaunchError> {
        let Some(app) = &self.app else {
            return Ok(());
        };
        let app_root = root.join(SCIF_APPS_DIR.trim_start_matches('/')).join(app);
        if app_root.is_dir() {
            Ok(())
        } else {
            Err(LaunchError::UnknownApp { name: app.clone() })
        }
    }

    /// Initial working directory: `pwd`, else home, else `/`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::WorkingDirectory`] if an explicit `pwd` is
    /// not a directory.
    pub fn working_directory(&self) -> Result<PathBuf, LaunchError> {
        if let Some(pwd) = &self.pwd {
            return match std::fs::metadata(pwd) {
                Ok(meta) if meta.is_dir() => Ok(pwd.clone()),
                Ok(_) => Err(LaunchError::WorkingDirectory {
                    path: pwd.clone(),
                    source: io::Error::from(io::ErrorKind::NotADirectory),
                }),
                Err(source) => Err(LaunchError::WorkingDirectory {
                    path: pwd.clone(),
                    source,
                }),
            };
        }
        match &self.home {
            Some(home) if home.is_dir() => Ok(home.clone()),
            Some(home) => {
                tracing::warn!(home = %home.display(), "home not present in container, starting in /");
                Ok(PathBuf::from("/"))
            }
            None => Ok(PathBuf::from("/")),
        }
    }

    /// Locates the program, searching `PATH` for bare names.
    ///
    /// Relative paths such as `./tool` are taken from `cwd`, the directory
    /// the program will run in.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::NotFound`] or [`LaunchError::NotExecutable`].
    pub fn resolve_program(&self, cwd: &Path) -> Result<PathBuf, LaunchError> {
        if self.program.components().count() > 1 {
            let program = cwd.join(&self.program);
            if std::fs::symlink_metadata(&program).is_err() {
                return Err(LaunchError::NotFound {
                    program: self.program.clone(),
                });
            }
            if program.is_dir() || nix::unistd::access(&program, AccessFlags::X_OK).is_err() {
                return Err(LaunchError::NotExecutable {
                    program: self.program.clone(),
                });
            }
            return Ok(program);
        }
        let path = self.env.get("PATH").map_or("", String::as_str);
        which::which_in(&self.program, Some(path), cwd).map_err(|_| LaunchError::NotFound {
            program: self.program.clone(),
        })
    }

    /// Builds the [`Command`] without starting it.
    ///
    /// # Errors
    ///
    /// Returns a [`LaunchError`] if the working directory or the program
    /// cannot be used.
    pub fn command(&self) -> Result<Command, LaunchError> {
        let cwd = self.working_directory()?;
        let program = self.resolve_program(&cwd)?;
        let mut command = Command::new(&program);
        let _ = command
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&cwd);
        tracing::debug!(
            program = %program.display(),
            args = ?self.args,
            cwd = %cwd.display(),
            "target command prepared"
        );
        Ok(command)
    }

    /// Starts the program as a child; used by a PID namespace init.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Start`] if spawning fails.
    pub fn spawn(&self, _dropped: &DroppedPrivileges) -> Result<Child, LaunchError> {
        self.command()?
            .spawn()
            .map_err(|source| self.start_error(source))
    }

    /// Runs the program and returns its exit code.
    ///
    /// With [`LaunchMode::Exec`] this only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns a [`LaunchError`] if the program cannot be started or awaited.
    pub fn run(&self, mode: LaunchMode, _dropped: &DroppedPrivileges) -> Result<i32, LaunchError> {
        let mut command = self.command()?;
        match mode {
            LaunchMode::Exec => {
                tracing::info!(program = %self.program.display(), "executing target");
                let source = command.exec();
                Err(self.start_error(source))
            }
            LaunchMode::Spawn => {
                let mut child = command.spawn().map_err(|source| self.start_error(source))?;
                self.relay_signals_to(&child);
                let waited = child.wait();
                pid::stop_forwarding();
                let status = waited.map_err(|e| LaunchError::Wait {
                    program: self.program.clone(),
                    message: e.to_string(),
                })?;
                status_code(status).ok_or_else(|| LaunchError::Wait {
                    program: self.program.clone(),
                    message: format!("unexpected status {status}"),
                })
            }
        }
    }

    /// Termination signals sent to the engine while it waits reach the
    /// target instead of orphaning it.
    fn relay_signals_to(&self, child: &Child) {
        let Ok(raw) = i32::try_from(child.id()) else {
            tracing::warn!(pid = child.id(), "signal forwarding unavailable");
            return;
        };
        if let Err(e) = pid::forward_signals_to(Pid::from_raw(raw)) {
            tracing::warn!(program = %self.program.display(), error = %e, "signal forwarding unavailable");
        }
    }

    fn start_error(&self, source: io::Error) -> LaunchError {
        let program = self.program.clone();
        match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound { program },
            io::ErrorKind::PermissionDenied => LaunchError::NotExecutable { program },
            _ => LaunchError::Start { program, source },
        }
    }
}

/// Converts an exit status to a shell-style code (`128 + signal` for signals).
#[must_use]
pub fn status_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
}

fn environment(
    spec: &LaunchSpec,
    config: &EngineConfig,
    host: &HostContext,
    home: Option<&Path>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = if spec.cleanenv {
        host.env
            .iter()
            .filter(|(key, _)| CLEAN_ENV_KEEP.contains(&key.as_str()))
            .cloned()
            .collect()
    } else {
        host.env
            .iter()
            .filter(|(key, _)| {
                !key.starts_with(ENV_PREFIX) && !config.filtered_env.iter().any(|f| f == key)
            })
            .cloned()
            .collect()
    };

    if spec.cleanenv || !env.contains_key("PATH") {
        let _ = env.insert("PATH".into(), config.default_path.clone());
    }
    match home {
        Some(home) => {
            let _ = env.insert("HOME".into(), home.display().to_string());
        }
        None => {
            let _ = env.remove("HOME");
        }
    }

    let name = spec.image.display_name();
    let _ = env.insert(ENV_CONTAINER.into(), spec.image.to_string());
    let _ = env.insert("PS1".into(), format!("Capsule {name}> "));
    let _ = env.insert(ENV_NAME.into(), name);

    if let Some(app) = &spec.app {
        let app_root = format!("{SCIF_APPS_DIR}/{app}");
        let path = env.get("PATH").map_or_else(String::new, Clone::clone);
        let _ = env.insert("PATH".into(), format!("{app_root}/bin:{path}"));
        let _ = env.insert(ENV_APPNAME.into(), app.clone());
        let _ = env.insert("SCIF_APPNAME".into(), app.clone());
        let _ = env.insert("SCIF_APPROOT".into(), app_root);
        let _ = env.insert("SCIF_APPDATA".into(), format!("{SCIF_DATA_DIR}/{app}"));
    }
    env
}

#[cfg(test)]
mod tests {
    use capsule_common::options::OptionMap;
    use capsule_core::privilege::Identity;

    use super::*;
    use crate::host::HostSupport;
    use crate::resolver::{ResolveContext, resolve};

    fn host(env: &[(&str, &str)]) -> HostContext {
        HostContext {
            support: HostSupport::full(),
            identity: Identity::current(),
            home: Some(PathBuf::from("/home/alice")),
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    fn launcher(options: OptionMap, host: &HostContext) -> ProcessLauncher {
        let options = options.with_value("image", "/images/alpine");
        let spec = resolve(
            &options,
            &ResolveContext {
                host: HostSupport::full(),
                default_shell: PathBuf::from("/bin/sh"),
            },
        )
        .unwrap();
        ProcessLauncher::new(&spec, &EngineConfig::default(), host)
    }

    #[test]
    fn inherited_environment_drops_host_state() {
        let host = host(&[
            ("PATH", "/opt/bin:/usr/bin"),
            ("LD_PRELOAD", "/lib/evil.so"),
            ("PS1", "$ "),
            ("CAPSULE_CONTAINER", "/outer"),
            ("EDITOR", "vi"),
        ]);
        let env = launcher(OptionMap::new(), &host).env().clone();
        assert_eq!(env["PATH"], "/opt/bin:/usr/bin");
        assert_eq!(env["EDITOR"], "vi");
        assert!(!env.contains_key("LD_PRELOAD"));
        assert_eq!(env["CAPSULE_CONTAINER"], "/images/alpine");
        assert_eq!(env["CAPSULE_NAME"], "alpine");
        assert_eq!(env["PS1"], "Capsule alpine> ");
        assert_eq!(env["HOME"], "/home/alice");
    }

    #[test]
    fn clean_environment_keeps_only_the_minimal_set() {
        let host = host(&[("PATH", "/opt/bin"), ("EDITOR", "vi"), ("TERM", "xterm")]);
        let env = launcher(OptionMap::new().with_flag("cleanenv", true), &host)
            .env()
            .clone();
        let keys: Vec<&str> = env.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["CAPSULE_CONTAINER", "CAPSULE_NAME", "HOME", "PATH", "PS1", "TERM"]
        );
        assert_eq!(env["PATH"], capsule_common::constants::DEFAULT_PATH);
    }

    #[test]
    fn app_selects_its_environment_subset() {
        let host = host(&[("PATH", "/usr/bin")]);
        let launch = launcher(OptionMap::new().with_value("app", "foo"), &host);
        let env = launch.env();
        assert_eq!(env["PATH"], "/scif/apps/foo/bin:/usr/bin");
        assert_eq!(env["CAPSULE_APPNAME"], "foo");
        assert_eq!(env["SCIF_APPROOT"], "/scif/apps/foo");
        assert_eq!(env["SCIF_APPDATA"], "/scif/data/foo");

        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            launch.check_app(root.path()),
            Err(LaunchError::UnknownApp { name }) if name == "foo"
        ));
        std::fs::create_dir_all(root.path().join("scif/apps/foo")).unwrap();
        launch.check_app(root.path()).unwrap();
    }

    #[test]
    fn working_directory_prefers_pwd_then_home() {
        let dir = tempfile::tempdir().unwrap();
        let pwd = dir.path().display().to_string();
        let host = host(&[]);
        let launch = launcher(OptionMap::new().with_value("pwd", pwd.as_str()), &host);
        assert_eq!(launch.working_directory().unwrap(), dir.path());

        let missing = dir.path().join("absent").display().to_string();
        let launch = launcher(OptionMap::new().with_value("pwd", missing), &host);
        assert!(matches!(
            launch.working_directory(),
            Err(LaunchError::WorkingDirectory { .. })
        ));

        // /home/alice does not exist on the test host
        let launch = launcher(OptionMap::new(), &host);
        assert_eq!(launch.working_directory().unwrap(), Path::new("/"));
    }

    #[test]
    fn program_resolution_classifies_failures() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let host = host(&[("PATH", "/usr/bin:/bin")]);

        let launch = launcher(
            OptionMap::new().with_value("shell", script.display().to_string()),
            &host,
        );
        assert!(matches!(
            launch.resolve_program(dir.path()),
            Err(LaunchError::NotExecutable { .. })
        ));

        let launch = launcher(
            OptionMap::new().with_value("shell", "/no/such/program"),
            &host,
        );
        assert!(matches!(
            launch.resolve_program(dir.path()),
            Err(LaunchError::NotFound { .. })
        ));
    }

    #[test]
    fn relative_program_is_found_from_the_working_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        let tool = dir.path().join("bin/tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let launch = launcher(OptionMap::new().with_item("command", "./bin/tool"), &host(&[]));

        assert_eq!(launch.resolve_program(dir.path()).unwrap(), dir.path().join("./bin/tool"));
        let elsewhere = tempfile::tempdir().unwrap();
        assert!(matches!(
            launch.resolve_program(elsewhere.path()),
            Err(LaunchError::NotFound { .. })
        ));
    }

    #[test]
    fn command_runs_with_the_prepared_environment() {
        let host = host(&[("PATH", "/usr/bin:/bin")]);
        let launch = launcher(
            OptionMap::new()
                .with_item("command", "sh")
                .with_item("command", "-c")
                .with_item("command", "printf %s \"$CAPSULE_NAME\""),
            &host,
        );
        let output = launch.command().unwrap().output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "alpine");
    }

    #[test]
    fn signals_map_to_128_plus_signal() {
        let status = Command::new("/bin/sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(status_code(status), Some(143));
        let status = Command::new("/bin/sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(status_code(status), Some(3));
    }
}
