//! Config Resolver: raw options to a validated [`LaunchSpec`].
//!
//! Resolution is a pure function of the option map and the
//! [`ResolveContext`]. It touches no files and makes no syscalls, so
//! every error here is reported before any OS-level action is taken.

use std::collections::BTreeSet;
use std::path::PathBuf;

use capsule_common::error::ConfigError;
use capsule_common::options::OptionMap;
use capsule_common::types::NamespaceKind;
use capsule_core::capability::CapabilitySet;
use capsule_core::namespace::uts::is_valid_hostname;
use capsule_core::privilege::{PrivilegePosture, Retention};

use crate::host::HostSupport;
use crate::spec::{BindSpec, HomeSpec, ImageRef, LaunchSpec, OverlaySpec, TargetProgram, absolute};

/// Options that make no sense when joining a running instance.
const INSTANCE_EXCLUSIVE: [&str; 16] = [
    "overlay",
    "bind",
    "home",
    "workdir",
    "scratchdir",
    "contain",
    "containall",
    "readonly",
    "nv",
    "hostname",
    "fakeroot",
    "userns",
    "pid",
    "ipc",
    "net",
    "uts",
];

/// Host facts resolution depends on.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Kernel feature support.
    pub host: HostSupport,
    /// Shell used when the options name neither `shell` nor `command`.
    pub default_shell: PathBuf,
}

/// Resolves `options` into a [`LaunchSpec`].
///
/// # Errors
///
/// Returns the first [`ConfigError`] found: unknown keys, malformed
/// values, mutually exclusive options, or features the host lacks.
pub fn resolve(options: &OptionMap, ctx: &ResolveContext) -> Result<LaunchSpec, ConfigError> {
    options.check_known()?;

    let image = ImageRef::parse(options.value("image")?.ok_or(ConfigError::Missing { key: "image" })?)?;
    if image.is_instance() {
        if let Some(key) = INSTANCE_EXCLUSIVE.iter().copied().find(|k| options.contains(k)) {
            return Err(ConfigError::Conflict {
                first: "image",
                second: key,
            });
        }
    }

    let containall = options.enabled("containall")?;
    let contain = containall || options.enabled("contain")?;
    let cleanenv = containall || options.enabled("cleanenv")?;
    let fakeroot = options.enabled("fakeroot")?;
    let hostname = match options.value("hostname")? {
        Some(name) if !is_valid_hostname(name) => {
            return Err(ConfigError::InvalidOption {
                key: "hostname",
                message: format!("\"{name}\" is not a valid hostname"),
            });
        }
        other => other.map(str::to_owned),
    };

    let namespaces = if image.is_instance() {
        BTreeSet::new()
    } else {
        let mut namespaces = BTreeSet::from([NamespaceKind::Mount]);
        for (kind, implied_by) in [
            (NamespaceKind::User, fakeroot.then_some("fakeroot")),
            (NamespaceKind::Pid, containall.then_some("containall")),
            (NamespaceKind::Ipc, containall.then_some("containall")),
            (NamespaceKind::Uts, hostname.as_ref().map(|_| "hostname")),
            (NamespaceKind::Net, None),
        ] {
            let Some(key) = kind.option_key() else {
                continue;
            };
            match (options.flag(key)?, implied_by) {
                (Some(false), Some("fakeroot")) => {
                    return Err(ConfigError::Unsupported {
                        message: "fakeroot requires a user namespace, but userns is disabled".into(),
                    });
                }
                (Some(false), Some(first)) => {
                    return Err(ConfigError::Conflict { first, second: key });
                }
                (Some(true), _) | (None, Some(_)) => {
                    let _ = namespaces.insert(kind);
                }
                (Some(false) | None, None) => {}
            }
        }
        namespaces
    };
    if fakeroot && !ctx.host.user_namespaces {
        return Err(ConfigError::Unsupported {
            message: "fakeroot requires user namespaces, which this host does not allow".into(),
        });
    }
    if let Some(kind) = namespaces.iter().find(|k| !ctx.host.namespaces.contains(k)) {
        return Err(ConfigError::Unsupported {
            message: format!("this kernel does not provide {kind} namespaces"),
        });
    }

    let privileges = posture(options, fakeroot)?;

    let overlay = options.value("overlay")?.map(OverlaySpec::parse).transpose()?;
    let readonly = options.enabled("readonly")?;
    if let Some(overlay) = overlay.as_ref().filter(|o| o.writable && readonly) {
        return Err(ConfigError::IncompatibleWritability {
            overlay: overlay.path.clone(),
        });
    }

    let mut mounts = Vec::new();
    for item in options.items("bind")? {
        for spec in item.split(',').filter(|s| !s.is_empty()) {
            mounts.push(BindSpec::parse(spec)?);
        }
    }

    let home = options.value("home")?.map(HomeSpec::parse).transpose()?;
    let workdir = options
        .value("workdir")?
        .map(|w| path_option("workdir", w))
        .transpose()?;
    let mut scratch = Vec::new();
    for item in options.items("scratchdir")? {
        for dir in item.split(',').filter(|s| !s.is_empty()) {
            scratch.push(path_option("scratchdir", dir)?);
        }
    }
    let pwd = options.value("pwd")?.map(|p| path_option("pwd", p)).transpose()?;
    let app = match options.value("app")? {
        Some(name) if name.contains('/') || name.starts_with('.') => {
            return Err(ConfigError::InvalidOption {
                key: "app",
                message: format!("\"{name}\" is not an app name"),
            });
        }
        other => other.map(str::to_owned),
    };

    let target = target_program(options, ctx)?;

    let spec = LaunchSpec {
        image,
        namespaces,
        mounts,
        overlay,
        home,
        workdir,
        scratch,
        pwd,
        app,
        hostname,
        contain,
        containall,
        cleanenv,
        readonly,
        nv: options.enabled("nv")?,
        privileges,
        target,
    };
    tracing::debug!(
        image = %spec.image,
        namespaces = ?spec.namespaces,
        binds = spec.mounts.len(),
        "options resolved"
    );
    Ok(spec)
}

fn posture(options: &OptionMap, fakeroot: bool) -> Result<PrivilegePosture, ConfigError> {
    let keep = options.enabled("keep-privs")?;
    let none = options.enabled("no-privs")?;
    let add_caps = capability_list(options, "add-caps")?;
    let drop_caps = capability_list(options, "drop-caps")?;
    if keep && none {
        return Err(ConfigError::Conflict {
            first: "keep-privs",
            second: "no-privs",
        });
    }
    if keep && !drop_caps.is_empty() {
        return Err(ConfigError::Conflict {
            first: "keep-privs",
            second: "drop-caps",
        });
    }
    let retention = if keep {
        Retention::KeepPrivs
    } else if none {
        Retention::NoPrivs
    } else {
        Retention::Standard
    };
    Ok(PrivilegePosture {
        fakeroot,
        retention,
        add_caps,
        drop_caps,
        allow_setuid: options.enabled("allow-setuid")?,
    })
}

fn capability_list(options: &OptionMap, key: &'static str) -> Result<CapabilitySet, ConfigError> {
    options
        .items(key)?
        .into_iter()
        .try_fold(CapabilitySet::new(), |acc, item| {
            Ok(acc.union(&CapabilitySet::parse_list(item)?))
        })
}

fn target_program(options: &OptionMap, ctx: &ResolveContext) -> Result<TargetProgram, ConfigError> {
    let shell = options.value("shell")?;
    let command = options.items("command")?;
    match (shell, command.split_first()) {
        (Some(_), Some(_)) => Err(ConfigError::Conflict {
            first: "shell",
            second: "command",
        }),
        (_, Some((program, args))) => Ok(TargetProgram {
            program: PathBuf::from(program),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            shell: false,
        }),
        (shell, None) => Ok(TargetProgram {
            program: shell.map_or_else(|| ctx.default_shell.clone(), PathBuf::from),
            args: Vec::new(),
            shell: true,
        }),
    }
}

fn path_option(key: &'static str, value: &str) -> Result<PathBuf, ConfigError> {
    absolute(value).ok_or_else(|| ConfigError::InvalidOption {
        key,
        message: format!("\"{value}\" is not an absolute path"),
    })
}
