//! The validated, immutable description of one launch.
//!
//! A [`LaunchSpec`] is built once by [`crate::resolver::resolve`] and only
//! read afterwards. [`LaunchSpec::to_options`] renders it back into the
//! canonical option map, so resolving that map again yields the same spec.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use capsule_common::constants::INSTANCE_SCHEME;
use capsule_common::error::ConfigError;
use capsule_common::options::OptionMap;
use capsule_common::types::{AccessMode, NamespaceKind};
use capsule_core::filesystem::resolve::normalize;
use capsule_core::privilege::{PrivilegePosture, Retention};

/// Where the container root comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// A root filesystem directory on the host.
    Path(PathBuf),
    /// An already-running named instance.
    Instance(String),
}

impl ImageRef {
    /// Parses an image reference.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Image`] for relative paths or empty instance names.
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        if let Some(name) = reference.strip_prefix(INSTANCE_SCHEME) {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::Image {
                    reference: reference.to_owned(),
                    message: "instance name must be non-empty and contain no '/'".into(),
                });
            }
            return Ok(Self::Instance(name.to_owned()));
        }
        let path = Path::new(reference);
        if !path.is_absolute() {
            return Err(ConfigError::Image {
                reference: reference.to_owned(),
                message: "image path must be absolute".into(),
            });
        }
        Ok(Self::Path(path.to_path_buf()))
    }

    /// Short name shown in the prompt and the `CAPSULE_NAME` marker.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map_or_else(|| "/".to_owned(), |n| n.to_string_lossy().into_owned()),
            Self::Instance(name) => name.clone(),
        }
    }

    /// Returns `true` for instance references.
    #[must_use]
    pub const fn is_instance(&self) -> bool {
        matches!(self, Self::Instance(_))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Instance(name) => write!(f, "{INSTANCE_SCHEME}{name}"),
        }
    }
}

/// A host path exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host path.
    pub source: PathBuf,
    /// Container path.
    pub dest: PathBuf,
    /// Access mode.
    pub mode: AccessMode,
}

impl BindSpec {
    /// Parses `src[:dest[:opts]]`, where `opts` is `ro` or `rw`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBind`] for relative paths, destinations
    /// escaping the root, or unknown options.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidBind {
            spec: spec.to_owned(),
            message,
        };
        let mut parts = spec.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let dest = parts.next().filter(|d| !d.is_empty()).unwrap_or(source);
        let mode = match parts.next() {
            None | Some("") => AccessMode::default(),
            Some(opts) => opts.parse().map_err(invalid)?,
        };
        Ok(Self {
            source: absolute(source).ok_or_else(|| invalid("source must be an absolute path".into()))?,
            dest: absolute(dest)
                .ok_or_else(|| invalid("destination must be absolute and stay inside the container".into()))?,
            mode,
        })
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source.display(),
            self.dest.display(),
            self.mode
        )
    }
}

/// An overlay directory stacked above the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    /// Host directory holding the overlay.
    pub path: PathBuf,
    /// Whether writes land in the overlay.
    pub writable: bool,
}

impl OverlaySpec {
    /// Parses `path[:ro|rw]`; overlays are writable unless marked `ro`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for relative paths or unknown modes.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let (path, mode) = match value.rsplit_once(':') {
            Some((path, mode)) if mode == "ro" || mode == "rw" => (path, mode),
            _ => (value, "rw"),
        };
        let path = absolute(path).ok_or_else(|| ConfigError::InvalidOption {
            key: "overlay",
            message: format!("\"{value}\" is not an absolute path"),
        })?;
        Ok(Self {
            path,
            writable: mode == "rw",
        })
    }
}

impl fmt::Display for OverlaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.writable { "rw" } else { "ro" };
        write!(f, "{}:{mode}", self.path.display())
    }
}

/// Home directory override: a host directory shown at a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeSpec {
    /// Host directory.
    pub source: PathBuf,
    /// Container path; defaults to the source path.
    pub dest: PathBuf,
}

impl HomeSpec {
    /// Parses `src[:dest]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for relative or escaping paths.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let (source, dest) = value.split_once(':').unwrap_or((value, value));
        let invalid = || ConfigError::InvalidOption {
            key: "home",
            message: format!("\"{value}\" must be src[:dest] with absolute paths"),
        };
        Ok(Self {
            source: absolute(source).ok_or_else(invalid)?,
            dest: absolute(dest).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for HomeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.display(), self.dest.display())
    }
}

/// The program run inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProgram {
    /// Program path or name looked up in `PATH`.
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// `true` when the program is the interactive shell.
    pub shell: bool,
}

/// Validated launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Root filesystem source.
    pub image: ImageRef,
    /// Namespaces to create; always holds [`NamespaceKind::Mount`] unless joining.
    pub namespaces: BTreeSet<NamespaceKind>,
    /// User binds in the order given.
    pub mounts: Vec<BindSpec>,
    /// Overlay stacked over the image.
    pub overlay: Option<OverlaySpec>,
    /// Home directory override.
    pub home: Option<HomeSpec>,
    /// Host directory backing `/tmp`, `/var/tmp`, and scratch directories.
    pub workdir: Option<PathBuf>,
    /// Container paths given fresh empty directories.
    pub scratch: Vec<PathBuf>,
    /// Initial working directory inside the container.
    pub pwd: Option<PathBuf>,
    /// Selected app environment.
    pub app: Option<String>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// Replace shared host directories with private ones.
    pub contain: bool,
    /// Full containment: implies `contain`, `cleanenv`, PID and IPC namespaces.
    pub containall: bool,
    /// Start from a scrubbed environment.
    pub cleanenv: bool,
    /// Force a read-only root.
    pub readonly: bool,
    /// GPU device pass-through.
    pub nv: bool,
    /// Privilege options.
    pub privileges: PrivilegePosture,
    /// Program to run.
    pub target: TargetProgram,
}

impl LaunchSpec {
    /// Returns `true` if `kind` will be created.
    #[must_use]
    pub fn wants(&self, kind: NamespaceKind) -> bool {
        self.namespaces.contains(&kind)
    }

    /// Renders this launch spec as the canonical option map.
    #[must_use]
    pub fn to_options(&self) -> OptionMap {
        let mut map = OptionMap::new().with_value("image", self.image.to_string());
        for kind in &self.namespaces {
            if let Some(key) = kind.option_key() {
                map.set_flag(key, true);
            }
        }
        for bind in &self.mounts {
            map.push("bind", bind.to_string());
        }
        if let Some(overlay) = &self.overlay {
            map.set_value("overlay", overlay.to_string());
        }
        if let Some(home) = &self.home {
            map.set_value("home", home.to_string());
        }
        if let Some(workdir) = &self.workdir {
            map.set_value("workdir", workdir.display().to_string());
        }
        for dir in &self.scratch {
            map.push("scratchdir", dir.display().to_string());
        }
        if let Some(pwd) = &self.pwd {
            map.set_value("pwd", pwd.display().to_string());
        }
        if let Some(app) = &self.app {
            map.set_value("app", app.clone());
        }
        if let Some(hostname) = &self.hostname {
            map.set_value("hostname", hostname.clone());
        }
        for (key, on) in [
            ("contain", self.contain),
            ("containall", self.containall),
            ("cleanenv", self.cleanenv),
            ("readonly", self.readonly),
            ("nv", self.nv),
            ("fakeroot", self.privileges.fakeroot),
            ("allow-setuid", self.privileges.allow_setuid),
            ("keep-privs", self.privileges.retention == Retention::KeepPrivs),
            ("no-privs", self.privileges.retention == Retention::NoPrivs),
        ] {
            if on {
                map.set_flag(key, true);
            }
        }
        if !self.privileges.add_caps.is_empty() {
            map.set_value("add-caps", self.privileges.add_caps.to_list());
        }
        if !self.privileges.drop_caps.is_empty() {
            map.set_value("drop-caps", self.privileges.drop_caps.to_list());
        }
        if self.target.shell {
            map.set_value("shell", self.target.program.display().to_string());
        } else {
            let mut command = vec![self.target.program.display().to_string()];
            command.extend(self.target.args.iter().cloned());
            map.set_list("command", command);
        }
        map
    }
}

/// Lexically normalized absolute path, or `None`.
pub(crate) fn absolute(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        normalize(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_dest_and_mode() {
        let bind = BindSpec::parse("/data").unwrap();
        assert_eq!(bind.dest, PathBuf::from("/data"));
        assert_eq!(bind.mode, AccessMode::ReadWrite);
        assert_eq!(bind.to_string(), "/data:/data:rw");
    }

    #[test]
    fn bind_parses_full_triplet() {
        let bind = BindSpec::parse("/data:/mnt:ro").unwrap();
        assert_eq!(bind.source, PathBuf::from("/data"));
        assert_eq!(bind.dest, PathBuf::from("/mnt"));
        assert!(bind.mode.is_read_only());
    }

    #[test]
    fn bind_rejects_escaping_or_relative_paths() {
        assert!(matches!(
            BindSpec::parse("/data:/../../etc"),
            Err(ConfigError::InvalidBind { .. })
        ));
        assert!(matches!(
            BindSpec::parse("data:/mnt"),
            Err(ConfigError::InvalidBind { .. })
        ));
        assert!(matches!(
            BindSpec::parse("/data:/mnt:exec"),
            Err(ConfigError::InvalidBind { .. })
        ));
    }

    #[test]
    fn bind_dest_is_normalized() {
        let bind = BindSpec::parse("/data/:/mnt/./x/../y").unwrap();
        assert_eq!(bind.dest, PathBuf::from("/mnt/y"));
    }

    #[test]
    fn overlay_mode_suffix() {
        assert!(OverlaySpec::parse("/ov").unwrap().writable);
        assert!(!OverlaySpec::parse("/ov:ro").unwrap().writable);
        assert_eq!(OverlaySpec::parse("/ov:ro").unwrap().path, PathBuf::from("/ov"));
        assert!(OverlaySpec::parse("ov").is_err());
    }

    #[test]
    fn image_reference_forms() {
        assert_eq!(
            ImageRef::parse("instance://web").unwrap(),
            ImageRef::Instance("web".into())
        );
        assert_eq!(
            ImageRef::parse("/images/alpine").unwrap().display_name(),
            "alpine"
        );
        assert!(ImageRef::parse("alpine").is_err());
        assert!(ImageRef::parse("instance://").is_err());
    }

    #[test]
    fn home_defaults_dest_to_source() {
        let home = HomeSpec::parse("/srv/alice").unwrap();
        assert_eq!(home.dest, PathBuf::from("/srv/alice"));
        let home = HomeSpec::parse("/srv/alice:/home/alice").unwrap();
        assert_eq!(home.to_string(), "/srv/alice:/home/alice");
    }
}
