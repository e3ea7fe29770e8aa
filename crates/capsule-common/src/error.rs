//! Unified error types for the Capsule workspace.
//!
//! Each launch stage has its own error enum. [`CapsuleError`] wraps all of
//! them so the orchestrator can surface one diagnostic naming the failing
//! stage, and maps each stage to the process exit code.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::types::NamespaceKind;

/// Exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for namespace and privilege setup errors.
pub const EXIT_SETUP: i32 = 2;
/// Exit code for mount errors.
pub const EXIT_MOUNT: i32 = 3;
/// Exit code when the target program could not be started.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit code when the target program does not exist.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Bad or contradictory options, detected before any OS-level action.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The root filesystem cannot be both read-only and carry a writable overlay.
    #[error("incompatible writability: readonly root with writable overlay {overlay}")]
    IncompatibleWritability {
        /// Overlay path requested as writable.
        overlay: PathBuf,
    },

    /// A requested feature is not available on this host.
    #[error("unsupported: {message}")]
    Unsupported {
        /// What is unsupported and why.
        message: String,
    },

    /// A capability name does not refer to a known Linux capability.
    #[error("unknown capability: {name}")]
    UnknownCapability {
        /// The offending name as given.
        name: String,
    },

    /// An option key is not recognized.
    #[error("unknown option: {key}")]
    UnknownOption {
        /// The unrecognized key.
        key: String,
    },

    /// An option carries a value of the wrong type or shape.
    #[error("invalid value for option {key}: {message}")]
    InvalidOption {
        /// Option key.
        key: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A bind specification could not be parsed or normalized.
    #[error("invalid bind specification \"{spec}\": {message}")]
    InvalidBind {
        /// The raw `src[:dest[:opts]]` string.
        spec: String,
        /// Description of the problem.
        message: String,
    },

    /// Two options exclude each other.
    #[error("conflicting options: {first} and {second}")]
    Conflict {
        /// First option key.
        first: &'static str,
        /// Second option key.
        second: &'static str,
    },

    /// A required option is absent.
    #[error("missing option: {key}")]
    Missing {
        /// Option key.
        key: &'static str,
    },

    /// The image reference does not resolve to a usable root filesystem.
    #[error("image {reference}: {message}")]
    Image {
        /// Image reference as given.
        reference: String,
        /// Description of the problem.
        message: String,
    },

    /// A named instance could not be resolved.
    #[error("instance {name}: {message}")]
    Instance {
        /// Instance name.
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// The engine configuration file is unreadable or malformed.
    #[error("engine configuration {path}: {message}")]
    File {
        /// Configuration file path.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },
}

/// Namespace creation or entry failed.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// The host kernel lacks the namespace type.
    #[error("unsupported: host kernel does not provide the {kind} namespace")]
    Unsupported {
        /// Namespace that is unavailable.
        kind: NamespaceKind,
    },

    /// The invoking identity may not create the namespace.
    #[error("insufficient privilege to create the {kind} namespace ({hint})")]
    InsufficientPrivilege {
        /// Namespace that could not be created.
        kind: NamespaceKind,
        /// Remediation hint.
        hint: &'static str,
    },

    /// A PID namespace was created but no init process runs inside it.
    #[error("init process required: {reason}")]
    InitProcessRequired {
        /// Why the init process is missing.
        reason: String,
    },

    /// A namespace syscall failed for another reason.
    #[error("{kind} namespace setup failed: {source}")]
    Syscall {
        /// Namespace being set up.
        kind: NamespaceKind,
        /// Underlying errno.
        source: Errno,
    },

    /// Writing the user namespace ID maps failed.
    #[error("writing {path} failed: {source}")]
    IdMap {
        /// Map file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Supervising the init process failed.
    #[error("waiting for init process failed: {source}")]
    Supervise {
        /// Underlying errno.
        source: Errno,
    },
}

/// Mount planning or staging failed.
#[derive(Debug, Error)]
pub enum MountError {
    /// A mount source does not exist.
    #[error("not found: {path}")]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },

    /// A mount source or target is not accessible.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// Inaccessible path.
        path: PathBuf,
    },

    /// A mount syscall failed.
    #[error("{operation} on {target} failed: {source}")]
    Syscall {
        /// Operation name (`bind`, `tmpfs`, `remount`, ...).
        operation: &'static str,
        /// Host path of the mount target.
        target: PathBuf,
        /// Underlying errno.
        source: Errno,
    },

    /// Too many symlinks while resolving a container path.
    #[error("too many levels of symbolic links resolving {path}")]
    SymlinkLoop {
        /// Container path being resolved.
        path: PathBuf,
    },

    /// Preparing a mountpoint or source directory failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl MountError {
    /// Classifies a failed filesystem probe of `path`.
    #[must_use]
    pub fn from_probe(path: PathBuf, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::PermissionDenied { path }
        }
    }
}

/// A privilege transition failed. Never leaves elevated privilege active.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// Reading or writing a capability set failed.
    #[error("capability operation failed: {message}")]
    Capability {
        /// Description from the capability layer.
        message: String,
    },

    /// Requested capabilities are not held by this process.
    #[error("capabilities not available to this process: {names}")]
    Unavailable {
        /// Comma-separated capability names.
        names: String,
    },

    /// Switching user or group identity failed.
    #[error("identity switch to uid {uid} gid {gid} failed: {source}")]
    Identity {
        /// Target user ID.
        uid: u32,
        /// Target group ID.
        gid: u32,
        /// Underlying errno.
        source: Errno,
    },

    /// A process control flag could not be set.
    #[error("prctl {flag} failed: {source}")]
    Prctl {
        /// Flag name.
        flag: &'static str,
        /// Underlying errno.
        source: Errno,
    },

    /// Capabilities outside the target set survived the drop.
    #[error("capabilities still permitted after drop: {names}")]
    Residual {
        /// Comma-separated capability names.
        names: String,
    },
}

/// The target program could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program does not exist inside the container.
    #[error("program not found: {program}")]
    NotFound {
        /// Program as requested.
        program: PathBuf,
    },

    /// The program exists but is not executable.
    #[error("program not executable: {program}")]
    NotExecutable {
        /// Program path.
        program: PathBuf,
    },

    /// The selected app is not installed inside the container.
    #[error("app {name} is not installed in the container")]
    UnknownApp {
        /// App name.
        name: String,
    },

    /// Changing to the working directory failed.
    #[error("cannot enter working directory {path}: {source}")]
    WorkingDirectory {
        /// Container path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Executing or spawning the program failed.
    #[error("starting {program} failed: {source}")]
    Start {
        /// Program path.
        program: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Waiting for the program failed.
    #[error("waiting for {program} failed: {message}")]
    Wait {
        /// Program path.
        program: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Top-level error surfaced by the launch engine.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Configuration stage failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Namespace stage failure.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    /// Mount stage failure.
    #[error(transparent)]
    Mount(#[from] MountError),
    /// Privilege stage failure.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    /// Launch stage failure.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl CapsuleError {
    /// Name of the stage that failed.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Namespace(_) => "namespace",
            Self::Mount(_) => "mount",
            Self::Privilege(_) => "privilege",
            Self::Launch(_) => "launch",
        }
    }

    /// Process exit code for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Namespace(_) | Self::Privilege(_) => EXIT_SETUP,
            Self::Mount(_) => EXIT_MOUNT,
            Self::Launch(LaunchError::NotFound { .. }) => EXIT_NOT_FOUND,
            Self::Launch(_) => EXIT_NOT_EXECUTABLE,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CapsuleError>;
