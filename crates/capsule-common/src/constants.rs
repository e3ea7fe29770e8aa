//! System-wide constants and default paths.

use std::path::PathBuf;

/// Application name used in diagnostics and marker variables.
pub const APP_NAME: &str = "capsule";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "capsule";

/// Platform default shell when neither the options nor the config name one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// PATH handed to the target program when the environment is scrubbed.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Scheme prefix selecting an already-running named instance.
pub const INSTANCE_SCHEME: &str = "instance://";

/// Environment variable naming an engine configuration file.
pub const CONFIG_ENV: &str = "CAPSULE_CONFIG";

/// Prefix reserved for variables the engine injects into the container.
pub const ENV_PREFIX: &str = "CAPSULE_";

/// Marker variable carrying the image path.
pub const ENV_CONTAINER: &str = "CAPSULE_CONTAINER";

/// Marker variable carrying the image display name.
pub const ENV_NAME: &str = "CAPSULE_NAME";

/// Marker variable carrying the selected app.
pub const ENV_APPNAME: &str = "CAPSULE_APPNAME";

/// Root of app installations inside a container.
pub const SCIF_APPS_DIR: &str = "/scif/apps";

/// Root of app data directories inside a container.
pub const SCIF_DATA_DIR: &str = "/scif/data";

/// Upper bound on symlinks followed while resolving a container path.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Host device nodes bound into a contained `/dev`.
pub const MINIMAL_DEVICES: &[&str] = &["null", "zero", "random", "urandom", "tty"];

/// Host-specific variables never inherited by the container.
pub const FILTERED_ENV: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "PS1",
    "PROMPT_COMMAND",
    "XDG_RUNTIME_DIR",
    "DBUS_SESSION_BUS_ADDRESS",
    "SSH_AUTH_SOCK",
];

/// Returns the per-user base directory for Capsule runtime state.
///
/// Prefers `$XDG_RUNTIME_DIR/capsule`, falling back to `/tmp/capsule-<uid>`.
pub fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
        _ => std::env::temp_dir().join(format!("{APP_NAME}-{}", nix::unistd::getuid())),
    }
}

/// Returns the default session staging directory.
pub fn default_session_dir() -> PathBuf {
    runtime_dir().join("session")
}

/// Returns the default state directory holding the instance registry.
pub fn default_state_dir() -> PathBuf {
    runtime_dir().join("state")
}
