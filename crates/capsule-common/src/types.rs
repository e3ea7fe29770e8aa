//! Domain primitive types used across the Capsule workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a single launch, carried in log spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchId(String);

impl LaunchId {
    /// Creates a launch ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random launch ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel namespace types the engine can create or join.
///
/// The declaration order is the canonical creation order: the user
/// namespace always comes first and the PID namespace last, since it
/// only takes effect for children forked afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// User and group ID isolation.
    User,
    /// Mount table isolation.
    Mount,
    /// System V IPC and POSIX message queue isolation.
    Ipc,
    /// Hostname and domain name isolation.
    Uts,
    /// Network stack isolation.
    Net,
    /// Process ID isolation.
    Pid,
}

impl NamespaceKind {
    /// Every namespace kind in canonical creation order.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Mount,
        Self::Ipc,
        Self::Uts,
        Self::Net,
        Self::Pid,
    ];

    /// Name of the namespace entry under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Mount => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
        }
    }

    /// Option-map key toggling this namespace, if it has one.
    ///
    /// The mount namespace is always created and has no toggle.
    #[must_use]
    pub const fn option_key(self) -> Option<&'static str> {
        match self {
            Self::User => Some("userns"),
            Self::Mount => None,
            Self::Ipc => Some("ipc"),
            Self::Uts => Some("uts"),
            Self::Net => Some("net"),
            Self::Pid => Some("pid"),
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Mount => "mount",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
        };
        f.write_str(name)
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only.
    ReadOnly,
    /// Read-write.
    #[default]
    ReadWrite,
}

impl AccessMode {
    /// Returns `true` for [`AccessMode::ReadOnly`].
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("ro"),
            Self::ReadWrite => f.write_str("rw"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            other => Err(format!("unknown mount option \"{other}\" (expected ro or rw)")),
        }
    }
}

/// How the Process Launcher hands control to the target program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Replace the current process image.
    #[default]
    Exec,
    /// Spawn the target as a child and wait for it.
    Spawn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_order_puts_user_first_and_pid_last() {
        let mut kinds = vec![
            NamespaceKind::Pid,
            NamespaceKind::Net,
            NamespaceKind::Mount,
            NamespaceKind::User,
        ];
        kinds.sort();
        assert_eq!(kinds.first(), Some(&NamespaceKind::User));
        assert_eq!(kinds.last(), Some(&NamespaceKind::Pid));
    }

    #[test]
    fn mount_namespace_has_no_toggle() {
        assert_eq!(NamespaceKind::Mount.option_key(), None);
        assert_eq!(NamespaceKind::User.option_key(), Some("userns"));
    }

    #[test]
    fn access_mode_parses_ro_and_rw() {
        assert_eq!("ro".parse::<AccessMode>().unwrap(), AccessMode::ReadOnly);
        assert_eq!("rw".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert!("rx".parse::<AccessMode>().is_err());
    }

    #[test]
    fn launch_id_generate_is_unique() {
        assert_ne!(LaunchId::generate(), LaunchId::generate());
    }
}
