//! Facts about the invoking host and user, gathered once per launch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use capsule_common::types::NamespaceKind;
use capsule_core::privilege::Identity;

/// Kernel features the resolver and orchestrator depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSupport {
    /// Namespace types the kernel provides.
    pub namespaces: BTreeSet<NamespaceKind>,
    /// Whether this user may create user namespaces.
    pub user_namespaces: bool,
}

impl HostSupport {
    /// Probes `/proc` for namespace support.
    #[must_use]
    pub fn probe() -> Self {
        Self::probe_at(Path::new("/proc"))
    }

    /// Probes a `/proc`-like tree rooted at `proc_dir`.
    #[must_use]
    pub fn probe_at(proc_dir: &Path) -> Self {
        let namespaces: BTreeSet<NamespaceKind> = NamespaceKind::ALL
            .into_iter()
            .filter(|kind| proc_dir.join("self/ns").join(kind.proc_name()).exists())
            .collect();
        let max_userns = std::fs::read_to_string(proc_dir.join("sys/user/max_user_namespaces"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        let unprivileged_clone =
            std::fs::read_to_string(proc_dir.join("sys/kernel/unprivileged_userns_clone"))
                .ok()
                .map(|s| s.trim() != "0");
        let user_namespaces = namespaces.contains(&NamespaceKind::User)
            && max_userns.is_none_or(|n| n > 0)
            && unprivileged_clone.unwrap_or(true);
        tracing::debug!(?namespaces, user_namespaces, "probed host namespace support");
        Self {
            namespaces,
            user_namespaces,
        }
    }

    /// A host providing every namespace.
    #[must_use]
    pub fn full() -> Self {
        Self {
            namespaces: NamespaceKind::ALL.into_iter().collect(),
            user_namespaces: true,
        }
    }

    /// A host without user namespace support.
    #[must_use]
    pub fn without_user_namespaces() -> Self {
        let mut host = Self::full();
        let _ = host.namespaces.remove(&NamespaceKind::User);
        host.user_namespaces = false;
        host
    }
}

/// Everything the engine reads from the invoking process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Kernel feature support.
    pub support: HostSupport,
    /// Invoking user.
    pub identity: Identity,
    /// Invoking user's home directory.
    pub home: Option<PathBuf>,
    /// Inherited environment.
    pub env: Vec<(String, String)>,
}

impl HostContext {
    /// Captures the current process.
    #[must_use]
    pub fn probe() -> Self {
        let env: Vec<(String, String)> = std::env::vars().collect();
        let home = env
            .iter()
            .find(|(k, _)| k == "HOME")
            .map(|(_, v)| PathBuf::from(v))
            .filter(|p| p.is_absolute());
        Self {
            support: HostSupport::probe(),
            identity: Identity::current(),
            home,
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reads_namespace_entries_and_sysctls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("self/ns")).unwrap();
        for name in ["user", "mnt", "pid"] {
            std::fs::write(dir.path().join("self/ns").join(name), "").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("sys/user")).unwrap();
        std::fs::write(dir.path().join("sys/user/max_user_namespaces"), "15000\n").unwrap();

        let host = HostSupport::probe_at(dir.path());
        assert!(host.user_namespaces);
        assert_eq!(
            host.namespaces,
            [NamespaceKind::User, NamespaceKind::Mount, NamespaceKind::Pid]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn zero_max_user_namespaces_disables_support() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("self/ns")).unwrap();
        std::fs::write(dir.path().join("self/ns/user"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("sys/user")).unwrap();
        std::fs::write(dir.path().join("sys/user/max_user_namespaces"), "0").unwrap();
        assert!(!HostSupport::probe_at(dir.path()).user_namespaces);
    }
}
