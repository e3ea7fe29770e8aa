//! Linux namespace management for container isolation.
//!
//! Provides safe wrappers around `unshare(2)` and `setns(2)` for each
//! namespace type, the [`NamespaceBackend`] seam they sit behind, and the
//! [`NamespaceSet`] recording what a launch actually created.

pub mod network;
pub mod orchestrator;
pub mod pid;
pub mod user;
pub mod uts;

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use capsule_common::error::NamespaceError;
use capsule_common::types::NamespaceKind;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::Pid;

pub use orchestrator::{NamespaceOrchestrator, orchestrate};
pub use user::IdentityMapping;

/// Returns the `clone(2)` flag for a namespace kind.
#[must_use]
pub const fn clone_flag(kind: NamespaceKind) -> CloneFlags {
    match kind {
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
        NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
    }
}

/// Namespaces of an already-running instance to enter instead of creating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    /// PID of a process inside the instance.
    pub pid: i32,
    /// Namespaces the instance owns.
    pub kinds: BTreeSet<NamespaceKind>,
}

/// What the orchestrator is asked to set up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceRequest {
    /// Requested namespaces. The mount namespace is implied.
    pub kinds: BTreeSet<NamespaceKind>,
    /// ID mapping written after the user namespace is created.
    pub mapping: Option<IdentityMapping>,
    /// Hostname applied after the UTS namespace is created.
    pub hostname: Option<String>,
    /// Join an instance rather than create namespaces.
    pub join: Option<JoinTarget>,
}

impl NamespaceRequest {
    /// Returns `true` if `kind` will be present once orchestration completes.
    #[must_use]
    pub fn wants(&self, kind: NamespaceKind) -> bool {
        match &self.join {
            Some(join) => join.kinds.contains(&kind),
            None => kind == NamespaceKind::Mount || self.kinds.contains(&kind),
        }
    }
}

/// Whether a namespace was created by this launch or joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOrigin {
    /// Created with `unshare(2)`.
    Created,
    /// Entered with `setns(2)`.
    Joined,
}

/// One namespace in a [`NamespaceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceEntry {
    /// Namespace type.
    pub kind: NamespaceKind,
    /// How it was obtained.
    pub origin: NamespaceOrigin,
}

/// Role of the current process with respect to a PID namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRole {
    /// No PID namespace is involved.
    NotRequired,
    /// A PID namespace was created; its init has not been forked yet.
    AwaitingInit,
    /// A PID namespace was joined; the member has not been forked yet.
    AwaitingMember,
    /// This process supervises the forked child.
    Supervisor(Pid),
    /// This process is PID 1 of the created namespace.
    Init,
    /// This process is a member of a joined PID namespace.
    Member,
}

/// Namespaces actually created or joined by this launch, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
    entries: Vec<NamespaceEntry>,
    init: InitRole,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            init: InitRole::NotRequired,
        }
    }

    pub(crate) fn record(&mut self, kind: NamespaceKind, origin: NamespaceOrigin) {
        self.entries.push(NamespaceEntry { kind, origin });
        if kind == NamespaceKind::Pid {
            self.init = match origin {
                NamespaceOrigin::Created => InitRole::AwaitingInit,
                NamespaceOrigin::Joined => InitRole::AwaitingMember,
            };
        }
    }

    /// Returns `true` if `kind` was created or joined.
    #[must_use]
    pub fn contains(&self, kind: NamespaceKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    /// The namespace kinds in the set.
    #[must_use]
    pub fn kinds(&self) -> BTreeSet<NamespaceKind> {
        self.entries.iter().map(|e| e.kind).collect()
    }

    /// Entries in creation order.
    #[must_use]
    pub fn entries(&self) -> &[NamespaceEntry] {
        &self.entries
    }

    /// Returns `true` if the process runs inside a user namespace.
    #[must_use]
    pub fn in_user_namespace(&self) -> bool {
        self.contains(NamespaceKind::User)
    }

    /// Current PID namespace role.
    #[must_use]
    pub const fn init_role(&self) -> InitRole {
        self.init
    }

    /// Returns `true` if a child must be forked before entering the container.
    #[must_use]
    pub const fn requires_fork(&self) -> bool {
        matches!(self.init, InitRole::AwaitingInit | InitRole::AwaitingMember)
    }

    /// Records the forked child in the supervising process.
    pub fn attach_supervisor(&mut self, child: Pid) {
        self.init = InitRole::Supervisor(child);
    }

    /// Records, in the forked child, that it now runs inside the PID namespace.
    pub fn enter_child(&mut self) {
        self.init = match self.init {
            InitRole::AwaitingInit => InitRole::Init,
            InitRole::AwaitingMember => InitRole::Member,
            other => other,
        };
    }

    /// Fails unless the current process may stage and run the container.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::InitProcessRequired`] if a PID namespace
    /// exists but this process is not inside it.
    pub fn require_init_ready(&self) -> Result<(), NamespaceError> {
        match self.init {
            InitRole::NotRequired | InitRole::Init | InitRole::Member => Ok(()),
            InitRole::AwaitingInit | InitRole::AwaitingMember => {
                Err(NamespaceError::InitProcessRequired {
                    reason: "PID namespace has no process inside it".into(),
                })
            }
            InitRole::Supervisor(child) => Err(NamespaceError::InitProcessRequired {
                reason: format!(
                    "supervising process cannot enter the container (init is {child})"
                ),
            }),
        }
    }

    /// Best-effort teardown in reverse creation order.
    ///
    /// Namespaces live as long as a process is inside them: a supervised
    /// child is killed, and those held by this process are released when
    /// it exits.
    pub fn teardown(&self) {
        if let InitRole::Supervisor(child) = self.init {
            tracing::debug!(child = child.as_raw(), "terminating namespace child");
            pid::terminate(child);
        }
        for entry in self.entries.iter().rev() {
            tracing::debug!(kind = %entry.kind, origin = ?entry.origin, "releasing namespace");
        }
    }
}

/// Kernel operations the orchestrator needs.
pub trait NamespaceBackend {
    /// Returns `true` if the host kernel provides `kind`.
    fn supports(&self, kind: NamespaceKind) -> bool;

    /// Returns `true` if the caller may create namespaces without a user namespace.
    fn has_admin_capability(&self) -> bool;

    /// Moves the caller into a new namespace of `kind`.
    ///
    /// # Errors
    ///
    /// Returns the errno of `unshare(2)`.
    fn unshare(&mut self, kind: NamespaceKind) -> Result<(), Errno>;

    /// Moves the caller into the `kind` namespace of process `pid`.
    ///
    /// # Errors
    ///
    /// Returns the errno of opening the namespace file or `setns(2)`.
    fn join(&mut self, pid: i32, kind: NamespaceKind) -> Result<(), Errno>;

    /// Writes the UID/GID maps for the caller's new user namespace.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::IdMap`] if a map file cannot be written.
    fn write_id_maps(&mut self, mapping: &IdentityMapping) -> Result<(), NamespaceError>;

    /// Stops mount propagation between the new mount namespace and the host.
    ///
    /// # Errors
    ///
    /// Returns the errno of `mount(2)`.
    fn make_mounts_private(&mut self) -> Result<(), Errno>;

    /// Sets the hostname in the caller's UTS namespace.
    ///
    /// # Errors
    ///
    /// Returns the errno of `sethostname(2)`.
    fn set_hostname(&mut self, hostname: &str) -> Result<(), Errno>;

    /// Brings up the loopback device in the caller's network namespace.
    ///
    /// # Errors
    ///
    /// Returns the errno of the interface configuration.
    fn bring_up_loopback(&mut self) -> Result<(), Errno>;
}

/// [`NamespaceBackend`] issuing real syscalls on the calling process.
#[derive(Debug, Default)]
pub struct LinuxNamespaces;

impl NamespaceBackend for LinuxNamespaces {
    fn supports(&self, kind: NamespaceKind) -> bool {
        Path::new("/proc/self/ns").join(kind.proc_name()).exists()
    }

    fn has_admin_capability(&self) -> bool {
        crate::capability::has_effective(caps::Capability::CAP_SYS_ADMIN)
    }

    fn unshare(&mut self, kind: NamespaceKind) -> Result<(), Errno> {
        nix::sched::unshare(clone_flag(kind))?;
        tracing::debug!(%kind, "namespace created");
        Ok(())
    }

    fn join(&mut self, pid: i32, kind: NamespaceKind) -> Result<(), Errno> {
        let path = format!("/proc/{pid}/ns/{}", kind.proc_name());
        let file = File::open(&path)
            .map_err(|e| e.raw_os_error().map_or(Errno::EIO, Errno::from_raw))?;
        nix::sched::setns(&file, clone_flag(kind))?;
        tracing::debug!(%kind, pid, "joined namespace");
        Ok(())
    }

    fn write_id_maps(&mut self, mapping: &IdentityMapping) -> Result<(), NamespaceError> {
        user::write_id_maps(mapping)
    }

    fn make_mounts_private(&mut self) -> Result<(), Errno> {
        crate::filesystem::mount::make_rprivate()
    }

    fn set_hostname(&mut self, hostname: &str) -> Result<(), Errno> {
        uts::set_hostname(hostname)
    }

    fn bring_up_loopback(&mut self) -> Result<(), Errno> {
        network::bring_up_loopback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_implies_mount_namespace() {
        let request = NamespaceRequest::default();
        assert!(request.wants(NamespaceKind::Mount));
        assert!(!request.wants(NamespaceKind::Pid));
    }

    #[test]
    fn joined_request_wants_only_instance_namespaces() {
        let request = NamespaceRequest {
            join: Some(JoinTarget {
                pid: 10,
                kinds: [NamespaceKind::Pid].into_iter().collect(),
            }),
            ..NamespaceRequest::default()
        };
        assert!(request.wants(NamespaceKind::Pid));
        assert!(!request.wants(NamespaceKind::Mount));
    }

    #[test]
    fn created_pid_namespace_needs_init_before_entry() {
        let mut set = NamespaceSet::new();
        set.record(NamespaceKind::Mount, NamespaceOrigin::Created);
        set.record(NamespaceKind::Pid, NamespaceOrigin::Created);
        assert!(set.requires_fork());
        assert!(matches!(
            set.require_init_ready(),
            Err(NamespaceError::InitProcessRequired { .. })
        ));

        let mut child_view = set.clone();
        child_view.enter_child();
        assert_eq!(child_view.init_role(), InitRole::Init);
        assert!(child_view.require_init_ready().is_ok());
    }

    #[test]
    fn supervisor_may_not_enter_the_container() {
        let mut set = NamespaceSet::new();
        set.record(NamespaceKind::Pid, NamespaceOrigin::Joined);
        set.attach_supervisor(Pid::from_raw(4242));
        assert!(!set.requires_fork());
        assert!(set.require_init_ready().is_err());
    }

    #[test]
    fn set_without_pid_needs_no_init() {
        let mut set = NamespaceSet::new();
        set.record(NamespaceKind::User, NamespaceOrigin::Created);
        set.record(NamespaceKind::Mount, NamespaceOrigin::Created);
        assert!(!set.requires_fork());
        assert!(set.require_init_ready().is_ok());
        assert!(set.in_user_namespace());
        assert_eq!(
            set.entries().iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![NamespaceKind::User, NamespaceKind::Mount]
        );
    }

    #[test]
    fn clone_flags_are_distinct() {
        let mut seen = CloneFlags::empty();
        for kind in NamespaceKind::ALL {
            assert!(!seen.intersects(clone_flag(kind)));
            seen |= clone_flag(kind);
        }
    }
}
