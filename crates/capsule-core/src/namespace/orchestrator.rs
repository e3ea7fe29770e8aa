//! Namespace creation as a typestate machine.
//!
//! ```text
//! Unstarted ──enter_user──▶ UserStaged ──create_mount──▶ MountCreated
//!                                                            │
//!                              Ready ◀──create_isolated──────┘
//! ```
//!
//! Each transition consumes the orchestrator and returns it in the next
//! state, so the user namespace cannot be entered after any other
//! namespace and nothing can be created once the set is finished.

use std::marker::PhantomData;

use capsule_common::error::NamespaceError;
use capsule_common::types::NamespaceKind;
use nix::errno::Errno;

use super::{NamespaceBackend, NamespaceOrigin, NamespaceRequest, NamespaceSet};

/// Nothing has been created yet.
#[derive(Debug)]
pub struct Unstarted;

/// The user namespace is entered and mapped, or was not requested.
#[derive(Debug)]
pub struct UserStaged;

/// The mount namespace exists and propagation to the host is cut.
#[derive(Debug)]
pub struct MountCreated;

/// All requested namespaces exist.
#[derive(Debug)]
pub struct Ready;

/// Namespaces created after the mount namespace, in creation order.
const ISOLATED: [NamespaceKind; 4] = [
    NamespaceKind::Ipc,
    NamespaceKind::Uts,
    NamespaceKind::Net,
    NamespaceKind::Pid,
];

/// Drives namespace creation for one launch.
pub struct NamespaceOrchestrator<'b, S> {
    backend: &'b mut dyn NamespaceBackend,
    request: NamespaceRequest,
    set: NamespaceSet,
    state: PhantomData<S>,
}

impl<S> std::fmt::Debug for NamespaceOrchestrator<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceOrchestrator")
            .field("request", &self.request)
            .field("set", &self.set)
            .field("state", &std::any::type_name::<S>())
            .finish_non_exhaustive()
    }
}

impl<'b, S> NamespaceOrchestrator<'b, S> {
    fn advance<T>(self) -> NamespaceOrchestrator<'b, T> {
        NamespaceOrchestrator {
            backend: self.backend,
            request: self.request,
            set: self.set,
            state: PhantomData,
        }
    }

    /// Namespaces obtained so far.
    #[must_use]
    pub const fn set(&self) -> &NamespaceSet {
        &self.set
    }

    fn abort(&self, err: NamespaceError) -> NamespaceError {
        tracing::warn!(error = %err, "namespace setup failed, tearing down");
        self.set.teardown();
        err
    }

    fn join(&mut self, pid: i32, kind: NamespaceKind) -> Result<(), NamespaceError> {
        self.backend
            .join(pid, kind)
            .map_err(|errno| classify(kind, errno))?;
        self.set.record(kind, NamespaceOrigin::Joined);
        Ok(())
    }

    fn create(&mut self, kind: NamespaceKind) -> Result<(), NamespaceError> {
        if !self.backend.supports(kind) {
            return Err(NamespaceError::Unsupported { kind });
        }
        if kind != NamespaceKind::User
            && !self.set.in_user_namespace()
            && !self.backend.has_admin_capability()
        {
            return Err(NamespaceError::InsufficientPrivilege {
                kind,
                hint: "request a user namespace or run with CAP_SYS_ADMIN",
            });
        }
        self.backend
            .unshare(kind)
            .map_err(|errno| classify(kind, errno))?;
        self.set.record(kind, NamespaceOrigin::Created);
        Ok(())
    }

    /// Creates or joins `kind` and returns whether it was obtained.
    fn obtain(&mut self, kind: NamespaceKind) -> Result<bool, NamespaceError> {
        match self.request.join.as_ref().map(|j| (j.pid, j.kinds.contains(&kind))) {
            Some((pid, true)) => self.join(pid, kind).map(|()| true),
            Some((_, false)) => Ok(false),
            None if self.request.wants(kind) => self.create(kind).map(|()| true),
            None => Ok(false),
        }
    }
}

impl<'b> NamespaceOrchestrator<'b, Unstarted> {
    /// Starts orchestration for `request`.
    pub fn new(backend: &'b mut dyn NamespaceBackend, request: NamespaceRequest) -> Self {
        Self {
            backend,
            request,
            set: NamespaceSet::new(),
            state: PhantomData,
        }
    }

    /// Enters the user namespace, if requested, and writes its ID maps.
    ///
    /// # Errors
    ///
    /// Returns a [`NamespaceError`] if the namespace is unsupported, may not
    /// be created, or cannot be mapped.
    pub fn enter_user(mut self) -> Result<NamespaceOrchestrator<'b, UserStaged>, NamespaceError> {
        match self.obtain(NamespaceKind::User) {
            Ok(true) if self.request.join.is_none() => {
                if let Some(mapping) = self.request.mapping {
                    if let Err(e) = self.backend.write_id_maps(&mapping) {
                        return Err(self.abort(e));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => return Err(self.abort(e)),
        }
        Ok(self.advance())
    }
}

impl<'b> NamespaceOrchestrator<'b, UserStaged> {
    /// Creates the mount namespace and makes every mount private.
    ///
    /// # Errors
    ///
    /// Returns a [`NamespaceError`] if the namespace cannot be created or
    /// mount propagation cannot be changed.
    pub fn create_mount(mut self) -> Result<NamespaceOrchestrator<'b, MountCreated>, NamespaceError> {
        match self.obtain(NamespaceKind::Mount) {
            Ok(true) if self.request.join.is_none() => {
                if let Err(source) = self.backend.make_mounts_private() {
                    return Err(self.abort(NamespaceError::Syscall {
                        kind: NamespaceKind::Mount,
                        source,
                    }));
                }
            }
            Ok(_) => {}
            Err(e) => return Err(self.abort(e)),
        }
        Ok(self.advance())
    }
}

impl<'b> NamespaceOrchestrator<'b, MountCreated> {
    /// Creates the IPC, UTS, network, and PID namespaces that were requested.
    ///
    /// # Errors
    ///
    /// Returns a [`NamespaceError`] for the first namespace that fails.
    pub fn create_isolated(mut self) -> Result<NamespaceOrchestrator<'b, Ready>, NamespaceError> {
        for kind in ISOLATED {
            if let Err(e) = self.isolate(kind) {
                return Err(self.abort(e));
            }
        }
        Ok(self.advance())
    }

    fn isolate(&mut self, kind: NamespaceKind) -> Result<(), NamespaceError> {
        if !self.obtain(kind)? || self.request.join.is_some() {
            return Ok(());
        }
        match kind {
            NamespaceKind::Uts => {
                if let Some(hostname) = self.request.hostname.clone() {
                    self.backend
                        .set_hostname(&hostname)
                        .map_err(|source| NamespaceError::Syscall { kind, source })?;
                }
            }
            NamespaceKind::Net => self
                .backend
                .bring_up_loopback()
                .map_err(|source| NamespaceError::Syscall { kind, source })?,
            _ => {}
        }
        Ok(())
    }
}

impl NamespaceOrchestrator<'_, Ready> {
    /// Finishes orchestration, yielding the namespaces in creation order.
    #[must_use]
    pub fn finish(self) -> NamespaceSet {
        tracing::info!(
            namespaces = ?self.set.kinds(),
            joined = self.request.join.is_some(),
            "namespaces ready"
        );
        self.set
    }
}

/// Runs every transition in order.
///
/// # Errors
///
/// Returns the first [`NamespaceError`]; namespaces obtained before the
/// failure are torn down in reverse order.
pub fn orchestrate(
    backend: &mut dyn NamespaceBackend,
    request: NamespaceRequest,
) -> Result<NamespaceSet, NamespaceError> {
    Ok(NamespaceOrchestrator::new(backend, request)
        .enter_user()?
        .create_mount()?
        .create_isolated()?
        .finish())
}

fn classify(kind: NamespaceKind, errno: Errno) -> NamespaceError {
    match errno {
        Errno::EPERM | Errno::EACCES | Errno::EUSERS => NamespaceError::InsufficientPrivilege {
            kind,
            hint: if kind == NamespaceKind::User {
                "check /proc/sys/user/max_user_namespaces and kernel.unprivileged_userns_clone"
            } else {
                "request a user namespace or run with CAP_SYS_ADMIN"
            },
        },
        Errno::EINVAL | Errno::ENOSYS => NamespaceError::Unsupported { kind },
        source => NamespaceError::Syscall { kind, source },
    }
}
