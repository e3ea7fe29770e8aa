//! Privilege transitions between namespace setup and exec.
//!
//! The controller computes the final capability set from a
//! [`PrivilegePosture`] and what the process actually holds, then
//! [`PrivilegeTransition::commit`] applies it in a fixed order:
//!
//! 1. keep-caps, when the uid changes while capabilities are retained
//! 2. bounding set reduction, when `CAP_SETPCAP` is held
//! 3. supplementary groups, gid, uid
//! 4. effective, permitted, inheritable, ambient sets
//! 5. `no_new_privs`
//! 6. verification that nothing outside the target set survived
//!
//! The only way to obtain a [`DroppedPrivileges`] token is a successful
//! commit, and the process launcher requires one.

use caps::{CapSet, Capability};
use capsule_common::error::PrivilegeError;
use nix::unistd::{Gid, Uid};

use crate::capability::{self, CapabilitySet, caps_error};
use crate::namespace::{IdentityMapping, NamespaceSet};

/// Capabilities that never take effect inside a user namespace.
const HOST_ONLY: [Capability; 11] = [
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_MAC_ADMIN,
    Capability::CAP_MAC_OVERRIDE,
    Capability::CAP_SYSLOG,
    Capability::CAP_WAKE_ALARM,
    Capability::CAP_BLOCK_SUSPEND,
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_AUDIT_READ,
];

/// Capabilities scoped to the network namespace.
const NETWORK: [Capability; 4] = [
    Capability::CAP_NET_ADMIN,
    Capability::CAP_NET_RAW,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_BROADCAST,
];

/// A user and group ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

impl Identity {
    /// Real uid and gid of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
        }
    }

    /// The root identity.
    #[must_use]
    pub const fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// How the default capability drop is modified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retention {
    /// Drop to the computed set.
    #[default]
    Standard,
    /// Keep every held capability.
    KeepPrivs,
    /// Drop every capability, ignoring additions.
    NoPrivs,
}

/// Validated privilege options of a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegePosture {
    /// Appear as root inside the user namespace.
    pub fakeroot: bool,
    /// Keep or discard capabilities wholesale.
    pub retention: Retention,
    /// Capabilities granted on top of the base set.
    pub add_caps: CapabilitySet,
    /// Capabilities removed from the result.
    pub drop_caps: CapabilitySet,
    /// Honor setuid bits and skip `no_new_privs`.
    pub allow_setuid: bool,
}

impl PrivilegePosture {
    /// Mapping written into a new user namespace for `host`.
    #[must_use]
    pub const fn identity_mapping(&self, host: Identity) -> IdentityMapping {
        if self.fakeroot {
            IdentityMapping::root(host.uid, host.gid)
        } else {
            IdentityMapping::identity(host.uid, host.gid)
        }
    }

    /// Capability names granted on the command line, sorted.
    #[must_use]
    pub fn added_names(&self) -> Vec<String> {
        self.add_caps.names()
    }
}

/// Computes and applies the privilege transition of one launch.
#[derive(Debug)]
pub struct PrivilegeController<'a> {
    posture: &'a PrivilegePosture,
    namespaces: &'a NamespaceSet,
}

impl<'a> PrivilegeController<'a> {
    /// Creates a controller for `posture` over the namespaces already set up.
    #[must_use]
    pub const fn new(posture: &'a PrivilegePosture, namespaces: &'a NamespaceSet) -> Self {
        Self {
            posture,
            namespaces,
        }
    }

    /// Identity the target program runs as.
    #[must_use]
    pub fn target_identity(&self, host: Identity) -> Identity {
        if self.posture.fakeroot && self.namespaces.in_user_namespace() {
            Identity::root()
        } else {
            host
        }
    }

    /// Capabilities the target program keeps, given those `held` now.
    #[must_use]
    pub fn final_capabilities(&self, held: &CapabilitySet) -> CapabilitySet {
        let posture = self.posture;
        let wanted = match posture.retention {
            Retention::NoPrivs => return CapabilitySet::new(),
            Retention::KeepPrivs => return held.clone(),
            Retention::Standard => {
                let base = if posture.fakeroot {
                    held.intersection(&CapabilitySet::all())
                } else {
                    CapabilitySet::new()
                };
                base.union(&posture.add_caps).difference(&posture.drop_caps)
            }
        };

        if !self.namespaces.in_user_namespace() {
            return wanted;
        }
        let own_network = self
            .namespaces
            .contains(capsule_common::types::NamespaceKind::Net);
        wanted.filtered(|cap| {
            let meaningful = !HOST_ONLY.contains(&cap) && (own_network || !NETWORK.contains(&cap));
            if !meaningful {
                tracing::debug!(capability = %cap, "capability has no effect in this namespace set");
            }
            meaningful
        })
    }

    /// Builds the transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PrivilegeError::Unavailable`] if the final set names
    /// capabilities not in `held`.
    pub fn plan(
        &self,
        held: &CapabilitySet,
        target: Identity,
    ) -> Result<PrivilegeTransition, PrivilegeError> {
        let capabilities = self.final_capabilities(held);
        let missing = capabilities.difference(held);
        if !missing.is_empty() {
            return Err(PrivilegeError::Unavailable {
                names: missing.to_list(),
            });
        }
        if self.posture.retention == Retention::KeepPrivs {
            tracing::warn!(
                capabilities = %capabilities.to_list(),
                "keep-privs: capability drop skipped by request"
            );
        }
        Ok(PrivilegeTransition {
            target,
            capabilities,
            no_new_privs: !self.posture.allow_setuid,
            in_user_namespace: self.namespaces.in_user_namespace(),
            retention: self.posture.retention,
        })
    }

    /// Reads the held capabilities, plans, and commits in one step.
    ///
    /// # Errors
    ///
    /// Returns a [`PrivilegeError`] from planning or committing.
    pub fn apply(&self, host: Identity) -> Result<DroppedPrivileges, PrivilegeError> {
        let held = capability::permitted()?;
        self.plan(&held, self.target_identity(host))?.commit()
    }
}

/// A planned, not yet applied, privilege drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeTransition {
    target: Identity,
    capabilities: CapabilitySet,
    no_new_privs: bool,
    in_user_namespace: bool,
    retention: Retention,
}

impl PrivilegeTransition {
    /// Identity after the drop.
    #[must_use]
    pub const fn target(&self) -> Identity {
        self.target
    }

    /// Capabilities left after the drop.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Whether `no_new_privs` will be set.
    #[must_use]
    pub const fn no_new_privs(&self) -> bool {
        self.no_new_privs
    }

    /// Applies the transition to the calling thread.
    ///
    /// Any failure leaves the process unfit to continue; the caller must
    /// abort the launch.
    ///
    /// # Errors
    ///
    /// Returns the [`PrivilegeError`] of the first failing step.
    pub fn commit(self) -> Result<DroppedPrivileges, PrivilegeError> {
        let target = self.target;
        let uid = Uid::from_raw(target.uid);
        let gid = Gid::from_raw(target.gid);
        let identity_err = |source| PrivilegeError::Identity {
            uid: target.uid,
            gid: target.gid,
            source,
        };

        let current = nix::unistd::getresuid().map_err(identity_err)?;
        let switching = current.real != uid || current.effective != uid || current.saved != uid;
        if switching && !self.capabilities.is_empty() {
            nix::sys::prctl::set_keepcaps(true).map_err(|source| PrivilegeError::Prctl {
                flag: "PR_SET_KEEPCAPS",
                source,
            })?;
        }

        if self.retention != Retention::KeepPrivs
            && capability::has_effective(Capability::CAP_SETPCAP)
        {
            let bounding = capability::read(CapSet::Bounding)?;
            for cap in bounding.difference(&self.capabilities).iter() {
                caps::drop(None, CapSet::Bounding, cap).map_err(|e| caps_error(&e))?;
            }
            tracing::debug!(kept = self.capabilities.len(), "bounding set reduced");
        }

        if !self.in_user_namespace && capability::has_effective(Capability::CAP_SETGID) {
            nix::unistd::setgroups(&[gid]).map_err(identity_err)?;
        }
        nix::unistd::setresgid(gid, gid, gid).map_err(identity_err)?;
        nix::unistd::setresuid(uid, uid, uid).map_err(identity_err)?;
        tracing::debug!(uid = target.uid, gid = target.gid, "identity switched");

        let wanted = self.capabilities.as_caps();
        caps::set(None, CapSet::Effective, wanted).map_err(|e| caps_error(&e))?;
        caps::set(None, CapSet::Permitted, wanted).map_err(|e| caps_error(&e))?;
        caps::set(None, CapSet::Inheritable, wanted).map_err(|e| caps_error(&e))?;
        caps::clear(None, CapSet::Ambient).map_err(|e| caps_error(&e))?;
        for cap in self.capabilities.iter() {
            caps::raise(None, CapSet::Ambient, cap).map_err(|e| caps_error(&e))?;
        }
        if switching && !self.capabilities.is_empty() {
            nix::sys::prctl::set_keepcaps(false).map_err(|source| PrivilegeError::Prctl {
                flag: "PR_SET_KEEPCAPS",
                source,
            })?;
        }

        if self.no_new_privs {
            nix::sys::prctl::set_no_new_privs().map_err(|source| PrivilegeError::Prctl {
                flag: "PR_SET_NO_NEW_PRIVS",
                source,
            })?;
        }

        let residual = capability::permitted()?.difference(&self.capabilities);
        if !residual.is_empty() {
            return Err(PrivilegeError::Residual {
                names: residual.to_list(),
            });
        }
        let after = nix::unistd::getresuid().map_err(identity_err)?;
        if after.real != uid || after.effective != uid || after.saved != uid {
            return Err(identity_err(nix::errno::Errno::EPERM));
        }

        tracing::info!(
            uid = target.uid,
            gid = target.gid,
            capabilities = %self.capabilities.to_list(),
            no_new_privs = self.no_new_privs,
            "privileges dropped"
        );
        Ok(DroppedPrivileges {
            identity: target,
            capabilities: self.capabilities,
            no_new_privs: self.no_new_privs,
        })
    }
}

/// Proof that the final privilege drop happened.
#[derive(Debug)]
#[must_use]
pub struct DroppedPrivileges {
    identity: Identity,
    capabilities: CapabilitySet,
    no_new_privs: bool,
}

impl DroppedPrivileges {
    /// Identity the process now runs as.
    pub const fn identity(&self) -> Identity {
        self.identity
    }

    /// Capabilities the process kept.
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Whether `no_new_privs` is set.
    pub const fn no_new_privs(&self) -> bool {
        self.no_new_privs
    }
}

#[cfg(test)]
mod tests {
    use capsule_common::types::NamespaceKind;

    use super::*;
    use crate::namespace::NamespaceOrigin;

    fn caps(list: &str) -> CapabilitySet {
        CapabilitySet::parse_list(list).unwrap()
    }

    fn userns() -> NamespaceSet {
        let mut set = NamespaceSet::new();
        set.record(NamespaceKind::User, NamespaceOrigin::Created);
        set.record(NamespaceKind::Mount, NamespaceOrigin::Created);
        set
    }

    #[test]
    fn no_privs_supersedes_added_capabilities() {
        let posture = PrivilegePosture {
            retention: Retention::NoPrivs,
            add_caps: caps("net_raw"),
            ..PrivilegePosture::default()
        };
        let set = NamespaceSet::new();
        let controller = PrivilegeController::new(&posture, &set);
        assert!(controller.final_capabilities(&CapabilitySet::all()).is_empty());
    }

    #[test]
    fn standard_posture_keeps_only_additions() {
        let posture = PrivilegePosture {
            add_caps: caps("chown,kill"),
            drop_caps: caps("kill"),
            ..PrivilegePosture::default()
        };
        let set = NamespaceSet::new();
        let controller = PrivilegeController::new(&posture, &set);
        assert_eq!(
            controller.final_capabilities(&CapabilitySet::all()).names(),
            vec!["CAP_CHOWN"]
        );
    }

    #[test]
    fn fakeroot_starts_from_held_set_minus_host_only() {
        let posture = PrivilegePosture {
            fakeroot: true,
            drop_caps: caps("sys_admin"),
            ..PrivilegePosture::default()
        };
        let set = userns();
        let controller = PrivilegeController::new(&posture, &set);
        let result = controller.final_capabilities(&CapabilitySet::all());
        assert!(result.contains(Capability::CAP_CHOWN));
        assert!(!result.contains(Capability::CAP_SYS_ADMIN));
        assert!(!result.contains(Capability::CAP_SYS_MODULE));
        assert!(!result.contains(Capability::CAP_NET_ADMIN));
        assert_eq!(controller.target_identity(Identity { uid: 1000, gid: 1000 }), Identity::root());
    }

    #[test]
    fn network_caps_survive_with_own_network_namespace() {
        let posture = PrivilegePosture {
            fakeroot: true,
            ..PrivilegePosture::default()
        };
        let mut set = userns();
        set.record(NamespaceKind::Net, NamespaceOrigin::Created);
        let controller = PrivilegeController::new(&posture, &set);
        assert!(
            controller
                .final_capabilities(&CapabilitySet::all())
                .contains(Capability::CAP_NET_ADMIN)
        );
    }

    #[test]
    fn keep_privs_retains_everything_held() {
        let posture = PrivilegePosture {
            retention: Retention::KeepPrivs,
            ..PrivilegePosture::default()
        };
        let set = NamespaceSet::new();
        let controller = PrivilegeController::new(&posture, &set);
        let held = caps("chown,sys_admin");
        assert_eq!(controller.final_capabilities(&held), held);
    }

    #[test]
    fn plan_rejects_capabilities_not_held() {
        let posture = PrivilegePosture {
            add_caps: caps("sys_admin"),
            ..PrivilegePosture::default()
        };
        let set = NamespaceSet::new();
        let controller = PrivilegeController::new(&posture, &set);
        let err = controller
            .plan(&CapabilitySet::new(), Identity::current())
            .unwrap_err();
        assert!(matches!(err, PrivilegeError::Unavailable { names } if names == "CAP_SYS_ADMIN"));
    }

    #[test]
    fn plan_sets_no_new_privs_unless_setuid_allowed() {
        let set = NamespaceSet::new();
        let strict = PrivilegePosture::default();
        let plan = PrivilegeController::new(&strict, &set)
            .plan(&CapabilitySet::new(), Identity::current())
            .unwrap();
        assert!(plan.no_new_privs());
        assert!(plan.capabilities().is_empty());

        let lenient = PrivilegePosture {
            allow_setuid: true,
            ..PrivilegePosture::default()
        };
        let plan = PrivilegeController::new(&lenient, &set)
            .plan(&CapabilitySet::new(), Identity::current())
            .unwrap();
        assert!(!plan.no_new_privs());
    }

    #[test]
    fn fakeroot_maps_host_user_to_root() {
        let posture = PrivilegePosture {
            fakeroot: true,
            ..PrivilegePosture::default()
        };
        let mapping = posture.identity_mapping(Identity { uid: 1000, gid: 100 });
        assert_eq!(mapping, IdentityMapping::root(1000, 100));
    }
}
