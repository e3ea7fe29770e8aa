//! Linux capability sets for least-privilege execution.
//!
//! Wraps the `caps` crate with name parsing that accepts the forms users
//! type on the command line (`sys_admin`, `CAP_SYS_ADMIN`, `all`).

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use capsule_common::error::{ConfigError, PrivilegeError};

/// An unordered set of Linux capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(CapsHashSet);

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capability known to this build.
    #[must_use]
    pub fn all() -> Self {
        Self(caps::all())
    }

    /// Parses a single capability name.
    ///
    /// Matching is case-insensitive and the `CAP_` prefix is optional.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCapability`] if the name is not a Linux capability.
    pub fn parse_name(name: &str) -> Result<Capability, ConfigError> {
        let upper = name.trim().to_ascii_uppercase();
        let canonical = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        Capability::from_str(&canonical).map_err(|_| ConfigError::UnknownCapability {
            name: name.trim().to_owned(),
        })
    }

    /// Parses a comma-separated capability list; `all` selects every capability.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCapability`] for the first unknown name.
    pub fn parse_list(list: &str) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if item.eq_ignore_ascii_case("all") {
                set.0.extend(caps::all());
            } else {
                let _ = set.0.insert(Self::parse_name(item)?);
            }
        }
        Ok(set)
    }

    /// Adds a capability; returns `true` if it was not present.
    pub fn insert(&mut self, cap: Capability) -> bool {
        self.0.insert(cap)
    }

    /// Returns `true` if the set holds `cap`.
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of capabilities in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the capabilities in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Capabilities in either set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Capabilities in `self` but not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Capabilities in both sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Keeps only the capabilities for which `keep` returns `true`.
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(Capability) -> bool) -> Self {
        Self(self.0.iter().copied().filter(|c| keep(*c)).collect())
    }

    /// Capability names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        names.sort();
        names
    }

    /// Sorted names joined by commas, as accepted by [`CapabilitySet::parse_list`].
    #[must_use]
    pub fn to_list(&self) -> String {
        self.names().join(",")
    }

    /// Borrows the underlying `caps` set.
    #[must_use]
    pub const fn as_caps(&self) -> &CapsHashSet {
        &self.0
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Maps a `caps` failure into a [`PrivilegeError`].
pub(crate) fn caps_error(err: &caps::errors::CapsError) -> PrivilegeError {
    PrivilegeError::Capability {
        message: err.to_string(),
    }
}

/// Reads the calling thread's capability set `which`.
///
/// # Errors
///
/// Returns [`PrivilegeError::Capability`] if the set cannot be read.
pub fn read(which: CapSet) -> Result<CapabilitySet, PrivilegeError> {
    caps::read(None, which)
        .map(CapabilitySet)
        .map_err(|e| caps_error(&e))
}

/// Reads the calling thread's permitted capabilities.
///
/// # Errors
///
/// Returns [`PrivilegeError::Capability`] if the set cannot be read.
pub fn permitted() -> Result<CapabilitySet, PrivilegeError> {
    read(CapSet::Permitted)
}

/// Returns `true` if `cap` is in the calling thread's effective set.
///
/// Unreadable capability state is treated as not holding the capability.
pub fn has_effective(cap: Capability) -> bool {
    caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_accepts_short_and_lowercase_forms() {
        assert_eq!(
            CapabilitySet::parse_name("sys_admin").unwrap(),
            Capability::CAP_SYS_ADMIN
        );
        assert_eq!(
            CapabilitySet::parse_name("CAP_NET_RAW").unwrap(),
            Capability::CAP_NET_RAW
        );
        assert_eq!(
            CapabilitySet::parse_name(" cap_chown ").unwrap(),
            Capability::CAP_CHOWN
        );
    }

    #[test]
    fn parse_name_rejects_unknown() {
        assert!(matches!(
            CapabilitySet::parse_name("CAP_TELEPORT"),
            Err(ConfigError::UnknownCapability { name }) if name == "CAP_TELEPORT"
        ));
    }

    #[test]
    fn parse_list_skips_empty_items() {
        let set = CapabilitySet::parse_list("chown,, kill ,").unwrap();
        assert_eq!(set.names(), vec!["CAP_CHOWN", "CAP_KILL"]);
    }

    #[test]
    fn parse_list_all_selects_everything() {
        let set = CapabilitySet::parse_list("all").unwrap();
        assert_eq!(set, CapabilitySet::all());
    }

    #[test]
    fn to_list_parses_back_to_the_same_set() {
        let set = CapabilitySet::parse_list("net_raw,chown").unwrap();
        assert_eq!(set.to_list(), "CAP_CHOWN,CAP_NET_RAW");
        assert_eq!(CapabilitySet::parse_list(&set.to_list()).unwrap(), set);
    }

    #[test]
    fn set_algebra() {
        let a: CapabilitySet = [Capability::CAP_CHOWN, Capability::CAP_KILL]
            .into_iter()
            .collect();
        let b: CapabilitySet = [Capability::CAP_KILL].into_iter().collect();
        assert_eq!(a.difference(&b).names(), vec!["CAP_CHOWN"]);
        assert_eq!(a.intersection(&b), b);
        assert_eq!(b.union(&a), a);
    }
}
