//! User namespace isolation.
//!
//! Maps container UIDs/GIDs to unprivileged host UIDs, enabling rootless
//! launches and fakeroot.

use std::fs;
use std::path::Path;

use capsule_common::error::NamespaceError;

/// A single-ID mapping between the user namespace and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMapping {
    /// UID seen inside the namespace.
    pub inside_uid: u32,
    /// GID seen inside the namespace.
    pub inside_gid: u32,
    /// Host UID backing `inside_uid`.
    pub outside_uid: u32,
    /// Host GID backing `inside_gid`.
    pub outside_gid: u32,
}

impl IdentityMapping {
    /// Maps the host identity onto itself.
    #[must_use]
    pub const fn identity(uid: u32, gid: u32) -> Self {
        Self {
            inside_uid: uid,
            inside_gid: gid,
            outside_uid: uid,
            outside_gid: gid,
        }
    }

    /// Maps the host identity onto root inside the namespace.
    #[must_use]
    pub const fn root(uid: u32, gid: u32) -> Self {
        Self {
            inside_uid: 0,
            inside_gid: 0,
            outside_uid: uid,
            outside_gid: gid,
        }
    }

    /// Contents of `uid_map`.
    #[must_use]
    pub fn uid_line(&self) -> String {
        format!("{} {} 1\n", self.inside_uid, self.outside_uid)
    }

    /// Contents of `gid_map`.
    #[must_use]
    pub fn gid_line(&self) -> String {
        format!("{} {} 1\n", self.inside_gid, self.outside_gid)
    }
}

/// Writes the UID/GID maps of the calling process's user namespace.
///
/// `setgroups` is denied first, as required for unprivileged user namespaces.
///
/// # Errors
///
/// Returns [`NamespaceError::IdMap`] if writing `/proc/self/setgroups`,
/// `/proc/self/uid_map`, or `/proc/self/gid_map` fails.
pub fn write_id_maps(mapping: &IdentityMapping) -> Result<(), NamespaceError> {
    write_id_maps_at(Path::new("/proc/self"), mapping)
}

/// Writes ID maps below an arbitrary `/proc/<pid>` directory.
///
/// # Errors
///
/// Returns [`NamespaceError::IdMap`] if any of the map files cannot be written.
pub fn write_id_maps_at(proc_dir: &Path, mapping: &IdentityMapping) -> Result<(), NamespaceError> {
    let setgroups = proc_dir.join("setgroups");
    if setgroups.exists() {
        write(&setgroups, "deny")?;
    }
    write(&proc_dir.join("uid_map"), &mapping.uid_line())?;
    write(&proc_dir.join("gid_map"), &mapping.gid_line())?;

    tracing::debug!(
        inside_uid = mapping.inside_uid,
        outside_uid = mapping.outside_uid,
        "wrote UID/GID map"
    );
    Ok(())
}

fn write(path: &Path, contents: &str) -> Result<(), NamespaceError> {
    fs::write(path, contents).map_err(|source| NamespaceError::IdMap {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_mapping_lines() {
        let mapping = IdentityMapping::root(1000, 100);
        assert_eq!(mapping.uid_line(), "0 1000 1\n");
        assert_eq!(mapping.gid_line(), "0 100 1\n");
    }

    #[test]
    fn maps_are_written_after_setgroups_deny() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setgroups"), "allow").unwrap();
        write_id_maps_at(dir.path(), &IdentityMapping::identity(1000, 1000)).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("setgroups")).unwrap(),
            "deny"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("uid_map")).unwrap(),
            "1000 1000 1\n"
        );
    }

    #[test]
    fn missing_proc_dir_is_an_id_map_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_id_maps_at(&dir.path().join("gone"), &IdentityMapping::root(1, 1))
            .unwrap_err();
        assert!(matches!(err, NamespaceError::IdMap { .. }));
    }
}
