//! Mount syscalls used while staging the container root.
//!
//! Everything the stager does to the mount table goes through the
//! [`Mounter`] trait so plans can be applied against a recording fake.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::statvfs::{FsFlags, statvfs};

/// Flags the kernel refuses to clear on a remount inside a user namespace.
const LOCKABLE: [(FsFlags, MsFlags); 7] = [
    (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
    (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
    (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
    (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
    (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
    (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
    (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
];

/// Recursively marks every mount private to the current mount namespace.
///
/// # Errors
///
/// Returns the errno of `mount(2)`.
pub fn make_rprivate() -> Result<(), Errno> {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

/// Per-mount flags currently set on the mount containing `path`.
///
/// # Errors
///
/// Returns the errno of `statvfs(3)`.
pub fn current_flags(path: &Path) -> Result<MsFlags, Errno> {
    let stat = statvfs(path)?;
    let fs = stat.flags();
    Ok(LOCKABLE
        .iter()
        .filter(|(st, _)| fs.contains(*st))
        .fold(MsFlags::empty(), |acc, (_, ms)| acc | *ms))
}

/// Mount table operations.
pub trait Mounter {
    /// Mounts `source` on `target`.
    ///
    /// # Errors
    ///
    /// Returns the errno of `mount(2)`.
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno>;

    /// Changes the per-mount flags of an existing bind mount.
    ///
    /// # Errors
    ///
    /// Returns the errno of `mount(2)`.
    fn remount(&mut self, target: &Path, flags: MsFlags) -> Result<(), Errno>;

    /// Lazily detaches the mount at `target`.
    ///
    /// # Errors
    ///
    /// Returns the errno of `umount2(2)`.
    fn unmount(&mut self, target: &Path) -> Result<(), Errno>;

    /// Makes `new_root` the root of the mount namespace, detaching the old one.
    ///
    /// # Errors
    ///
    /// Returns the errno of the first failing step.
    fn pivot_root(&mut self, new_root: &Path) -> Result<(), Errno>;
}

/// [`Mounter`] issuing real syscalls.
#[derive(Debug, Default)]
pub struct LinuxMounter;

impl Mounter for LinuxMounter {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno> {
        nix::mount::mount(source, target, fstype, flags, data)?;
        tracing::trace!(
            source = ?source,
            target = %target.display(),
            fstype = ?fstype,
            flags = ?flags,
            "mounted"
        );
        Ok(())
    }

    fn remount(&mut self, target: &Path, flags: MsFlags) -> Result<(), Errno> {
        // Locked flags must be repeated or the kernel rejects the remount with EPERM.
        let wanted = flags | current_flags(target)?;
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | wanted,
            None::<&str>,
        )?;
        tracing::trace!(target = %target.display(), flags = ?wanted, "remounted");
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<(), Errno> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
    }

    fn pivot_root(&mut self, new_root: &Path) -> Result<(), Errno> {
        super::pivot_root::pivot_into(new_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_flags_reads_the_root_mount() {
        // Only checks that statvfs succeeds and yields known flags.
        let flags = current_flags(Path::new("/")).unwrap();
        let known = LOCKABLE.iter().fold(MsFlags::empty(), |acc, (_, ms)| acc | *ms);
        assert!(known.contains(flags));
    }

    #[test]
    fn current_flags_fails_for_missing_path() {
        assert_eq!(
            current_flags(Path::new("/definitely/not/here")),
            Err(Errno::ENOENT)
        );
    }
}
