//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. The old root is
//! stacked under the new one by `pivot_root(".", ".")` and detached
//! right away, so no host path stays reachable.

use std::path::{Path, PathBuf};

use capsule_common::error::MountError;
use nix::errno::Errno;
use nix::mount::MntFlags;
use nix::unistd::chdir;

use super::mount::Mounter;

/// Pivots into `new_root`, which must be a mount point.
///
/// # Errors
///
/// Returns the errno of `chdir(2)`, `pivot_root(2)`, or `umount2(2)`.
pub(crate) fn pivot_into(new_root: &Path) -> Result<(), Errno> {
    chdir(new_root)?;
    nix::unistd::pivot_root(".", ".")?;
    nix::mount::umount2(".", MntFlags::MNT_DETACH)?;
    chdir("/")?;
    tracing::info!(new_root = %new_root.display(), "pivoted into container root");
    Ok(())
}

/// Switches the caller's root to `new_root` through `mounter`.
///
/// # Errors
///
/// Returns [`MountError::Syscall`] naming `pivot_root` on failure.
pub fn switch_root(mounter: &mut dyn Mounter, new_root: &Path) -> Result<(), MountError> {
    mounter
        .pivot_root(new_root)
        .map_err(|source| MountError::Syscall {
            operation: "pivot_root",
            target: PathBuf::from(new_root),
            source,
        })
}
