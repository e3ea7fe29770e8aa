//! Filesystem management for container isolation.
//!
//! Provides the [`mount::Mounter`] seam over mount syscalls, `OverlayFS`
//! layering, `pivot_root` for secure root filesystem switching, and
//! resolution of container paths that cannot escape the root.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
pub mod resolve;
