//! # capsule-core
//!
//! Low-level Linux isolation primitives for the Capsule launch engine.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: user, mount, IPC, UTS, network and PID creation or
//!   entry, driven by a typestate orchestrator that fixes the order.
//! - **Init process**: the PID 1 helper that reaps children inside a new
//!   PID namespace and forwards termination signals.
//! - **Filesystem**: mount syscalls behind the [`filesystem::mount::Mounter`]
//!   seam, `OverlayFS`, `pivot_root`, and chroot-style path resolution.
//! - **Capabilities and privileges**: capability parsing, the final
//!   capability computation, and the irreversible identity drop.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod filesystem;
pub mod namespace;
pub mod privilege;
