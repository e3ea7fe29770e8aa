//! Chroot-style path resolution.
//!
//! Mount targets come from the user and from the image; a symlink inside
//! the image must never redirect a mount onto the host. Paths are walked
//! one component at a time and absolute links restart at the container
//! root instead of the host root.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use capsule_common::constants::MAX_SYMLINK_HOPS;
use capsule_common::error::MountError;

/// Resolves container path `path` against the tree at `root`.
///
/// Symlinks are followed relative to `root`, `..` never climbs above it,
/// and components that do not exist yet are kept literally.
///
/// # Errors
///
/// Returns [`MountError::SymlinkLoop`] after too many links, or
/// [`MountError::Io`] if a link cannot be read.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf, MountError> {
    let mut pending: VecDeque<OsString> = components(path).into();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0usize;

    while let Some(name) = pending.pop_front() {
        if name == ".." {
            let _ = resolved.pop();
            continue;
        }

        let candidate = join(root, &resolved).join(&name);
        let is_link = std::fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved.push(name);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(MountError::SymlinkLoop {
                path: path.to_path_buf(),
            });
        }
        let target = std::fs::read_link(&candidate).map_err(|source| MountError::Io {
            path: candidate.clone(),
            source,
        })?;
        if target.is_absolute() {
            resolved.clear();
        }
        for component in components(&target).into_iter().rev() {
            pending.push_front(component);
        }
    }

    Ok(join(root, &resolved))
}

/// Lexically normalizes an absolute container path.
///
/// Returns `None` if `..` would climb above `/`.
#[must_use]
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Some(out)
}

fn components(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

fn join(root: &Path, parts: &[OsString]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |acc, p| acc.join(p))
}
