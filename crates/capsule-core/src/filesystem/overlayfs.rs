//! `OverlayFS` management for layered container filesystems.
//!
//! An overlay stacks a user directory over the image root. With an upper
//! layer the merged tree is writable and changes land in the upper
//! directory; without one both directories become read-only lower layers.

use std::path::{Path, PathBuf};

use capsule_common::error::MountError;
use nix::mount::MsFlags;

use super::mount::Mounter;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, topmost first.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: Option<PathBuf>,
    /// Work directory required alongside the upper layer.
    pub work_dir: Option<PathBuf>,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
    /// Store overlay metadata in `user.*` xattrs, needed inside a user namespace.
    pub userxattr: bool,
}

impl OverlayConfig {
    /// Overlay of `overlay` on top of `image`.
    ///
    /// A writable overlay uses `overlay/upper` and `overlay/work`; a
    /// read-only one adds `overlay` as a second lower layer.
    #[must_use]
    pub fn over_image(image: &Path, overlay: &Path, writable: bool, merged_dir: PathBuf) -> Self {
        if writable {
            Self {
                lower_dirs: vec![image.to_path_buf()],
                upper_dir: Some(overlay.join("upper")),
                work_dir: Some(overlay.join("work")),
                merged_dir,
                userxattr: false,
            }
        } else {
            Self {
                lower_dirs: vec![overlay.to_path_buf(), image.to_path_buf()],
                upper_dir: None,
                work_dir: None,
                merged_dir,
                userxattr: false,
            }
        }
    }

    /// Returns `true` if the merged tree accepts writes.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.upper_dir.is_some()
    }

    /// The mount data string passed to the kernel.
    #[must_use]
    pub fn options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let mut opts = format!("lowerdir={lowers}");
        if let (Some(upper), Some(work)) = (&self.upper_dir, &self.work_dir) {
            opts.push_str(&format!(
                ",upperdir={},workdir={}",
                upper.display(),
                work.display()
            ));
        }
        if self.userxattr {
            opts.push_str(",userxattr");
        }
        opts
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// Creates the upper and work directories if they do not exist.
///
/// # Errors
///
/// Returns [`MountError::Io`] if directory creation fails or
/// [`MountError::Syscall`] if the mount is refused.
pub fn mount_overlay(mounter: &mut dyn Mounter, config: &OverlayConfig) -> Result<(), MountError> {
    for dir in config.upper_dir.iter().chain(config.work_dir.iter()) {
        std::fs::create_dir_all(dir).map_err(|source| MountError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    let opts = config.options();
    mounter
        .mount(
            Some(Path::new("overlay")),
            &config.merged_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(opts.as_str()),
        )
        .map_err(|source| MountError::Syscall {
            operation: "overlay",
            target: config.merged_dir.clone(),
            source,
        })?;

    tracing::info!(
        merged = %config.merged_dir.display(),
        writable = config.is_writable(),
        "overlayfs mounted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_overlay_has_upper_and_work() {
        let config = OverlayConfig::over_image(
            Path::new("/img"),
            Path::new("/ov"),
            true,
            PathBuf::from("/final"),
        );
        assert!(config.is_writable());
        assert_eq!(
            config.options(),
            "lowerdir=/img,upperdir=/ov/upper,workdir=/ov/work"
        );
    }

    #[test]
    fn read_only_overlay_stacks_two_lowers() {
        let mut config = OverlayConfig::over_image(
            Path::new("/img"),
            Path::new("/ov"),
            false,
            PathBuf::from("/final"),
        );
        config.userxattr = true;
        assert!(!config.is_writable());
        assert_eq!(config.options(), "lowerdir=/ov:/img,userxattr");
    }
}
