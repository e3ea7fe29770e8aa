//! Image resolution seam.
//!
//! The engine only needs a host directory to use as the container root
//! and whether it may be written. Format detection and fetching live
//! behind [`ImageResolver`].

use std::path::{Path, PathBuf};

use capsule_common::error::ConfigError;
use nix::unistd::AccessFlags;

/// A mountable root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFs {
    /// Host directory holding the tree.
    pub path: PathBuf,
    /// Whether the tree must be mounted read-only.
    pub read_only: bool,
}

/// Turns an image path into a [`RootFs`].
pub trait ImageResolver {
    /// Resolves `image`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Image`] if the image cannot be used.
    fn resolve(&self, image: &Path) -> Result<RootFs, ConfigError>;
}

/// Resolves unpacked root filesystem directories.
#[derive(Debug, Default)]
pub struct DirectoryImage;

impl ImageResolver for DirectoryImage {
    fn resolve(&self, image: &Path) -> Result<RootFs, ConfigError> {
        let fail = |message: &str| ConfigError::Image {
            reference: image.display().to_string(),
            message: message.to_owned(),
        };
        let meta = std::fs::metadata(image).map_err(|e| fail(&e.to_string()))?;
        if !meta.is_dir() {
            return Err(fail("not a root filesystem directory"));
        }
        let read_only = nix::unistd::access(image, AccessFlags::W_OK).is_err();
        tracing::debug!(image = %image.display(), read_only, "image resolved");
        Ok(RootFs {
            path: image.to_path_buf(),
            read_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_resolves_to_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let root = DirectoryImage.resolve(dir.path()).unwrap();
        assert_eq!(root.path, dir.path());
    }

    #[test]
    fn plain_file_is_not_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("image.sif");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            DirectoryImage.resolve(&file),
            Err(ConfigError::Image { .. })
        ));
        assert!(DirectoryImage.resolve(&dir.path().join("absent")).is_err());
    }
}
