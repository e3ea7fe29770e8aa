//! Applies a [`MountPlan`] inside the private mount namespace.
//!
//! The session directory is covered by a tmpfs first, so everything
//! staged under it disappears with the namespace. Optional operations
//! that fail are logged and skipped. A failing required operation
//! detaches every mount made so far, newest first, before the error is
//! returned.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use capsule_common::error::MountError;
use capsule_core::filesystem::mount::Mounter;
use capsule_core::filesystem::overlayfs::mount_overlay;
use capsule_core::filesystem::pivot_root::switch_root;
use capsule_core::filesystem::resolve::resolve_in_root;
use nix::mount::MsFlags;

use crate::planner::{MountKind, MountOp, MountPlan, MountTarget, Mountpoint};

/// A fully assembled container root, not yet entered.
#[derive(Debug)]
pub struct StagedRoot {
    root: PathBuf,
    mounted: Vec<PathBuf>,
    skipped: usize,
}

impl StagedRoot {
    /// Host path of the assembled root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host paths mounted, in order.
    #[must_use]
    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    /// Number of optional operations that were skipped.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Makes the staged root the process root.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Syscall`] if `pivot_root` fails; the staged
    /// mounts are detached first.
    pub fn enter(mut self, mounter: &mut dyn Mounter) -> Result<(), MountError> {
        if let Err(e) = switch_root(mounter, &self.root) {
            rollback(mounter, &mut self.mounted);
            return Err(e);
        }
        Ok(())
    }

    /// Detaches every staged mount, newest first.
    pub fn teardown(mut self, mounter: &mut dyn Mounter) {
        rollback(mounter, &mut self.mounted);
    }
}

/// Executes `plan` through `mounter`.
///
/// # Errors
///
/// Returns the [`MountError`] of the first required operation that fails.
pub fn stage(mounter: &mut dyn Mounter, plan: &MountPlan) -> Result<StagedRoot, MountError> {
    let mut mounted = Vec::new();
    match run(mounter, plan, &mut mounted) {
        Ok(skipped) => {
            tracing::info!(
                root = %plan.root().display(),
                mounts = mounted.len(),
                skipped,
                "container root staged"
            );
            Ok(StagedRoot {
                root: plan.root().to_path_buf(),
                mounted,
                skipped,
            })
        }
        Err(e) => {
            rollback(mounter, &mut mounted);
            Err(e)
        }
    }
}

fn run(
    mounter: &mut dyn Mounter,
    plan: &MountPlan,
    mounted: &mut Vec<PathBuf>,
) -> Result<usize, MountError> {
    let session = plan.session_dir();
    create_dir(session)?;
    mounter
        .mount(
            Some(Path::new("tmpfs")),
            session,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0700"),
        )
        .map_err(|source| MountError::Syscall {
            operation: "tmpfs",
            target: session.to_path_buf(),
            source,
        })?;
    mounted.push(session.to_path_buf());
    create_dir(plan.root())?;

    let mut skipped = 0;
    for op in plan.ops() {
        match apply(mounter, plan.root(), op) {
            Ok(Some(target)) => mounted.push(target),
            Ok(None) => {}
            Err(e) if op.must_succeed => return Err(e),
            Err(e) => {
                skipped += 1;
                tracing::warn!(op = %op, error = %e, "optional mount skipped");
            }
        }
    }
    Ok(skipped)
}

/// Runs one operation; returns the host target when a new mount was made.
fn apply(mounter: &mut dyn Mounter, root: &Path, op: &MountOp) -> Result<Option<PathBuf>, MountError> {
    let target = match &op.target {
        MountTarget::Root => root.to_path_buf(),
        MountTarget::Container(path) => resolve_in_root(root, path)?,
    };
    let syscall = |source| MountError::Syscall {
        operation: op.kind.name(),
        target: target.clone(),
        source,
    };

    if let MountKind::Remount = op.kind {
        mounter.remount(&target, op.flags).map_err(syscall)?;
        tracing::debug!(target = %target.display(), flags = %op.flags_label(), "remounted");
        return Ok(None);
    }

    if let (Some(source), true) = (&op.source, op.create_source) {
        create_dir(source)?;
    }
    if op.target != MountTarget::Root {
        make_mountpoint(&target, op.mountpoint)?;
    }

    match &op.kind {
        MountKind::Overlay(config) => mount_overlay(mounter, config)?,
        MountKind::Bind { recursive } => {
            let mut flags = MsFlags::MS_BIND;
            if *recursive {
                flags |= MsFlags::MS_REC;
            }
            mounter
                .mount(op.source.as_deref(), &target, None, flags, None)
                .map_err(syscall)?;
            // Bind mounts ignore per-mount flags until remounted. A bind
            // that cannot take its flags must not stay visible without them.
            if !op.flags.is_empty() {
                if let Err(source) = mounter.remount(&target, op.flags) {
                    if let Err(e) = mounter.unmount(&target) {
                        tracing::warn!(target = %target.display(), error = %e, "detaching unflagged bind failed");
                    }
                    return Err(syscall(source));
                }
            }
        }
        MountKind::Tmpfs => mounter
            .mount(Some(Path::new("tmpfs")), &target, Some("tmpfs"), op.flags, op.data.as_deref())
            .map_err(syscall)?,
        MountKind::Proc => mounter
            .mount(Some(Path::new("proc")), &target, Some("proc"), op.flags, None)
            .map_err(syscall)?,
        MountKind::Remount => {}
    }
    tracing::debug!(op = %op, host_target = %target.display(), "mounted");
    Ok(Some(target))
}

fn rollback(mounter: &mut dyn Mounter, mounted: &mut Vec<PathBuf>) {
    while let Some(target) = mounted.pop() {
        if let Err(e) = mounter.unmount(&target) {
            tracing::warn!(target = %target.display(), error = %e, "rollback unmount failed");
        }
    }
}

fn create_dir(path: &Path) -> Result<(), MountError> {
    std::fs::create_dir_all(path).map_err(|source| MountError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn make_mountpoint(target: &Path, kind: Mountpoint) -> Result<(), MountError> {
    if target.symlink_metadata().is_ok() {
        return Ok(());
    }
    match kind {
        Mountpoint::Dir => create_dir(target),
        Mountpoint::File => {
            if let Some(parent) = target.parent() {
                create_dir(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(target)
                .map(|_| ())
                .map_err(|source| MountError::Io {
                    path: target.to_path_buf(),
                    source,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use capsule_common::options::OptionMap;
    use nix::errno::Errno;

    use super::*;
    use crate::host::HostSupport;
    use crate::image::RootFs;
    use crate::planner::{PlanContext, plan};
    use crate::resolver::{ResolveContext, resolve};

    #[derive(Default)]
    struct FakeMounter {
        log: Vec<String>,
        fail_on: Option<PathBuf>,
        fail_remount_on: Option<PathBuf>,
    }

    impl Mounter for FakeMounter {
        fn mount(
            &mut self,
            _source: Option<&Path>,
            target: &Path,
            fstype: Option<&str>,
            _flags: MsFlags,
            _data: Option<&str>,
        ) -> Result<(), Errno> {
            if self.fail_on.as_deref() == Some(target) {
                return Err(Errno::EPERM);
            }
            self.log
                .push(format!("mount {} {}", fstype.unwrap_or("bind"), target.display()));
            Ok(())
        }

        fn remount(&mut self, target: &Path, _flags: MsFlags) -> Result<(), Errno> {
            if self.fail_remount_on.as_deref() == Some(target) {
                return Err(Errno::EPERM);
            }
            self.log.push(format!("remount {}", target.display()));
            Ok(())
        }

        fn unmount(&mut self, target: &Path) -> Result<(), Errno> {
            self.log.push(format!("umount {}", target.display()));
            Ok(())
        }

        fn pivot_root(&mut self, new_root: &Path) -> Result<(), Errno> {
            self.log.push(format!("pivot {}", new_root.display()));
            Ok(())
        }
    }

    fn plan_with(dir: &Path, options: OptionMap) -> MountPlan {
        let image = dir.join("image");
        std::fs::create_dir_all(&image).unwrap();
        let options = options.with_value("image", image.display().to_string());
        let spec = resolve(
            &options,
            &ResolveContext {
                host: HostSupport::full(),
                default_shell: PathBuf::from("/bin/sh"),
            },
        )
        .unwrap();
        let ctx = PlanContext {
            session_dir: dir.join("session"),
            host_home: None,
            host_dev: dir.join("dev"),
        };
        plan(
            &spec,
            &RootFs {
                path: image,
                read_only: false,
            },
            &ctx,
        )
        .unwrap()
    }

    #[test]
    fn staging_mounts_session_then_root_and_creates_mountpoints() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let plan = plan_with(
            dir.path(),
            OptionMap::new().with_item("bind", format!("{}:/mnt:ro", data.display())),
        );
        let mut mounter = FakeMounter::default();
        let staged = stage(&mut mounter, &plan).unwrap();

        assert_eq!(
            mounter.log[0],
            format!("mount tmpfs {}", plan.session_dir().display())
        );
        assert_eq!(mounter.log[1], format!("mount bind {}", plan.root().display()));
        assert!(plan.root().join("mnt").is_dir());
        assert!(
            mounter
                .log
                .iter()
                .any(|l| l == &format!("remount {}", plan.root().join("mnt").display()))
        );
        assert_eq!(staged.mounted()[0], plan.session_dir());
    }

    #[test]
    fn required_failure_rolls_back_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let plan = plan_with(
            dir.path(),
            OptionMap::new().with_item("bind", format!("{}:/mnt", data.display())),
        );
        let mut mounter = FakeMounter {
            fail_on: Some(plan.root().join("mnt")),
            ..FakeMounter::default()
        };
        let err = stage(&mut mounter, &plan).unwrap_err();
        assert!(matches!(err, MountError::Syscall { operation: "bind", .. }));

        let mounts: Vec<_> = mounter
            .log
            .iter()
            .filter_map(|l| l.strip_prefix("mount ").and_then(|l| l.split_once(' ')))
            .map(|(_, target)| target.to_owned())
            .collect();
        let unmounts: Vec<_> = mounter
            .log
            .iter()
            .filter_map(|l| l.strip_prefix("umount "))
            .map(str::to_owned)
            .collect();
        let mut expected = mounts.clone();
        expected.reverse();
        assert_eq!(unmounts, expected);
    }

    #[test]
    fn optional_failure_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_with(dir.path(), OptionMap::new().with_flag("contain", true));
        let mut mounter = FakeMounter {
            fail_on: Some(plan.root().join("tmp")),
            ..FakeMounter::default()
        };
        let staged = stage(&mut mounter, &plan).unwrap();
        assert_eq!(staged.skipped(), 1);
        assert!(!mounter.log.iter().any(|l| l.starts_with("umount")));
    }

    #[test]
    fn bind_that_cannot_take_its_flags_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_with(dir.path(), OptionMap::new());
        let tmp = plan.root().join("tmp");
        let mut mounter = FakeMounter {
            fail_remount_on: Some(tmp.clone()),
            ..FakeMounter::default()
        };
        let staged = stage(&mut mounter, &plan).unwrap();

        assert_eq!(staged.skipped(), 1);
        assert!(!staged.mounted().contains(&tmp));
        let bound = mounter
            .log
            .iter()
            .position(|l| l == &format!("mount bind {}", tmp.display()))
            .unwrap();
        let detached = mounter
            .log
            .iter()
            .position(|l| l == &format!("umount {}", tmp.display()))
            .unwrap();
        assert!(detached > bound);
    }

    #[test]
    fn required_bind_without_flags_applied_fails_and_leaves_nothing_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let plan = plan_with(
            dir.path(),
            OptionMap::new().with_item("bind", format!("{}:/mnt:ro", data.display())),
        );
        let mut mounter = FakeMounter {
            fail_remount_on: Some(plan.root().join("mnt")),
            ..FakeMounter::default()
        };
        let err = stage(&mut mounter, &plan).unwrap_err();
        assert!(matches!(err, MountError::Syscall { operation: "bind", .. }));

        let mounts = mounter.log.iter().filter(|l| l.starts_with("mount ")).count();
        let unmounts = mounter.log.iter().filter(|l| l.starts_with("umount ")).count();
        assert_eq!(mounts, unmounts);
    }

    #[test]
    fn enter_pivots_into_the_staged_root() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_with(dir.path(), OptionMap::new());
        let mut mounter = FakeMounter::default();
        let staged = stage(&mut mounter, &plan).unwrap();
        staged.enter(&mut mounter).unwrap();
        assert_eq!(
            mounter.log.last().unwrap(),
            &format!("pivot {}", plan.root().display())
        );
    }
}
