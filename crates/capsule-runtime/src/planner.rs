//! Mount Planner: the ordered filesystem operations for a launch.
//!
//! The plan is built in a fixed sequence:
//!
//! 1. image root (bind or overlay)
//! 2. `/proc`, `/sys`, `/dev`
//! 3. containment defaults, or host sharing when not contained
//! 4. GPU device nodes
//! 5. user binds in the order given
//! 6. home
//! 7. scratch directories
//! 8. workdir-backed `/tmp` and `/var/tmp`
//! 9. read-only remount of the root
//!
//! Later operations shadow earlier ones at the same destination. That is
//! how users override defaults, so it is never an error.

use std::fmt;
use std::path::{Path, PathBuf};

use capsule_common::constants::MINIMAL_DEVICES;
use capsule_common::error::MountError;
use capsule_common::types::NamespaceKind;
use capsule_core::filesystem::overlayfs::OverlayConfig;
use nix::mount::MsFlags;

use crate::image::RootFs;
use crate::spec::LaunchSpec;

/// What a [`MountOp`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Bind a host path.
    Bind {
        /// Include submounts.
        recursive: bool,
    },
    /// Fresh tmpfs.
    Tmpfs,
    /// Fresh procfs for the new PID namespace.
    Proc,
    /// Overlay of a directory on the image.
    Overlay(OverlayConfig),
    /// Change flags of an existing bind.
    Remount,
}

impl MountKind {
    /// Short name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Tmpfs => "tmpfs",
            Self::Proc => "proc",
            Self::Overlay(_) => "overlay",
            Self::Remount => "remount",
        }
    }
}

/// Where a [`MountOp`] lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountTarget {
    /// The container root itself.
    Root,
    /// An absolute, normalized path inside the container.
    Container(PathBuf),
}

impl MountTarget {
    /// The destination as seen from inside the container.
    #[must_use]
    pub fn container_path(&self) -> &Path {
        match self {
            Self::Root => Path::new("/"),
            Self::Container(path) => path,
        }
    }
}

/// Why an operation is in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOrigin {
    /// Builds the root itself.
    Root,
    /// Engine default.
    Default,
    /// Requested by the user.
    User,
}

/// Kind of mountpoint to create before mounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mountpoint {
    /// A directory.
    Dir,
    /// An empty regular file, for binding files and device nodes.
    File,
}

/// One planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOp {
    /// Operation.
    pub kind: MountKind,
    /// Host source path, for binds.
    pub source: Option<PathBuf>,
    /// Destination.
    pub target: MountTarget,
    /// Mount flags.
    pub flags: MsFlags,
    /// Filesystem data string.
    pub data: Option<String>,
    /// Whether failure aborts the launch.
    pub must_succeed: bool,
    /// Why the operation exists.
    pub origin: MountOrigin,
    /// Mountpoint to create when missing.
    pub mountpoint: Mountpoint,
    /// Create the source directory if it does not exist yet.
    pub create_source: bool,
}

impl MountOp {
    fn bind(source: PathBuf, dest: PathBuf, flags: MsFlags, origin: MountOrigin) -> Self {
        let mountpoint = if source.is_dir() {
            Mountpoint::Dir
        } else {
            Mountpoint::File
        };
        Self {
            kind: MountKind::Bind { recursive: true },
            source: Some(source),
            target: MountTarget::Container(dest),
            flags,
            data: None,
            must_succeed: origin == MountOrigin::User,
            origin,
            mountpoint,
            create_source: false,
        }
    }

    fn tmpfs(dest: &str, flags: MsFlags, mode: &str) -> Self {
        Self {
            kind: MountKind::Tmpfs,
            source: None,
            target: MountTarget::Container(PathBuf::from(dest)),
            flags,
            data: Some(format!("mode={mode}")),
            must_succeed: false,
            origin: MountOrigin::Default,
            mountpoint: Mountpoint::Dir,
            create_source: false,
        }
    }

    fn remount(target: MountTarget, flags: MsFlags, origin: MountOrigin) -> Self {
        Self {
            kind: MountKind::Remount,
            source: None,
            target,
            flags,
            data: None,
            must_succeed: true,
            origin,
            mountpoint: Mountpoint::Dir,
            create_source: false,
        }
    }

    const fn created(mut self) -> Self {
        self.create_source = true;
        self.mountpoint = Mountpoint::Dir;
        self
    }

    /// Returns `true` if this operation places something at its target.
    #[must_use]
    pub const fn is_mount(&self) -> bool {
        !matches!(self.kind, MountKind::Remount)
    }

    /// Flags rendered as `ro,nosuid,...`.
    #[must_use]
    pub fn flags_label(&self) -> String {
        let labels: Vec<&str> = [
            (MsFlags::MS_RDONLY, "ro"),
            (MsFlags::MS_NOSUID, "nosuid"),
            (MsFlags::MS_NODEV, "nodev"),
            (MsFlags::MS_NOEXEC, "noexec"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.flags.contains(*flag))
        .map(|(_, label)| label)
        .collect();
        if labels.is_empty() {
            "-".to_owned()
        } else {
            labels.join(",")
        }
    }
}

impl fmt::Display for MountOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match (&self.kind, &self.source) {
            (MountKind::Overlay(config), _) => config.options(),
            (_, Some(source)) => source.display().to_string(),
            (kind, None) => kind.name().to_owned(),
        };
        write!(
            f,
            "{} {} -> {} [{}]",
            self.kind.name(),
            source,
            self.target.container_path().display(),
            self.flags_label()
        )
    }
}

/// Host facts the planner needs.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// Staging directory; the container root is built at `<session>/final`.
    pub session_dir: PathBuf,
    /// Invoking user's home directory.
    pub host_home: Option<PathBuf>,
    /// Host `/dev`, scanned for GPU nodes.
    pub host_dev: PathBuf,
}

impl PlanContext {
    /// Where the container root is assembled.
    #[must_use]
    pub fn root_dir(&self) -> PathBuf {
        self.session_dir.join("final")
    }
}

/// The ordered operations building one container root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    session_dir: PathBuf,
    root: PathBuf,
    ops: Vec<MountOp>,
}

impl MountPlan {
    /// Staging directory covered by the session tmpfs.
    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Host path where the root is assembled.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Operations in execution order.
    #[must_use]
    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    /// The operation whose mount is visible at `dest` once the plan ran.
    #[must_use]
    pub fn visible_at(&self, dest: &Path) -> Option<&MountOp> {
        self.ops
            .iter()
            .rev()
            .find(|op| op.is_mount() && op.target.container_path() == dest)
    }

    /// Returns `true` if the mount visible at `dest` ends up read-only.
    #[must_use]
    pub fn is_read_only(&self, dest: &Path) -> bool {
        let Some(last) = self
            .ops
            .iter()
            .rposition(|op| op.is_mount() && op.target.container_path() == dest)
        else {
            return false;
        };
        self.ops[last..].iter().any(|op| {
            op.target.container_path() == dest && op.flags.contains(MsFlags::MS_RDONLY)
        })
    }
}

/// Computes the mount plan for `spec` over `rootfs`.
///
/// # Errors
///
/// Returns [`MountError::NotFound`] or [`MountError::PermissionDenied`]
/// when an explicit source cannot be used.
pub fn plan(spec: &LaunchSpec, rootfs: &RootFs, ctx: &PlanContext) -> Result<MountPlan, MountError> {
    let nosuid = if spec.privileges.allow_setuid {
        MsFlags::empty()
    } else {
        MsFlags::MS_NOSUID
    };
    let root = ctx.root_dir();
    let mut ops = Vec::new();

    // 1. image root
    let writable_overlay = spec.overlay.as_ref().is_some_and(|o| o.writable);
    match &spec.overlay {
        Some(overlay) => {
            probe(&overlay.path)?;
            let mut config =
                OverlayConfig::over_image(&rootfs.path, &overlay.path, overlay.writable, root.clone());
            config.userxattr = spec.wants(NamespaceKind::User);
            ops.push(MountOp {
                kind: MountKind::Overlay(config),
                source: Some(overlay.path.clone()),
                target: MountTarget::Root,
                flags: nosuid,
                data: None,
                must_succeed: true,
                origin: MountOrigin::User,
                mountpoint: Mountpoint::Dir,
                create_source: false,
            });
        }
        None => {
            probe(&rootfs.path)?;
            ops.push(MountOp {
                kind: MountKind::Bind { recursive: true },
                source: Some(rootfs.path.clone()),
                target: MountTarget::Root,
                flags: nosuid,
                data: None,
                must_succeed: true,
                origin: MountOrigin::Root,
                mountpoint: Mountpoint::Dir,
                create_source: false,
            });
        }
    }

    // 2. system trees
    let pseudo = nosuid | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    if spec.wants(NamespaceKind::Pid) {
        ops.push(MountOp {
            kind: MountKind::Proc,
            source: None,
            target: MountTarget::Container(PathBuf::from("/proc")),
            flags: pseudo,
            data: None,
            must_succeed: true,
            origin: MountOrigin::Default,
            mountpoint: Mountpoint::Dir,
            create_source: false,
        });
    } else {
        let mut proc = MountOp::bind("/proc".into(), "/proc".into(), pseudo, MountOrigin::Default);
        proc.must_succeed = true;
        ops.push(proc);
    }
    ops.push(MountOp::bind("/sys".into(), "/sys".into(), pseudo, MountOrigin::Default));
    if spec.contain {
        ops.push(MountOp::tmpfs("/dev", nosuid | MsFlags::MS_NOEXEC, "755"));
        for dev in MINIMAL_DEVICES {
            let path = Path::new("/dev").join(dev);
            let mut node = MountOp::bind(path.clone(), path, nosuid, MountOrigin::Default);
            node.kind = MountKind::Bind { recursive: false };
            node.mountpoint = Mountpoint::File;
            ops.push(node);
        }
    } else {
        ops.push(MountOp::bind("/dev".into(), "/dev".into(), nosuid, MountOrigin::Default));
    }

    // 3. containment or host sharing
    let tmp_flags = nosuid | MsFlags::MS_NODEV;
    if spec.contain {
        ops.push(MountOp::tmpfs("/tmp", tmp_flags, "1777"));
        ops.push(MountOp::tmpfs("/var/tmp", tmp_flags, "1777"));
        ops.push(MountOp::tmpfs("/home", tmp_flags, "755"));
        if let Some(home) = ctx.host_home.as_ref().filter(|_| spec.home.is_none()) {
            if home.starts_with("/home") && home != Path::new("/home") {
                let mut private = MountOp::tmpfs("/", tmp_flags, "700");
                private.target = MountTarget::Container(home.clone());
                ops.push(private);
            }
        }
    } else {
        for dir in ["/tmp", "/var/tmp"] {
            ops.push(MountOp::bind(dir.into(), dir.into(), nosuid, MountOrigin::Default));
        }
        if let Some(home) = ctx.host_home.as_ref().filter(|_| spec.home.is_none()) {
            ops.push(MountOp::bind(home.clone(), home.clone(), nosuid, MountOrigin::Default));
        }
    }

    // 4. GPU nodes; an uncontained /dev already exposes them
    if spec.nv && spec.contain {
        for node in gpu_nodes(&ctx.host_dev) {
            let dest = Path::new("/dev").join(node.file_name().unwrap_or_default());
            let mut op = MountOp::bind(node, dest, nosuid, MountOrigin::Default);
            op.kind = MountKind::Bind { recursive: false };
            op.mountpoint = Mountpoint::File;
            ops.push(op);
        }
    }

    // 5. user binds
    for bind in &spec.mounts {
        probe(&bind.source)?;
        ops.push(MountOp::bind(bind.source.clone(), bind.dest.clone(), nosuid, MountOrigin::User));
        if bind.mode.is_read_only() {
            ops.push(MountOp::remount(
                MountTarget::Container(bind.dest.clone()),
                nosuid | MsFlags::MS_RDONLY,
                MountOrigin::User,
            ));
        }
    }

    // 6. home
    if let Some(home) = &spec.home {
        probe(&home.source)?;
        ops.push(MountOp::bind(home.source.clone(), home.dest.clone(), nosuid, MountOrigin::User));
    } else if let (true, Some(workdir), Some(home)) = (spec.contain, &spec.workdir, &ctx.host_home) {
        probe(workdir)?;
        ops.push(
            MountOp::bind(workdir.join("home"), home.clone(), nosuid, MountOrigin::User).created(),
        );
    }

    // 7. scratch
    let scratch_root = spec
        .workdir
        .as_ref()
        .map_or_else(|| ctx.session_dir.join("scratch"), |w| w.join("scratch"));
    for dest in &spec.scratch {
        let source = scratch_root.join(dest.strip_prefix("/").unwrap_or(dest));
        ops.push(MountOp::bind(source, dest.clone(), nosuid, MountOrigin::User).created());
    }

    // 8. workdir
    if let Some(workdir) = &spec.workdir {
        probe(workdir)?;
        for (sub, dest) in [("tmp", "/tmp"), ("var_tmp", "/var/tmp")] {
            ops.push(
                MountOp::bind(workdir.join(sub), dest.into(), tmp_flags, MountOrigin::User).created(),
            );
        }
    }

    // 9. read-only root, last so mountpoints could still be created
    let overlay_read_only = spec.overlay.as_ref().is_some_and(|o| !o.writable);
    if spec.readonly || (rootfs.read_only && !writable_overlay) || overlay_read_only {
        ops.push(MountOp::remount(
            MountTarget::Root,
            nosuid | MsFlags::MS_RDONLY,
            MountOrigin::Root,
        ));
    }

    tracing::debug!(ops = ops.len(), root = %root.display(), "mount plan computed");
    Ok(MountPlan {
        session_dir: ctx.session_dir.clone(),
        root,
        ops,
    })
}

fn probe(path: &Path) -> Result<(), MountError> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|e| MountError::from_probe(path.to_path_buf(), &e))
}

fn gpu_nodes(dev: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return Vec::new();
    };
    let mut nodes: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("nvidia"))
        .map(|e| e.path())
        .filter(|p| !p.is_dir())
        .collect();
    nodes.sort();
    nodes
}
