//! Launch engine that drives every stage in order.
//!
//! [`Engine::prepare`] resolves options into a [`Prepared`] launch
//! without touching kernel state, so it doubles as the `plan`
//! diagnostic. [`Engine::launch`] then creates namespaces, stages the
//! root, drops privileges and hands over to the target program.

use std::path::{Path, PathBuf};

use capsule_common::config::EngineConfig;
use capsule_common::error::{CapsuleError, LaunchError, Result};
use capsule_common::options::OptionMap;
use capsule_common::types::{LaunchId, NamespaceKind};
use capsule_core::filesystem::mount::{LinuxMounter, Mounter};
use capsule_core::namespace::{
    InitRole, JoinTarget, LinuxNamespaces, NamespaceBackend, NamespaceRequest, NamespaceSet,
    orchestrate, pid,
};
use capsule_core::privilege::PrivilegeController;
use nix::unistd::Pid;

use crate::host::HostContext;
use crate::image::{DirectoryImage, ImageResolver};
use crate::instance::{InstanceRegistry, StateDirRegistry};
use crate::planner::{self, MountPlan, PlanContext};
use crate::process::ProcessLauncher;
use crate::resolver::{self, ResolveContext};
use crate::spec::{ImageRef, LaunchSpec};
use crate::stage::stage;

/// A launch resolved and planned, with no OS state changed yet.
#[derive(Debug, Clone)]
pub struct Prepared {
    spec: LaunchSpec,
    request: NamespaceRequest,
    plan: Option<MountPlan>,
    launcher: ProcessLauncher,
}

impl Prepared {
    /// The validated spec.
    #[must_use]
    pub const fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// What the namespace orchestrator will be asked for.
    #[must_use]
    pub const fn request(&self) -> &NamespaceRequest {
        &self.request
    }

    /// Mount plan; `None` when joining a running instance.
    #[must_use]
    pub const fn plan(&self) -> Option<&MountPlan> {
        self.plan.as_ref()
    }

    /// The target program launcher.
    #[must_use]
    pub const fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }
}

/// The container launch engine.
///
/// Kernel interaction and the external collaborators sit behind trait
/// objects so every stage can be exercised with fakes.
pub struct Engine {
    config: EngineConfig,
    host: HostContext,
    namespaces: Box<dyn NamespaceBackend>,
    mounter: Box<dyn Mounter>,
    images: Box<dyn ImageResolver>,
    instances: Box<dyn InstanceRegistry>,
}

impl Engine {
    /// Creates an engine using the real kernel and the invoking process.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let instances = StateDirRegistry::new(&config.state_dir);
        Self {
            config,
            host: HostContext::probe(),
            namespaces: Box::new(LinuxNamespaces),
            mounter: Box::<LinuxMounter>::default(),
            images: Box::new(DirectoryImage),
            instances: Box::new(instances),
        }
    }

    /// Replaces the namespace backend.
    #[must_use]
    pub fn with_namespace_backend(mut self, backend: Box<dyn NamespaceBackend>) -> Self {
        self.namespaces = backend;
        self
    }

    /// Replaces the mount syscall layer.
    #[must_use]
    pub fn with_mounter(mut self, mounter: Box<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Replaces the image resolver.
    #[must_use]
    pub fn with_image_resolver(mut self, images: Box<dyn ImageResolver>) -> Self {
        self.images = images;
        self
    }

    /// Replaces the instance registry.
    #[must_use]
    pub fn with_instance_registry(mut self, instances: Box<dyn InstanceRegistry>) -> Self {
        self.instances = instances;
        self
    }

    /// Replaces the captured host context.
    #[must_use]
    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = host;
        self
    }

    /// Engine configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates `options` into a [`LaunchSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] for bad or contradictory options.
    pub fn resolve(&self, options: &OptionMap) -> Result<LaunchSpec> {
        let ctx = ResolveContext {
            host: self.host.support.clone(),
            default_shell: self.config.default_shell.clone(),
        };
        Ok(resolver::resolve(options, &ctx)?)
    }

    /// Resolves and plans a launch without changing any OS state.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, or a mount error when an explicit
    /// mount source is unusable.
    pub fn prepare(&self, options: &OptionMap) -> Result<Prepared> {
        let spec = self.resolve(options)?;
        let (request, plan) = match &spec.image {
            ImageRef::Path(image) => {
                let rootfs = self.images.resolve(image)?;
                let ctx = PlanContext {
                    session_dir: self.config.session_dir.clone(),
                    host_home: self.host.home.clone(),
                    host_dev: PathBuf::from("/dev"),
                };
                let plan = planner::plan(&spec, &rootfs, &ctx)?;
                let request = NamespaceRequest {
                    kinds: spec.namespaces.clone(),
                    mapping: spec
                        .wants(NamespaceKind::User)
                        .then(|| spec.privileges.identity_mapping(self.host.identity)),
                    hostname: spec.hostname.clone(),
                    join: None,
                };
                (request, Some(plan))
            }
            ImageRef::Instance(name) => {
                let record = self.instances.lookup(name)?;
                tracing::debug!(name = %name, pid = record.pid, "joining instance");
                let request = NamespaceRequest {
                    kinds: record.namespaces.clone(),
                    join: Some(JoinTarget {
                        pid: record.pid,
                        kinds: record.namespaces,
                    }),
                    ..NamespaceRequest::default()
                };
                (request, None)
            }
        };
        let launcher = ProcessLauncher::new(&spec, &self.config, &self.host);
        Ok(Prepared {
            spec,
            request,
            plan,
            launcher,
        })
    }

    /// Runs a prepared launch and returns the target's exit code.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure. Everything set up before it is
    /// torn down first.
    pub fn launch(&mut self, prepared: &Prepared) -> Result<i32> {
        let id = LaunchId::generate();
        let span = tracing::info_span!("launch", id = %id);
        let _entered = span.enter();
        tracing::info!(image = %prepared.spec.image, "launch started");

        let mut set = orchestrate(self.namespaces.as_mut(), prepared.request.clone())?;
        if !set.requires_fork() {
            return self.enter(prepared, &set).inspect_err(|_| set.teardown());
        }

        let mut child_set = set.clone();
        let child = pid::spawn_child(|| {
            child_set.enter_child();
            match self.enter(prepared, &child_set) {
                Ok(code) => code,
                Err(e) => {
                    report_failure(&e);
                    e.exit_code()
                }
            }
        })
        .inspect_err(|_| set.teardown())?;
        set.attach_supervisor(child);
        match pid::supervise(child) {
            Ok(code) => {
                tracing::info!(code, "launch finished");
                Ok(code)
            }
            Err(e) => {
                set.teardown();
                Err(e.into())
            }
        }
    }

    /// Resolves, plans and launches in one step.
    ///
    /// # Errors
    ///
    /// See [`Engine::prepare`] and [`Engine::launch`].
    pub fn run(&mut self, options: &OptionMap) -> Result<i32> {
        let prepared = self.prepare(options)?;
        self.launch(&prepared)
    }

    /// Stages the root, drops privileges and starts the target; runs in
    /// the process that will become the container.
    fn enter(&mut self, prepared: &Prepared, set: &NamespaceSet) -> Result<i32> {
        set.require_init_ready()?;
        if let Some(plan) = &prepared.plan {
            let staged = stage(self.mounter.as_mut(), plan)?;
            staged.enter(self.mounter.as_mut())?;
        }
        prepared.launcher.check_app(Path::new("/"))?;

        let dropped =
            PrivilegeController::new(&prepared.spec.privileges, set).apply(self.host.identity)?;
        if set.init_role() == InitRole::Init {
            let child = prepared.launcher.spawn(&dropped)?;
            let target = i32::try_from(child.id()).map_err(|_| LaunchError::Wait {
                program: prepared.launcher.program().to_path_buf(),
                message: format!("pid {} out of range", child.id()),
            })?;
            let target = Pid::from_raw(target);
            pid::forward_signals_to(target)?;
            return Ok(pid::reap_until(target)?);
        }
        Ok(prepared.launcher.run(self.config.launch_mode, &dropped)?)
    }
}

/// Prints the single-line diagnostic for a failed launch.
#[allow(clippy::print_stderr)]
pub fn report_failure(err: &CapsuleError) {
    tracing::error!(stage = err.stage(), error = %err, "launch failed");
    eprintln!("capsule: {} failed: {err}", err.stage());
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use capsule_common::error::ConfigError;
    use capsule_core::namespace::IdentityMapping;
    use capsule_core::privilege::Identity;
    use nix::errno::Errno;

    use super::*;
    use crate::host::HostSupport;
    use crate::instance::InstanceRecord;

    struct NoNamespaces;

    impl NamespaceBackend for NoNamespaces {
        fn supports(&self, _kind: NamespaceKind) -> bool {
            true
        }
        fn has_admin_capability(&self) -> bool {
            false
        }
        fn unshare(&mut self, _kind: NamespaceKind) -> std::result::Result<(), Errno> {
            Err(Errno::EPERM)
        }
        fn join(&mut self, _pid: i32, _kind: NamespaceKind) -> std::result::Result<(), Errno> {
            Err(Errno::EPERM)
        }
        fn write_id_maps(
            &mut self,
            _mapping: &IdentityMapping,
        ) -> std::result::Result<(), capsule_common::error::NamespaceError> {
            Ok(())
        }
        fn make_mounts_private(&mut self) -> std::result::Result<(), Errno> {
            Ok(())
        }
        fn set_hostname(&mut self, _hostname: &str) -> std::result::Result<(), Errno> {
            Ok(())
        }
        fn bring_up_loopback(&mut self) -> std::result::Result<(), Errno> {
            Ok(())
        }
    }

    struct OneInstance;

    impl InstanceRegistry for OneInstance {
        fn lookup(&self, name: &str) -> std::result::Result<InstanceRecord, ConfigError> {
            Ok(InstanceRecord {
                name: name.to_owned(),
                pid: 4242,
                namespaces: [NamespaceKind::Mount, NamespaceKind::Pid].into_iter().collect(),
                image: PathBuf::from("/images/web"),
            })
        }
    }

    fn engine(dir: &Path) -> Engine {
        let config = EngineConfig {
            session_dir: dir.join("session"),
            state_dir: dir.join("state"),
            ..EngineConfig::default()
        };
        Engine::new(config)
            .with_namespace_backend(Box::new(NoNamespaces))
            .with_instance_registry(Box::new(OneInstance))
            .with_host(HostContext {
                support: HostSupport::full(),
                identity: Identity { uid: 1000, gid: 1000 },
                home: None,
                env: Vec::new(),
            })
    }

    #[test]
    fn prepare_plans_without_touching_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        std::fs::create_dir_all(&image).unwrap();
        let options = OptionMap::new()
            .with_value("image", image.display().to_string())
            .with_flag("fakeroot", true)
            .with_value("hostname", "box");
        let prepared = engine(dir.path()).prepare(&options).unwrap();

        let request = prepared.request();
        assert!(request.kinds.contains(&NamespaceKind::User));
        assert!(request.kinds.contains(&NamespaceKind::Uts));
        assert_eq!(request.hostname.as_deref(), Some("box"));
        let mapping = request.mapping.unwrap();
        assert_eq!(mapping.uid_line(), "0 1000 1\n");
        assert_eq!(
            prepared.plan().unwrap().root(),
            dir.path().join("session/final")
        );
    }

    #[test]
    fn instance_images_join_without_a_plan() {
        let dir = tempfile::tempdir().unwrap();
        let options = OptionMap::new().with_value("image", "instance://web");
        let prepared = engine(dir.path()).prepare(&options).unwrap();
        assert!(prepared.plan().is_none());
        let join = prepared.request().join.clone().unwrap();
        assert_eq!(join.pid, 4242);
        assert_eq!(
            join.kinds,
            BTreeSet::from([NamespaceKind::Mount, NamespaceKind::Pid])
        );
    }

    #[test]
    fn namespace_failure_maps_to_setup_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        std::fs::create_dir_all(&image).unwrap();
        let options = OptionMap::new().with_value("image", image.display().to_string());
        let err = engine(dir.path()).run(&options).unwrap_err();
        assert_eq!(err.stage(), "namespace");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_image_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let options =
            OptionMap::new().with_value("image", dir.path().join("absent").display().to_string());
        let err = engine(dir.path()).prepare(&options).unwrap_err();
        assert!(matches!(err, CapsuleError::Config(ConfigError::Image { .. })));
        assert_eq!(err.exit_code(), 1);
    }
}
