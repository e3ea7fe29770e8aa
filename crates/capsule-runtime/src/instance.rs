//! Named instance registry.
//!
//! Each running instance is recorded as
//! `<state_dir>/instances/<name>.json`, naming a process inside it and
//! the namespaces it owns. Launching against `instance://<name>` joins
//! those namespaces instead of creating new ones.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use capsule_common::error::ConfigError;
use capsule_common::types::NamespaceKind;
use serde::{Deserialize, Serialize};

/// Persistent record of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance name.
    pub name: String,
    /// PID of a process inside the instance.
    pub pid: i32,
    /// Namespaces the instance owns.
    pub namespaces: BTreeSet<NamespaceKind>,
    /// Image the instance was started from.
    pub image: PathBuf,
}

/// Looks up running instances.
pub trait InstanceRegistry {
    /// Returns the record of instance `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Instance`] if the instance is unknown or gone.
    fn lookup(&self, name: &str) -> Result<InstanceRecord, ConfigError>;
}

/// Registry stored as JSON files under a state directory.
#[derive(Debug, Clone)]
pub struct StateDirRegistry {
    dir: PathBuf,
    proc_dir: PathBuf,
}

impl StateDirRegistry {
    /// Registry rooted at `<state_dir>/instances`.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("instances"),
            proc_dir: PathBuf::from("/proc"),
        }
    }

    /// Checks liveness against another `/proc`-like tree.
    #[must_use]
    pub fn with_proc_dir(mut self, proc_dir: PathBuf) -> Self {
        self.proc_dir = proc_dir;
        self
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Writes or replaces the record of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Instance`] if the record cannot be written.
    pub fn register(&self, record: &InstanceRecord) -> Result<(), ConfigError> {
        let fail = |message: String| ConfigError::Instance {
            name: record.name.clone(),
            message,
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| fail(e.to_string()))?;
        let json = serde_json::to_string_pretty(record).map_err(|e| fail(e.to_string()))?;
        std::fs::write(self.record_path(&record.name), json).map_err(|e| fail(e.to_string()))?;
        tracing::debug!(name = %record.name, pid = record.pid, "instance registered");
        Ok(())
    }
}

impl InstanceRegistry for StateDirRegistry {
    fn lookup(&self, name: &str) -> Result<InstanceRecord, ConfigError> {
        let fail = |message: String| ConfigError::Instance {
            name: name.to_owned(),
            message,
        };
        let path = self.record_path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(fail("no such instance".into()));
            }
            Err(e) => return Err(fail(format!("{}: {e}", path.display()))),
        };
        let record: InstanceRecord =
            serde_json::from_str(&content).map_err(|e| fail(format!("corrupt record: {e}")))?;
        if !self.proc_dir.join(record.pid.to_string()).exists() {
            return Err(fail(format!("instance process {} is not running", record.pid)));
        }
        Ok(record)
    }
}
