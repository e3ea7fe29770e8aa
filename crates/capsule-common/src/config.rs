//! Engine configuration model for the Capsule runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::LaunchMode;

/// Root configuration for the launch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory covered by a private tmpfs while staging the container root.
    pub session_dir: PathBuf,
    /// Base directory for instance records.
    pub state_dir: PathBuf,
    /// Shell executed when the options name none.
    pub default_shell: PathBuf,
    /// PATH used for scrubbed environments.
    pub default_path: String,
    /// How the target program replaces or is spawned by the engine.
    pub launch_mode: LaunchMode,
    /// Host variables never inherited by the container.
    pub filtered_env: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_dir: crate::constants::default_session_dir(),
            state_dir: crate::constants::default_state_dir(),
            default_shell: PathBuf::from(crate::constants::DEFAULT_SHELL),
            default_path: crate::constants::DEFAULT_PATH.to_owned(),
            launch_mode: LaunchMode::default(),
            filtered_env: crate::constants::FILTERED_ENV
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file, falling back to defaults if it does not exist.
    ///
    /// Keys absent from the file keep their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::File`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no engine config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::File {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };
        serde_json::from_str(&content).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
