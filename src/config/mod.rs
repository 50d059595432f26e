use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_result_rows() -> usize {
    200
}

fn default_max_diagnostic_chars() -> usize {
    4_000
}

fn default_max_frame_rows() -> usize {
    100_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ExecutionLimits {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Result tables are truncated above this many rows.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
    #[serde(default = "default_max_diagnostic_chars")]
    pub max_diagnostic_chars: usize,
    /// Ceiling on rows loaded from a CSV source into memory.
    #[serde(default = "default_max_frame_rows")]
    pub max_frame_rows: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_result_rows: default_max_result_rows(),
            max_diagnostic_chars: default_max_diagnostic_chars(),
            max_frame_rows: default_max_frame_rows(),
        }
    }
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct EngineSettings {
    pub state_root: PathBuf,
    #[serde(default)]
    pub execution: ExecutionLimits,
}

impl EngineSettings {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            execution: ExecutionLimits::default(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Self =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be a non-empty path".to_string(),
            ));
        }
        if self.execution.timeout_ms == 0 {
            return Err(ConfigError::Settings(
                "`execution.timeout_ms` must be greater than zero".to_string(),
            ));
        }
        if self.execution.max_result_rows == 0 {
            return Err(ConfigError::Settings(
                "`execution.max_result_rows` must be greater than zero".to_string(),
            ));
        }
        if self.execution.max_frame_rows < self.execution.max_result_rows {
            return Err(ConfigError::Settings(
                "`execution.max_frame_rows` must be at least `execution.max_result_rows`"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.state_root.join("sessions")
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.state_root.join("artifacts")
    }
}
