use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from workerctl.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WorkerctlConfig {
    pub service: ServiceConfig,
    pub worker: WorkerConfig,
    pub files: FilesConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub working_dir: PathBuf,
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub start_grace_ms: u64,
    pub stop_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

// --- Default implementations ---

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            working_dir: PathBuf::from("."),
            user: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "celery".to_string(),
            args: vec!["worker".to_string(), "--concurrency=2".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("worker.pid"),
            lock_file: PathBuf::from("worker.lock"),
            log_file: PathBuf::from("worker.log"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            start_grace_ms: 500,
            stop_timeout_secs: 10,
            kill_timeout_secs: 5,
            poll_interval_ms: 100,
        }
    }
}

/// Load the config file at `path`.
///
/// A missing file yields the defaults; an unreadable or malformed one is an error.
pub fn load_config(path: &Path) -> Result<WorkerctlConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WorkerctlConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
