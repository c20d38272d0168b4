/// Immutable description of the managed worker, resolved once from config.
use crate::config::{ConfigError, WorkerctlConfig};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything the supervisor needs to know about the worker it manages.
///
/// Built once at startup and only ever handed out by shared reference.
/// Relative file paths have already been resolved against `working_dir`.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub working_dir: PathBuf,
    /// Account the worker runs as. `None` keeps the invoking user.
    pub user: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    /// How long a freshly spawned worker must survive before start reports success.
    pub start_grace: Duration,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub poll_interval: Duration,
}

impl ServiceDescriptor {
    /// Validate `config` and resolve it into a descriptor.
    pub fn from_config(config: &WorkerctlConfig) -> Result<Self, ConfigError> {
        let name = config.service.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".into()));
        }
        if config.worker.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker.command must not be empty".into(),
            ));
        }
        if let Some(user) = &config.service.user {
            if user.trim().is_empty() {
                return Err(ConfigError::Invalid("service.user must not be empty".into()));
            }
        }

        let working_dir = config.service.working_dir.clone();
        let files = &config.files;
        let timing = &config.timing;

        Ok(Self {
            name: name.to_string(),
            user: config.service.user.clone(),
            command: config.worker.command.clone(),
            args: config.worker.args.clone(),
            env: config.worker.env.clone(),
            pid_file: resolve(&working_dir, &files.pid_file),
            lock_file: resolve(&working_dir, &files.lock_file),
            log_file: resolve(&working_dir, &files.log_file),
            start_grace: Duration::from_millis(timing.start_grace_ms),
            stop_timeout: Duration::from_secs(timing.stop_timeout_secs),
            kill_timeout: Duration::from_secs(timing.kill_timeout_secs),
            poll_interval: Duration::from_millis(timing.poll_interval_ms.max(1)),
            working_dir,
        })
    }

    /// Path of the advisory lock serializing mutating commands (`<lock_file>.ctl`).
    pub fn control_lock_file(&self) -> PathBuf {
        let mut path: OsString = self.lock_file.clone().into_os_string();
        path.push(".ctl");
        PathBuf::from(path)
    }

    /// Worker arguments with `{name}`, `{pid_file}` and `{log_file}` placeholders filled in.
    pub fn expanded_args(&self) -> Vec<String> {
        let pid_file = self.pid_file.display().to_string();
        let log_file = self.log_file.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{name}", &self.name)
                    .replace("{pid_file}", &pid_file)
                    .replace("{log_file}", &log_file)
            })
            .collect()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_files_resolve_against_working_dir() {
        let mut config = WorkerctlConfig::default();
        config.service.working_dir = PathBuf::from("/srv/app");
        config.files.log_file = PathBuf::from("/var/log/worker.log");

        let desc = ServiceDescriptor::from_config(&config).unwrap();
        assert_eq!(desc.pid_file, PathBuf::from("/srv/app/worker.pid"));
        assert_eq!(desc.lock_file, PathBuf::from("/srv/app/worker.lock"));
        assert_eq!(desc.log_file, PathBuf::from("/var/log/worker.log"));
        assert_eq!(
            desc.control_lock_file(),
            PathBuf::from("/srv/app/worker.lock.ctl")
        );
    }

    #[test]
    fn test_timing_conversion() {
        let mut config = WorkerctlConfig::default();
        config.timing.poll_interval_ms = 0;

        let desc = ServiceDescriptor::from_config(&config).unwrap();
        assert_eq!(desc.start_grace, Duration::from_millis(500));
        assert_eq!(desc.stop_timeout, Duration::from_secs(10));
        assert_eq!(desc.kill_timeout, Duration::from_secs(5));
        assert_eq!(desc.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_expanded_args_fill_placeholders() {
        let mut config = WorkerctlConfig::default();
        config.service.name = "indexer".to_string();
        config.service.working_dir = PathBuf::from("/srv");
        config.worker.args = vec![
            "celeryd".to_string(),
            "--logfile={log_file}".to_string(),
            "--hostname={name}@%h".to_string(),
            "--concurrency=2".to_string(),
        ];

        let desc = ServiceDescriptor::from_config(&config).unwrap();
        assert_eq!(
            desc.expanded_args(),
            vec![
                "celeryd",
                "--logfile=/srv/worker.log",
                "--hostname=indexer@%h",
                "--concurrency=2"
            ]
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut config = WorkerctlConfig::default();
        config.worker.command = "  ".to_string();
        let err = ServiceDescriptor::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("worker.command"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut config = WorkerctlConfig::default();
        config.service.name = String::new();
        assert!(matches!(
            ServiceDescriptor::from_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_blank_user_rejected() {
        let mut config = WorkerctlConfig::default();
        config.service.user = Some(String::new());
        assert!(ServiceDescriptor::from_config(&config).is_err());
    }
}
