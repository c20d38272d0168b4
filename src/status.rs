/// Status report: what `status` prints, as text or JSON.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Worker states as seen from the PID file, lock marker and process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// PID file names a live worker.
    Running,
    /// Neither PID file nor lock marker.
    Stopped,
    /// PID file present, process gone or PID reused.
    Stale,
    /// No PID file, but the lock marker says the service was started.
    Locked,
    /// PID file exists but cannot be read or parsed.
    Unknown,
}

impl ServiceState {
    /// LSB init-script status exit code.
    pub fn exit_code(self) -> u8 {
        match self {
            ServiceState::Running => 0,
            ServiceState::Stale => 1,
            ServiceState::Locked => 2,
            ServiceState::Stopped => 3,
            ServiceState::Unknown => 4,
        }
    }
}

/// The payload behind `workerctl status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<i32>,
    /// When the PID file was written.
    pub since: Option<DateTime<Utc>>,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    /// Why the state could not be determined, for `Unknown`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusReport {
    /// One line in the style of the classic init `status` helper.
    pub fn render(&self) -> String {
        let name = &self.name;
        match (self.state, self.pid) {
            (ServiceState::Running, Some(pid)) => match self.since {
                Some(since) => format!(
                    "{name} (pid {pid}) is running since {}",
                    since.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => format!("{name} (pid {pid}) is running..."),
            },
            (ServiceState::Running, None) => format!("{name} is running..."),
            (ServiceState::Stale, Some(pid)) => {
                format!("{name} dead but pid file exists (pid {pid})")
            }
            (ServiceState::Stale, None) => format!("{name} dead but pid file exists"),
            (ServiceState::Locked, _) => format!("{name} dead but subsys locked"),
            (ServiceState::Stopped, _) => format!("{name} is stopped"),
            (ServiceState::Unknown, _) => match &self.detail {
                Some(detail) => format!("{name} status unknown: {detail}"),
                None => format!("{name} status unknown"),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
