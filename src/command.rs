/// Init-script verbs and their mapping onto supervisor operations.
use crate::process::ProcessOps;
use crate::supervisor::{StartOutcome, StopOutcome, Supervisor};
use clap::ValueEnum;

/// Exit code for a successful command (or a running worker, for `status`).
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for an unrecognized command line.
pub const EXIT_USAGE: u8 = 2;

/// Every verb `workerctl` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Reload,
    /// Restart, since the worker cannot reload in place.
    ForceReload,
    Status,
    Condrestart,
    TryRestart,
}

/// What a command produced: the process exit code and a line for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub code: u8,
    pub message: String,
}

impl Outcome {
    fn success(message: String) -> Self {
        Self {
            code: EXIT_SUCCESS,
            message,
        }
    }
}

/// One-line usage text printed for unrecognized commands.
pub fn usage(program: &str) -> String {
    let verbs: Vec<String> = Command::value_variants()
        .iter()
        .filter_map(|c| c.to_possible_value())
        .map(|v| v.get_name().to_string())
        .collect();
    format!("Usage: {program} {{{}}}", verbs.join("|"))
}

/// Run `command` against `supervisor`. `json` only affects `status`.
pub async fn dispatch<P: ProcessOps>(
    supervisor: &Supervisor<P>,
    command: Command,
    json: bool,
) -> Outcome {
    let name = supervisor.descriptor().name.clone();
    tracing::debug!(?command, %name, "dispatching");

    match command {
        Command::Start => match supervisor.start().await {
            Ok(StartOutcome::Started { pid }) => {
                Outcome::success(format!("Starting {name}: OK (pid {pid})"))
            }
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                Outcome::success(format!("{name} is already running (pid {pid})"))
            }
            Err(e) => failed(&format!("Starting {name}"), e),
        },
        Command::Stop => match supervisor.stop().await {
            Ok(outcome) => Outcome::success(describe_stop(&name, outcome)),
            Err(e) => failed(&format!("Stopping {name}"), e),
        },
        Command::Restart | Command::ForceReload => match supervisor.restart().await {
            Ok(outcome) => Outcome::success(format!(
                "Restarting {name}: OK (pid {})",
                outcome.pid()
            )),
            Err(e) => failed(&format!("Restarting {name}"), e),
        },
        Command::Condrestart | Command::TryRestart => match supervisor.condrestart().await {
            Ok(Some(outcome)) => Outcome::success(format!(
                "Restarting {name}: OK (pid {})",
                outcome.pid()
            )),
            Ok(None) => Outcome::success(format!("{name} is not running, nothing to restart")),
            Err(e) => failed(&format!("Restarting {name}"), e),
        },
        Command::Reload => match supervisor.reload() {
            Ok(()) => Outcome::success(format!("Reloading {name}: OK")),
            Err(e) => failed(&format!("Reloading {name}"), e),
        },
        Command::Status => {
            let report = supervisor.status();
            let message = if json {
                match report.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize status report");
                        report.render()
                    }
                }
            } else {
                report.render()
            };
            Outcome {
                code: report.state.exit_code(),
                message,
            }
        }
    }
}

fn describe_stop(name: &str, outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::Stopped { forced: false, .. } => format!("Stopping {name}: OK"),
        StopOutcome::Stopped { forced: true, pid } => {
            format!("Stopping {name}: OK (pid {pid} killed after ignoring SIGTERM)")
        }
        StopOutcome::NotRunning { stale: None } => format!("{name} is not running"),
        StopOutcome::NotRunning { stale: Some(pid) } => {
            format!("{name} is not running (removed stale pid file for pid {pid})")
        }
    }
}

fn failed(action: &str, e: crate::supervisor::SupervisorError) -> Outcome {
    tracing::debug!(error = ?e, "command failed");
    Outcome {
        code: e.exit_code(),
        message: format!("{action}: FAILED: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ServiceDescriptor;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::new(ServiceDescriptor {
            name: "indexer".to_string(),
            working_dir: dir.to_path_buf(),
            user: None,
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: Default::default(),
            pid_file: dir.join("indexer.pid"),
            lock_file: dir.join("indexer.lock"),
            log_file: dir.join("indexer.log"),
            start_grace: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        })
    }

    #[test]
    fn test_command_names() {
        let parse = |s| Command::from_str(s, false).unwrap();
        assert_eq!(parse("start"), Command::Start);
        assert_eq!(parse("force-reload"), Command::ForceReload);
        assert_eq!(parse("try-restart"), Command::TryRestart);
        assert_eq!(parse("condrestart"), Command::Condrestart);
        assert!(Command::from_str("foo", false).is_err());
    }

    #[test]
    fn test_usage_lists_every_verb() {
        assert_eq!(
            usage("workerctl"),
            "Usage: workerctl {start|stop|restart|reload|force-reload|status|condrestart|try-restart}"
        );
    }

    #[tokio::test]
    async fn test_start_status_stop_exit_codes() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());

        let status = dispatch(&sup, Command::Status, false).await;
        assert_eq!(status.code, 3);
        assert_eq!(status.message, "indexer is stopped");

        let start = dispatch(&sup, Command::Start, false).await;
        assert_eq!(start.code, 0);
        assert!(start.message.starts_with("Starting indexer: OK (pid "));

        let again = dispatch(&sup, Command::Start, false).await;
        assert_eq!(again.code, 0);
        assert!(again.message.contains("already running"));

        let status = dispatch(&sup, Command::Status, false).await;
        assert_eq!(status.code, 0);
        assert!(status.message.contains("is running"));

        let stop = dispatch(&sup, Command::Stop, false).await;
        assert_eq!(stop, Outcome::success("Stopping indexer: OK".to_string()));

        let stop = dispatch(&sup, Command::Stop, false).await;
        assert_eq!(stop.code, 0);
        assert_eq!(stop.message, "indexer is not running");
    }

    #[tokio::test]
    async fn test_reload_exit_codes() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());

        let reload = dispatch(&sup, Command::Reload, false).await;
        assert_eq!(reload.code, 7);
        assert!(reload.message.starts_with("Reloading indexer: FAILED"));

        dispatch(&sup, Command::Start, false).await;
        let pid_before = std::fs::read_to_string(dir.path().join("indexer.pid")).unwrap();

        let reload = dispatch(&sup, Command::Reload, false).await;
        assert_eq!(reload.code, 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("indexer.pid")).unwrap(),
            pid_before
        );
        assert_eq!(dispatch(&sup, Command::Status, false).await.code, 0);

        dispatch(&sup, Command::Stop, false).await;
    }

    #[tokio::test]
    async fn test_force_reload_restarts() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());

        dispatch(&sup, Command::Start, false).await;
        let before = std::fs::read_to_string(dir.path().join("indexer.pid")).unwrap();

        let outcome = dispatch(&sup, Command::ForceReload, false).await;
        assert_eq!(outcome.code, 0);
        assert!(outcome.message.starts_with("Restarting indexer: OK"));
        let after = std::fs::read_to_string(dir.path().join("indexer.pid")).unwrap();
        assert_ne!(before, after);

        dispatch(&sup, Command::Stop, false).await;
    }

    #[tokio::test]
    async fn test_try_restart_when_stopped_is_noop() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());

        let outcome = dispatch(&sup, Command::TryRestart, false).await;
        assert_eq!(outcome.code, 0);
        assert!(outcome.message.contains("nothing to restart"));
        assert!(!dir.path().join("indexer.pid").exists());
    }

    #[tokio::test]
    async fn test_status_json() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());

        let outcome = dispatch(&sup, Command::Status, true).await;
        assert_eq!(outcome.code, 3);
        let parsed: serde_json::Value = serde_json::from_str(&outcome.message).unwrap();
        assert_eq!(parsed["name"], "indexer");
        assert_eq!(parsed["state"], "stopped");
    }

    #[tokio::test]
    async fn test_start_failure_exit_code() {
        let dir = tempdir().unwrap();
        let mut desc = supervisor(dir.path()).descriptor().clone();
        desc.command = "/nonexistent/indexer".to_string();
        let sup = Supervisor::new(desc);

        let outcome = dispatch(&sup, Command::Start, false).await;
        assert_eq!(outcome.code, 1);
        assert!(outcome.message.starts_with("Starting indexer: FAILED"));
        assert!(outcome.message.contains("/nonexistent/indexer"));
    }
}
