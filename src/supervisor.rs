/// Worker lifecycle: start, stop, restart, reload and status for the one
/// process named by a [`ServiceDescriptor`].
///
/// Every mutating operation holds the [`ControlLock`] for its whole
/// duration and re-inspects the PID file after acquiring it, so racing
/// invocations observe each other's results instead of duplicating work.
/// `status` is read-only and never takes the lock.
use crate::control_lock::ControlLock;
use crate::descriptor::ServiceDescriptor;
use crate::pidfile::{LockMarker, PidFile, StateFileError};
use crate::process::{self, Identity, Liveness, ProcessOps, SpawnError, UnixProcess};
use crate::status::{ServiceState, StatusReport};
use chrono::{SecondsFormat, Utc};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new worker was spawned and survived the startup grace period.
    Started { pid: Pid },
    /// A live worker was already recorded; nothing was spawned.
    AlreadyRunning { pid: Pid },
}

impl StartOutcome {
    pub fn pid(self) -> Pid {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => pid,
        }
    }
}

/// Result of a successful `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker exited; `forced` when it needed SIGKILL.
    Stopped { pid: Pid, forced: bool },
    /// Nothing was running. `stale` holds the PID of a leftover PID file
    /// that was cleaned up.
    NotRunning { stale: Option<Pid> },
}

/// What the PID file says, checked against the process table.
#[derive(Debug)]
enum Inspection {
    NoPidFile,
    Running(Pid),
    Stale(Pid),
    /// The file holds something other than a PID.
    Malformed(StateFileError),
    /// The file exists but could not be read.
    Unreadable(StateFileError),
}

/// Supervises a single worker process.
pub struct Supervisor<P = UnixProcess> {
    desc: ServiceDescriptor,
    ops: P,
    pid_file: PidFile,
    lock: LockMarker,
}

impl Supervisor<UnixProcess> {
    pub fn new(desc: ServiceDescriptor) -> Self {
        Self::with_ops(desc, UnixProcess)
    }
}

impl<P: ProcessOps> Supervisor<P> {
    pub fn with_ops(desc: ServiceDescriptor, ops: P) -> Self {
        Self {
            pid_file: PidFile::new(desc.pid_file.clone()),
            lock: LockMarker::new(desc.lock_file.clone()),
            desc,
            ops,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.desc
    }

    /// Report the worker's state without touching anything.
    pub fn status(&self) -> StatusReport {
        let (state, pid, detail) = match self.inspect() {
            Inspection::NoPidFile if self.lock.exists() => (ServiceState::Locked, None, None),
            Inspection::NoPidFile => (ServiceState::Stopped, None, None),
            Inspection::Running(pid) => (ServiceState::Running, Some(pid.as_raw()), None),
            Inspection::Stale(pid) => (ServiceState::Stale, Some(pid.as_raw()), None),
            Inspection::Malformed(e) | Inspection::Unreadable(e) => {
                (ServiceState::Unknown, None, Some(e.to_string()))
            }
        };

        StatusReport {
            name: self.desc.name.clone(),
            state,
            pid,
            since: pid.and_then(|_| self.pid_file.recorded_at()),
            pid_file: self.desc.pid_file.clone(),
            lock_file: self.desc.lock_file.clone(),
            detail,
        }
    }

    /// Start the worker unless a live one is already recorded.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let _guard = self.control_lock()?;
        self.start_locked().await
    }

    /// Stop the worker: SIGTERM, then SIGKILL once `stop_timeout` passes.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let _guard = self.control_lock()?;
        self.stop_locked().await
    }

    /// Stop then start. A failed stop aborts before anything is spawned.
    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        let _guard = self.control_lock()?;
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Restart only if the worker is running or the lock marker says it
    /// should be. Returns `None` when there was nothing to restart.
    pub async fn condrestart(&self) -> Result<Option<StartOutcome>, SupervisorError> {
        let _guard = self.control_lock()?;
        let running = match self.inspect() {
            Inspection::Running(_) => true,
            Inspection::Unreadable(e) => return Err(e.into()),
            _ => false,
        };
        if !running && !self.lock.exists() {
            tracing::debug!(name = %self.desc.name, "not started, skipping conditional restart");
            return Ok(None);
        }
        self.stop_locked().await?;
        self.start_locked().await.map(Some)
    }

    /// The worker has no live-reload signal; this always fails and never
    /// touches the process.
    pub fn reload(&self) -> Result<(), SupervisorError> {
        let running = matches!(self.inspect(), Inspection::Running(_));
        Err(SupervisorError::Unsupported {
            operation: "reload",
            running,
        })
    }

    fn control_lock(&self) -> Result<ControlLock, SupervisorError> {
        let path = self.desc.control_lock_file();
        ControlLock::acquire(&path).map_err(|e| SupervisorError::ControlLock { path, source: e })
    }

    fn inspect(&self) -> Inspection {
        let pid = match self.pid_file.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Inspection::NoPidFile,
            Err(e @ StateFileError::Malformed { .. }) => return Inspection::Malformed(e),
            Err(e) => return Inspection::Unreadable(e),
        };
        match self.ops.liveness(pid, &self.identity()) {
            Liveness::Alive => Inspection::Running(pid),
            Liveness::Dead => Inspection::Stale(pid),
            Liveness::Foreign => {
                tracing::debug!(pid = pid.as_raw(), "pid belongs to an unrelated process");
                Inspection::Stale(pid)
            }
        }
    }

    fn identity(&self) -> Identity<'_> {
        Identity {
            command: &self.desc.command,
            recorded_at: self.pid_file.recorded_at(),
        }
    }

    async fn start_locked(&self) -> Result<StartOutcome, SupervisorError> {
        match self.inspect() {
            Inspection::Running(pid) => {
                tracing::info!(pid = pid.as_raw(), "worker already running");
                self.lock.create()?;
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            Inspection::Stale(pid) => {
                tracing::warn!(pid = pid.as_raw(), path = %self.pid_file.path().display(), "removing stale pid file");
                self.pid_file.remove()?;
            }
            Inspection::Malformed(e) => {
                tracing::warn!(error = %e, "discarding malformed pid file");
                self.pid_file.remove()?;
            }
            Inspection::Unreadable(e) => return Err(e.into()),
            Inspection::NoPidFile => {}
        }

        let mut log = process::open_log(&self.desc.log_file)?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Err(e) = writeln!(
            log,
            "[{stamp}] workerctl: starting {} ({})",
            self.desc.name, self.desc.command
        ) {
            tracing::warn!(error = %e, path = %self.desc.log_file.display(), "failed to write log marker");
        }

        let mut child = process::spawn_detached(&self.desc, log)?;
        let pid = match child.id() {
            Some(raw) => Pid::from_raw(raw as i32),
            None => {
                return Err(SupervisorError::ExitedDuringStartup {
                    pid: None,
                    code: None,
                })
            }
        };

        if let Err(e) = self.pid_file.write(pid) {
            tracing::error!(pid = pid.as_raw(), error = %e, "cannot record pid, killing worker");
            if let Err(kill_err) = child.start_kill() {
                tracing::warn!(pid = pid.as_raw(), error = %kill_err, "failed to kill unrecorded worker");
            }
            return Err(e.into());
        }

        sleep(self.desc.start_grace).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::error!(pid = pid.as_raw(), ?status, "worker exited during startup");
                if let Err(e) = self.pid_file.remove() {
                    tracing::warn!(error = %e, "failed to remove pid file of exited worker");
                }
                return Err(SupervisorError::ExitedDuringStartup {
                    pid: Some(pid),
                    code: status.code(),
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "could not poll worker status"),
        }

        self.lock.create()?;
        tracing::info!(pid = pid.as_raw(), name = %self.desc.name, "worker started");
        Ok(StartOutcome::Started { pid })
    }

    async fn stop_locked(&self) -> Result<StopOutcome, SupervisorError> {
        let pid = match self.inspect() {
            Inspection::Running(pid) => pid,
            Inspection::NoPidFile => {
                self.lock.remove()?;
                return Ok(StopOutcome::NotRunning { stale: None });
            }
            Inspection::Stale(pid) => {
                tracing::warn!(pid = pid.as_raw(), "worker already dead, cleaning up stale pid file");
                self.clear_state()?;
                return Ok(StopOutcome::NotRunning { stale: Some(pid) });
            }
            Inspection::Malformed(e) => {
                tracing::warn!(error = %e, "discarding malformed pid file");
                self.clear_state()?;
                return Ok(StopOutcome::NotRunning { stale: None });
            }
            Inspection::Unreadable(e) => return Err(e.into()),
        };

        self.deliver(pid, Signal::SIGTERM)?;
        if self.wait_for_exit(pid, self.desc.stop_timeout).await {
            self.clear_state()?;
            tracing::info!(pid = pid.as_raw(), "worker stopped");
            return Ok(StopOutcome::Stopped { pid, forced: false });
        }

        tracing::warn!(
            pid = pid.as_raw(),
            timeout_ms = self.desc.stop_timeout.as_millis() as u64,
            "worker group survived SIGTERM, escalating to SIGKILL"
        );
        self.deliver(pid, Signal::SIGKILL)?;
        if self.wait_for_exit(pid, self.desc.kill_timeout).await {
            self.clear_state()?;
            tracing::info!(pid = pid.as_raw(), "worker killed");
            return Ok(StopOutcome::Stopped { pid, forced: true });
        }

        Err(SupervisorError::Survived { pid })
    }

    fn deliver(&self, pid: Pid, signal: Signal) -> Result<(), SupervisorError> {
        tracing::debug!(pid = pid.as_raw(), %signal, "signaling worker");
        match self.ops.signal(pid, signal) {
            // Exited between the liveness check and the signal
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Termination {
                pid,
                signal,
                source: e,
            }),
        }
    }

    /// Poll until the worker and the rest of its process group are gone,
    /// or `timeout` elapses. True if gone.
    async fn wait_for_exit(&self, pid: Pid, timeout: Duration) -> bool {
        let identity = self.identity();
        let deadline = Instant::now() + timeout;
        loop {
            self.ops.reap(pid);
            let leader_gone = self.ops.liveness(pid, &identity) != Liveness::Alive;
            if leader_gone && !self.ops.group_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.desc.poll_interval).await;
        }
    }

    fn clear_state(&self) -> Result<(), SupervisorError> {
        self.pid_file.remove()?;
        self.lock.remove()?;
        Ok(())
    }
}

/// Errors from supervisor operations.
#[derive(Debug)]
pub enum SupervisorError {
    /// The worker could not be launched.
    Spawn(SpawnError),
    /// The worker launched but exited before the grace period ended.
    ExitedDuringStartup { pid: Option<Pid>, code: Option<i32> },
    /// A signal could not be delivered (typically EPERM).
    Termination {
        pid: Pid,
        signal: Signal,
        source: Errno,
    },
    /// The worker was still alive after SIGKILL.
    Survived { pid: Pid },
    /// The worker type does not support this operation.
    Unsupported {
        operation: &'static str,
        running: bool,
    },
    StateFile(StateFileError),
    ControlLock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Init-script exit code for a failed non-status command.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Unsupported { running: false, .. } => 7,
            SupervisorError::Unsupported { running: true, .. } => 3,
            _ => 1,
        }
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn(e) => write!(f, "{e}"),
            SupervisorError::ExitedDuringStartup { pid, code } => {
                write!(f, "worker exited during startup")?;
                if let Some(pid) = pid {
                    write!(f, " (pid {pid}")?;
                    match code {
                        Some(code) => write!(f, ", exit code {code})")?,
                        None => write!(f, ", killed by signal)")?,
                    }
                }
                Ok(())
            }
            SupervisorError::Termination { pid, signal, source } => {
                write!(f, "failed to send {signal} to pid {pid}: {source}")
            }
            SupervisorError::Survived { pid } => {
                write!(f, "pid {pid} is still alive after SIGKILL")
            }
            SupervisorError::Unsupported { operation, running } => {
                write!(f, "{operation} is not supported by this worker")?;
                if !running {
                    write!(f, " (and it is not running)")?;
                }
                Ok(())
            }
            SupervisorError::StateFile(e) => write!(f, "{e}"),
            SupervisorError::ControlLock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn(e) => Some(e),
            SupervisorError::Termination { source, .. } => Some(source),
            SupervisorError::StateFile(e) => Some(e),
            SupervisorError::ControlLock { source, .. } => Some(source),
            SupervisorError::ExitedDuringStartup { .. }
            | SupervisorError::Survived { .. }
            | SupervisorError::Unsupported { .. } => None,
        }
    }
}

impl From<SpawnError> for SupervisorError {
    fn from(e: SpawnError) -> Self {
        SupervisorError::Spawn(e)
    }
}

impl From<StateFileError> for SupervisorError {
    fn from(e: StateFileError) -> Self {
        SupervisorError::StateFile(e)
    }
}
