/// OS process primitives: liveness checks, signal delivery, reaping and
/// detached spawning.
use crate::descriptor::ServiceDescriptor;
use chrono::{DateTime, TimeDelta, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getsid, sysconf, Pid, SysconfVar, User};
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Tolerance between the process start time derived from procfs and the
/// PID file's mtime. `btime` only has one-second resolution.
const START_TIME_SLACK: TimeDelta = TimeDelta::seconds(2);

/// What the OS says about a recorded PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Alive and still the worker that was recorded.
    Alive,
    /// No such process, or a zombie awaiting reaping.
    Dead,
    /// Alive, but the PID now belongs to an unrelated process.
    Foreign,
}

/// What is known about the worker a PID file refers to.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    /// Configured executable, compared against argv as a hint only.
    pub command: &'a str,
    /// When the PID file was written.
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Process-control operations the supervisor needs from the platform.
pub trait ProcessOps {
    /// Check whether `pid` is alive and is still the worker described by
    /// `identity`.
    fn liveness(&self, pid: Pid, identity: &Identity<'_>) -> Liveness;

    /// Whether any live (non-zombie) process remains in group `pgid`.
    fn group_alive(&self, pgid: Pid) -> bool;

    /// Deliver `signal` to the worker's process group, or to `pid` alone
    /// when it does not lead a group.
    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno>;

    /// Collect the exit status of `pid` if it is our exited child.
    fn reap(&self, pid: Pid);
}

/// Direct Unix implementation on top of `kill(2)`, `waitpid(2)` and procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcess;

impl ProcessOps for UnixProcess {
    fn liveness(&self, pid: Pid, identity: &Identity<'_>) -> Liveness {
        match kill(pid, None) {
            // EPERM: the process exists but belongs to someone else
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return Liveness::Dead,
        }

        let proc_dir = Path::new("/proc").join(pid.as_raw().to_string());
        let stat = if procfs_available() {
            match std::fs::read_to_string(proc_dir.join("stat")) {
                Ok(raw) => match ProcStat::parse(&raw) {
                    Some(stat) if stat.is_zombie() => return Liveness::Dead,
                    parsed => parsed,
                },
                Err(_) => return Liveness::Dead,
            }
        } else {
            None
        };

        // The worker is spawned with setsid and keeps its session across exec
        match getsid(Some(pid)) {
            Ok(sid) if sid != pid => {
                tracing::debug!(
                    pid = pid.as_raw(),
                    sid = sid.as_raw(),
                    "pid does not lead its own session"
                );
                return Liveness::Foreign;
            }
            Ok(_) => {}
            Err(Errno::ESRCH) => return Liveness::Dead,
            Err(e) => tracing::debug!(pid = pid.as_raw(), error = %e, "getsid failed"),
        }

        let start_time = stat.and_then(|s| started_at(s.start_ticks));
        if let (Some(started), Some(recorded)) = (start_time, identity.recorded_at) {
            if started > recorded + START_TIME_SLACK {
                tracing::debug!(
                    pid = pid.as_raw(),
                    %started,
                    %recorded,
                    "process started after its pid file was written"
                );
                return Liveness::Foreign;
            }
        }

        if let Ok(cmdline) = std::fs::read(proc_dir.join("cmdline")) {
            if !cmdline_matches(&cmdline, identity.command) {
                tracing::debug!(
                    pid = pid.as_raw(),
                    command = %identity.command,
                    "worker argv differs from the configured command"
                );
            }
        }
        Liveness::Alive
    }

    fn group_alive(&self, pgid: Pid) -> bool {
        match killpg(pgid, None) {
            Err(Errno::ESRCH) => return false,
            _ => {}
        }
        if !procfs_available() {
            return true;
        }

        // killpg also succeeds for zombies nobody has reaped yet
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return true;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().as_bytes().iter().all(u8::is_ascii_digit))
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .filter_map(|raw| ProcStat::parse(&raw))
            .any(|stat| stat.pgrp == pgid.as_raw() && !stat.is_zombie())
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        match killpg(pid, signal) {
            Err(Errno::ESRCH) => kill(pid, signal),
            other => other,
        }
    }

    fn reap(&self, pid: Pid) {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => tracing::trace!(pid = pid.as_raw(), ?status, "waitpid"),
            // Not our child: whoever parents it will reap it
            Err(Errno::ECHILD) => {}
            Err(e) => tracing::debug!(pid = pid.as_raw(), error = %e, "waitpid failed"),
        }
    }
}

fn procfs_available() -> bool {
    Path::new("/proc/self/stat").exists()
}

/// The fields of `/proc/<pid>/stat` that matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    pgrp: i32,
    /// Field 22: clock ticks since boot.
    start_ticks: u64,
}

impl ProcStat {
    /// The line is `pid (comm) state ppid pgrp ...`; comm may itself
    /// contain parens and spaces, so fields are counted after the last ')'.
    fn parse(raw: &str) -> Option<Self> {
        let idx = raw.rfind(')')?;
        let fields: Vec<&str> = raw[idx + 1..].split_whitespace().collect();
        Some(Self {
            state: fields.first()?.chars().next()?,
            pgrp: fields.get(2)?.parse().ok()?,
            start_ticks: fields.get(19)?.parse().ok()?,
        })
    }

    fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Wall-clock start time from a `starttime` tick count.
fn started_at(start_ticks: u64) -> Option<DateTime<Utc>> {
    let ticks_per_sec = u64::try_from(sysconf(SysconfVar::CLK_TCK).ok()??).ok()?;
    if ticks_per_sec == 0 {
        return None;
    }
    let since_boot = i64::try_from(start_ticks.checked_mul(1000)? / ticks_per_sec).ok()?;
    DateTime::from_timestamp_millis(boot_time()?.checked_mul(1000)?.checked_add(since_boot)?)
}

/// `btime` from `/proc/stat`, in seconds since the epoch.
fn boot_time() -> Option<i64> {
    std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|secs| secs.trim().parse().ok())
}

/// Match the configured command against argv[0] or, for interpreted
/// workers, argv[1].
fn cmdline_matches(cmdline: &[u8], expected_command: &str) -> bool {
    let Some(expected) = Path::new(expected_command).file_name() else {
        return false;
    };
    cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .take(2)
        .any(|arg| Path::new(OsStr::from_bytes(arg)).file_name() == Some(expected))
}

/// Errors raised while launching the worker.
#[derive(Debug)]
pub enum SpawnError {
    /// The configured account does not exist.
    UnknownUser { user: String },
    /// The account database could not be queried.
    UserLookup { user: String, source: Errno },
    /// Opening the log file for the worker's output failed.
    LogFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// `fork`/`exec` failed: missing executable, permission denied, ...
    Exec {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::UnknownUser { user } => write!(f, "unknown user {user:?}"),
            SpawnError::UserLookup { user, source } => {
                write!(f, "failed to look up user {user:?}: {source}")
            }
            SpawnError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            SpawnError::Exec { command, source } => {
                write!(f, "failed to execute {command}: {source}")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::UnknownUser { .. } => None,
            SpawnError::UserLookup { source, .. } => Some(source),
            SpawnError::LogFile { source, .. } => Some(source),
            SpawnError::Exec { source, .. } => Some(source),
        }
    }
}

/// Open the worker's log file for appending, creating it if needed.
pub fn open_log(path: &Path) -> Result<File, SpawnError> {
    let to_err = |e| SpawnError::LogFile {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)
}

/// Launch the worker in a new session, detached from our terminal.
///
/// stdin is `/dev/null`; stdout and stderr both append to `log`. When the
/// descriptor names a user, the worker runs with that user's uid and
/// primary gid.
pub fn spawn_detached(desc: &ServiceDescriptor, log: File) -> Result<Child, SpawnError> {
    let log_stderr = log.try_clone().map_err(|e| SpawnError::LogFile {
        path: desc.log_file.clone(),
        source: e,
    })?;

    let args = desc.expanded_args();
    let mut cmd = Command::new(&desc.command);
    cmd.args(&args)
        .current_dir(&desc.working_dir)
        .envs(&desc.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_stderr));

    if let Some(name) = &desc.user {
        let user = User::from_name(name)
            .map_err(|e| SpawnError::UserLookup {
                user: name.clone(),
                source: e,
            })?
            .ok_or_else(|| SpawnError::UnknownUser { user: name.clone() })?;
        cmd.uid(user.uid.as_raw())
            .gid(user.gid.as_raw())
            .env("HOME", &user.dir)
            .env("USER", &user.name)
            .env("LOGNAME", &user.name);
    }

    // New session: the worker leads its own process group so stop can
    // signal it together with any children it forks.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }

    tracing::info!(
        command = %desc.command,
        args = ?args,
        cwd = %desc.working_dir.display(),
        user = ?desc.user,
        "spawning worker"
    );

    cmd.spawn().map_err(|e| SpawnError::Exec {
        command: desc.command.clone(),
        source: e,
    })
}
