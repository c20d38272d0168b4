/// On-disk worker state: the PID file and the "service started" lock marker.
///
/// The PID file is written atomically (temp file in the same directory, then
/// rename) so a concurrent `status` never reads a partial PID.
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// The file recording the PID of the managed worker.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the recorded PID. `Ok(None)` when the file does not exist.
    pub fn read(&self) -> Result<Option<Pid>, StateFileError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateFileError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        match contents.trim().parse::<i32>() {
            Ok(raw) if raw > 0 => Ok(Some(Pid::from_raw(raw))),
            _ => Err(StateFileError::Malformed {
                path: self.path.clone(),
                contents: contents.trim().to_string(),
            }),
        }
    }

    /// Atomically replace the file with `pid`.
    pub fn write(&self, pid: Pid) -> Result<(), StateFileError> {
        let dir = parent_dir(&self.path);
        std::fs::create_dir_all(dir).map_err(|e| StateFileError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateFileError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        // Readable by unprivileged `status` callers
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .and_then(|_| writeln!(tmp, "{pid}"))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StateFileError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;

        tmp.persist(&self.path).map_err(|e| StateFileError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;

        tracing::debug!(path = %self.path.display(), pid = pid.as_raw(), "pid file written");
        Ok(())
    }

    /// Remove the file. Removing a file that is already gone is not an error.
    pub fn remove(&self) -> Result<(), StateFileError> {
        remove_if_exists(&self.path)
    }

    /// When the PID was recorded, taken from the file's modification time.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Existence-only marker asserting that the service was started.
#[derive(Debug, Clone)]
pub struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn create(&self) -> Result<(), StateFileError> {
        let dir = parent_dir(&self.path);
        std::fs::create_dir_all(dir)
            .and_then(|_| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&self.path)
            })
            .map_err(|e| StateFileError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), StateFileError> {
        remove_if_exists(&self.path)
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StateFileError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateFileError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Errors from PID file and lock marker operations.
#[derive(Debug)]
pub enum StateFileError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Malformed {
        path: PathBuf,
        contents: String,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateFileError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            StateFileError::Malformed { path, contents } => {
                write!(f, "{} does not contain a pid: {contents:?}", path.display())
            }
            StateFileError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            StateFileError::Remove { path, source } => {
                write!(f, "failed to remove {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StateFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateFileError::Read { source, .. } => Some(source),
            StateFileError::Malformed { .. } => None,
            StateFileError::Write { source, .. } => Some(source),
            StateFileError::Remove { source, .. } => Some(source),
        }
    }
}
