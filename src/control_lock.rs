/// Exclusive advisory lock held while a command mutates worker state.
///
/// Two invocations racing (`start` twice, a health check against a manual
/// `restart`) are serialized here; whoever acquires second re-checks
/// liveness and finds the state the first one left behind.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held lock. Released when dropped.
#[derive(Debug)]
pub struct ControlLock {
    file: File,
    path: PathBuf,
}

impl ControlLock {
    /// Block until the lock at `path` is held exclusively.
    ///
    /// The lock file itself is never removed: deleting it while another
    /// invocation waits on the old inode would let two holders in.
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            tracing::info!(path = %path.display(), "waiting for another workerctl invocation");
            file.lock_exclusive()?;
        }
        tracing::debug!(path = %path.display(), "control lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ControlLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release control lock");
        }
    }
}
