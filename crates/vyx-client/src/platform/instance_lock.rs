//! Single-instance lock via OS advisory file locking.
//!
//! Running two agents on one machine would register the device twice on
//! the exchange. The lock file lives in the user config directory and
//! holds the owning PID for diagnostics; the advisory lock (not the
//! file's existence) is what arbitrates, so a stale file from a crashed
//! process never blocks startup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::debug;

const LOCK_FILE_NAME: &str = "vyx-client.lock";

#[derive(Debug, thiserror::Error)]
pub enum InstanceLockError {
    #[error("another instance is already running")]
    AlreadyHeld,

    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held while this process is the only running instance. Released on
/// drop (or by the OS if the process dies).
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock under `dir`, failing fast if another process
    /// holds it.
    pub fn acquire(dir: &Path) -> Result<Self, InstanceLockError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(InstanceLockError::AlreadyHeld);
            }
            Err(e) => return Err(e.into()),
        }

        let mut lock = Self { file, path };
        lock.write_pid()?;
        debug!(path = %lock.path.display(), "instance lock acquired");
        Ok(lock)
    }

    fn write_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        write!(self.file, "{}", std::process::id())?;
        self.file.sync_all()
    }

    /// Release explicitly. Dropping the lock has the same effect.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        // Best-effort cleanup; a leftover file is harmless.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();

        let lock = InstanceLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            InstanceLock::acquire(dir.path()),
            Err(InstanceLockError::AlreadyHeld)
        ));

        lock.release();
        let again = InstanceLock::acquire(dir.path()).unwrap();
        again.release();
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = InstanceLock::acquire(dir.path()).unwrap();

        let contents = std::fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
