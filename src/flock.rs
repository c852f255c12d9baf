use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// An advisory lock file owned by one component for its lifetime.
///
/// The descriptor is opened once and locked per critical section, either
/// shared (concurrent readers) or exclusive (single writer). Acquisition
/// blocks with no timeout. The OS releases the lock if the process dies.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Opens (creating if absent) the lock file without taking the lock.
    /// The process ID is written into the file for debugging.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io("open lock file", &path, e))?;

        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { file, path })
    }

    /// Takes the lock exclusively, blocking until it is available.
    pub fn exclusive(&self) -> Result<LockGuard<'_>> {
        self.file
            .lock_exclusive()
            .map_err(|e| Error::io("lock exclusive", &self.path, e))?;
        debug!(path = %self.path.display(), "acquired exclusive lock");
        Ok(LockGuard { lock: self })
    }

    /// Takes the lock shared, blocking until no writer holds it.
    pub fn shared(&self) -> Result<LockGuard<'_>> {
        self.file
            .lock_shared()
            .map_err(|e| Error::io("lock shared", &self.path, e))?;
        debug!(path = %self.path.display(), "acquired shared lock");
        Ok(LockGuard { lock: self })
    }

    /// Takes the exclusive lock without a guard. The caller must pair this
    /// with [`FileLock::release`] on every exit path.
    pub fn acquire_exclusive(&self) -> Result<()> {
        self.file
            .lock_exclusive()
            .map_err(|e| Error::io("lock exclusive", &self.path, e))
    }

    /// Releases a lock taken with [`FileLock::acquire_exclusive`].
    pub fn release(&self) -> Result<()> {
        self.file
            .unlock()
            .map_err(|e| Error::io("unlock", &self.path, e))
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Holds a lock for the duration of a critical section.
pub struct LockGuard<'a> {
    lock: &'a FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // The descriptor stays open; only the lock is dropped.
        let _ = self.lock.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("test.lock");

        let lock = FileLock::open(&path).expect("Failed to open lock");
        let _guard = lock.exclusive().expect("Failed to acquire lock");

        assert!(path.exists());
        let content = std::fs::read_to_string(&path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("test.lock");
        let lock = FileLock::open(&path).expect("Failed to open lock");

        {
            let _guard = lock.exclusive().expect("Failed to acquire lock");
        }

        // Re-acquiring proves the guard released the lock.
        let _guard = lock.exclusive().expect("Lock still held after drop");
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("test.lock");

        let lock_a = FileLock::open(&path).expect("Failed to open lock");
        let lock_b = FileLock::open(&path).expect("Failed to open lock");

        let _guard_a = lock_a.shared().expect("Failed to acquire first shared lock");
        let _guard_b = lock_b
            .shared()
            .expect("Second shared lock should not block");
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("test.lock");
        let lock = FileLock::open(&path).expect("Failed to open lock");

        lock.acquire_exclusive().expect("Failed to acquire");
        lock.release().expect("Failed to release");
        lock.acquire_exclusive()
            .expect("Failed to re-acquire after release");
        lock.release().expect("Failed to release");
    }
}
