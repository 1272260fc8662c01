use crate::storage::cache::StorageError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on a file, held until dropped.
///
/// Works across processes; two handles in one process also exclude each
/// other since every `acquire` opens its own file description.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock is ours or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!("gave up waiting for {:?} after {:?}", path, timeout);
                        return Err(StorageError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("failed to unlock {:?}: {}", self.path, e);
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("k.lock");

        let held = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        assert!(path.exists());

        let err = FileLock::acquire(&path, Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));

        drop(held);
        assert!(FileLock::acquire(&path, Duration::from_millis(120)).is_ok());
    }

    #[test]
    fn test_lock_released_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.lock");

        let inner = path.clone();
        let result = std::panic::catch_unwind(move || {
            let _lock = FileLock::acquire(&inner, Duration::from_secs(1)).unwrap();
            panic!("probe blew up");
        });
        assert!(result.is_err());

        assert!(FileLock::acquire(&path, Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = FileLock::acquire(&dir.path().join("a.lock"), Duration::from_millis(50)).unwrap();
        let _b = FileLock::acquire(&dir.path().join("b.lock"), Duration::from_millis(50)).unwrap();
    }
}
