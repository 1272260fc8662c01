use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Root of the probe cache when set.
pub const ENV_CACHE_DIR: &str = "VECISA_CACHE_DIR";

/// How long a process waits for another one compiling the same probe.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {timeout:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },
}

/// Content-addressed home for probe sources and the artifacts built from them.
pub trait ArtifactStore: Send + Sync {
    /// Store `content` under a key derived from it and `extra`.
    /// Returns the key and the path of the written file.
    fn write(&self, content: &str, extension: &str, extra: &str)
        -> Result<(String, PathBuf), StorageError>;

    fn lock_dir(&self) -> PathBuf;

    fn lock_timeout(&self) -> Duration {
        LOCK_TIMEOUT
    }
}

/// `write` places files at `<root>/<key[1..3]>/<key>.<ext>`; lock files live in `<root>/locks`.
#[derive(Debug, Clone)]
pub struct DiskArtifactStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl DiskArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// `$VECISA_CACHE_DIR`, else a per-user directory under the system temp dir.
    pub fn default_root() -> PathBuf {
        if let Some(dir) = std::env::var_os(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default".to_string());
        std::env::temp_dir().join(format!("vecisa_{}", sanitize(&user)))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for DiskArtifactStore {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

impl ArtifactStore for DiskArtifactStore {
    fn write(
        &self,
        content: &str,
        extension: &str,
        extra: &str,
    ) -> Result<(String, PathBuf), StorageError> {
        let key = content_key(content, extra);
        let subdir = self.root.join(&key[1..3]);
        fs::create_dir_all(&subdir)?;

        let path = subdir.join(format!("{}.{}", key, extension));
        if !path.exists() {
            write_atomic(&path, content)?;
        }
        Ok((key, path))
    }

    fn lock_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

/// `c` followed by 51 hex digits of SHA-256 over the trimmed content and `extra`.
pub fn content_key(content: &str, extra: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    hasher.update(extra.as_bytes());
    let digest = hasher.finalize();

    let mut key = String::with_capacity(52);
    key.push('c');
    for byte in digest.iter() {
        key.push_str(&format!("{:02x}", byte));
    }
    key.truncate(52);
    key
}

// Readers never observe a half-written source.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let tmp = path.with_extension(format!(
        "tmp{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, content)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        // Lost a race against an identical write.
        Err(_) if path.exists() => {
            let _ = fs::remove_file(&tmp);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
