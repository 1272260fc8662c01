pub mod cache;
pub mod lock;

pub use cache::{ArtifactStore, DiskArtifactStore, StorageError, LOCK_TIMEOUT};
pub use lock::FileLock;
