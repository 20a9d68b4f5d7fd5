use crate::transfer::{Result, TransferParams};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// The file storage of a transfer.
/// The actual disk I/O is executed by the storage implementation.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Release all file handles held by the storage.
    /// Files will be reopened in read-only mode when they're needed again.
    async fn release_files(&self) -> Result<()>;
}

/// Creates the storage of a transfer.
pub trait StorageFactory: Debug + Send + Sync {
    /// Create a new storage for the given transfer parameters.
    fn create(&self, params: &TransferParams) -> Result<Arc<dyn Storage>>;
}
