//! Blob storage contract, an in-process backend and its resilience decorators.

mod decorators;
mod memory;

pub use decorators::{ReconnectingBlobStorage, RetryingBlobStorage};
pub use memory::InMemoryBlobStorage;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `data` under `key`, creating the container on demand. Returns the blob URL.
    async fn save_blob(&self, container: &str, key: &str, data: Vec<u8>) -> Result<String>;

    async fn has_blob(&self, container: &str, key: &str) -> Result<bool>;

    /// Latest modification time among the container's blobs; `None` when empty
    async fn get_blobs_last_modified(&self, container: &str) -> Result<Option<DateTime<Utc>>>;

    /// Blob contents; `NotFound` if absent
    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>>;

    /// Blob contents decoded as UTF-8
    async fn get_as_text(&self, container: &str, key: &str) -> Result<String>;

    async fn get_blob_url(&self, container: &str, key: &str) -> Result<String>;

    /// URLs of the container's blobs that start with `prefix`
    async fn find_names_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>>;

    /// URLs of all blobs in the container
    async fn list_blobs(&self, container: &str) -> Result<Vec<String>>;

    /// Keys of all blobs in the container
    async fn list_blob_keys(&self, container: &str) -> Result<Vec<String>>;

    async fn delete_blob(&self, container: &str, key: &str) -> Result<()>;
}
