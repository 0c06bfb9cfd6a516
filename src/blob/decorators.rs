use super::BlobStorage;
use crate::config::StorageConfig;
use crate::decorators::{check_count, storage_policy, ClientFactory, ReloadingCell};
use crate::error::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Blob counterpart of [`crate::decorators::RetryingTableStorage`]. Both
/// attempt counts default to 10.
pub struct RetryingBlobStorage {
    inner: Arc<dyn BlobStorage>,
    policy: RetryPolicy,
    modification_attempts: u32,
    getting_attempts: u32,
}

impl RetryingBlobStorage {
    pub fn new(inner: Arc<dyn BlobStorage>, config: &StorageConfig) -> Result<Self> {
        Self::with_policy(
            inner,
            storage_policy(config),
            config.blob_on_modification_retry_count,
            config.blob_on_getting_retry_count,
        )
    }

    pub fn with_policy(
        inner: Arc<dyn BlobStorage>,
        policy: RetryPolicy,
        modification_attempts: u32,
        getting_attempts: u32,
    ) -> Result<Self> {
        Ok(Self {
            inner,
            policy,
            modification_attempts: check_count(
                "blob_on_modification_retry_count",
                modification_attempts,
            )?,
            getting_attempts: check_count("blob_on_getting_retry_count", getting_attempts)?,
        })
    }
}

#[async_trait]
impl BlobStorage for RetryingBlobStorage {
    async fn save_blob(&self, container: &str, key: &str, data: Vec<u8>) -> Result<String> {
        self.policy
            .run(
                "save_blob",
                || self.inner.save_blob(container, key, data.clone()),
                self.modification_attempts,
            )
            .await
    }

    async fn has_blob(&self, container: &str, key: &str) -> Result<bool> {
        self.policy
            .run("has_blob", || self.inner.has_blob(container, key), self.getting_attempts)
            .await
    }

    async fn get_blobs_last_modified(&self, container: &str) -> Result<Option<DateTime<Utc>>> {
        self.policy
            .run(
                "get_blobs_last_modified",
                || self.inner.get_blobs_last_modified(container),
                self.getting_attempts,
            )
            .await
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        self.policy
            .run("get_blob", || self.inner.get(container, key), self.getting_attempts)
            .await
    }

    async fn get_as_text(&self, container: &str, key: &str) -> Result<String> {
        self.policy
            .run(
                "get_as_text",
                || self.inner.get_as_text(container, key),
                self.getting_attempts,
            )
            .await
    }

    async fn get_blob_url(&self, container: &str, key: &str) -> Result<String> {
        self.policy
            .run(
                "get_blob_url",
                || self.inner.get_blob_url(container, key),
                self.getting_attempts,
            )
            .await
    }

    async fn find_names_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.policy
            .run(
                "find_names_by_prefix",
                || self.inner.find_names_by_prefix(container, prefix),
                self.getting_attempts,
            )
            .await
    }

    async fn list_blobs(&self, container: &str) -> Result<Vec<String>> {
        self.policy
            .run("list_blobs", || self.inner.list_blobs(container), self.getting_attempts)
            .await
    }

    async fn list_blob_keys(&self, container: &str) -> Result<Vec<String>> {
        self.policy
            .run(
                "list_blob_keys",
                || self.inner.list_blob_keys(container),
                self.getting_attempts,
            )
            .await
    }

    async fn delete_blob(&self, container: &str, key: &str) -> Result<()> {
        self.policy
            .run(
                "delete_blob",
                || self.inner.delete_blob(container, key),
                self.modification_attempts,
            )
            .await
    }
}

/// Reruns `$call` once against a rebuilt client after a 403
macro_rules! reconnecting {
    ($self:ident, |$blobs:ident| $call:expr) => {{
        let (generation, $blobs) = $self.cell.instance().await?;
        match $call {
            Err(e) if e.is_auth_failure() => {
                $self.cell.invalidate(generation);
                let (_, $blobs) = $self.cell.instance().await?;
                $call
            }
            other => other,
        }
    }};
}

/// Blob counterpart of [`crate::decorators::ReconnectingTableStorage`]
pub struct ReconnectingBlobStorage {
    cell: ReloadingCell<dyn BlobStorage>,
}

impl ReconnectingBlobStorage {
    pub fn new(factory: ClientFactory<dyn BlobStorage>) -> Self {
        Self {
            cell: ReloadingCell::new("blob", factory),
        }
    }

    pub fn generation(&self) -> u64 {
        self.cell.generation()
    }
}

#[async_trait]
impl BlobStorage for ReconnectingBlobStorage {
    async fn save_blob(&self, container: &str, key: &str, data: Vec<u8>) -> Result<String> {
        reconnecting!(self, |blobs| blobs.save_blob(container, key, data.clone()).await)
    }

    async fn has_blob(&self, container: &str, key: &str) -> Result<bool> {
        reconnecting!(self, |blobs| blobs.has_blob(container, key).await)
    }

    async fn get_blobs_last_modified(&self, container: &str) -> Result<Option<DateTime<Utc>>> {
        reconnecting!(self, |blobs| blobs.get_blobs_last_modified(container).await)
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        reconnecting!(self, |blobs| blobs.get(container, key).await)
    }

    async fn get_as_text(&self, container: &str, key: &str) -> Result<String> {
        reconnecting!(self, |blobs| blobs.get_as_text(container, key).await)
    }

    async fn get_blob_url(&self, container: &str, key: &str) -> Result<String> {
        reconnecting!(self, |blobs| blobs.get_blob_url(container, key).await)
    }

    async fn find_names_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        reconnecting!(self, |blobs| blobs.find_names_by_prefix(container, prefix).await)
    }

    async fn list_blobs(&self, container: &str) -> Result<Vec<String>> {
        reconnecting!(self, |blobs| blobs.list_blobs(container).await)
    }

    async fn list_blob_keys(&self, container: &str) -> Result<Vec<String>> {
        reconnecting!(self, |blobs| blobs.list_blob_keys(container).await)
    }

    async fn delete_blob(&self, container: &str, key: &str) -> Result<()> {
        reconnecting!(self, |blobs| blobs.delete_blob(container, key).await)
    }
}
