use super::BlobStorage;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

struct StoredBlob {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

type Containers = BTreeMap<String, BTreeMap<String, StoredBlob>>;

/// Process-local blob store. Blob URLs are `{base_url}/{container}/{key}`.
/// Clones share the same contents.
#[derive(Clone)]
pub struct InMemoryBlobStorage {
    base_url: String,
    containers: Arc<RwLock<Containers>>,
    faults: Arc<Mutex<VecDeque<Error>>>,
}

impl Default for InMemoryBlobStorage {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

impl InMemoryBlobStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            containers: Arc::new(RwLock::new(Containers::new())),
            faults: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Fail the next call with `error`. Queued faults are consumed in order.
    pub fn inject(&self, error: Error) {
        self.faults.lock().push_back(error);
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        match self.faults.lock().pop_front() {
            Some(error) => {
                trace!(operation, %error, "Injected blob fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn url(&self, container: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, container, key)
    }

    fn not_found(container: &str, key: &str) -> Error {
        Error::NotFound(format!("blob {}/{} does not exist", container, key))
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn save_blob(&self, container: &str, key: &str, data: Vec<u8>) -> Result<String> {
        self.enter("save_blob")?;
        if container.is_empty() || key.is_empty() {
            return Err(Error::BadRequest("container and key must not be empty".into()));
        }
        self.containers
            .write()
            .entry(container.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredBlob {
                    data,
                    last_modified: Utc::now(),
                },
            );
        Ok(self.url(container, key))
    }

    async fn has_blob(&self, container: &str, key: &str) -> Result<bool> {
        self.enter("has_blob")?;
        Ok(self
            .containers
            .read()
            .get(container)
            .is_some_and(|blobs| blobs.contains_key(key)))
    }

    async fn get_blobs_last_modified(&self, container: &str) -> Result<Option<DateTime<Utc>>> {
        self.enter("get_blobs_last_modified")?;
        Ok(self
            .containers
            .read()
            .get(container)
            .and_then(|blobs| blobs.values().map(|b| b.last_modified).max()))
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        self.enter("get")?;
        self.containers
            .read()
            .get(container)
            .and_then(|blobs| blobs.get(key))
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Self::not_found(container, key))
    }

    async fn get_as_text(&self, container: &str, key: &str) -> Result<String> {
        let data = self.get(container, key).await?;
        String::from_utf8(data).map_err(|e| Error::Serialization(e.to_string()))
    }

    async fn get_blob_url(&self, container: &str, key: &str) -> Result<String> {
        self.enter("get_blob_url")?;
        Ok(self.url(container, key))
    }

    async fn find_names_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_blobs(container)
            .await?
            .into_iter()
            .filter(|url| url.starts_with(prefix))
            .collect())
    }

    async fn list_blobs(&self, container: &str) -> Result<Vec<String>> {
        let keys = self.list_blob_keys(container).await?;
        Ok(keys.iter().map(|key| self.url(container, key)).collect())
    }

    async fn list_blob_keys(&self, container: &str) -> Result<Vec<String>> {
        self.enter("list_blob_keys")?;
        Ok(self
            .containers
            .read()
            .get(container)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_blob(&self, container: &str, key: &str) -> Result<()> {
        self.enter("delete_blob")?;
        self.containers
            .write()
            .get_mut(container)
            .and_then(|blobs| blobs.remove(key))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(container, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_read() {
        let blobs = InMemoryBlobStorage::new("https://store.example/");
        let url = blobs
            .save_blob("reports", "2024/q1.txt", b"revenue".to_vec())
            .await
            .unwrap();
        assert_eq!(url, "https://store.example/reports/2024/q1.txt");

        assert!(blobs.has_blob("reports", "2024/q1.txt").await.unwrap());
        assert!(!blobs.has_blob("reports", "2024/q2.txt").await.unwrap());
        assert_eq!(blobs.get_as_text("reports", "2024/q1.txt").await.unwrap(), "revenue");
        assert!(blobs.get("reports", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_listing() {
        let blobs = InMemoryBlobStorage::default();
        for key in ["a/1", "a/2", "b/1"] {
            blobs.save_blob("c", key, vec![1]).await.unwrap();
        }

        assert_eq!(blobs.list_blob_keys("c").await.unwrap(), vec!["a/1", "a/2", "b/1"]);
        assert_eq!(blobs.list_blobs("c").await.unwrap()[2], "memory://blobs/c/b/1");
        assert_eq!(
            blobs
                .find_names_by_prefix("c", "memory://blobs/c/a/")
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(blobs.list_blob_keys("empty").await.unwrap().is_empty());
        assert!(blobs.get_blobs_last_modified("empty").await.unwrap().is_none());
        assert!(blobs.get_blobs_last_modified("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let blobs = InMemoryBlobStorage::default();
        blobs.save_blob("c", "k", vec![1, 2]).await.unwrap();
        blobs.delete_blob("c", "k").await.unwrap();
        assert!(!blobs.has_blob("c", "k").await.unwrap());
        assert!(blobs.delete_blob("c", "k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let blobs = InMemoryBlobStorage::default();
        blobs.save_blob("c", "bin", vec![0xff, 0xfe]).await.unwrap();
        assert!(matches!(
            blobs.get_as_text("c", "bin").await,
            Err(Error::Serialization(_))
        ));
    }
}
