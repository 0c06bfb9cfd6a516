//! Blob storage through the factory-built chain

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tablestore::blob::{BlobStorage, InMemoryBlobStorage};
use tablestore::error::Result;
use tablestore::factory::{BlobConnector, TableStorageFactory};
use tablestore::{Error, StorageConfig};

/// Hands out the shared backend and counts connections
struct CountingConnector {
    backend: InMemoryBlobStorage,
    connections: AtomicUsize,
}

#[async_trait]
impl BlobConnector for CountingConnector {
    async fn connect_blobs(&self, _connection_string: &str) -> Result<Arc<dyn BlobStorage>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.backend.clone()))
    }
}

fn setup() -> (Arc<dyn BlobStorage>, Arc<CountingConnector>) {
    let config = StorageConfig {
        retry_delay_ms: 0,
        connection_string: Some("memory://blobs".into()),
        ..StorageConfig::default()
    };
    let connector = Arc::new(CountingConnector {
        backend: InMemoryBlobStorage::new("https://acct.blob.example"),
        connections: AtomicUsize::new(0),
    });
    let factory = TableStorageFactory::from_config(config).unwrap();
    let blobs = factory.create_blob_storage(connector.clone()).unwrap();
    (blobs, connector)
}

#[tokio::test]
async fn test_blob_contract() {
    let (blobs, _) = setup();

    assert!(blobs.get_blobs_last_modified("invoices").await.unwrap().is_none());

    let url = blobs
        .save_blob("invoices", "2024/01/a.json", br#"{"total":12}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(url, "https://acct.blob.example/invoices/2024/01/a.json");
    blobs
        .save_blob("invoices", "2024/02/b.json", b"{}".to_vec())
        .await
        .unwrap();

    assert!(blobs.has_blob("invoices", "2024/01/a.json").await.unwrap());
    assert_eq!(
        blobs.get_as_text("invoices", "2024/01/a.json").await.unwrap(),
        r#"{"total":12}"#
    );
    assert_eq!(
        blobs.get_blob_url("invoices", "2024/02/b.json").await.unwrap(),
        "https://acct.blob.example/invoices/2024/02/b.json"
    );
    assert_eq!(
        blobs.list_blob_keys("invoices").await.unwrap(),
        vec!["2024/01/a.json", "2024/02/b.json"]
    );
    assert_eq!(blobs.list_blobs("invoices").await.unwrap().len(), 2);

    let january = blobs
        .find_names_by_prefix("invoices", "https://acct.blob.example/invoices/2024/01/")
        .await
        .unwrap();
    assert_eq!(january, vec!["https://acct.blob.example/invoices/2024/01/a.json"]);

    let before = blobs.get_blobs_last_modified("invoices").await.unwrap().unwrap();
    blobs
        .save_blob("invoices", "2024/03/c.json", b"{}".to_vec())
        .await
        .unwrap();
    let after = blobs.get_blobs_last_modified("invoices").await.unwrap().unwrap();
    assert!(after >= before);

    blobs.delete_blob("invoices", "2024/02/b.json").await.unwrap();
    assert!(!blobs.has_blob("invoices", "2024/02/b.json").await.unwrap());
    assert!(blobs.get("invoices", "2024/02/b.json").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_connection_is_lazy_and_reused() {
    let (blobs, connector) = setup();
    assert_eq!(connector.connections.load(Ordering::SeqCst), 0);

    blobs.save_blob("c", "k", vec![1]).await.unwrap();
    blobs.get("c", "k").await.unwrap();
    assert_eq!(connector.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_faults_are_retried_and_credentials_refreshed() {
    let (blobs, connector) = setup();
    blobs.save_blob("c", "k", b"v1".to_vec()).await.unwrap();

    connector.backend.inject(Error::Transient("server busy".into()));
    connector.backend.inject(Error::Forbidden("signature expired".into()));
    connector.backend.inject(Error::Transient("server busy".into()));
    blobs.save_blob("c", "k", b"v2".to_vec()).await.unwrap();

    assert_eq!(blobs.get_as_text("c", "k").await.unwrap(), "v2");
    assert_eq!(connector.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bad_requests_are_not_retried() {
    let (blobs, connector) = setup();

    let err = blobs.save_blob("", "k", vec![1]).await.unwrap_err();
    assert_eq!(err.status_code(), Some(400));

    // a 400 fails fast, the transient fault behind it is left for the next call
    connector.backend.inject(Error::BadRequest("bad name".into()));
    connector.backend.inject(Error::Transient("busy".into()));
    let err = blobs.save_blob("c", "k", vec![1]).await.unwrap_err();
    assert_eq!(err.status_code(), Some(400));
    blobs.save_blob("c", "k", vec![2]).await.unwrap();
    assert_eq!(blobs.get("c", "k").await.unwrap(), vec![2]);
}
