//! Assembles decorated storage clients from a [`StorageConfig`].
//!
//! Table chain, outermost first:
//! logging → cache (optional) → retry → reconnect → remote client.
//! Blob chain: retry → reconnect → connected blob client.
//! Queue chain: reconnect → connected queue client.
//!
//! The reconnect layer re-reads the connection string every time it builds a
//! client, so rotated credentials are picked up after the first 403.

use crate::blob::{
    BlobStorage, InMemoryBlobStorage, ReconnectingBlobStorage, RetryingBlobStorage,
};
use crate::config::StorageConfig;
use crate::decorators::{
    CachedTableStorage, ClientFactory, LoggingTableStorage, ReconnectingTableStorage,
    RetryingTableStorage,
};
use crate::entity::{self, TableEntity};
use crate::error::{Error, Result};
use crate::queue::{
    normalize_queue_name, InMemoryQueueService, QueueStorage, ReconnectingQueueStorage,
};
use crate::storage::{RemoteTableStorage, TableStorage};
use crate::transport::{MemoryTransport, TableTransport};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Source of the current connection string
#[async_trait]
pub trait ConnectionStringProvider: Send + Sync {
    async fn connection_string(&self) -> Result<String>;
}

/// A connection string that never changes
#[derive(Debug, Clone)]
pub struct StaticConnectionString(pub String);

#[async_trait]
impl ConnectionStringProvider for StaticConnectionString {
    async fn connection_string(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Opens transports and blob clients for a connection string
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn TableTransport>>;
}

#[async_trait]
pub trait BlobConnector: Send + Sync {
    async fn connect_blobs(&self, connection_string: &str) -> Result<Arc<dyn BlobStorage>>;
}

#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect_queue(
        &self,
        connection_string: &str,
        queue_name: &str,
    ) -> Result<Arc<dyn QueueStorage>>;
}

/// Every connection string reaches the same in-process service
#[async_trait]
impl TransportConnector for MemoryTransport {
    async fn connect(&self, _connection_string: &str) -> Result<Arc<dyn TableTransport>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BlobConnector for InMemoryBlobStorage {
    async fn connect_blobs(&self, _connection_string: &str) -> Result<Arc<dyn BlobStorage>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl QueueConnector for InMemoryQueueService {
    async fn connect_queue(
        &self,
        _connection_string: &str,
        queue_name: &str,
    ) -> Result<Arc<dyn QueueStorage>> {
        Ok(Arc::new(self.queue(queue_name)?))
    }
}

pub struct TableStorageFactory {
    config: StorageConfig,
    connections: Arc<dyn ConnectionStringProvider>,
}

impl TableStorageFactory {
    pub fn new(
        config: StorageConfig,
        connections: Arc<dyn ConnectionStringProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connections,
        })
    }

    /// Use the connection string from `config`
    pub fn from_config(config: StorageConfig) -> Result<Self> {
        let connection_string = config
            .connection_string
            .clone()
            .ok_or_else(|| Error::Configuration("connection_string is required".into()))?;
        Self::new(config, Arc::new(StaticConnectionString(connection_string)))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Client for the configured table; cached when `enable_cache` is set
    pub async fn create<T: TableEntity>(
        &self,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Arc<dyn TableStorage<T>>> {
        self.build(&self.config.table_name, connector, self.config.enable_cache)
            .await
    }

    /// Client for the configured table with a write-through cache
    pub async fn create_with_cache<T: TableEntity>(
        &self,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Arc<dyn TableStorage<T>>> {
        self.build(&self.config.table_name, connector, true).await
    }

    /// Client for another table sharing this factory's settings
    pub async fn create_for_table<T: TableEntity>(
        &self,
        table: &str,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Arc<dyn TableStorage<T>>> {
        self.build(table, connector, self.config.enable_cache).await
    }

    #[instrument(skip(self, connector), fields(entity = std::any::type_name::<T>()))]
    async fn build<T: TableEntity>(
        &self,
        table: &str,
        connector: Arc<dyn TransportConnector>,
        cache: bool,
    ) -> Result<Arc<dyn TableStorage<T>>> {
        // Reject a bad registration before anything touches the network
        entity::describe::<T>()?;

        let connections = self.connections.clone();
        let config = self.config.clone();
        let table_name = table.to_string();
        let remote: ClientFactory<dyn TableStorage<T>> = Arc::new(move || {
            let connections = connections.clone();
            let connector = connector.clone();
            let config = config.clone();
            let table_name = table_name.clone();
            async move {
                let connection_string = connections.connection_string().await?;
                let transport = connector.connect(&connection_string).await?;
                debug!(table = %table_name, "Connected table client");
                let storage: Arc<dyn TableStorage<T>> =
                    Arc::new(RemoteTableStorage::new(transport, table_name, &config)?);
                Ok::<_, Error>(storage)
            }
            .boxed()
        });

        let reconnecting: Arc<dyn TableStorage<T>> =
            Arc::new(ReconnectingTableStorage::new(table, remote));
        let retrying: Arc<dyn TableStorage<T>> =
            Arc::new(RetryingTableStorage::new(reconnecting, &self.config)?);
        let inner = if cache {
            let cached: Arc<dyn TableStorage<T>> =
                Arc::new(CachedTableStorage::new(retrying).await?);
            cached
        } else {
            retrying
        };

        info!(table, cache, "Created table storage");
        Ok(Arc::new(LoggingTableStorage::new(inner)?))
    }

    /// Blob client with retry and reconnect
    pub fn create_blob_storage(
        &self,
        connector: Arc<dyn BlobConnector>,
    ) -> Result<Arc<dyn BlobStorage>> {
        let connections = self.connections.clone();
        let blobs: ClientFactory<dyn BlobStorage> = Arc::new(move || {
            let connections = connections.clone();
            let connector = connector.clone();
            async move {
                let connection_string = connections.connection_string().await?;
                connector.connect_blobs(&connection_string).await
            }
            .boxed()
        });

        let reconnecting: Arc<dyn BlobStorage> = Arc::new(ReconnectingBlobStorage::new(blobs));
        Ok(Arc::new(RetryingBlobStorage::new(reconnecting, &self.config)?))
    }

    /// Queue client that reconnects after a 403. The name is lowercased and
    /// validated before any connection is made.
    pub fn create_queue_storage(
        &self,
        queue_name: &str,
        connector: Arc<dyn QueueConnector>,
    ) -> Result<Arc<dyn QueueStorage>> {
        let name = normalize_queue_name(queue_name)?;
        let connections = self.connections.clone();
        let queue_name = name.clone();
        let queues: ClientFactory<dyn QueueStorage> = Arc::new(move || {
            let connections = connections.clone();
            let connector = connector.clone();
            let queue_name = queue_name.clone();
            async move {
                let connection_string = connections.connection_string().await?;
                let queue = connector.connect_queue(&connection_string, &queue_name).await?;
                debug!(queue = %queue_name, "Connected queue client");
                Ok::<_, Error>(queue)
            }
            .boxed()
        });

        info!(queue = %name, "Created queue storage");
        Ok(Arc::new(ReconnectingQueueStorage::new(name, queues)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDescriptor;
    use crate::transport::TransportCall;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Device {
        site: String,
        serial: String,
        online: bool,
    }

    impl TableEntity for Device {
        fn describe(d: &mut EntityDescriptor<Self>) {
            d.partition_key("Site", |x: &Self| &x.site, |x: &mut Self, v| x.site = v)
                .row_key("Serial", |x: &Self| &x.serial, |x: &mut Self, v| x.serial = v)
                .property("Online", |x: &Self| &x.online, |x: &mut Self, v| x.online = v);
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Broken;

    impl TableEntity for Broken {
        fn describe(_: &mut EntityDescriptor<Self>) {}
    }

    /// Hands out a new connection string on every read
    struct Rotating {
        reads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionStringProvider for Rotating {
        async fn connection_string(&self) -> Result<String> {
            let mut reads = self.reads.lock();
            let next = format!("key-{}", reads.len());
            reads.push(next.clone());
            Ok(next)
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            retry_delay_ms: 0,
            connection_string: Some("memory://".into()),
            ..StorageConfig::for_table("devices")
        }
    }

    fn device(serial: &str) -> Device {
        Device {
            site: "lab".into(),
            serial: serial.into(),
            online: true,
        }
    }

    #[tokio::test]
    async fn test_chain_round_trip() {
        let transport = MemoryTransport::new();
        let factory = TableStorageFactory::from_config(config()).unwrap();
        let storage = factory.create::<Device>(Arc::new(transport.clone())).await.unwrap();

        storage.insert(&device("a1")).await.unwrap();
        assert_eq!(storage.get("lab", "a1").await.unwrap(), Some(device("a1")));
        assert!(storage.insert(&device("a1")).await.unwrap_err().is_conflict());
        assert_eq!(transport.row_count("devices"), 1);
    }

    #[tokio::test]
    async fn test_invalid_entity_rejected_before_connecting() {
        let transport = MemoryTransport::new();
        let factory = TableStorageFactory::from_config(config()).unwrap();
        let err = factory
            .create::<Broken>(Arc::new(transport.clone()))
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert_eq!(transport.calls(TransportCall::CreateTable), 0);
    }

    #[test]
    fn test_missing_connection_string() {
        let err = TableStorageFactory::from_config(StorageConfig::for_table("devices"))
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_reconnect_rereads_connection_string() {
        let transport = MemoryTransport::new();
        let provider = Arc::new(Rotating {
            reads: Mutex::new(Vec::new()),
        });
        let factory = TableStorageFactory::new(config(), provider.clone()).unwrap();
        let storage = factory.create::<Device>(Arc::new(transport.clone())).await.unwrap();

        storage.insert(&device("a1")).await.unwrap();
        transport.inject(TransportCall::Execute, Error::Forbidden("key rotated".into()));
        assert!(storage.get("lab", "a1").await.unwrap().is_some());
        assert_eq!(*provider.reads.lock(), vec!["key-0", "key-1"]);
    }

    #[tokio::test]
    async fn test_cached_chain_serves_reads_locally() {
        let transport = MemoryTransport::new();
        let factory = TableStorageFactory::from_config(config()).unwrap();
        let storage = factory
            .create_with_cache::<Device>(Arc::new(transport.clone()))
            .await
            .unwrap();

        storage.insert(&device("a1")).await.unwrap();
        let executes = transport.calls(TransportCall::Execute);
        assert!(storage.get("lab", "a1").await.unwrap().is_some());
        assert_eq!(transport.calls(TransportCall::Execute), executes);
    }

    #[tokio::test]
    async fn test_queue_chain() {
        let service = InMemoryQueueService::new();
        let factory = TableStorageFactory::from_config(config()).unwrap();
        let queue = factory
            .create_queue_storage("Notifications", Arc::new(service.clone()))
            .unwrap();
        assert_eq!(queue.name(), "notifications");

        queue.put_raw_message("hello").await.unwrap();
        service.inject(Error::Forbidden("expired".into()));
        assert_eq!(queue.count().await.unwrap(), 1);
        assert_eq!(service.queue("notifications").unwrap().count().await.unwrap(), 1);

        assert!(factory
            .create_queue_storage("no_underscores", Arc::new(service))
            .err()
            .unwrap()
            .is_configuration());
    }

    #[tokio::test]
    async fn test_blob_chain() {
        let backend = InMemoryBlobStorage::default();
        let factory = TableStorageFactory::from_config(config()).unwrap();
        let blobs = factory.create_blob_storage(Arc::new(backend.clone())).unwrap();

        backend.inject(Error::Transient("busy".into()));
        backend.inject(Error::Forbidden("expired".into()));
        blobs.save_blob("docs", "readme", b"hi".to_vec()).await.unwrap();
        assert_eq!(blobs.get_as_text("docs", "readme").await.unwrap(), "hi");
    }
}
