//! Queue storage through the factory-built chain

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablestore::error::Result;
use tablestore::factory::{QueueConnector, TableStorageFactory};
use tablestore::queue::{InMemoryQueueService, QueueStorage, TypedQueue};
use tablestore::{Error, StorageConfig};

/// Hands out queues of the shared service and counts connections
struct CountingConnector {
    service: InMemoryQueueService,
    connections: AtomicUsize,
}

#[async_trait]
impl QueueConnector for CountingConnector {
    async fn connect_queue(
        &self,
        _connection_string: &str,
        queue_name: &str,
    ) -> Result<Arc<dyn QueueStorage>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.service.queue(queue_name)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaymentReceived {
    account: String,
    amount: i64,
}

fn setup(queue_name: &str) -> (Arc<dyn QueueStorage>, Arc<CountingConnector>) {
    let config = StorageConfig {
        connection_string: Some("memory://queues".into()),
        ..StorageConfig::default()
    };
    let connector = Arc::new(CountingConnector {
        service: InMemoryQueueService::new(),
        connections: AtomicUsize::new(0),
    });
    let factory = TableStorageFactory::from_config(config).unwrap();
    let queue = factory
        .create_queue_storage(queue_name, connector.clone())
        .unwrap();
    (queue, connector)
}

#[tokio::test]
async fn test_insert_and_count() {
    let (queue, connector) = setup("InsertQueueTest");
    assert_eq!(connector.connections.load(Ordering::SeqCst), 0);

    queue.put_raw_message("test").await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(connector.connections.load(Ordering::SeqCst), 1);

    queue.clear().await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_parallel_inserts() {
    let (queue, connector) = setup("parallel-inserts");

    let writers: Vec<_> = (1..=10)
        .map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put_raw_message(&i.to_string()).await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(queue.count().await.unwrap(), 10);
    assert_eq!(connector.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_take_finish_and_release() {
    let (queue, _) = setup("work-items");
    queue.put_raw_message("first").await.unwrap();
    queue.put_raw_message("second").await.unwrap();

    let first = queue
        .get_raw_message(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let second = queue
        .get_raw_message(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(queue.get_raw_message(Duration::from_secs(30)).await.unwrap().is_none());

    queue.finish_raw_message(&first).await.unwrap();
    queue.release_raw_message(&second).await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(queue.peek_raw_message().await.unwrap().unwrap().content, "second");
}

#[tokio::test]
async fn test_forbidden_reconnects_with_fresh_credentials() {
    let (queue, connector) = setup("payments");
    queue.put_raw_message("a").await.unwrap();

    connector.service.inject(Error::Forbidden("sas expired".into()));
    queue.put_raw_message("b").await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 2);
    assert_eq!(connector.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_typed_messages_over_the_chain() {
    let (queue, _) = setup("payments");
    let typed = TypedQueue::new(queue)
        .register::<PaymentReceived>("PaymentReceived")
        .unwrap();

    let payment = PaymentReceived {
        account: "acc-1".into(),
        amount: 250,
    };
    typed.put_message(&payment).await.unwrap();

    let taken = typed.get_message::<PaymentReceived>().await.unwrap().unwrap();
    assert_eq!(taken.item, Some(payment));
    typed.finish_message(&taken).await.unwrap();
    assert_eq!(typed.queue().count().await.unwrap(), 0);
}
