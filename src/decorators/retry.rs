//! Bounded retries around the table contract.

use crate::batch::TableBatch;
use crate::config::StorageConfig;
use crate::entity::TableEntity;
use crate::error::{Error, Result};
use crate::paging::{PagedResult, PagingInfo};
use crate::query::TableQuery;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::{
    AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter, EntityUpdate,
    StopCondition, TableStorage,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Classifier shared by the table and blob retry decorators.
///
/// Configuration errors, caller cancellation and the listed status codes
/// fail fast. A timeout is retried only when `retry_on_timeout` is set.
pub fn storage_policy(config: &StorageConfig) -> RetryPolicy {
    let no_retry = config.no_retry_status_codes.clone();
    let retry_on_timeout = config.retry_on_timeout;
    RetryPolicy::with_classifier(config.retry_delay(), move |error: &Error| {
        if error.is_configuration() {
            return RetryDecision::FailFast;
        }
        if let Some(status) = error.status_code() {
            if no_retry.contains(&status) {
                return RetryDecision::FailFast;
            }
        }
        if error.is_cancellation() && !(retry_on_timeout && error.is_timeout()) {
            return RetryDecision::FailFast;
        }
        RetryDecision::RetryableUntilExhausted
    })
}

pub(crate) fn check_count(name: &str, count: u32) -> Result<u32> {
    if count < 1 {
        return Err(Error::Configuration(format!(
            "{} must be greater than 0, got {}",
            name, count
        )));
    }
    Ok(count)
}

/// Reads get `on_getting_retry_count` attempts, writes get
/// `on_modification_retry_count`. Streaming scans and pagination pass
/// straight through since a partial result cannot be replayed.
pub struct RetryingTableStorage<T: TableEntity> {
    inner: Arc<dyn TableStorage<T>>,
    policy: RetryPolicy,
    modification_attempts: u32,
    getting_attempts: u32,
}

impl<T: TableEntity> RetryingTableStorage<T> {
    pub fn new(inner: Arc<dyn TableStorage<T>>, config: &StorageConfig) -> Result<Self> {
        Self::with_policy(
            inner,
            storage_policy(config),
            config.on_modification_retry_count,
            config.on_getting_retry_count,
        )
    }

    pub fn with_policy(
        inner: Arc<dyn TableStorage<T>>,
        policy: RetryPolicy,
        modification_attempts: u32,
        getting_attempts: u32,
    ) -> Result<Self> {
        Ok(Self {
            inner,
            policy,
            modification_attempts: check_count(
                "on_modification_retry_count",
                modification_attempts,
            )?,
            getting_attempts: check_count("on_getting_retry_count", getting_attempts)?,
        })
    }
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for RetryingTableStorage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn insert(&self, item: &T) -> Result<()> {
        self.policy
            .run("insert", || self.inner.insert(item), self.modification_attempts)
            .await
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        self.policy
            .run("insert_batch", || self.inner.insert_batch(items), self.modification_attempts)
            .await
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        self.policy
            .run(
                "insert_or_merge",
                || self.inner.insert_or_merge(item),
                self.modification_attempts,
            )
            .await
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        self.policy
            .run(
                "insert_or_merge_batch",
                || self.inner.insert_or_merge_batch(items),
                self.modification_attempts,
            )
            .await
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        self.policy
            .run(
                "insert_or_replace",
                || self.inner.insert_or_replace(item),
                self.modification_attempts,
            )
            .await
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        self.policy
            .run(
                "insert_or_replace_batch",
                || self.inner.insert_or_replace_batch(items),
                self.modification_attempts,
            )
            .await
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.policy
            .run(
                "replace",
                || self.inner.replace(partition_key, row_key, update),
                self.modification_attempts,
            )
            .await
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.policy
            .run(
                "merge",
                || self.inner.merge(partition_key, row_key, update),
                self.modification_attempts,
            )
            .await
    }

    async fn delete(&self, item: &T) -> Result<()> {
        self.policy
            .run("delete", || self.inner.delete(item), self.modification_attempts)
            .await
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.policy
            .run(
                "delete_by_key",
                || self.inner.delete_by_key(partition_key, row_key),
                self.modification_attempts,
            )
            .await
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        self.policy
            .run(
                "delete_if_exists",
                || self.inner.delete_if_exists(partition_key, row_key),
                self.modification_attempts,
            )
            .await
    }

    async fn delete_table(&self) -> Result<bool> {
        self.policy
            .run("delete_table", || self.inner.delete_table(), self.modification_attempts)
            .await
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        self.policy
            .run("delete_batch", || self.inner.delete_batch(items), self.modification_attempts)
            .await
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        self.policy
            .run(
                "create_if_not_exists",
                || self.inner.create_if_not_exists(item),
                self.modification_attempts,
            )
            .await
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        self.policy
            .run("record_exists", || self.inner.record_exists(item), self.getting_attempts)
            .await
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.policy
            .run("get", || self.inner.get(partition_key, row_key), self.getting_attempts)
            .await
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        self.policy
            .run("get_all", || self.inner.get_all(filter), self.getting_attempts)
            .await
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "get_partition",
                || self.inner.get_partition(partition_key, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "get_by_row_keys",
                || self.inner.get_by_row_keys(partition_key, row_keys, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "get_by_partition_keys",
                || self.inner.get_by_partition_keys(partition_keys, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "get_by_keys",
                || self.inner.get_by_keys(keys, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        self.policy
            .run(
                "get_top_record",
                || self.inner.get_top_record(partition_key),
                self.getting_attempts,
            )
            .await
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        self.policy
            .run(
                "get_top_records",
                || self.inner.get_top_records(partition_key, count),
                self.getting_attempts,
            )
            .await
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        self.inner.get_data_by_chunks(query, sink).await
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        self.inner.scan_data(query, handler).await
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        self.inner.first_or_none_via_scan(partition_key, search).await
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        self.inner.get_row_keys_only(row_keys).await
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "where_query",
                || self.inner.where_query(query, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        self.policy
            .run(
                "where_query_async",
                || self.inner.where_query_async(query, filter),
                self.getting_attempts,
            )
            .await
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        self.inner.execute(query, sink, stop).await
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        self.policy
            .run(
                "do_batch",
                || self.inner.do_batch(batch.clone()),
                self.modification_attempts,
            )
            .await
    }

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>> {
        self.inner.execute_query_with_pagination(query, paging).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDescriptor;
    use crate::storage::RemoteTableStorage;
    use crate::transport::{MemoryTransport, TransportCall};
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Order {
        customer: String,
        id: String,
        total: i64,
    }

    impl TableEntity for Order {
        fn describe(d: &mut EntityDescriptor<Self>) {
            d.partition_key("Customer", |o: &Self| &o.customer, |o: &mut Self, v| o.customer = v)
                .row_key("Id", |o: &Self| &o.id, |o: &mut Self, v| o.id = v)
                .property("Total", |o: &Self| &o.total, |o: &mut Self, v| o.total = v);
        }
    }

    fn order(id: &str) -> Order {
        Order {
            customer: "acme".into(),
            id: id.into(),
            total: 10,
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            retry_delay_ms: 0,
            on_getting_retry_count: 2,
            on_modification_retry_count: 4,
            ..StorageConfig::for_table("orders")
        }
    }

    fn retrying(transport: &MemoryTransport, config: &StorageConfig) -> RetryingTableStorage<Order> {
        let remote = RemoteTableStorage::new(Arc::new(transport.clone()), "orders", config).unwrap();
        RetryingTableStorage::new(Arc::new(remote), config).unwrap()
    }

    #[test]
    fn test_classifier() {
        let policy = storage_policy(&StorageConfig::default());
        let retry = RetryDecision::RetryableUntilExhausted;
        let fail = RetryDecision::FailFast;
        assert_eq!(policy.classify(&Error::Conflict("x".into())), fail);
        assert_eq!(policy.classify(&Error::BadRequest("x".into())), fail);
        assert_eq!(policy.classify(&Error::Configuration("x".into())), fail);
        assert_eq!(policy.classify(&Error::Cancelled("x".into())), fail);
        assert_eq!(policy.classify(&Error::Timeout(Duration::from_secs(5))), retry);
        assert_eq!(policy.classify(&Error::PreconditionFailed("x".into())), retry);
        assert_eq!(policy.classify(&Error::Transient("x".into())), retry);
        let batch = Error::BatchFailed {
            partition: "p".into(),
            chunk: 0,
            source: Box::new(Error::Conflict("x".into())),
        };
        assert_eq!(policy.classify(&batch), fail);

        let strict = StorageConfig {
            retry_on_timeout: false,
            ..StorageConfig::default()
        };
        assert_eq!(
            storage_policy(&strict).classify(&Error::Timeout(Duration::from_secs(5))),
            fail
        );
    }

    #[test]
    fn test_zero_counts_rejected() {
        let inner: Arc<dyn TableStorage<Order>> =
            Arc::new(crate::storage::InMemoryTable::new("orders").unwrap());
        let err = RetryingTableStorage::with_policy(inner, RetryPolicy::default(), 0, 1)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_writes_retry_until_success() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        transport.inject(TransportCall::Execute, Error::Transient("busy".into()));
        transport.inject(TransportCall::Execute, Error::Transient("busy".into()));

        storage.insert(&order("1")).await.unwrap();
        assert_eq!(transport.calls(TransportCall::Execute), 3);
        assert_eq!(transport.row_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_writes_give_up_after_modification_count() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        for _ in 0..5 {
            transport.inject(TransportCall::Execute, Error::Transient("busy".into()));
        }

        let err = storage.insert(&order("1")).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(transport.calls(TransportCall::Execute), 4);
    }

    #[tokio::test]
    async fn test_reads_use_getting_count() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        storage.insert(&order("1")).await.unwrap();
        let before = transport.calls(TransportCall::Execute);
        for _ in 0..3 {
            transport.inject(TransportCall::Execute, Error::Transient("busy".into()));
        }

        assert!(storage.get("acme", "1").await.is_err());
        assert_eq!(transport.calls(TransportCall::Execute) - before, 2);
    }

    #[tokio::test]
    async fn test_conflict_fails_fast() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        storage.insert(&order("1")).await.unwrap();
        let before = transport.calls(TransportCall::Execute);

        let err = storage.insert(&order("1")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(transport.calls(TransportCall::Execute) - before, 1);
    }

    #[tokio::test]
    async fn test_cancellation_fails_fast() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        transport.inject(TransportCall::Execute, Error::Cancelled("shutdown".into()));

        let err = storage.insert(&order("1")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(transport.calls(TransportCall::Execute), 1);
    }

    #[tokio::test]
    async fn test_scans_are_not_retried() {
        let transport = MemoryTransport::new();
        let storage = retrying(&transport, &config());
        storage.insert(&order("1")).await.unwrap();
        transport.inject(TransportCall::Query, Error::Transient("busy".into()));

        let mut seen = 0;
        let mut sink = |chunk: Vec<Order>| seen += chunk.len();
        assert!(storage
            .get_data_by_chunks(&TableQuery::new(), &mut sink)
            .await
            .is_err());
        assert_eq!(transport.calls(TransportCall::Query), 1);
    }
}
