//! Rebuild the wrapped table client after an authorization failure.

use super::reloading::{ClientFactory, ReloadingCell};
use crate::batch::TableBatch;
use crate::entity::TableEntity;
use crate::error::Result;
use crate::paging::{PagedResult, PagingInfo};
use crate::query::TableQuery;
use crate::storage::{
    AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter, EntityUpdate,
    StopCondition, TableStorage,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs `$call` against the current client. A 403 discards that client's
/// generation and runs `$call` once more against a fresh one.
macro_rules! reconnecting {
    ($self:ident, |$storage:ident| $call:expr) => {{
        let (generation, $storage) = $self.cell.instance().await?;
        match $call {
            Err(e) if e.is_auth_failure() => {
                $self.cell.invalidate(generation);
                let (_, $storage) = $self.cell.instance().await?;
                $call
            }
            other => other,
        }
    }};
}

/// Like `reconnecting!`, but a 403 is surfaced once `$delivered` is set,
/// since rerunning would hand the same rows to the consumer twice.
macro_rules! reconnecting_stream {
    ($self:ident, $delivered:ident, |$storage:ident| $call:expr) => {{
        let (generation, $storage) = $self.cell.instance().await?;
        match $call {
            Err(e) if e.is_auth_failure() && !$delivered.load(Ordering::SeqCst) => {
                $self.cell.invalidate(generation);
                let (_, $storage) = $self.cell.instance().await?;
                $call
            }
            other => other,
        }
    }};
}

/// Table decorator that swaps in a freshly built client when the service
/// answers 403, typically because the credentials were rotated.
///
/// Streaming reads (`get_data_by_chunks`, `scan_data`, `execute`) are rerun
/// only if the 403 arrived before the first chunk reached the consumer.
pub struct ReconnectingTableStorage<T: TableEntity> {
    name: String,
    cell: ReloadingCell<dyn TableStorage<T>>,
}

impl<T: TableEntity> ReconnectingTableStorage<T> {
    /// The factory is not called until the first operation
    pub fn new(name: impl Into<String>, factory: ClientFactory<dyn TableStorage<T>>) -> Self {
        Self {
            name: name.into(),
            cell: ReloadingCell::new("table", factory),
        }
    }

    pub fn generation(&self) -> u64 {
        self.cell.generation()
    }
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for ReconnectingTableStorage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, item: &T) -> Result<()> {
        reconnecting!(self, |storage| storage.insert(item).await)
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        reconnecting!(self, |storage| storage.insert_batch(items).await)
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        reconnecting!(self, |storage| storage.insert_or_merge(item).await)
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        reconnecting!(self, |storage| storage.insert_or_merge_batch(items).await)
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        reconnecting!(self, |storage| storage.insert_or_replace(item).await)
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        reconnecting!(self, |storage| storage.insert_or_replace_batch(items).await)
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage
            .replace(partition_key, row_key, update)
            .await)
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage
            .merge(partition_key, row_key, update)
            .await)
    }

    async fn delete(&self, item: &T) -> Result<()> {
        reconnecting!(self, |storage| storage.delete(item).await)
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage
            .delete_by_key(partition_key, row_key)
            .await)
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        reconnecting!(self, |storage| storage
            .delete_if_exists(partition_key, row_key)
            .await)
    }

    async fn delete_table(&self) -> Result<bool> {
        reconnecting!(self, |storage| storage.delete_table().await)
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        reconnecting!(self, |storage| storage.delete_batch(items).await)
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        reconnecting!(self, |storage| storage.create_if_not_exists(item).await)
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        reconnecting!(self, |storage| storage.record_exists(item).await)
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage.get(partition_key, row_key).await)
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage.get_all(filter).await)
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage
            .get_partition(partition_key, filter)
            .await)
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage
            .get_by_row_keys(partition_key, row_keys, filter)
            .await)
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage
            .get_by_partition_keys(partition_keys, filter)
            .await)
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage.get_by_keys(keys, filter).await)
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage.get_top_record(partition_key).await)
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage
            .get_top_records(partition_key, count)
            .await)
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        let delivered = AtomicBool::new(false);
        let mut tracked = |chunk: Vec<T>| {
            delivered.store(true, Ordering::SeqCst);
            sink(chunk)
        };
        reconnecting_stream!(self, delivered, |storage| storage
            .get_data_by_chunks(query, &mut tracked)
            .await)
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        let delivered = AtomicBool::new(false);
        let tracked = |chunk: Vec<T>| {
            delivered.store(true, Ordering::SeqCst);
            handler(chunk)
        };
        reconnecting_stream!(self, delivered, |storage| storage
            .scan_data(query, &tracked)
            .await)
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        reconnecting!(self, |storage| storage
            .first_or_none_via_scan(partition_key, search)
            .await)
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage.get_row_keys_only(row_keys).await)
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage.where_query(query, filter).await)
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        reconnecting!(self, |storage| storage.where_query_async(query, filter).await)
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        let delivered = AtomicBool::new(false);
        let mut tracked = |chunk: Vec<T>| {
            delivered.store(true, Ordering::SeqCst);
            sink(chunk)
        };
        reconnecting_stream!(self, delivered, |storage| storage
            .execute(query, &mut tracked, stop)
            .await)
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        reconnecting!(self, |storage| storage.do_batch(batch.clone()).await)
    }

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>> {
        reconnecting!(self, |storage| storage
            .execute_query_with_pagination(query, paging.clone())
            .await)
    }
}
