//! Table storage contract and its two backends.
//!
//! [`TableStorage`] is the wide contract every backend and decorator
//! implements. [`InMemoryTable`] keeps rows in process; [`RemoteTableStorage`]
//! talks to the remote service through a [`crate::transport::TableTransport`].

mod memory;
mod remote;

pub use memory::InMemoryTable;
pub use remote::RemoteTableStorage;

use crate::batch::TableBatch;
use crate::entity::TableEntity;
use crate::error::Result;
use crate::paging::{PagedResult, PagingInfo};
use crate::query::TableQuery;
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Client-side row predicate
pub type EntityFilter<T> = dyn Fn(&T) -> bool + Send + Sync;

/// Asynchronous client-side row predicate
pub type AsyncEntityFilter<T> = dyn Fn(&T) -> BoxFuture<'static, bool> + Send + Sync;

/// Replace/merge transform. Receives the stored entity, returns the entity to
/// write or `None` to leave the row untouched.
pub type EntityUpdate<T> = dyn Fn(T) -> Option<T> + Send + Sync;

/// Synchronous per-chunk consumer
pub type ChunkSink<'a, T> = dyn FnMut(Vec<T>) + Send + 'a;

/// Asynchronous per-chunk consumer
pub type AsyncChunkHandler<'a, T> = dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'a;

/// Per-chunk search used by [`TableStorage::first_or_none_via_scan`]
pub type ChunkSearch<T> = dyn Fn(&[T]) -> Option<T> + Send + Sync;

/// Returns `true` to end a running scan
pub type StopCondition = dyn Fn() -> bool + Send + Sync;

/// Storage contract for entities of type `T`
#[async_trait]
pub trait TableStorage<T: TableEntity>: Send + Sync {
    /// Table name
    fn name(&self) -> &str;

    /// Add a new row; `Conflict` if it already exists
    async fn insert(&self, item: &T) -> Result<()>;

    async fn insert_batch(&self, items: &[T]) -> Result<()>;

    /// Add the row or overlay its properties onto the stored one
    async fn insert_or_merge(&self, item: &T) -> Result<()>;

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()>;

    /// Add the row or replace the stored one entirely
    async fn insert_or_replace(&self, item: &T) -> Result<()>;

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()>;

    /// Read-transform-replace. `None` when the row is absent or the transform
    /// declined.
    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>>;

    /// Read-transform-merge. `None` when the transform declined. An absent row
    /// yields `None` from the remote client and `NotFound` from the in-memory
    /// table.
    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>>;

    /// Delete a row; `NotFound` if it is absent
    async fn delete(&self, item: &T) -> Result<()>;

    /// Delete by key, returning the removed entity
    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>>;

    /// `false` when the row did not exist
    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool>;

    /// Drop the whole table; `false` when there was nothing to drop
    async fn delete_table(&self) -> Result<bool>;

    async fn delete_batch(&self, items: &[T]) -> Result<()>;

    /// `true` if created, `false` if the row existed before
    async fn create_if_not_exists(&self, item: &T) -> Result<bool>;

    async fn record_exists(&self, item: &T) -> Result<bool>;

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>>;

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>>;

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>>;

    /// Rows of one partition, queried in pieces
    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>>;

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>>;

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>>;

    /// First row of a partition in key order
    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>>;

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>>;

    /// Stream query results to `sink` segment by segment
    async fn get_data_by_chunks(&self, query: &TableQuery, sink: &mut ChunkSink<'_, T>)
        -> Result<()>;

    /// Like [`get_data_by_chunks`](Self::get_data_by_chunks) with an async handler;
    /// a handler error ends the scan
    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()>;

    /// Scan a partition until `search` finds something
    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>>;

    /// Rows with the given row keys in any partition, keys only
    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>>;

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>>;

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>>;

    /// Stream query results to `sink`, checking `stop` after each segment
    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()>;

    /// Run a mixed batch, grouped per partition
    async fn do_batch(&self, batch: TableBatch) -> Result<()>;

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>>;
}

/// Keep the items accepted by `filter`
pub(crate) fn apply_filter<T>(items: Vec<T>, filter: Option<&EntityFilter<T>>) -> Vec<T> {
    match filter {
        Some(filter) => items.into_iter().filter(|item| filter(item)).collect(),
        None => items,
    }
}
