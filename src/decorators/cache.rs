//! Write-through cache over a whole table.
//!
//! The constructor copies every remote row into an [`InMemoryTable`] mirror.
//! Writes go to the remote table first and reach the mirror only after the
//! remote call succeeded. Reads are answered from the mirror alone.

use crate::batch::TableBatch;
use crate::entity::TableEntity;
use crate::error::Result;
use crate::paging::{PagedResult, PagingInfo};
use crate::query::TableQuery;
use crate::storage::{
    AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter, EntityUpdate,
    InMemoryTable, StopCondition, TableStorage,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub rows: usize,
}

pub struct CachedTableStorage<T: TableEntity> {
    inner: Arc<dyn TableStorage<T>>,
    mirror: InMemoryTable<T>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<T: TableEntity> CachedTableStorage<T> {
    /// Wrap `inner`, loading all of its rows into the mirror
    #[instrument(skip(inner), fields(table = %inner.name()))]
    pub async fn new(inner: Arc<dyn TableStorage<T>>) -> Result<Self> {
        let mirror = InMemoryTable::new(inner.name())?;
        let rows = inner.get_all(None).await?;
        mirror.insert_or_replace_batch(&rows).await?;
        debug!(rows = rows.len(), "Loaded cache mirror");
        crate::stats::set_cache_rows(inner.name(), rows.len());

        Ok(Self {
            inner,
            mirror,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            rows: self.mirror.len().await,
        }
    }

    fn read(&self) -> &InMemoryTable<T> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        &self.mirror
    }

    async fn written(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        crate::stats::set_cache_rows(self.inner.name(), self.mirror.len().await);
    }

    /// Drop `item` from the mirror; a row the mirror never saw is fine
    async fn evict(&self, item: &T) -> Result<()> {
        match self.mirror.delete(item).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for CachedTableStorage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn insert(&self, item: &T) -> Result<()> {
        self.inner.insert(item).await?;
        self.mirror.insert_or_replace(item).await?;
        self.written().await;
        Ok(())
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        self.inner.insert_batch(items).await?;
        self.mirror.insert_or_replace_batch(items).await?;
        self.written().await;
        Ok(())
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        self.inner.insert_or_merge(item).await?;
        self.mirror.insert_or_merge(item).await?;
        self.written().await;
        Ok(())
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        self.inner.insert_or_merge_batch(items).await?;
        self.mirror.insert_or_merge_batch(items).await?;
        self.written().await;
        Ok(())
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        self.inner.insert_or_replace(item).await?;
        self.mirror.insert_or_replace(item).await?;
        self.written().await;
        Ok(())
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        self.inner.insert_or_replace_batch(items).await?;
        self.mirror.insert_or_replace_batch(items).await?;
        self.written().await;
        Ok(())
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        let result = self.inner.replace(partition_key, row_key, update).await?;
        if let Some(entity) = &result {
            self.mirror.insert_or_replace(entity).await?;
            self.written().await;
        }
        Ok(result)
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        let result = self.inner.merge(partition_key, row_key, update).await?;
        if let Some(entity) = &result {
            self.mirror.insert_or_merge(entity).await?;
            self.written().await;
        }
        Ok(result)
    }

    async fn delete(&self, item: &T) -> Result<()> {
        self.inner.delete(item).await?;
        self.evict(item).await?;
        self.written().await;
        Ok(())
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        let removed = self.inner.delete_by_key(partition_key, row_key).await?;
        self.mirror.delete_if_exists(partition_key, row_key).await?;
        self.written().await;
        Ok(removed)
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        let existed = self.inner.delete_if_exists(partition_key, row_key).await?;
        self.mirror.delete_if_exists(partition_key, row_key).await?;
        self.written().await;
        Ok(existed)
    }

    async fn delete_table(&self) -> Result<bool> {
        let existed = self.inner.delete_table().await?;
        self.mirror.delete_table().await?;
        self.written().await;
        Ok(existed)
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        self.inner.delete_batch(items).await?;
        for item in items {
            self.evict(item).await?;
        }
        self.written().await;
        Ok(())
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        let created = self.inner.create_if_not_exists(item).await?;
        if created {
            self.mirror.insert_or_replace(item).await?;
            self.written().await;
        }
        Ok(created)
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        self.read().record_exists(item).await
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.read().get(partition_key, row_key).await
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        self.read().get_all(filter).await
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.read().get_partition(partition_key, filter).await
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.read()
            .get_by_row_keys(partition_key, row_keys, filter)
            .await
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.read().get_by_partition_keys(partition_keys, filter).await
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.read().get_by_keys(keys, filter).await
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        self.read().get_top_record(partition_key).await
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        self.read().get_top_records(partition_key, count).await
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        self.read().get_data_by_chunks(query, sink).await
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        self.read().scan_data(query, handler).await
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        self.read().first_or_none_via_scan(partition_key, search).await
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        self.read().get_row_keys_only(row_keys).await
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.read().where_query(query, filter).await
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        self.read().where_query_async(query, filter).await
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        self.read().execute(query, sink, stop).await
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        self.inner.do_batch(batch.clone()).await?;
        self.mirror.do_batch(batch).await?;
        self.written().await;
        Ok(())
    }

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>> {
        self.read()
            .execute_query_with_pagination(query, paging)
            .await
    }
}
