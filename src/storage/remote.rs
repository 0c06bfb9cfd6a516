//! Remote table client
//!
//! Implements the storage contract over a [`TableTransport`]. The table is
//! created lazily on first use; every transport call is bounded by the
//! configured maximum execution time.

use super::{
    apply_filter, AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter,
    EntityUpdate, StopCondition, TableStorage,
};
use crate::batch::{TableBatch, TableOperation};
use crate::config::StorageConfig;
use crate::entity::{self, EntityMetadata, TableEntity, TableRow};
use crate::error::{Error, Result};
use crate::paging::{ContinuationToken, PagedResult, PagingInfo};
use crate::query::{self, Filter, QueryComparison, TableQuery};
use crate::transport::{QuerySegment, TableTransport};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Storage contract over the remote service
pub struct RemoteTableStorage<T> {
    table: String,
    transport: Arc<dyn TableTransport>,
    metadata: Arc<EntityMetadata<T>>,
    max_execution_time: Duration,
    batch_limit: usize,
    piece_size: usize,
    table_created: AtomicBool,
}

impl<T: TableEntity> RemoteTableStorage<T> {
    pub fn new(
        transport: Arc<dyn TableTransport>,
        table: impl Into<String>,
        config: &StorageConfig,
    ) -> Result<Self> {
        Ok(Self {
            table: table.into(),
            transport,
            metadata: entity::describe::<T>()?,
            max_execution_time: config.max_execution_time(),
            batch_limit: config.batch_limit,
            piece_size: config.piece_size.max(1),
            table_created: AtomicBool::new(false),
        })
    }

    /// Client with default settings
    pub fn with_defaults(transport: Arc<dyn TableTransport>, table: impl Into<String>) -> Result<Self> {
        Self::new(transport, table, &StorageConfig::default())
    }

    /// Bound a transport call by the maximum execution time
    async fn call<R, F>(&self, fut: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        tokio::time::timeout(self.max_execution_time, fut)
            .await
            .map_err(|_| Error::Timeout(self.max_execution_time))?
    }

    /// Table name, creating the table on first use
    async fn table(&self) -> Result<&str> {
        if !self.table_created.load(Ordering::Acquire) {
            let created = self
                .call(self.transport.create_table_if_not_exists(&self.table))
                .await?;
            self.table_created.store(true, Ordering::Release);
            if created {
                info!(table = %self.table, "Created table");
            }
        }
        Ok(&self.table)
    }

    async fn execute_op(&self, operation: TableOperation) -> Result<Option<TableRow>> {
        let table = self.table().await?;
        self.call(self.transport.execute(table, operation)).await
    }

    async fn retrieve(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow>> {
        self.execute_op(TableOperation::retrieve(partition_key, row_key))
            .await
    }

    async fn segment(
        &self,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QuerySegment> {
        let table = self.table().await?;
        self.call(self.transport.query_segment(table, query, continuation))
            .await
    }

    /// Follow continuations, handing each segment to `on_rows` until it
    /// returns `false` or the query is exhausted
    async fn for_each_segment<F>(&self, query: &TableQuery, mut on_rows: F) -> Result<()>
    where
        F: FnMut(Vec<TableRow>) -> Result<bool> + Send,
    {
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let segment = self.segment(query, continuation.as_ref()).await?;
            if !on_rows(segment.rows)? {
                return Ok(());
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// All rows matching `query`, honoring `take`
    async fn collect_rows(&self, query: &TableQuery) -> Result<Vec<TableRow>> {
        let mut rows = Vec::new();
        let take = query.take;
        self.for_each_segment(query, |segment| {
            rows.extend(segment);
            Ok(take.map_or(true, |take| rows.len() < take))
        })
        .await?;
        if let Some(take) = take {
            rows.truncate(take);
        }
        Ok(rows)
    }

    fn to_entities(&self, rows: &[TableRow]) -> Result<Vec<T>> {
        self.metadata.from_rows(rows)
    }

    async fn query_entities(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let rows = self.collect_rows(query).await?;
        Ok(apply_filter(self.to_entities(&rows)?, filter))
    }

    /// Issue one query per filter concurrently and concatenate the results
    async fn scatter_gather(
        &self,
        filters: Vec<Filter>,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let pieces = filters.into_iter().map(|piece| {
            let query = TableQuery::filtered(piece);
            async move { self.collect_rows(&query).await }
        });
        let rows: Vec<TableRow> = try_join_all(pieces).await?.into_iter().flatten().collect();
        Ok(apply_filter(self.to_entities(&rows)?, filter))
    }

    /// Run operations grouped per partition in chunks; stop at the first failure
    async fn run_batch(&self, batch: TableBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let table = self.table().await?;
        for mut chunk in batch.into_chunks(self.batch_limit) {
            let operations = std::mem::take(&mut chunk.operations);
            debug!(
                table = %table,
                partition = %chunk.partition_key,
                chunk = chunk.index,
                operations = operations.len(),
                "Executing batch chunk"
            );
            self.call(self.transport.execute_batch(table, operations))
                .await
                .map_err(|e| chunk.failed(e))?;
        }
        Ok(())
    }

    fn batch_of(&self, items: &[T], op: fn(TableRow) -> TableOperation) -> Result<TableBatch> {
        items
            .iter()
            .map(|item| self.metadata.to_row(item).map(op))
            .collect()
    }

    /// Optimistic read-transform-write loop; a 412 means the row changed
    /// underneath us and the whole cycle starts over
    async fn update_loop(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
        write: fn(TableRow) -> TableOperation,
    ) -> Result<Option<T>> {
        loop {
            let Some(stored) = self.retrieve(partition_key, row_key).await? else {
                return Ok(None);
            };
            let current = self.metadata.from_row(&stored)?;
            let Some(updated) = update(current) else {
                return Ok(None);
            };

            let mut row = self.metadata.to_row(&updated)?;
            row.etag = stored.etag.clone();
            match self.execute_op(write(row)).await {
                Ok(_) => return Ok(Some(updated)),
                Err(e) if e.is_precondition_failed() => {
                    debug!(
                        table = %self.table,
                        partition_key,
                        row_key,
                        "Concurrent modification, repeating update"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pieces of at most `piece_size` elements
    fn pieces<'a, S>(&self, items: &'a [S]) -> impl Iterator<Item = &'a [S]> {
        items.chunks(self.piece_size)
    }
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for RemoteTableStorage<T> {
    fn name(&self) -> &str {
        &self.table
    }

    async fn insert(&self, item: &T) -> Result<()> {
        let row = self.metadata.to_row(item)?;
        self.execute_op(TableOperation::Insert(row)).await?;
        Ok(())
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        let batch = self.batch_of(items, TableOperation::Insert)?;
        self.run_batch(batch).await
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        let row = self.metadata.to_row(item)?;
        self.execute_op(TableOperation::InsertOrMerge(row)).await?;
        Ok(())
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        let batch = self.batch_of(items, TableOperation::InsertOrMerge)?;
        self.run_batch(batch).await
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        let row = self.metadata.to_row(item)?;
        self.execute_op(TableOperation::InsertOrReplace(row)).await?;
        Ok(())
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        let batch = self.batch_of(items, TableOperation::InsertOrReplace)?;
        self.run_batch(batch).await
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.update_loop(partition_key, row_key, update, TableOperation::Replace)
            .await
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.update_loop(partition_key, row_key, update, TableOperation::Merge)
            .await
    }

    async fn delete(&self, item: &T) -> Result<()> {
        let row = self.metadata.to_row(item)?;
        self.execute_op(TableOperation::Delete(row)).await?;
        Ok(())
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        let Some(stored) = self.retrieve(partition_key, row_key).await? else {
            return Ok(None);
        };
        let entity = self.metadata.from_row(&stored)?;
        self.execute_op(TableOperation::Delete(TableRow::new(partition_key, row_key)))
            .await?;
        Ok(Some(entity))
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        match self.delete_by_key(partition_key, row_key).await {
            Ok(removed) => Ok(removed.is_some()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_table(&self) -> Result<bool> {
        let deleted = match self
            .call(self.transport.delete_table_if_exists(&self.table))
            .await
        {
            Ok(deleted) => deleted,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        if deleted {
            self.table_created.store(false, Ordering::Release);
            info!(table = %self.table, "Deleted table");
        }
        Ok(deleted)
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        let batch = self.batch_of(items, TableOperation::Delete)?;
        self.run_batch(batch).await
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        match self.insert(item).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        let partition_key = self.metadata.partition_key_of(item)?;
        let row_key = self.metadata.row_key_of(item)?;
        Ok(self.retrieve(&partition_key, &row_key).await?.is_some())
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.retrieve(partition_key, row_key)
            .await?
            .map(|row| self.metadata.from_row(&row))
            .transpose()
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        self.query_entities(&TableQuery::new(), filter).await
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let query = TableQuery::filtered(query::partition_filter(partition_key));
        self.query_entities(&query, filter).await
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let filters = self
            .pieces(row_keys)
            .filter_map(|piece| query::row_keys_filter(partition_key, piece))
            .collect();
        self.scatter_gather(filters, filter).await
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let filters = self
            .pieces(partition_keys)
            .filter_map(query::partition_keys_filter)
            .collect();
        self.scatter_gather(filters, filter).await
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let filters = self
            .pieces(keys)
            .filter_map(query::keys_filter)
            .collect();
        self.scatter_gather(filters, filter).await
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        Ok(self.get_top_records(partition_key, 1).await?.into_iter().next())
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let query = TableQuery::filtered(query::partition_filter(partition_key)).take(count);
        self.query_entities(&query, None).await
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        self.execute(query, sink, None).await
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let segment = self.segment(query, continuation.as_ref()).await?;
            if !segment.rows.is_empty() {
                handler(self.to_entities(&segment.rows)?).await?;
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        let query = TableQuery::filtered(query::partition_filter(partition_key));
        let mut found = None;
        self.for_each_segment(&query, |rows| {
            found = search(&self.to_entities(&rows)?);
            Ok(found.is_none())
        })
        .await?;
        Ok(found)
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        let Some(filter) = Filter::any_of(
            row_keys
                .iter()
                .map(|rk| Filter::row_key(QueryComparison::Equal, rk.as_str())),
        ) else {
            return Ok(Vec::new());
        };
        let query = TableQuery::filtered(filter).select(Vec::<String>::new());
        self.query_entities(&query, None).await
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.query_entities(query, filter).await
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        let mut accepted = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let segment = self.segment(query, continuation.as_ref()).await?;
            for item in self.to_entities(&segment.rows)? {
                if filter(&item).await {
                    accepted.push(item);
                }
            }
            match segment.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(accepted),
            }
        }
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        self.for_each_segment(query, |rows| {
            if !rows.is_empty() {
                sink(self.to_entities(&rows)?);
            }
            Ok(!stop.map_or(false, |stop| stop()))
        })
        .await
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        self.run_batch(batch).await
    }

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>> {
        let start = match paging.start_token() {
            Ok(start) => start,
            Err(e) if e.is_not_found() => return Ok(PagedResult::empty(paging.exhausted())),
            Err(e) => return Err(e),
        };

        let page_query = TableQuery {
            take: paging.element_count,
            ..query.clone()
        };
        let segment = self.segment(&page_query, start.as_ref()).await?;
        if segment.rows.is_empty() {
            return Ok(PagedResult::empty(paging.exhausted()));
        }

        let items = self.to_entities(&segment.rows)?;
        Ok(PagedResult::new(items, paging.advance(segment.continuation)))
    }
}
