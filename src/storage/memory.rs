//! In-memory table
//!
//! Full implementation of the storage contract over a process-local partition
//! map. Used on its own in tests and as the mirror behind the cache decorator.
//! One table-wide `RwLock`: writers are exclusive, readers share.

use super::{
    apply_filter, AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter,
    EntityUpdate, StopCondition, TableStorage,
};
use crate::batch::{TableBatch, TableOperation};
use crate::entity::{self, EntityMetadata, TableEntity, TableRow};
use crate::error::{Error, Result};
use crate::paging::{ContinuationToken, PagedResult, PagingInfo};
use crate::query::{ConjunctiveQuery, TableQuery};
use crate::transport::DEFAULT_SEGMENT_SIZE;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;

type Partitions = BTreeMap<String, BTreeMap<String, TableRow>>;

/// Process-local table of `T`
pub struct InMemoryTable<T> {
    name: String,
    partitions: RwLock<Partitions>,
    metadata: Arc<EntityMetadata<T>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: TableEntity> InMemoryTable<T> {
    /// Create an empty table. Fails if `T` has an invalid registration.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            partitions: RwLock::new(Partitions::new()),
            metadata: entity::describe::<T>()?,
            _entity: PhantomData,
        })
    }

    /// Number of rows stored
    pub async fn len(&self) -> usize {
        self.partitions.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.partitions.read().await.values().all(BTreeMap::is_empty)
    }

    /// Replace all contents with `rows`
    pub async fn load_rows(&self, rows: impl IntoIterator<Item = TableRow>) {
        let mut partitions = Partitions::new();
        for row in rows {
            partitions
                .entry(row.partition_key.clone())
                .or_default()
                .insert(row.row_key.clone(), row.stored());
        }
        *self.partitions.write().await = partitions;
    }

    fn to_row(&self, item: &T) -> Result<TableRow> {
        let mut row = self.metadata.to_row(item)?;
        row.timestamp = Some(Utc::now());
        Ok(row)
    }

    fn to_entities(&self, rows: Vec<TableRow>) -> Result<Vec<T>> {
        self.metadata.from_rows(&rows)
    }

    fn conflict(&self, row: &TableRow) -> Error {
        Error::Conflict(format!(
            "row {}/{} already exists in {}",
            row.partition_key, row.row_key, self.name
        ))
    }

    fn not_found(&self, partition_key: &str, row_key: &str) -> Error {
        Error::NotFound(format!(
            "row {}/{} does not exist in {}",
            partition_key, row_key, self.name
        ))
    }

    /// Matching rows in key order, cloned out of the lock
    async fn select_rows(&self, query: &TableQuery) -> Result<Vec<TableRow>> {
        let conjunction = match &query.filter {
            Some(filter) => ConjunctiveQuery::from_filter(filter)?,
            None => ConjunctiveQuery::all(),
        };

        let partitions = self.partitions.read().await;
        let candidates: Box<dyn Iterator<Item = &TableRow>> = match conjunction.partition() {
            Some(pk) => match partitions.get(pk) {
                Some(rows) => Box::new(rows.values()),
                None => Box::new(std::iter::empty()),
            },
            None => Box::new(partitions.values().flat_map(BTreeMap::values)),
        };

        let selected = candidates.filter(|row| conjunction.matches(row)).cloned();
        Ok(match query.take {
            Some(take) => selected.take(take).collect(),
            None => selected.collect(),
        })
    }

    async fn partition_rows(&self, partition_key: &str) -> Vec<TableRow> {
        self.partitions
            .read()
            .await
            .get(partition_key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn apply_operation(&self, partitions: &mut Partitions, operation: TableOperation) -> Result<()> {
        match operation {
            TableOperation::Retrieve { .. } => Ok(()),
            TableOperation::Insert(row) => {
                let rows = partitions.entry(row.partition_key.clone()).or_default();
                if rows.contains_key(&row.row_key) {
                    return Err(self.conflict(&row));
                }
                rows.insert(row.row_key.clone(), row.stored());
                Ok(())
            }
            TableOperation::InsertOrReplace(row) => {
                partitions
                    .entry(row.partition_key.clone())
                    .or_default()
                    .insert(row.row_key.clone(), row.stored());
                Ok(())
            }
            TableOperation::InsertOrMerge(row) => {
                let rows = partitions.entry(row.partition_key.clone()).or_default();
                match rows.get_mut(&row.row_key) {
                    Some(existing) => existing.merge_from(&row),
                    None => {
                        rows.insert(row.row_key.clone(), row.stored());
                    }
                }
                Ok(())
            }
            TableOperation::Replace(row) | TableOperation::Merge(row)
                if !Self::contains(partitions, &row.partition_key, &row.row_key) =>
            {
                Err(self.not_found(&row.partition_key, &row.row_key))
            }
            TableOperation::Replace(row) => {
                if let Some(existing) = Self::row_mut(partitions, &row.partition_key, &row.row_key) {
                    existing.replace_with(&row);
                }
                Ok(())
            }
            TableOperation::Merge(row) => {
                if let Some(existing) = Self::row_mut(partitions, &row.partition_key, &row.row_key) {
                    existing.merge_from(&row);
                }
                Ok(())
            }
            TableOperation::Delete(row) => {
                if Self::remove(partitions, &row.partition_key, &row.row_key).is_none() {
                    return Err(self.not_found(&row.partition_key, &row.row_key));
                }
                Ok(())
            }
        }
    }

    fn contains(partitions: &Partitions, partition_key: &str, row_key: &str) -> bool {
        partitions
            .get(partition_key)
            .map_or(false, |rows| rows.contains_key(row_key))
    }

    fn row_mut<'a>(
        partitions: &'a mut Partitions,
        partition_key: &str,
        row_key: &str,
    ) -> Option<&'a mut TableRow> {
        partitions.get_mut(partition_key)?.get_mut(row_key)
    }

    fn remove(partitions: &mut Partitions, partition_key: &str, row_key: &str) -> Option<TableRow> {
        let rows = partitions.get_mut(partition_key)?;
        let removed = rows.remove(row_key);
        if rows.is_empty() {
            partitions.remove(partition_key);
        }
        removed
    }

    /// Apply `update` to the stored entity under the write lock
    async fn update_with(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
        missing: Option<Error>,
        apply: fn(&mut TableRow, &TableRow),
    ) -> Result<Option<T>> {
        let mut partitions = self.partitions.write().await;
        let Some(existing) = Self::row_mut(&mut partitions, partition_key, row_key) else {
            return match missing {
                Some(err) => Err(err),
                None => Ok(None),
            };
        };

        let current = self.metadata.from_row(existing)?;
        let Some(updated) = update(current) else {
            return Ok(None);
        };

        let row = self.to_row(&updated)?;
        if row.partition_key != partition_key || row.row_key != row_key {
            return Err(Error::BadRequest(format!(
                "update moved row {}/{} to {}/{}",
                partition_key, row_key, row.partition_key, row.row_key
            )));
        }
        apply(existing, &row);
        Ok(Some(updated))
    }

    fn write_rows(&self, items: &[T], op: fn(TableRow) -> TableOperation) -> Result<Vec<TableOperation>> {
        items
            .iter()
            .map(|item| self.to_row(item).map(op))
            .collect()
    }

    /// Apply all operations or none
    async fn apply_atomically(&self, operations: Vec<TableOperation>) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let mut staged = partitions.clone();
        for operation in operations {
            self.apply_operation(&mut staged, operation)?;
        }
        *partitions = staged;
        Ok(())
    }

    async fn stream(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        let rows = self.select_rows(query).await?;
        for chunk in rows.chunks(DEFAULT_SEGMENT_SIZE) {
            sink(self.to_entities(chunk.to_vec())?);
            if stop.map_or(false, |stop| stop()) {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for InMemoryTable<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, item: &T) -> Result<()> {
        let row = self.to_row(item)?;
        let mut partitions = self.partitions.write().await;
        self.apply_operation(&mut partitions, TableOperation::Insert(row))
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        let operations = self.write_rows(items, TableOperation::Insert)?;
        self.apply_atomically(operations).await
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        let row = self.to_row(item)?;
        let mut partitions = self.partitions.write().await;
        self.apply_operation(&mut partitions, TableOperation::InsertOrMerge(row))
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        let operations = self.write_rows(items, TableOperation::InsertOrMerge)?;
        self.apply_atomically(operations).await
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        let row = self.to_row(item)?;
        let mut partitions = self.partitions.write().await;
        self.apply_operation(&mut partitions, TableOperation::InsertOrReplace(row))
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        let operations = self.write_rows(items, TableOperation::InsertOrReplace)?;
        self.apply_atomically(operations).await
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.update_with(partition_key, row_key, update, None, TableRow::replace_with)
            .await
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        let missing = self.not_found(partition_key, row_key);
        self.update_with(partition_key, row_key, update, Some(missing), TableRow::merge_from)
            .await
    }

    async fn delete(&self, item: &T) -> Result<()> {
        let row = self.metadata.to_row(item)?;
        let mut partitions = self.partitions.write().await;
        self.apply_operation(&mut partitions, TableOperation::Delete(row))
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        let removed = {
            let mut partitions = self.partitions.write().await;
            Self::remove(&mut partitions, partition_key, row_key)
        };
        removed.map(|row| self.metadata.from_row(&row)).transpose()
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        Ok(Self::remove(&mut partitions, partition_key, row_key).is_some())
    }

    async fn delete_table(&self) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        let existed = !partitions.is_empty();
        partitions.clear();
        Ok(existed)
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        let operations = items
            .iter()
            .map(|item| self.metadata.to_row(item).map(TableOperation::Delete))
            .collect::<Result<Vec<_>>>()?;
        self.apply_atomically(operations).await
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        let row = self.to_row(item)?;
        let mut partitions = self.partitions.write().await;
        let rows = partitions.entry(row.partition_key.clone()).or_default();
        if rows.contains_key(&row.row_key) {
            return Ok(false);
        }
        rows.insert(row.row_key.clone(), row.stored());
        Ok(true)
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        let partition_key = self.metadata.partition_key_of(item)?;
        let row_key = self.metadata.row_key_of(item)?;
        let partitions = self.partitions.read().await;
        Ok(Self::contains(&partitions, &partition_key, &row_key))
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        let row = {
            let partitions = self.partitions.read().await;
            partitions
                .get(partition_key)
                .and_then(|rows| rows.get(row_key))
                .cloned()
        };
        row.map(|row| self.metadata.from_row(&row)).transpose()
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        let rows = self.select_rows(&TableQuery::new()).await?;
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let rows = self.partition_rows(partition_key).await;
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let wanted: HashSet<&str> = row_keys.iter().map(String::as_str).collect();
        let rows = self
            .partition_rows(partition_key)
            .await
            .into_iter()
            .filter(|row| wanted.contains(row.row_key.as_str()))
            .collect();
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let wanted: HashSet<&str> = partition_keys.iter().map(String::as_str).collect();
        let rows = {
            let partitions = self.partitions.read().await;
            partitions
                .iter()
                .filter(|(pk, _)| wanted.contains(pk.as_str()))
                .flat_map(|(_, rows)| rows.values().cloned())
                .collect()
        };
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let rows = {
            let partitions = self.partitions.read().await;
            keys.iter()
                .filter_map(|(pk, rk)| partitions.get(pk).and_then(|rows| rows.get(rk)).cloned())
                .collect()
        };
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        Ok(self.get_top_records(partition_key, 1).await?.pop())
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        let rows = {
            let partitions = self.partitions.read().await;
            partitions
                .get(partition_key)
                .map(|rows| rows.values().take(count).cloned().collect())
                .unwrap_or_default()
        };
        self.to_entities(rows)
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        self.stream(query, sink, None).await
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        let rows = self.select_rows(query).await?;
        for chunk in rows.chunks(DEFAULT_SEGMENT_SIZE) {
            handler(self.to_entities(chunk.to_vec())?).await?;
        }
        Ok(())
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        let rows = self.partition_rows(partition_key).await;
        for chunk in rows.chunks(DEFAULT_SEGMENT_SIZE) {
            let entities = self.to_entities(chunk.to_vec())?;
            if let Some(found) = search(&entities) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        let wanted: HashSet<&str> = row_keys.iter().map(String::as_str).collect();
        let rows = {
            let partitions = self.partitions.read().await;
            partitions
                .values()
                .flat_map(BTreeMap::values)
                .filter(|row| wanted.contains(row.row_key.as_str()))
                .map(|row| TableRow::new(row.partition_key.clone(), row.row_key.clone()))
                .collect()
        };
        self.to_entities(rows)
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        let rows = self.select_rows(query).await?;
        Ok(apply_filter(self.to_entities(rows)?, filter))
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        let rows = self.select_rows(query).await?;
        let mut accepted = Vec::new();
        for item in self.to_entities(rows)? {
            if filter(&item).await {
                accepted.push(item);
            }
        }
        Ok(accepted)
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        self.stream(query, sink, stop).await
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        for operation in batch.into_operations() {
            self.apply_operation(&mut partitions, operation)?;
        }
        Ok(())
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

        let unbounded = TableQuery {
            take: None,
            ..query.clone()
        };
        let rows = self.select_rows(&unbounded).await?;

        let skip = match &start {
            Some(token) => rows
                .iter()
                .take_while(|row| {
                    (row.partition_key.as_str(), row.row_key.as_str())
                        < (token.next_partition_key.as_str(), token.next_row_key.as_str())
                })
                .count(),
            None => 0,
        };
        let page_size = paging.element_count.unwrap_or(usize::MAX);
        let mut remaining = rows.into_iter().skip(skip);
        let page: Vec<TableRow> = remaining.by_ref().take(page_size).collect();
        if page.is_empty() {
            return Ok(PagedResult::empty(paging.exhausted()));
        }

        let next = remaining
            .next()
            .map(|row| ContinuationToken::at(row.partition_key, row.row_key));
        Ok(PagedResult::new(
            self.to_entities(page)?,
            paging.advance(next),
        ))
    }
}
