//! Log failed table operations with their call context.

use crate::batch::TableBatch;
use crate::entity::{self, EntityMetadata, TableEntity};
use crate::error::{Error, Result};
use crate::paging::{PagedResult, PagingInfo};
use crate::query::TableQuery;
use crate::storage::{
    AsyncChunkHandler, AsyncEntityFilter, ChunkSearch, ChunkSink, EntityFilter, EntityUpdate,
    StopCondition, TableStorage,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, warn};

/// Logs every failure and hands the error back untouched. Timeouts and
/// cancellations are logged at `warn`, everything else at `error`.
pub struct LoggingTableStorage<T: TableEntity> {
    inner: Arc<dyn TableStorage<T>>,
    metadata: Arc<EntityMetadata<T>>,
}

impl<T: TableEntity> LoggingTableStorage<T> {
    pub fn new(inner: Arc<dyn TableStorage<T>>) -> Result<Self> {
        Ok(Self {
            inner,
            metadata: entity::describe::<T>()?,
        })
    }

    async fn logged<R, F, C>(&self, operation: &'static str, context: C, call: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
        C: FnOnce() -> Value,
    {
        call.await.map_err(|e| {
            self.report(operation, context(), &e);
            e
        })
    }

    fn report(&self, operation: &'static str, context: Value, e: &Error) {
        let table = self.inner.name();
        if e.is_cancellation() {
            warn!(table, operation, context = %context, error = %e, "Table operation cancelled");
        } else {
            error!(table, operation, context = %context, error = %e, "Table operation failed");
        }
    }

    fn entity(&self, item: &T) -> Value {
        match self.metadata.to_row(item) {
            Ok(row) => serde_json::to_value(row)
                .unwrap_or_else(|e| json!({ "dump_error": e.to_string() })),
            Err(e) => json!({ "dump_error": e.to_string() }),
        }
    }

    fn entities(&self, items: &[T]) -> Value {
        Value::Array(items.iter().map(|item| self.entity(item)).collect())
    }
}

fn key_context(partition_key: &str, row_key: &str) -> Value {
    json!({ "partition_key": partition_key, "row_key": row_key })
}

fn query_context(query: &TableQuery) -> Value {
    json!({ "query": query.to_string() })
}

#[async_trait]
impl<T: TableEntity> TableStorage<T> for LoggingTableStorage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn insert(&self, item: &T) -> Result<()> {
        self.logged("insert", || self.entity(item), self.inner.insert(item))
            .await
    }

    async fn insert_batch(&self, items: &[T]) -> Result<()> {
        self.logged(
            "insert_batch",
            || self.entities(items),
            self.inner.insert_batch(items),
        )
        .await
    }

    async fn insert_or_merge(&self, item: &T) -> Result<()> {
        self.logged(
            "insert_or_merge",
            || self.entity(item),
            self.inner.insert_or_merge(item),
        )
        .await
    }

    async fn insert_or_merge_batch(&self, items: &[T]) -> Result<()> {
        self.logged(
            "insert_or_merge_batch",
            || self.entities(items),
            self.inner.insert_or_merge_batch(items),
        )
        .await
    }

    async fn insert_or_replace(&self, item: &T) -> Result<()> {
        self.logged(
            "insert_or_replace",
            || self.entity(item),
            self.inner.insert_or_replace(item),
        )
        .await
    }

    async fn insert_or_replace_batch(&self, items: &[T]) -> Result<()> {
        self.logged(
            "insert_or_replace_batch",
            || self.entities(items),
            self.inner.insert_or_replace_batch(items),
        )
        .await
    }

    async fn replace(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.logged(
            "replace",
            || key_context(partition_key, row_key),
            self.inner.replace(partition_key, row_key, update),
        )
        .await
    }

    async fn merge(
        &self,
        partition_key: &str,
        row_key: &str,
        update: &EntityUpdate<T>,
    ) -> Result<Option<T>> {
        self.logged(
            "merge",
            || key_context(partition_key, row_key),
            self.inner.merge(partition_key, row_key, update),
        )
        .await
    }

    async fn delete(&self, item: &T) -> Result<()> {
        self.logged("delete", || self.entity(item), self.inner.delete(item))
            .await
    }

    async fn delete_by_key(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.logged(
            "delete_by_key",
            || key_context(partition_key, row_key),
            self.inner.delete_by_key(partition_key, row_key),
        )
        .await
    }

    async fn delete_if_exists(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        self.logged(
            "delete_if_exists",
            || key_context(partition_key, row_key),
            self.inner.delete_if_exists(partition_key, row_key),
        )
        .await
    }

    async fn delete_table(&self) -> Result<bool> {
        self.logged("delete_table", || Value::Null, self.inner.delete_table())
            .await
    }

    async fn delete_batch(&self, items: &[T]) -> Result<()> {
        self.logged(
            "delete_batch",
            || self.entities(items),
            self.inner.delete_batch(items),
        )
        .await
    }

    async fn create_if_not_exists(&self, item: &T) -> Result<bool> {
        self.logged(
            "create_if_not_exists",
            || self.entity(item),
            self.inner.create_if_not_exists(item),
        )
        .await
    }

    async fn record_exists(&self, item: &T) -> Result<bool> {
        self.logged(
            "record_exists",
            || self.entity(item),
            self.inner.record_exists(item),
        )
        .await
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        self.logged(
            "get",
            || key_context(partition_key, row_key),
            self.inner.get(partition_key, row_key),
        )
        .await
    }

    async fn get_all(&self, filter: Option<&EntityFilter<T>>) -> Result<Vec<T>> {
        self.logged("get_all", || Value::Null, self.inner.get_all(filter))
            .await
    }

    async fn get_partition(
        &self,
        partition_key: &str,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.logged(
            "get_partition",
            || json!({ "partition_key": partition_key }),
            self.inner.get_partition(partition_key, filter),
        )
        .await
    }

    async fn get_by_row_keys(
        &self,
        partition_key: &str,
        row_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.logged(
            "get_by_row_keys",
            || json!({ "partition_key": partition_key, "row_keys": row_keys }),
            self.inner.get_by_row_keys(partition_key, row_keys, filter),
        )
        .await
    }

    async fn get_by_partition_keys(
        &self,
        partition_keys: &[String],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.logged(
            "get_by_partition_keys",
            || json!({ "partition_keys": partition_keys }),
            self.inner.get_by_partition_keys(partition_keys, filter),
        )
        .await
    }

    async fn get_by_keys(
        &self,
        keys: &[(String, String)],
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.logged(
            "get_by_keys",
            || json!({ "keys": keys }),
            self.inner.get_by_keys(keys, filter),
        )
        .await
    }

    async fn get_top_record(&self, partition_key: &str) -> Result<Option<T>> {
        self.logged(
            "get_top_record",
            || json!({ "partition_key": partition_key }),
            self.inner.get_top_record(partition_key),
        )
        .await
    }

    async fn get_top_records(&self, partition_key: &str, count: usize) -> Result<Vec<T>> {
        self.logged(
            "get_top_records",
            || json!({ "partition_key": partition_key, "count": count }),
            self.inner.get_top_records(partition_key, count),
        )
        .await
    }

    async fn get_data_by_chunks(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
    ) -> Result<()> {
        self.logged(
            "get_data_by_chunks",
            || query_context(query),
            self.inner.get_data_by_chunks(query, sink),
        )
        .await
    }

    async fn scan_data(&self, query: &TableQuery, handler: &AsyncChunkHandler<'_, T>) -> Result<()> {
        self.logged(
            "scan_data",
            || query_context(query),
            self.inner.scan_data(query, handler),
        )
        .await
    }

    async fn first_or_none_via_scan(
        &self,
        partition_key: &str,
        search: &ChunkSearch<T>,
    ) -> Result<Option<T>> {
        self.logged(
            "first_or_none_via_scan",
            || json!({ "partition_key": partition_key }),
            self.inner.first_or_none_via_scan(partition_key, search),
        )
        .await
    }

    async fn get_row_keys_only(&self, row_keys: &[String]) -> Result<Vec<T>> {
        self.logged(
            "get_row_keys_only",
            || json!({ "row_keys": row_keys }),
            self.inner.get_row_keys_only(row_keys),
        )
        .await
    }

    async fn where_query(
        &self,
        query: &TableQuery,
        filter: Option<&EntityFilter<T>>,
    ) -> Result<Vec<T>> {
        self.logged(
            "where_query",
            || query_context(query),
            self.inner.where_query(query, filter),
        )
        .await
    }

    async fn where_query_async(
        &self,
        query: &TableQuery,
        filter: &AsyncEntityFilter<T>,
    ) -> Result<Vec<T>> {
        self.logged(
            "where_query_async",
            || query_context(query),
            self.inner.where_query_async(query, filter),
        )
        .await
    }

    async fn execute(
        &self,
        query: &TableQuery,
        sink: &mut ChunkSink<'_, T>,
        stop: Option<&StopCondition>,
    ) -> Result<()> {
        self.logged(
            "execute",
            || query_context(query),
            self.inner.execute(query, sink, stop),
        )
        .await
    }

    async fn do_batch(&self, batch: TableBatch) -> Result<()> {
        let operations: Vec<Value> = batch
            .operations()
            .iter()
            .map(|op| {
                json!({
                    "operation": op.name(),
                    "partition_key": op.partition_key(),
                    "row_key": op.row_key(),
                })
            })
            .collect();
        self.logged(
            "do_batch",
            move || Value::Array(operations),
            self.inner.do_batch(batch),
        )
        .await
    }

    async fn execute_query_with_pagination(
        &self,
        query: &TableQuery,
        paging: PagingInfo,
    ) -> Result<PagedResult<T>> {
        let paging_context = serde_json::to_value(&paging).unwrap_or(Value::Null);
        self.logged(
            "execute_query_with_pagination",
            move || json!({ "query": query.to_string(), "paging": paging_context }),
            self.inner.execute_query_with_pagination(query, paging),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDescriptor;
    use crate::storage::InMemoryTable;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Session {
        user: String,
        token: String,
        expires: Option<i64>,
    }

    impl TableEntity for Session {
        fn describe(d: &mut EntityDescriptor<Self>) {
            d.partition_key("User", |s: &Self| &s.user, |s: &mut Self, v| s.user = v)
                .row_key("Token", |s: &Self| &s.token, |s: &mut Self, v| s.token = v)
                .property("Expires", |s: &Self| &s.expires, |s: &mut Self, v| s.expires = v);
        }
    }

    fn logging() -> LoggingTableStorage<Session> {
        let inner: Arc<dyn TableStorage<Session>> =
            Arc::new(InMemoryTable::new("sessions").unwrap());
        LoggingTableStorage::new(inner).unwrap()
    }

    fn session(token: &str) -> Session {
        Session {
            user: "ann".into(),
            token: token.into(),
            expires: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_passes_results_through() {
        let storage = logging();
        storage.insert(&session("a")).await.unwrap();
        assert_eq!(storage.get("ann", "a").await.unwrap(), Some(session("a")));
        assert_eq!(storage.name(), "sessions");
    }

    #[tokio::test]
    async fn test_reraises_original_error() {
        let storage = logging();
        storage.insert(&session("a")).await.unwrap();

        let err = storage.insert(&session("a")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            err.to_string(),
            "Conflict: row ann/a already exists in sessions"
        );

        let err = storage.merge("ann", "missing", &|s: Session| Some(s)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_entity_dump() {
        let storage = logging();
        let dump = storage.entity(&session("a"));
        assert_eq!(dump["partition_key"], "ann");
        assert_eq!(dump["row_key"], "a");
        assert_eq!(dump["properties"]["Expires"], 1_700_000_000);
    }
}
