//! In-process emulation of the remote table service.
//!
//! Behaves like the service where the client depends on it: etags with
//! optimistic concurrency, 100-operation single-partition atomic batches, and
//! segmented queries with continuation tokens. Faults and latency can be
//! injected per call kind, and every call is counted.

use super::{QuerySegment, TableTransport, DEFAULT_SEGMENT_SIZE};
use crate::batch::{TableOperation, BATCH_LIMIT_PER_PARTITION};
use crate::entity::TableRow;
use crate::error::{Error, Result};
use crate::paging::ContinuationToken;
use crate::query::TableQuery;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Table = BTreeMap<(String, String), TableRow>;

/// Kinds of transport calls, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCall {
    CreateTable,
    DeleteTable,
    Execute,
    Batch,
    Query,
}

impl TransportCall {
    fn index(self) -> usize {
        self as usize
    }
}

struct Fault {
    call: TransportCall,
    skip: usize,
    error: Error,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    faults: Vec<Fault>,
    latency: Option<Duration>,
}

/// Fake remote service
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    calls: Arc<[AtomicUsize; 5]>,
    etag_seq: Arc<AtomicU64>,
    segment_size: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    /// Serve at most `segment_size` rows per query segment
    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            calls: Arc::new(Default::default()),
            etag_seq: Arc::new(AtomicU64::new(1)),
            segment_size: segment_size.max(1),
        }
    }

    /// Fail the next call of kind `call` with `error`
    pub fn inject(&self, call: TransportCall, error: Error) {
        self.inject_after(call, 0, error);
    }

    /// Let `skip` calls of kind `call` pass, then fail one with `error`
    pub fn inject_after(&self, call: TransportCall, skip: usize, error: Error) {
        self.state.lock().faults.push(Fault { call, skip, error });
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Number of calls of kind `call` so far, including failed ones
    pub fn calls(&self, call: TransportCall) -> usize {
        self.calls[call.index()].load(Ordering::SeqCst)
    }

    /// Number of rows stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, |t| t.len())
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    /// Count the call, apply latency and pop a pending fault
    async fn enter(&self, call: TransportCall) -> Result<()> {
        self.calls[call.index()].fetch_add(1, Ordering::SeqCst);

        let (latency, fault) = {
            let mut state = self.state.lock();
            let mut fault = None;
            if let Some(pos) = state.faults.iter().position(|f| f.call == call) {
                if state.faults[pos].skip > 0 {
                    state.faults[pos].skip -= 1;
                } else {
                    fault = Some(state.faults.remove(pos).error);
                }
            }
            (state.latency, fault)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(error) => {
                trace!(?call, %error, "Injected transport fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn next_etag(&self) -> String {
        format!("W/\"{}\"", self.etag_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn apply(&self, table: &mut Table, operation: TableOperation) -> Result<Option<TableRow>> {
        match operation {
            TableOperation::Retrieve {
                partition_key,
                row_key,
            } => Ok(table.get(&(partition_key, row_key)).cloned()),
            TableOperation::Insert(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                if table.contains_key(&key) {
                    return Err(Error::Conflict(format!(
                        "entity {}/{} already exists",
                        key.0, key.1
                    )));
                }
                Ok(Some(self.store(table, key, row.stored())))
            }
            TableOperation::InsertOrReplace(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                Ok(Some(self.store(table, key, row.stored())))
            }
            TableOperation::InsertOrMerge(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                let merged = match table.get(&key) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merged.merge_from(&row);
                        merged
                    }
                    None => row.stored(),
                };
                Ok(Some(self.store(table, key, merged)))
            }
            TableOperation::Replace(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                let mut current = Self::conditional(table, &key, row.etag.as_deref())?.clone();
                current.replace_with(&row);
                Ok(Some(self.store(table, key, current)))
            }
            TableOperation::Merge(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                let mut current = Self::conditional(table, &key, row.etag.as_deref())?.clone();
                current.merge_from(&row);
                Ok(Some(self.store(table, key, current)))
            }
            TableOperation::Delete(row) => {
                let key = (row.partition_key.clone(), row.row_key.clone());
                Self::conditional(table, &key, row.etag.as_deref())?;
                Ok(table.remove(&key))
            }
        }
    }

    /// Stored row at `key`, checking the etag when one was supplied
    fn conditional<'a>(
        table: &'a Table,
        key: &(String, String),
        etag: Option<&str>,
    ) -> Result<&'a TableRow> {
        let current = table.get(key).ok_or_else(|| {
            Error::NotFound(format!("entity {}/{} does not exist", key.0, key.1))
        })?;
        match etag {
            Some(expected) if expected != "*" && current.etag.as_deref() != Some(expected) => {
                Err(Error::PreconditionFailed(format!(
                    "etag mismatch on {}/{}",
                    key.0, key.1
                )))
            }
            _ => Ok(current),
        }
    }

    fn store(&self, table: &mut Table, key: (String, String), mut row: TableRow) -> TableRow {
        row.etag = Some(self.next_etag());
        row.timestamp = Some(Utc::now());
        table.insert(key, row.clone());
        row
    }

    fn missing_table(table: &str) -> Error {
        Error::NotFound(format!("table {} does not exist", table))
    }
}

#[async_trait]
impl TableTransport for MemoryTransport {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        self.enter(TransportCall::CreateTable).await?;
        let mut state = self.state.lock();
        if state.tables.contains_key(table) {
            return Ok(false);
        }
        state.tables.insert(table.to_string(), Table::new());
        Ok(true)
    }

    async fn delete_table_if_exists(&self, table: &str) -> Result<bool> {
        self.enter(TransportCall::DeleteTable).await?;
        Ok(self.state.lock().tables.remove(table).is_some())
    }

    async fn execute(&self, table: &str, operation: TableOperation) -> Result<Option<TableRow>> {
        self.enter(TransportCall::Execute).await?;
        let mut state = self.state.lock();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        self.apply(rows, operation)
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<Option<TableRow>>> {
        self.enter(TransportCall::Batch).await?;

        if operations.len() > BATCH_LIMIT_PER_PARTITION {
            return Err(Error::BadRequest(format!(
                "batch of {} operations exceeds the limit of {}",
                operations.len(),
                BATCH_LIMIT_PER_PARTITION
            )));
        }
        if let Some(first) = operations.first() {
            let pk = first.partition_key();
            if operations.iter().any(|op| op.partition_key() != pk) {
                return Err(Error::BadRequest(
                    "batch operations must share one partition key".to_string(),
                ));
            }
        }

        let mut state = self.state.lock();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;

        // all or nothing
        let mut staged = rows.clone();
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            results.push(self.apply(&mut staged, operation)?);
        }
        *rows = staged;
        Ok(results)
    }

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QuerySegment> {
        self.enter(TransportCall::Query).await?;

        let state = self.state.lock();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| Self::missing_table(table))?;

        let limit = query
            .take
            .unwrap_or(self.segment_size)
            .min(self.segment_size)
            .max(1);
        let start = continuation
            .map(|t| (t.next_partition_key.clone(), t.next_row_key.clone()))
            .unwrap_or_default();

        let mut matching = rows.range(start..).map(|(_, row)| row).filter(|row| query.matches(row));
        let page: Vec<TableRow> = matching
            .by_ref()
            .take(limit)
            .map(|row| query.project(row.clone()))
            .collect();
        let continuation = matching
            .next()
            .map(|next| ContinuationToken::at(&next.partition_key, &next.row_key));

        Ok(QuerySegment {
            rows: page,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;

    fn row(pk: &str, rk: &str) -> TableRow {
        TableRow::new(pk, rk).with_property("Value", 1)
    }

    #[tokio::test]
    async fn test_stale_etag_is_rejected() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.create_table_if_not_exists("t").await?;

        let stored = transport
            .execute("t", TableOperation::Insert(row("p", "r")))
            .await?
            .ok_or_else(|| Error::Internal("no row".into()))?;

        transport
            .execute("t", TableOperation::InsertOrReplace(row("p", "r")))
            .await?;

        let err = transport
            .execute("t", TableOperation::Replace(stored))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
        Ok(())
    }

    #[tokio::test]
    async fn test_batches_are_atomic() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.create_table_if_not_exists("t").await?;
        transport
            .execute("t", TableOperation::Insert(row("p", "b")))
            .await?;

        let err = transport
            .execute_batch(
                "t",
                vec![
                    TableOperation::Insert(row("p", "a")),
                    TableOperation::Insert(row("p", "b")),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(transport.row_count("t"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_segments_carry_continuation() -> Result<()> {
        let transport = MemoryTransport::with_segment_size(2);
        transport.create_table_if_not_exists("t").await?;
        for rk in ["a", "b", "c"] {
            transport
                .execute("t", TableOperation::Insert(row("p", rk)))
                .await?;
        }

        let query = TableQuery::filtered(Filter::partition_key_eq("p"));
        let first = transport.query_segment("t", &query, None).await?;
        assert_eq!(first.rows.len(), 2);
        let token = first.continuation.clone().unwrap();
        assert_eq!(token.next_row_key, "c");

        let second = transport.query_segment("t", &query, Some(&token)).await?;
        assert_eq!(second.rows.len(), 1);
        assert!(second.continuation.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.inject_after(TransportCall::CreateTable, 1, Error::Forbidden("key".into()));

        assert!(transport.create_table_if_not_exists("a").await?);
        assert!(transport.create_table_if_not_exists("b").await.is_err());
        assert!(transport.create_table_if_not_exists("c").await?);
        assert_eq!(transport.calls(TransportCall::CreateTable), 3);
        Ok(())
    }
}
