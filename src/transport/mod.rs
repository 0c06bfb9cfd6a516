//! Wire-level access to the remote table service.
//!
//! The transport is the narrow seam below [`crate::storage::RemoteTableStorage`]:
//! single operations, single-partition batches and segmented queries, all
//! reporting failures as status-coded [`crate::error::Error`]s. A production
//! deployment plugs in an HTTP client; [`MemoryTransport`] emulates the
//! service for tests and local runs.

mod memory;

pub use memory::{MemoryTransport, TransportCall};

use crate::batch::TableOperation;
use crate::entity::TableRow;
use crate::error::Result;
use crate::paging::ContinuationToken;
use crate::query::TableQuery;
use async_trait::async_trait;

/// Rows returned per query segment unless the query asks for fewer
pub const DEFAULT_SEGMENT_SIZE: usize = 1000;

/// One segment of a query response
#[derive(Debug, Clone, Default)]
pub struct QuerySegment {
    pub rows: Vec<TableRow>,
    /// Where the next segment starts; `None` on the last segment
    pub continuation: Option<ContinuationToken>,
}

#[async_trait]
pub trait TableTransport: Send + Sync {
    /// `true` if the table was created by this call
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool>;

    /// `true` if the table existed
    async fn delete_table_if_exists(&self, table: &str) -> Result<bool>;

    /// Run one operation. Writes return the stored row with its new etag,
    /// retrieves return the row or `None`.
    async fn execute(&self, table: &str, operation: TableOperation) -> Result<Option<TableRow>>;

    /// Run up to 100 operations of one partition atomically
    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<Option<TableRow>>>;

    async fn query_segment(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QuerySegment>;
}
