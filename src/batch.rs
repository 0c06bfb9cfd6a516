//! Batch operations.
//!
//! The service applies a batch atomically only within one partition and only
//! up to [`BATCH_LIMIT_PER_PARTITION`] operations. Larger or mixed batches are
//! split into per-partition chunks that run one after another; the first
//! failing chunk stops the rest.

use crate::entity::{self, TableEntity, TableRow};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Maximum operations per batch call
pub const BATCH_LIMIT_PER_PARTITION: usize = 100;

/// Single row operation
#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    Insert(TableRow),
    InsertOrMerge(TableRow),
    InsertOrReplace(TableRow),
    /// Conditional on `row.etag` when set
    Replace(TableRow),
    /// Conditional on `row.etag` when set
    Merge(TableRow),
    /// Conditional on `row.etag` when set
    Delete(TableRow),
    Retrieve {
        partition_key: String,
        row_key: String,
    },
}

impl TableOperation {
    pub fn retrieve(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        TableOperation::Retrieve {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }

    pub fn partition_key(&self) -> &str {
        match self {
            TableOperation::Retrieve { partition_key, .. } => partition_key,
            other => other.row().map(|r| r.partition_key.as_str()).unwrap_or_default(),
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            TableOperation::Retrieve { row_key, .. } => row_key,
            other => other.row().map(|r| r.row_key.as_str()).unwrap_or_default(),
        }
    }

    /// Row carried by a write operation
    pub fn row(&self) -> Option<&TableRow> {
        match self {
            TableOperation::Insert(row)
            | TableOperation::InsertOrMerge(row)
            | TableOperation::InsertOrReplace(row)
            | TableOperation::Replace(row)
            | TableOperation::Merge(row)
            | TableOperation::Delete(row) => Some(row),
            TableOperation::Retrieve { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TableOperation::Insert(_) => "insert",
            TableOperation::InsertOrMerge(_) => "insert_or_merge",
            TableOperation::InsertOrReplace(_) => "insert_or_replace",
            TableOperation::Replace(_) => "replace",
            TableOperation::Merge(_) => "merge",
            TableOperation::Delete(_) => "delete",
            TableOperation::Retrieve { .. } => "retrieve",
        }
    }
}

/// Ordered list of operations, possibly spanning partitions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableBatch {
    operations: Vec<TableOperation>,
}

/// One per-partition slice of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchChunk {
    pub partition_key: String,
    /// Index of the chunk within its partition
    pub index: usize,
    pub operations: Vec<TableOperation>,
}

impl BatchChunk {
    /// Wrap an error raised while executing this chunk
    pub fn failed(&self, source: Error) -> Error {
        Error::BatchFailed {
            partition: self.partition_key.clone(),
            chunk: self.index,
            source: Box::new(source),
        }
    }
}

impl TableBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch applying `op` to every entity
    pub fn from_entities<T: TableEntity>(
        items: &[T],
        op: impl Fn(TableRow) -> TableOperation,
    ) -> Result<Self> {
        let metadata = entity::describe::<T>()?;
        let operations = items
            .iter()
            .map(|item| metadata.to_row(item).map(&op))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { operations })
    }

    pub fn push(&mut self, operation: TableOperation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn insert(&mut self, row: TableRow) -> &mut Self {
        self.push(TableOperation::Insert(row))
    }

    pub fn insert_or_merge(&mut self, row: TableRow) -> &mut Self {
        self.push(TableOperation::InsertOrMerge(row))
    }

    pub fn insert_or_replace(&mut self, row: TableRow) -> &mut Self {
        self.push(TableOperation::InsertOrReplace(row))
    }

    pub fn delete(&mut self, row: TableRow) -> &mut Self {
        self.push(TableOperation::Delete(row))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[TableOperation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<TableOperation> {
        self.operations
    }

    /// Group by partition (first appearance order) and split into chunks of
    /// at most `limit` operations
    pub fn into_chunks(self, limit: usize) -> Vec<BatchChunk> {
        let limit = limit.clamp(1, BATCH_LIMIT_PER_PARTITION);

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<TableOperation>> = HashMap::new();
        for op in self.operations {
            let pk = op.partition_key().to_string();
            groups
                .entry(pk.clone())
                .or_insert_with(|| {
                    order.push(pk);
                    Vec::new()
                })
                .push(op);
        }

        let mut chunks = Vec::new();
        for pk in order {
            let Some(mut ops) = groups.remove(&pk) else {
                continue;
            };
            let mut index = 0;
            while !ops.is_empty() {
                let rest = ops.split_off(ops.len().min(limit));
                chunks.push(BatchChunk {
                    partition_key: pk.clone(),
                    index,
                    operations: ops,
                });
                ops = rest;
                index += 1;
            }
        }
        chunks
    }
}

impl FromIterator<TableOperation> for TableBatch {
    fn from_iter<I: IntoIterator<Item = TableOperation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}
