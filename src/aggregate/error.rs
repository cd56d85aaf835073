//! Aggregation error types
//!
//! Defines all error conditions of definitions, refreshes and queries over
//! continuous aggregates.

use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the aggregation layer
#[derive(Error, Debug)]
pub enum AggregateError {
    /// Duration or aggregate expression failed to parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// Definition references a column the source table does not declare
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Referenced table does not exist
    #[error("Table not found: {0}")]
    UnknownTable(String),

    /// Referenced continuous aggregate does not exist
    #[error("Continuous aggregate not found: {0}")]
    UnknownAggregate(String),

    /// Bucket width is zero, negative, or not a multiple of the base width
    #[error("Invalid bucket width: {0}")]
    InvalidBucketWidth(String),

    /// Definition is otherwise unusable
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// Stored partial state does not match the aggregate function
    #[error("Aggregate state mismatch: {0}")]
    StateMismatch(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Materialization store error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization of partial states failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<bincode::Error> for AggregateError {
    fn from(err: bincode::Error) -> Self {
        AggregateError::Serialization(err.to_string())
    }
}

impl AggregateError {
    /// Chunk that made a read fail because it sits in cold storage
    pub fn tiered_chunk(&self) -> Option<u32> {
        match self {
            AggregateError::Storage(StorageError::TieredUnavailable { chunk_id }) => Some(*chunk_id),
            _ => None,
        }
    }
}

/// Result type for aggregation operations
pub type AggregateResult<T> = Result<T, AggregateError>;
