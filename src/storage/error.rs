//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer. Variants that concern
//! a single chunk carry its id so callers can retry narrowly.

use crate::storage::types::ChunkState;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Chunk file format error
    #[error("Invalid chunk file: {0}")]
    InvalidChunkFile(String),

    /// WAL format or recovery error
    #[error("WAL error: {0}")]
    WalError(String),

    /// Requested chunk does not exist
    #[error("Chunk not found: {0}")]
    ChunkNotFound(u32),

    /// Operation is not valid for the chunk's current state
    #[error("Chunk {chunk_id} is {state}, cannot {operation}")]
    InvalidState {
        chunk_id: u32,
        state: ChunkState,
        operation: &'static str,
    },

    /// Event is older than the oldest retained chunk range
    #[error("Timestamp {timestamp} is out of retention range (floor {floor})")]
    OutOfRetention { timestamp: i64, floor: i64 },

    /// Write into a chunk whose rows are no longer row-oriented
    #[error("Chunk {chunk_id} is {state} and does not accept writes")]
    ChunkImmutable { chunk_id: u32, state: ChunkState },

    /// Read touched a chunk in cold storage while tiered reads are disabled
    #[error("Chunk {chunk_id} is tiered and tiered reads are disabled")]
    TieredUnavailable { chunk_id: u32 },

    /// Encoded event exceeds the largest WAL frame replay accepts
    #[error("Event encodes to {bytes} bytes, limit is {limit}")]
    EventTooLarge { bytes: usize, limit: usize },

    /// Event or definition references a column the table does not declare
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Batch rejected as a whole (all-or-nothing mode)
    #[error("Batch rejected: {rejected} of {total} events failed, first: {first}")]
    BatchRejected {
        rejected: usize,
        total: usize,
        first: Box<StorageError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl StorageError {
    /// Errors that reject a single event without affecting the rest of a batch
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StorageError::SchemaMismatch(_)
                | StorageError::OutOfRetention { .. }
                | StorageError::ChunkImmutable { .. }
                | StorageError::EventTooLarge { .. }
        )
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
