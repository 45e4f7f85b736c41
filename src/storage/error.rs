//! Storage engine error types
//!
//! Defines all errors that can occur in the temporal storage layer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the temporal store
#[derive(Error, Debug)]
pub enum ChronoError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller passed an invalid argument (empty name, NUL byte, duplicate key, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored temporal key could not be decoded
    #[error("Invalid temporal key encoding: {0}")]
    InvalidEncoding(String),

    /// Requested branch does not exist
    #[error("Unknown branch: {0}")]
    BranchUnknown(String),

    /// Requested secondary index does not exist
    #[error("Unknown index: {0}")]
    IndexUnknown(String),

    /// No chunk covers the requested timestamp on the branch
    #[error("No chunk covers timestamp {timestamp} on branch '{branch}'")]
    ChunkMissing { branch: String, timestamp: u64 },

    /// Query refused because the index may not reflect all base-data writes
    #[error("Index '{0}' is dirty and must be rebuilt before it can be queried")]
    IndexDirty(String),

    /// Attempted to write a timestamp older than the head chunk's start
    #[error("Timestamp {timestamp} precedes head chunk start {head_start}")]
    TimestampPrecedesHead { timestamp: u64, head_start: u64 },

    /// Attempted to write into a sealed chunk
    #[error("Chunk is sealed: {0}")]
    ChunkSealed(String),

    /// ensure_closed called while transactions are still outstanding
    #[error("Handle still has open transactions: {0:?}")]
    HandleBusy(PathBuf),

    /// The branch cannot accept further commits
    #[error("Branch stalled: {0}")]
    BranchStalled(String),

    /// Base data committed but the index write did not; the index is now dirty
    #[error("Index write failed (base data is durable, index marked dirty): {0}")]
    IndexWriteFailed(String),

    /// Failure reported by the underlying KV or document store
    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ChronoError {
    fn from(err: serde_json::Error) -> Self {
        ChronoError::Serialization(err.to_string())
    }
}

impl From<redb::DatabaseError> for ChronoError {
    fn from(err: redb::DatabaseError) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

impl From<redb::TransactionError> for ChronoError {
    fn from(err: redb::TransactionError) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

impl From<redb::TableError> for ChronoError {
    fn from(err: redb::TableError) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

impl From<redb::StorageError> for ChronoError {
    fn from(err: redb::StorageError) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

impl From<redb::CommitError> for ChronoError {
    fn from(err: redb::CommitError) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

impl From<rusqlite::Error> for ChronoError {
    fn from(err: rusqlite::Error) -> Self {
        ChronoError::StorageBackend(err.to_string())
    }
}

/// Result type alias for temporal store operations
pub type ChronoResult<T> = Result<T, ChronoError>;
