//! Temporal storage engine
//!
//! This module provides the chunked, branched, versioned key-value core:
//!
//! - **types**: timestamps, validity periods, mutations, commit metadata
//! - **temporal_key**: order-preserving `(keyspace, key, t)` codec
//! - **kv**: the ordered-KV contract over the embedded backend
//! - **chunk**: one data file per contiguous time interval, plus sidecar
//! - **branch**: per-branch chunk lists and rollover
//! - **pool**: process-wide bounded pool of open chunk handles
//! - **matrix**: point-in-time reads, history and modification scans
//! - **resolver**: origin-chain walking for reads before a fork point
//! - **commit**: the transactional commit pipeline
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Read path:
//!   (branch, T) -> resolver -> chunk manager -> matrix -> floor lookup
//!
//! Write path:
//!   commit -> pipeline -> head chunk txn -> index modifications
//!          -> commit metadata -> atomic publish
//! ```

pub mod branch;
pub mod chunk;
pub mod commit;
pub mod error;
pub mod kv;
pub mod matrix;
pub mod pool;
pub mod resolver;
pub mod temporal_key;
pub mod types;

// Re-export commonly used types
pub use branch::{BranchChunkManager, BranchInfo};
pub use chunk::{ChunkFile, ChunkMetadata};
pub use commit::{CommitOutcome, CommitPipeline};
pub use error::{ChronoError, ChronoResult};
pub use kv::{KvStore, KvTransaction};
pub use matrix::{HistoryIter, ModificationsIter, RowLookup, TemporalMatrix};
pub use pool::{ChunkTransaction, GlobalChunkManager, PooledTransaction, DEFAULT_MAX_OPEN_FILES};
pub use resolver::{BranchResolver, BranchStep};
pub use temporal_key::TemporalKey;
pub use types::{
    CommitMetadata, ModificationRecord, Mutation, Order, Period, RowValue, Timestamp,
    MASTER_BRANCH, MAX_TIMESTAMP, OPEN_END,
};
