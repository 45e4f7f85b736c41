//! # ChronoDB
//!
//! A temporal key-value store: every write is timestamped, every read
//! selects a snapshot at a chosen timestamp, and the entire history of a
//! key is retained and queryable.
//!
//! ## Features
//!
//! - **Chunked temporal storage**: each branch's history is partitioned
//!   into on-disk chunks covering contiguous time intervals, with a
//!   bounded pool of open files
//! - **Point-in-time reads**: `(key, timestamp)` maps onto one ordered
//!   keyspace, so an ordinary ordered lookup answers as-of queries
//! - **Branching**: fork a branch at any timestamp; reads before the fork
//!   point fall through to the origin
//! - **Secondary temporal index**: indexed field values carry validity
//!   intervals, maintained incrementally on commit
//! - **Transactional commits**: base data, index modifications, and
//!   commit metadata become visible atomically
//!
//! ## Modules
//!
//! - [`storage`]: chunked temporal storage engine
//! - [`index`]: secondary temporal index
//! - [`cache`]: read and query caches
//! - [`config`]: configuration loading
//! - [`db`]: the orchestrating engine
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronodb::{ChronoDb, Mutation, Order, MASTER_BRANCH};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = ChronoDb::open_default("./chronodb_data").await?;
//!
//!     // Commit a batch of mutations
//!     let t = db
//!         .commit(
//!             MASTER_BRANCH,
//!             vec![Mutation::put("people", "p1", br#"{"name":"Alice"}"#.to_vec())],
//!             None,
//!         )
//!         .await?;
//!
//!     // Point-in-time read
//!     let value = db.get(MASTER_BRANCH, "people", "p1", t).await?;
//!     println!("as of t={}: {:?}", t, value);
//!
//!     // Time-travel on a fork
//!     db.create_branch("what-if", MASTER_BRANCH, t).await?;
//!     let history = db.history("what-if", "people", "p1", t, Order::Descending).await?;
//!     println!("versions: {:?}", history);
//!
//!     db.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use db::{CacheStatsReport, ChronoDb, DbStats};

pub use storage::{
    BranchInfo, ChronoError, ChronoResult, CommitMetadata, ModificationRecord, Mutation, Order,
    Period, RowValue, Timestamp, MASTER_BRANCH, MAX_TIMESTAMP,
};

pub use index::{
    Condition, ExtractorRegistry, IndexDocument, IndexExtractor, IndexStats, IndexValue,
    NumberMatch, SearchSpec, TextMatch, ValueExtractor,
};

pub use cache::CacheStatsSnapshot;

pub use config::{ChronoConfig, ConfigError};
