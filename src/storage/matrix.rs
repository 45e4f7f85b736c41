//! Temporal matrix: versioned reads and writes over one branch's chunks
//!
//! A point-in-time `get` is an ordered-predecessor lookup on the encoded
//! temporal key inside the chunk covering the read timestamp. When that
//! chunk holds no version of the key, the lookup walks backward through
//! the preceding chunks, because a key's latest write may predate the
//! current chunk.
//!
//! `history` and `modifications_between` are lazy single-pass iterators:
//! they open one bogus transaction per chunk as they advance and buffer
//! only that chunk's matching rows.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::storage::branch::BranchChunkManager;
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::DATA_TABLE;
use crate::storage::pool::{ChunkTransaction, GlobalChunkManager};
use crate::storage::temporal_key;
use crate::storage::types::{ModificationRecord, Order, RowValue, Timestamp};

/// Result of a point-in-time lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLookup {
    /// A live value as of the read timestamp
    Value(Vec<u8>),
    /// The key was deleted at or before the read timestamp
    Tombstone,
    /// This branch holds no version of the key at or before the read
    /// timestamp; an origin branch may
    None,
}

/// Versioned read/write operations on one branch
pub struct TemporalMatrix {
    pool: Arc<GlobalChunkManager>,
    branch: Arc<BranchChunkManager>,
}

impl TemporalMatrix {
    pub fn new(pool: Arc<GlobalChunkManager>, branch: Arc<BranchChunkManager>) -> Self {
        Self { pool, branch }
    }

    /// Point-in-time get: the row with the greatest `t <= timestamp`
    pub fn get(&self, keyspace: &str, key: &str, timestamp: Timestamp) -> ChronoResult<RowLookup> {
        let mut chunk = match self.branch.chunk_for_timestamp(timestamp) {
            Ok(chunk) => chunk,
            Err(ChronoError::ChunkMissing { .. }) => return Ok(RowLookup::None),
            Err(e) => return Err(e),
        };
        let target = temporal_key::encode(keyspace, key, timestamp);

        loop {
            let txn = self.pool.open_bogus_transaction(chunk.data_path())?;
            if let Some((found_key, row)) = txn.floor(DATA_TABLE, &target)? {
                if temporal_key::matches_key(&found_key, keyspace, key) {
                    return Ok(match RowValue::decode(&row)? {
                        RowValue::Value(payload) => RowLookup::Value(payload),
                        RowValue::Tombstone => RowLookup::Tombstone,
                    });
                }
            }
            // no version in this chunk; continue in the preceding one
            let from = chunk.period().from();
            if from == 0 {
                return Ok(RowLookup::None);
            }
            chunk = match self.branch.chunk_for_timestamp(from - 1) {
                Ok(chunk) => chunk,
                Err(ChronoError::ChunkMissing { .. }) => return Ok(RowLookup::None),
                Err(e) => return Err(e),
            };
        }
    }

    /// Exact-version read: the row stored at precisely `timestamp`, if any
    pub fn get_version(
        &self,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
    ) -> ChronoResult<Option<RowValue>> {
        let chunk = match self.branch.chunk_for_timestamp(timestamp) {
            Ok(chunk) => chunk,
            Err(ChronoError::ChunkMissing { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let txn = self.pool.open_bogus_transaction(chunk.data_path())?;
        let encoded = temporal_key::encode(keyspace, key, timestamp);
        match txn.load(DATA_TABLE, &encoded)? {
            Some(row) => Ok(Some(RowValue::decode(&row)?)),
            None => Ok(None),
        }
    }

    /// Write one version into the head chunk through an open transaction
    ///
    /// Callers must only write into the head: a timestamp below the head's
    /// start fails with `TimestampPrecedesHead`, and a transaction bound to
    /// a sealed chunk fails with `ChunkSealed`.
    pub fn put(
        &self,
        txn: &ChunkTransaction,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
        value: &RowValue,
    ) -> ChronoResult<()> {
        let chunk = txn.chunk();
        if !chunk.is_head() {
            return Err(ChronoError::ChunkSealed(format!(
                "{:?} is not the head chunk",
                chunk.data_path()
            )));
        }
        let head_start = chunk.period().from();
        if timestamp < head_start {
            return Err(ChronoError::TimestampPrecedesHead {
                timestamp,
                head_start,
            });
        }
        let encoded = temporal_key::encode(keyspace, key, timestamp);
        txn.txn().store(DATA_TABLE, &encoded, &value.encode())
    }

    /// Lazy sequence of version timestamps of `(keyspace, key)` up to and
    /// including `upper`, in the requested order
    pub fn history(
        &self,
        keyspace: &str,
        key: &str,
        upper: Timestamp,
        order: Order,
    ) -> HistoryIter {
        let mut chunks: VecDeque<Arc<_>> = self.branch.chunks_in_range(0, upper).into();
        if order == Order::Descending {
            chunks = chunks.into_iter().rev().collect();
        }
        HistoryIter {
            pool: Arc::clone(&self.pool),
            keyspace: keyspace.to_string(),
            key: key.to_string(),
            upper,
            order,
            chunks,
            buffer: VecDeque::new(),
        }
    }

    /// Lazy sequence of every stored row with timestamp in `[lo, hi]`
    ///
    /// Rows are emitted in storage order within each chunk, chunks in
    /// ascending time order.
    pub fn modifications_between(&self, lo: Timestamp, hi: Timestamp) -> ModificationsIter {
        ModificationsIter {
            pool: Arc::clone(&self.pool),
            lo,
            hi,
            chunks: self.branch.chunks_in_range(lo, hi).into(),
            buffer: VecDeque::new(),
        }
    }

    /// Number of stored rows with timestamp in `[lo, hi]`
    pub fn count_between(&self, lo: Timestamp, hi: Timestamp) -> ChronoResult<u64> {
        let mut count = 0u64;
        for record in self.modifications_between(lo, hi) {
            record?;
            count += 1;
        }
        Ok(count)
    }

    /// Distinct keyspaces with at least one row at or before `upper`
    pub fn keyspaces(&self, upper: Timestamp) -> ChronoResult<Vec<String>> {
        let mut out = std::collections::BTreeSet::new();
        for chunk in self.branch.chunks_in_range(0, upper) {
            let txn = self.pool.open_bogus_transaction(chunk.data_path())?;
            for (encoded, _) in txn.scan_all(DATA_TABLE, Order::Ascending)? {
                let decoded = temporal_key::decode(&encoded)?;
                if decoded.timestamp <= upper {
                    out.insert(decoded.keyspace);
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}

/// Lazy iterator over the version timestamps of one key
///
/// Must be fully consumed or dropped before the store shuts down; each
/// step may check one chunk transaction out of the pool.
pub struct HistoryIter {
    pool: Arc<GlobalChunkManager>,
    keyspace: String,
    key: String,
    upper: Timestamp,
    order: Order,
    chunks: VecDeque<Arc<crate::storage::chunk::ChunkFile>>,
    buffer: VecDeque<Timestamp>,
}

impl Iterator for HistoryIter {
    type Item = ChronoResult<Timestamp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(t) = self.buffer.pop_front() {
                return Some(Ok(t));
            }
            let chunk = self.chunks.pop_front()?;
            let lo = temporal_key::encode(&self.keyspace, &self.key, 0);
            let hi = temporal_key::encode(&self.keyspace, &self.key, self.upper);
            let rows = self
                .pool
                .open_bogus_transaction(chunk.data_path())
                .and_then(|txn| txn.scan(DATA_TABLE, &lo, &hi, self.order));
            match rows {
                Ok(rows) => {
                    for (encoded, _) in rows {
                        match temporal_key::decode_timestamp(&encoded) {
                            Ok(t) => self.buffer.push_back(t),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Lazy iterator over all rows stored in a time window
pub struct ModificationsIter {
    pool: Arc<GlobalChunkManager>,
    lo: Timestamp,
    hi: Timestamp,
    chunks: VecDeque<Arc<crate::storage::chunk::ChunkFile>>,
    buffer: VecDeque<ModificationRecord>,
}

impl Iterator for ModificationsIter {
    type Item = ChronoResult<ModificationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            let chunk = self.chunks.pop_front()?;
            let rows = self
                .pool
                .open_bogus_transaction(chunk.data_path())
                .and_then(|txn| txn.scan_all(DATA_TABLE, Order::Ascending));
            match rows {
                Ok(rows) => {
                    for (encoded, _) in rows {
                        match temporal_key::decode(&encoded) {
                            Ok(decoded) => {
                                if decoded.timestamp >= self.lo && decoded.timestamp <= self.hi {
                                    self.buffer.push_back(ModificationRecord {
                                        timestamp: decoded.timestamp,
                                        keyspace: decoded.keyspace,
                                        key: decoded.key,
                                    });
                                }
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
