//! Branch metadata and per-branch chunk management
//!
//! A branch owns an ordered list of chunks that partition its live time
//! range without gap or overlap. The last chunk is the head (open-ended);
//! all others are sealed. Rollover seals the head and opens a new one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::chunk::{ChunkFile, META_EXTENSION};
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::types::{Timestamp, MASTER_BRANCH};

/// Persisted record describing one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    /// `None` for the root branch
    pub origin: Option<String>,
    /// Timestamp on the origin at which this branch was forked; `0` for
    /// the root branch
    pub branching_timestamp: Timestamp,
    pub created_at: DateTime<Utc>,
}

impl BranchInfo {
    pub fn master() -> Self {
        Self {
            name: MASTER_BRANCH.to_string(),
            origin: None,
            branching_timestamp: 0,
            created_at: Utc::now(),
        }
    }

    pub fn fork(
        name: impl Into<String>,
        origin: impl Into<String>,
        branching_timestamp: Timestamp,
    ) -> Self {
        Self {
            name: name.into(),
            origin: Some(origin.into()),
            branching_timestamp,
            created_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.origin.is_none()
    }
}

/// Manages the ordered chunk list of a single branch
#[derive(Debug)]
pub struct BranchChunkManager {
    branch_name: String,
    dir: PathBuf,
    /// Chunks sorted by sequence number; the last entry is the head
    chunks: RwLock<Vec<Arc<ChunkFile>>>,
    backend_cache_bytes: usize,
}

impl BranchChunkManager {
    /// Create the branch directory with its initial head chunk
    pub fn create(
        dir: impl Into<PathBuf>,
        branch_name: impl Into<String>,
        initial_valid_from: Timestamp,
        backend_cache_bytes: usize,
    ) -> ChronoResult<Self> {
        let dir = dir.into();
        let branch_name = branch_name.into();
        std::fs::create_dir_all(&dir)?;
        let head = ChunkFile::create(&dir, 0, initial_valid_from, backend_cache_bytes)?;
        Ok(Self {
            branch_name,
            dir,
            chunks: RwLock::new(vec![Arc::new(head)]),
            backend_cache_bytes,
        })
    }

    /// Open an existing branch directory, discovering its chunks
    pub fn open(
        dir: impl Into<PathBuf>,
        branch_name: impl Into<String>,
        backend_cache_bytes: usize,
    ) -> ChronoResult<Self> {
        let dir = dir.into();
        let branch_name = branch_name.into();

        let mut chunks = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == META_EXTENSION).unwrap_or(false) {
                match ChunkFile::open(&path) {
                    Ok(chunk) => chunks.push(Arc::new(chunk)),
                    Err(e) => {
                        tracing::warn!("Failed to open chunk {:?}: {}", path, e);
                    }
                }
            }
        }
        if chunks.is_empty() {
            return Err(ChronoError::StorageBackend(format!(
                "branch directory {:?} contains no chunks",
                dir
            )));
        }
        chunks.sort_by_key(|c| c.sequence());

        tracing::info!(
            "Loaded {} chunks for branch '{}'",
            chunks.len(),
            branch_name
        );

        Ok(Self {
            branch_name,
            dir,
            chunks: RwLock::new(chunks),
            backend_cache_bytes,
        })
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The writable head chunk
    pub fn head_chunk(&self) -> Arc<ChunkFile> {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        // the chunk list is never empty by construction
        Arc::clone(chunks.last().expect("branch has no chunks"))
    }

    /// Earliest timestamp covered by this branch's chunks
    pub fn first_valid_from(&self) -> Timestamp {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        chunks.first().expect("branch has no chunks").period().from()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The chunk whose interval contains `timestamp`
    ///
    /// Fails with `ChunkMissing` only when `timestamp` precedes the first
    /// chunk's `valid_from`.
    pub fn chunk_for_timestamp(&self, timestamp: Timestamp) -> ChronoResult<Arc<ChunkFile>> {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        // chunks partition the branch's time range, so a reverse walk over
        // the (small) list finds the unique cover
        for chunk in chunks.iter().rev() {
            if chunk.period().contains(timestamp) {
                return Ok(Arc::clone(chunk));
            }
        }
        Err(ChronoError::ChunkMissing {
            branch: self.branch_name.clone(),
            timestamp,
        })
    }

    /// All chunks intersecting the inclusive range `[lo, hi]`, ascending
    pub fn chunks_in_range(&self, lo: Timestamp, hi: Timestamp) -> Vec<Arc<ChunkFile>> {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        chunks
            .iter()
            .filter(|c| c.period().intersects_range(lo, hi))
            .cloned()
            .collect()
    }

    /// Seal the head at `t_now + 1` and open a new head beginning there
    ///
    /// Returns `(old_head, new_head)`. Callers serialize rollover per
    /// branch through the commit lock.
    pub fn perform_rollover(
        &self,
        t_now: Timestamp,
    ) -> ChronoResult<(Arc<ChunkFile>, Arc<ChunkFile>)> {
        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        let old_head = Arc::clone(chunks.last().expect("branch has no chunks"));
        let boundary = t_now + 1;

        old_head.seal(boundary)?;
        let new_head = Arc::new(ChunkFile::create(
            &self.dir,
            old_head.sequence() + 1,
            boundary,
            self.backend_cache_bytes,
        )?);
        chunks.push(Arc::clone(&new_head));

        tracing::info!(
            "Rolled over branch '{}': chunk {} sealed at {}, chunk {} is the new head",
            self.branch_name,
            old_head.sequence(),
            boundary,
            new_head.sequence()
        );

        Ok((old_head, new_head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CACHE: usize = 1024 * 1024;

    fn create_manager(dir: &Path) -> BranchChunkManager {
        BranchChunkManager::create(dir.join(MASTER_BRANCH), MASTER_BRANCH, 0, CACHE).unwrap()
    }

    #[test]
    fn test_branch_info() {
        let master = BranchInfo::master();
        assert!(master.is_root());
        assert_eq!(master.branching_timestamp, 0);

        let child = BranchInfo::fork("child", MASTER_BRANCH, 5);
        assert!(!child.is_root());
        assert_eq!(child.origin.as_deref(), Some(MASTER_BRANCH));
        assert_eq!(child.branching_timestamp, 5);
    }

    #[test]
    fn test_create_has_single_head() {
        let dir = tempdir().unwrap();
        let manager = create_manager(dir.path());

        assert_eq!(manager.chunk_count(), 1);
        let head = manager.head_chunk();
        assert!(head.is_head());
        assert_eq!(head.period().from(), 0);
    }

    #[test]
    fn test_chunk_for_timestamp() {
        let dir = tempdir().unwrap();
        let manager = create_manager(dir.path());

        manager.perform_rollover(9).unwrap(); // chunk 0 = [0, 10), chunk 1 = [10, inf)
        manager.perform_rollover(19).unwrap(); // chunk 1 = [10, 20), chunk 2 = [20, inf)

        assert_eq!(manager.chunk_for_timestamp(0).unwrap().sequence(), 0);
        assert_eq!(manager.chunk_for_timestamp(9).unwrap().sequence(), 0);
        assert_eq!(manager.chunk_for_timestamp(10).unwrap().sequence(), 1);
        assert_eq!(manager.chunk_for_timestamp(19).unwrap().sequence(), 1);
        assert_eq!(manager.chunk_for_timestamp(20).unwrap().sequence(), 2);
        assert_eq!(manager.chunk_for_timestamp(u64::MAX - 1).unwrap().sequence(), 2);
    }

    #[test]
    fn test_chunk_missing_before_first() {
        let dir = tempdir().unwrap();
        let manager =
            BranchChunkManager::create(dir.path().join("child"), "child", 6, CACHE).unwrap();

        assert!(matches!(
            manager.chunk_for_timestamp(5),
            Err(ChronoError::ChunkMissing { .. })
        ));
        assert!(manager.chunk_for_timestamp(6).is_ok());
    }

    #[test]
    fn test_chunks_in_range() {
        let dir = tempdir().unwrap();
        let manager = create_manager(dir.path());
        manager.perform_rollover(9).unwrap();
        manager.perform_rollover(19).unwrap();

        let all = manager.chunks_in_range(0, 100);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].sequence() < w[1].sequence()));

        let first_two = manager.chunks_in_range(5, 15);
        assert_eq!(first_two.len(), 2);

        let head_only = manager.chunks_in_range(25, 30);
        assert_eq!(head_only.len(), 1);
        assert_eq!(head_only[0].sequence(), 2);
    }

    #[test]
    fn test_rollover_partitions_without_gap() {
        let dir = tempdir().unwrap();
        let manager = create_manager(dir.path());

        let (old_head, new_head) = manager.perform_rollover(7).unwrap();
        assert_eq!(old_head.period().from(), 0);
        assert_eq!(old_head.period().to(), 8);
        assert_eq!(new_head.period().from(), 8);
        assert!(new_head.is_head());

        // every timestamp is covered by exactly one chunk
        for t in 0..20u64 {
            let covering = manager
                .chunks_in_range(0, 100)
                .iter()
                .filter(|c| c.period().contains(t))
                .count();
            assert_eq!(covering, 1, "timestamp {} covered by {} chunks", t, covering);
        }
    }

    #[test]
    fn test_reopen_discovers_chunks() {
        let dir = tempdir().unwrap();
        let branch_dir = dir.path().join(MASTER_BRANCH);
        {
            let manager =
                BranchChunkManager::create(&branch_dir, MASTER_BRANCH, 0, CACHE).unwrap();
            manager.perform_rollover(4).unwrap();
            manager.perform_rollover(9).unwrap();
        }

        let reopened = BranchChunkManager::open(&branch_dir, MASTER_BRANCH, CACHE).unwrap();
        assert_eq!(reopened.chunk_count(), 3);
        assert_eq!(reopened.head_chunk().sequence(), 2);
        assert_eq!(reopened.head_chunk().period().from(), 10);
        assert_eq!(reopened.first_valid_from(), 0);
    }
}
