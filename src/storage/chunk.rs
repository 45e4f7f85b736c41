//! Chunk files: one on-disk data file per contiguous time interval
//!
//! A chunk owns one ordered-KV data file plus a JSON sidecar holding
//! `{valid_from, valid_to, row_count}`. Exactly one chunk per branch is
//! the head (`valid_to` absent, meaning unbounded); all others are sealed
//! and read-only.
//!
//! Layout on disk:
//! ```text
//! branches/<branch>/chunk_0000.data    ordered KV database
//! branches/<branch>/chunk_0000.meta    {"valid_from":0,"valid_to":8,"row_count":12}
//! ```

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::KvStore;
use crate::storage::types::{Period, Timestamp};

/// Chunk file name prefix, followed by the zero-padded sequence number
pub const CHUNK_FILE_PREFIX: &str = "chunk_";
/// Extension of the data file
pub const DATA_EXTENSION: &str = "data";
/// Extension of the metadata sidecar
pub const META_EXTENSION: &str = "meta";

/// Persisted sidecar record of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub valid_from: Timestamp,
    /// `None` while the chunk is the head
    pub valid_to: Option<Timestamp>,
    pub row_count: u64,
}

impl ChunkMetadata {
    pub fn period(&self) -> Period {
        match self.valid_to {
            Some(to) => Period::closed(self.valid_from, to),
            None => Period::open(self.valid_from),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.valid_to.is_some()
    }
}

/// Handle over one on-disk chunk: data file path plus sidecar metadata
///
/// The data file itself is opened through the global chunk manager's pool;
/// this handle only owns the metadata lifecycle.
#[derive(Debug)]
pub struct ChunkFile {
    sequence: u64,
    data_path: PathBuf,
    meta_path: PathBuf,
    meta: RwLock<ChunkMetadata>,
}

impl ChunkFile {
    /// Create a new head chunk in the given branch directory
    ///
    /// Writes the sidecar and initializes an empty data file so that the
    /// on-disk layout is complete from the start.
    pub fn create(
        branch_dir: &Path,
        sequence: u64,
        valid_from: Timestamp,
        backend_cache_bytes: usize,
    ) -> ChronoResult<Self> {
        std::fs::create_dir_all(branch_dir)?;
        let data_path = branch_dir.join(Self::data_file_name(sequence));
        let meta_path = branch_dir.join(Self::meta_file_name(sequence));

        let meta = ChunkMetadata {
            valid_from,
            valid_to: None,
            row_count: 0,
        };
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

        // materialize the data file so discovery and the pool agree on
        // what exists
        KvStore::open(&data_path, backend_cache_bytes)?;

        Ok(Self {
            sequence,
            data_path,
            meta_path,
            meta: RwLock::new(meta),
        })
    }

    /// Open an existing chunk from its metadata sidecar path
    pub fn open(meta_path: impl AsRef<Path>) -> ChronoResult<Self> {
        let meta_path = meta_path.as_ref().to_path_buf();
        let sequence = Self::parse_sequence(&meta_path).ok_or_else(|| {
            ChronoError::InvalidArgument(format!("not a chunk file name: {:?}", meta_path))
        })?;
        let content = std::fs::read(&meta_path)?;
        let meta: ChunkMetadata = serde_json::from_slice(&content)?;
        let data_path = meta_path.with_extension(DATA_EXTENSION);

        Ok(Self {
            sequence,
            data_path,
            meta_path,
            meta: RwLock::new(meta),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Snapshot of the sidecar metadata
    pub fn metadata(&self) -> ChunkMetadata {
        *self.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn period(&self) -> Period {
        self.metadata().period()
    }

    pub fn is_head(&self) -> bool {
        !self.metadata().is_sealed()
    }

    /// Seal the chunk at `valid_to`, making it read-only
    ///
    /// Idempotent when called again with the same boundary; sealing an
    /// already-sealed chunk at a different boundary fails with
    /// `ChunkSealed`.
    pub fn seal(&self, valid_to: Timestamp) -> ChronoResult<()> {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        match meta.valid_to {
            Some(existing) if existing == valid_to => return Ok(()),
            Some(existing) => {
                return Err(ChronoError::ChunkSealed(format!(
                    "{:?} already sealed at {}",
                    self.data_path, existing
                )))
            }
            None => {}
        }
        if valid_to <= meta.valid_from {
            return Err(ChronoError::InvalidArgument(format!(
                "seal boundary {} must be greater than valid_from {}",
                valid_to, meta.valid_from
            )));
        }
        meta.valid_to = Some(valid_to);
        Self::persist(&self.meta_path, &meta)
    }

    /// Bump the persisted row count after a successful commit
    pub fn add_rows(&self, count: u64) -> ChronoResult<()> {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        meta.row_count += count;
        Self::persist(&self.meta_path, &meta)
    }

    fn persist(meta_path: &Path, meta: &ChunkMetadata) -> ChronoResult<()> {
        std::fs::write(meta_path, serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    pub fn data_file_name(sequence: u64) -> String {
        format!("{}{:04}.{}", CHUNK_FILE_PREFIX, sequence, DATA_EXTENSION)
    }

    pub fn meta_file_name(sequence: u64) -> String {
        format!("{}{:04}.{}", CHUNK_FILE_PREFIX, sequence, META_EXTENSION)
    }

    /// Parse the sequence number out of a chunk file name
    pub fn parse_sequence(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(CHUNK_FILE_PREFIX))
            .and_then(|s| s.parse().ok())
    }
}
