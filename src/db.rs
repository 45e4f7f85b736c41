//! ChronoDB engine
//!
//! The engine orchestrates all components:
//! - Read path: resolver -> chunk manager -> temporal matrix -> caches
//! - Write path: commit pipeline -> head chunk -> index -> atomic publish
//!
//! Branch directory state lives behind an async RwLock; each branch
//! carries its own commit lock and a `last_committed` watermark published
//! with release ordering on commit and read with acquire ordering, so a
//! read issued after a successful commit always observes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use crate::cache::{CacheStatsSnapshot, QueryCache, ReadCache};
use crate::config::ChronoConfig;
use crate::index::{IndexBackend, IndexDocument, IndexExtractor, IndexModifications, IndexStats, SearchSpec, ValueExtractor};
use crate::storage::branch::{BranchChunkManager, BranchInfo};
use crate::storage::commit::{chain_lookup, CommitPipeline};
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::{KvStore, BRANCHES_TABLE, COMMITS_TABLE};
use crate::storage::matrix::TemporalMatrix;
use crate::storage::pool::GlobalChunkManager;
use crate::storage::resolver::BranchResolver;
use crate::storage::types::{
    validate_branch_name, validate_keyspace_and_key, validate_timestamp, CommitMetadata,
    ModificationRecord, Mutation, Order, RowValue, Timestamp, MASTER_BRANCH, OPEN_END,
};

/// Per-branch runtime state
struct BranchHandle {
    info: BranchInfo,
    manager: Arc<BranchChunkManager>,
    /// Serializes commits and rollovers on this branch
    commit_lock: tokio::sync::Mutex<()>,
    /// Timestamp of the last published commit; release/acquire ordered
    last_committed: AtomicU64,
}

impl BranchHandle {
    fn now(&self) -> Timestamp {
        self.last_committed.load(Ordering::Acquire)
    }
}

/// The temporal key-value store
pub struct ChronoDb {
    root: PathBuf,
    pool: Arc<GlobalChunkManager>,
    management: Arc<KvStore>,
    index: Arc<Mutex<IndexBackend>>,
    pipeline: CommitPipeline,
    branches: RwLock<HashMap<String, Arc<BranchHandle>>>,
    read_cache: Option<ReadCache>,
    query_cache: Option<QueryCache>,
    closed: AtomicBool,
}

impl ChronoDb {
    /// Open (or create) a store rooted at the given directory
    pub async fn open(root: impl Into<PathBuf>, config: ChronoConfig) -> ChronoResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let cache_bytes = config.storage.backend_cache_bytes;
        let management = Arc::new(KvStore::open(root.join("management.db"), cache_bytes)?);
        let pool = Arc::new(GlobalChunkManager::open(
            root.join("branches"),
            config.branches.max_open_files,
            cache_bytes,
        )?);

        // load persisted branch records, seeding master on first open
        let mut infos = Self::load_branch_records(&management)?;
        if !infos.contains_key(MASTER_BRANCH) {
            let master = BranchInfo::master();
            Self::persist_branch_record(&management, &master)?;
            infos.insert(MASTER_BRANCH.to_string(), master);
        }

        let mut branches = HashMap::new();
        for (name, info) in infos {
            let manager = if pool.has_branch(&name) {
                pool.branch_manager(&name)?
            } else {
                // a record without its directory: recover an empty one
                if !info.is_root() {
                    tracing::warn!("Recreating missing chunk directory for branch '{}'", name);
                }
                pool.create_branch_manager(&name, first_chunk_start(&info))?
            };
            let last_committed = Self::derive_last_committed(&pool, &manager, &info)?;
            branches.insert(
                name,
                Arc::new(BranchHandle {
                    info,
                    manager,
                    commit_lock: tokio::sync::Mutex::new(()),
                    last_committed: AtomicU64::new(last_committed),
                }),
            );
        }
        for name in pool.branch_names() {
            if !branches.contains_key(&name) {
                tracing::warn!("Ignoring branch directory without a record: '{}'", name);
            }
        }

        let index = Arc::new(Mutex::new(IndexBackend::open(&root, Arc::clone(&management))?));
        let pipeline = CommitPipeline::new(
            Arc::clone(&pool),
            Arc::clone(&index),
            config.storage.rollover_row_threshold,
        );

        let read_cache = config
            .cache
            .enabled
            .then(|| ReadCache::new(config.cache.max_size, config.cache.assume_immutable));
        let query_cache = config
            .query_cache
            .enabled
            .then(|| QueryCache::new(config.query_cache.max_size));

        tracing::info!(
            "Opened ChronoDB at {:?} with {} branches",
            root,
            branches.len()
        );

        Ok(Self {
            root,
            pool,
            management,
            index,
            pipeline,
            branches: RwLock::new(branches),
            read_cache,
            query_cache,
            closed: AtomicBool::new(false),
        })
    }

    /// Open with default configuration
    pub async fn open_default(root: impl Into<PathBuf>) -> ChronoResult<Self> {
        Self::open(root, ChronoConfig::default()).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_branch_records(management: &KvStore) -> ChronoResult<HashMap<String, BranchInfo>> {
        let txn = management.begin_read()?;
        let mut out = HashMap::new();
        for (_, value) in txn.scan_all(BRANCHES_TABLE, Order::Ascending)? {
            let info: BranchInfo = serde_json::from_slice(&value)?;
            out.insert(info.name.clone(), info);
        }
        Ok(out)
    }

    fn persist_branch_record(management: &KvStore, info: &BranchInfo) -> ChronoResult<()> {
        let txn = management.begin_write()?;
        txn.store(
            BRANCHES_TABLE,
            info.name.as_bytes(),
            &serde_json::to_vec(info)?,
        )?;
        txn.commit()
    }

    /// The last committed timestamp is derived from the commit log, never
    /// stored: after a crash, a timestamp is visible iff its commit record
    /// is durable.
    fn derive_last_committed(
        pool: &Arc<GlobalChunkManager>,
        manager: &Arc<BranchChunkManager>,
        info: &BranchInfo,
    ) -> ChronoResult<Timestamp> {
        for chunk in manager.chunks_in_range(0, OPEN_END - 1).iter().rev() {
            let txn = pool.open_bogus_transaction(chunk.data_path())?;
            if let Some((key, _)) = txn.last(COMMITS_TABLE)? {
                let mut buf = [0u8; 8];
                if key.len() == 8 {
                    buf.copy_from_slice(&key);
                    return Ok(u64::from_be_bytes(buf));
                }
            }
        }
        Ok(info.branching_timestamp)
    }

    async fn handle(&self, branch: &str) -> ChronoResult<Arc<BranchHandle>> {
        self.branches
            .read()
            .await
            .get(branch)
            .cloned()
            .ok_or_else(|| ChronoError::BranchUnknown(branch.to_string()))
    }

    async fn infos_snapshot(&self) -> HashMap<String, BranchInfo> {
        self.branches
            .read()
            .await
            .values()
            .map(|h| (h.info.name.clone(), h.info.clone()))
            .collect()
    }

    fn matrix(&self, manager: Arc<BranchChunkManager>) -> TemporalMatrix {
        TemporalMatrix::new(Arc::clone(&self.pool), manager)
    }

    // ==================== Reads ====================

    /// Point-in-time read: the live value of `(keyspace, key)` as of
    /// `timestamp` on the branch chain, or `None` if absent or deleted
    pub async fn get(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
    ) -> ChronoResult<Option<Vec<u8>>> {
        validate_keyspace_and_key(keyspace, key)?;
        validate_timestamp(timestamp)?;
        self.handle(branch).await?;

        if let Some(cache) = &self.read_cache {
            if let Some(cached) = cache.get(branch, keyspace, key, timestamp) {
                return Ok(cached.map(|value| value.as_ref().clone()));
            }
        }

        let infos = self.infos_snapshot().await;
        let value = chain_lookup(&self.pool, &infos, branch, keyspace, key, timestamp)?;

        if let Some(cache) = &self.read_cache {
            cache.insert(
                branch,
                keyspace,
                key,
                timestamp,
                value.clone().map(Arc::new),
            );
        }
        Ok(value)
    }

    /// The branch's last committed timestamp; `0` when nothing was ever
    /// committed on the root branch, the branching timestamp for a fresh
    /// fork
    pub async fn get_now(&self, branch: &str) -> ChronoResult<Timestamp> {
        Ok(self.handle(branch).await?.now())
    }

    /// Version timestamps of `(keyspace, key)` up to `timestamp`, walking
    /// the branch chain
    pub async fn history(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
        order: Order,
    ) -> ChronoResult<Vec<Timestamp>> {
        validate_keyspace_and_key(keyspace, key)?;
        validate_timestamp(timestamp)?;
        let infos = self.infos_snapshot().await;
        let mut steps = BranchResolver::resolve(&infos, branch, timestamp)?;
        if order == Order::Ascending {
            // nearest-first becomes oldest-first
            steps.reverse();
        }

        let mut out = Vec::new();
        for step in steps {
            let manager = self.pool.branch_manager(&step.branch)?;
            let matrix = self.matrix(manager);
            for t in matrix.history(keyspace, key, step.upper, order) {
                out.push(t?);
            }
        }
        Ok(out)
    }

    /// Every row stored on the branch (branch-local) in `[lo, hi]`
    pub async fn modifications_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
    ) -> ChronoResult<Vec<ModificationRecord>> {
        let handle = self.handle(branch).await?;
        let matrix = self.matrix(Arc::clone(&handle.manager));
        let mut out = Vec::new();
        for record in matrix.modifications_between(lo, hi) {
            out.push(record?);
        }
        Ok(out)
    }

    /// Number of rows stored on the branch in `[lo, hi]`
    pub async fn modification_count(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
    ) -> ChronoResult<u64> {
        let handle = self.handle(branch).await?;
        self.matrix(Arc::clone(&handle.manager)).count_between(lo, hi)
    }

    /// Commit timestamps on the branch in `[lo, hi]`
    pub async fn commit_timestamps_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        order: Order,
    ) -> ChronoResult<Vec<Timestamp>> {
        Ok(self
            .commit_metadata_between(branch, lo, hi, order)
            .await?
            .into_iter()
            .map(|m| m.timestamp)
            .collect())
    }

    /// Commit metadata records on the branch in `[lo, hi]`
    pub async fn commit_metadata_between(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        order: Order,
    ) -> ChronoResult<Vec<CommitMetadata>> {
        if lo > hi {
            return Err(ChronoError::InvalidArgument(format!(
                "invalid range: {} > {}",
                lo, hi
            )));
        }
        let handle = self.handle(branch).await?;
        let mut chunks = handle.manager.chunks_in_range(lo, hi);
        if order == Order::Descending {
            chunks.reverse();
        }
        let mut out = Vec::new();
        for chunk in chunks {
            let txn = self.pool.open_bogus_transaction(chunk.data_path())?;
            let rows = txn.scan(
                COMMITS_TABLE,
                &lo.to_be_bytes(),
                &hi.to_be_bytes(),
                order,
            )?;
            for (_, value) in rows {
                out.push(serde_json::from_slice(&value)?);
            }
        }
        Ok(out)
    }

    /// One page of commit metadata records, newest-first pages when
    /// descending
    pub async fn commit_metadata_paged(
        &self,
        branch: &str,
        lo: Timestamp,
        hi: Timestamp,
        page_size: usize,
        page_index: usize,
        order: Order,
    ) -> ChronoResult<Vec<CommitMetadata>> {
        if page_size == 0 {
            return Err(ChronoError::InvalidArgument(
                "page_size must be positive".to_string(),
            ));
        }
        let all = self.commit_metadata_between(branch, lo, hi, order).await?;
        Ok(all
            .into_iter()
            .skip(page_size * page_index)
            .take(page_size)
            .collect())
    }

    /// The commit metadata stored at exactly `timestamp`, if any
    pub async fn commit_metadata_at(
        &self,
        branch: &str,
        timestamp: Timestamp,
    ) -> ChronoResult<Option<CommitMetadata>> {
        let handle = self.handle(branch).await?;
        let chunk = match handle.manager.chunk_for_timestamp(timestamp) {
            Ok(chunk) => chunk,
            Err(ChronoError::ChunkMissing { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let txn = self.pool.open_bogus_transaction(chunk.data_path())?;
        match txn.load(COMMITS_TABLE, &timestamp.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Distinct keyspaces visible on the branch chain at `timestamp`
    pub async fn keyspaces(&self, branch: &str, timestamp: Timestamp) -> ChronoResult<Vec<String>> {
        let infos = self.infos_snapshot().await;
        let steps = BranchResolver::resolve(&infos, branch, timestamp)?;
        let mut out = BTreeSet::new();
        for step in steps {
            let manager = self.pool.branch_manager(&step.branch)?;
            out.extend(self.matrix(manager).keyspaces(step.upper)?);
        }
        Ok(out.into_iter().collect())
    }

    // ==================== Writes ====================

    /// Commit a batch of mutations (plus optional metadata payload) on the
    /// branch, returning the new timestamp
    ///
    /// Visibility is all-or-nothing. If the index write fails after the
    /// base data is durable, the new timestamp is still published, the
    /// index is marked dirty, and `IndexWriteFailed` is returned.
    pub async fn commit(
        &self,
        branch: &str,
        mutations: Vec<Mutation>,
        payload: Option<Vec<u8>>,
    ) -> ChronoResult<Timestamp> {
        let handle = self.handle(branch).await?;
        let _guard = handle.commit_lock.lock().await;

        let last_committed = handle.now();
        let infos = self.infos_snapshot().await;
        let outcome =
            self.pipeline
                .execute(&infos, branch, last_committed, mutations, payload)?;

        // base data is durable: publish, then invalidate caches
        handle
            .last_committed
            .store(outcome.timestamp, Ordering::Release);

        let mut affected = BranchResolver::descendants(&infos, branch);
        affected.push(branch.to_string());
        if let Some(cache) = &self.read_cache {
            cache.invalidate(&affected, &outcome.touched);
        }
        if let Some(cache) = &self.query_cache {
            cache.invalidate_branches(&affected);
        }

        match outcome.index_error {
            Some(e) => Err(ChronoError::IndexWriteFailed(format!(
                "commit at t={} on '{}': {}",
                outcome.timestamp, branch, e
            ))),
            None => Ok(outcome.timestamp),
        }
    }

    /// Seal the branch's head chunk and open a new one
    pub async fn perform_rollover(&self, branch: &str) -> ChronoResult<()> {
        let handle = self.handle(branch).await?;
        let _guard = handle.commit_lock.lock().await;

        let now = handle.now();
        if now < handle.manager.head_chunk().period().from() {
            return Err(ChronoError::InvalidArgument(format!(
                "head chunk of branch '{}' has no commits to roll over",
                branch
            )));
        }
        handle.manager.perform_rollover(now)?;
        Ok(())
    }

    // ==================== Branch management ====================

    /// Fork a new branch off `origin` at `branching_timestamp`
    ///
    /// Reads on the new branch at or before the fork point are answered by
    /// the origin chain; commits start at `branching_timestamp + 1`.
    pub async fn create_branch(
        &self,
        name: &str,
        origin: &str,
        branching_timestamp: Timestamp,
    ) -> ChronoResult<()> {
        validate_branch_name(name)?;
        validate_timestamp(branching_timestamp)?;

        let mut branches = self.branches.write().await;
        if branches.contains_key(name) {
            return Err(ChronoError::InvalidArgument(format!(
                "branch '{}' already exists",
                name
            )));
        }
        let origin_handle = branches
            .get(origin)
            .cloned()
            .ok_or_else(|| ChronoError::BranchUnknown(origin.to_string()))?;
        if branching_timestamp > origin_handle.now() {
            return Err(ChronoError::InvalidArgument(format!(
                "cannot branch at {} : origin '{}' is only at {}",
                branching_timestamp,
                origin,
                origin_handle.now()
            )));
        }

        let info = BranchInfo::fork(name, origin, branching_timestamp);
        // record first, directory second: a record without its directory
        // is recovered on reopen, the reverse is only warned about
        Self::persist_branch_record(&self.management, &info)?;
        let manager = self
            .pool
            .create_branch_manager(name, first_chunk_start(&info))?;

        branches.insert(
            name.to_string(),
            Arc::new(BranchHandle {
                info,
                manager,
                commit_lock: tokio::sync::Mutex::new(()),
                last_committed: AtomicU64::new(branching_timestamp),
            }),
        );
        tracing::info!(
            "Created branch '{}' from '{}' at t={}",
            name,
            origin,
            branching_timestamp
        );
        Ok(())
    }

    pub async fn has_branch(&self, name: &str) -> bool {
        self.branches.read().await.contains_key(name)
    }

    /// All branch names, sorted
    pub async fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn branch_info(&self, name: &str) -> ChronoResult<BranchInfo> {
        Ok(self.handle(name).await?.info.clone())
    }

    // ==================== Index management ====================

    /// Register a runtime implementation for named extractors
    pub async fn register_extractor(
        &self,
        name: impl Into<String>,
        extractor: Arc<dyn ValueExtractor>,
    ) {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register_extractor(name, extractor);
    }

    /// Register (or extend) a secondary index; it stays dirty until
    /// rebuilt
    pub async fn create_index(&self, name: &str, extractor: IndexExtractor) -> ChronoResult<()> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .create_index(name, extractor)
    }

    /// Drop an index with its documents and dirty flag
    pub async fn drop_index(&self, name: &str) -> ChronoResult<()> {
        if let Some(cache) = &self.query_cache {
            cache.clear();
        }
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drop_index(name)
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .index_names()
    }

    pub async fn is_index_dirty(&self, name: &str) -> ChronoResult<bool> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_dirty(name)
    }

    pub async fn dirty_indices(&self) -> Vec<String> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dirty_indices()
    }

    pub async fn index_stats(&self) -> IndexStats {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    /// Rebuild one index from base data across every branch, clearing its
    /// dirty flag
    pub async fn rebuild_index(&self, name: &str) -> ChronoResult<()> {
        let infos = self.infos_snapshot().await;
        let handles: Vec<Arc<BranchHandle>> =
            self.branches.read().await.values().cloned().collect();

        let mut backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
        if !backend.has_index(name) {
            return Err(ChronoError::IndexUnknown(name.to_string()));
        }
        backend.clear_index(name)?;

        let mut creations: Vec<IndexDocument> = Vec::new();
        for handle in &handles {
            let branch = &handle.info.name;
            let now = handle.now();
            let matrix = self.matrix(Arc::clone(&handle.manager));

            // group the branch-local versions of every key
            let mut versions: BTreeMap<(String, String), Vec<Timestamp>> = BTreeMap::new();
            for record in matrix.modifications_between(0, now) {
                let record = record?;
                versions
                    .entry((record.keyspace, record.key))
                    .or_default()
                    .push(record.timestamp);
            }

            for ((keyspace, key), mut timestamps) in versions {
                timestamps.sort_unstable();
                // open value intervals: (value, since)
                let mut open: Vec<(crate::index::IndexValue, Timestamp)> = Vec::new();

                // values inherited from the origin before the first local
                // write become branch-local shadows
                if handle.info.origin.is_some() {
                    let first = timestamps[0];
                    if let Some(bytes) =
                        chain_lookup(&self.pool, &infos, branch, &keyspace, &key, first - 1)?
                    {
                        let since = handle.info.branching_timestamp + 1;
                        for value in backend.extract_values(name, &bytes)? {
                            open.push((value, since));
                        }
                    }
                }

                for &t in &timestamps {
                    let new_values = match matrix.get_version(&keyspace, &key, t)? {
                        Some(RowValue::Value(bytes)) => backend.extract_values(name, &bytes)?,
                        _ => Vec::new(),
                    };
                    // close intervals whose value disappeared
                    let mut still_open = Vec::new();
                    for (value, since) in open.drain(..) {
                        if new_values.contains(&value) {
                            still_open.push((value, since));
                        } else if since < t {
                            creations.push(IndexDocument::new(
                                branch, &keyspace, &key, name, value, since, t,
                            ));
                        }
                    }
                    open = still_open;
                    // open intervals for values that appeared
                    for value in new_values {
                        if !open.iter().any(|(v, _)| *v == value) {
                            open.push((value, t));
                        }
                    }
                }
                for (value, since) in open {
                    creations.push(IndexDocument::new(
                        branch, &keyspace, &key, name, value, since, OPEN_END,
                    ));
                }
            }
        }

        backend.apply_modifications(&IndexModifications {
            creations,
            ..Default::default()
        })?;
        backend.set_dirty(name, false)?;
        tracing::info!("Rebuilt index '{}'", name);
        Ok(())
    }

    /// Rebuild every registered index
    pub async fn rebuild_all_indices(&self) -> ChronoResult<()> {
        for name in self.index_names().await {
            self.rebuild_index(&name).await?;
        }
        Ok(())
    }

    /// Keys on the branch chain whose indexed value satisfies the search
    /// spec at `timestamp`, sorted
    ///
    /// A key decided by a nearer branch (any local document at or before
    /// the step's effective timestamp) masks ancestor documents for that
    /// key.
    pub async fn query_index(
        &self,
        branch: &str,
        keyspace: &str,
        timestamp: Timestamp,
        spec: &SearchSpec,
    ) -> ChronoResult<Vec<String>> {
        validate_timestamp(timestamp)?;
        let infos = self.infos_snapshot().await;
        let steps = BranchResolver::resolve(&infos, branch, timestamp)?;

        {
            let backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
            backend.ensure_queryable(&spec.index_name)?;
        }

        let spec_key = spec.cache_key();
        if let Some(cache) = &self.query_cache {
            if let Some(cached) = cache.get(branch, keyspace, timestamp, &spec_key) {
                return Ok(cached.as_ref().clone());
            }
        }

        let mut matches = BTreeSet::new();
        let mut decided = BTreeSet::new();
        {
            let backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
            for step in steps {
                let local =
                    backend.get_matching_local(&step.branch, keyspace, step.upper, spec)?;
                for doc in local {
                    if !decided.contains(&doc.key) {
                        matches.insert(doc.key);
                    }
                }
                let touched = backend.touched_keys_local(
                    &step.branch,
                    keyspace,
                    &spec.index_name,
                    step.upper,
                )?;
                decided.extend(touched);
            }
        }

        let result: Vec<String> = matches.into_iter().collect();
        if let Some(cache) = &self.query_cache {
            cache.insert(
                branch,
                keyspace,
                timestamp,
                &spec_key,
                Arc::new(result.clone()),
            );
        }
        Ok(result)
    }

    // ==================== Statistics & lifecycle ====================

    pub async fn stats(&self) -> DbStats {
        let branches = self.branches.read().await;
        let chunk_count = branches.values().map(|h| h.manager.chunk_count()).sum();
        DbStats {
            branch_count: branches.len(),
            chunk_count,
            open_files: self.pool.open_handle_count(),
            index_documents: self
                .index
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .document_count()
                .unwrap_or(0),
        }
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            read: self.read_cache.as_ref().map(|c| c.stats()),
            query: self.query_cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Close every pooled handle and checkpoint the index store;
    /// idempotent
    pub async fn shutdown(&self) -> ChronoResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = backend.checkpoint() {
                tracing::warn!("Index checkpoint on shutdown failed: {}", e);
            }
        }
        self.pool.shutdown();
        tracing::info!("ChronoDB at {:?} shut down", self.root);
        Ok(())
    }
}

/// First chunk start for a branch: the root covers from 0, a fork covers
/// from just past its branching timestamp
fn first_chunk_start(info: &BranchInfo) -> Timestamp {
    if info.is_root() {
        0
    } else {
        info.branching_timestamp + 1
    }
}

/// Store-wide statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub branch_count: usize,
    pub chunk_count: usize,
    pub open_files: usize,
    pub index_documents: u64,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Branches: {}, Chunks: {}, Open files: {}, Index documents: {}",
            self.branch_count, self.chunk_count, self.open_files, self.index_documents
        )
    }
}

/// Hit/miss statistics for the enabled caches
#[derive(Debug, Clone, Default)]
pub struct CacheStatsReport {
    pub read: Option<CacheStatsSnapshot>,
    pub query: Option<CacheStatsSnapshot>,
}
