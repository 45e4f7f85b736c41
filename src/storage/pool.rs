//! Process-wide pool of open chunk databases
//!
//! Chunk data files are the scarce resource: the pool keeps at most
//! `max_open_files` of them open, evicting the LRU-coldest handles whose
//! transaction refcount is zero. A handle with live transactions is never
//! evicted; when every handle is busy the pool temporarily exceeds its
//! bound rather than block or deadlock.
//!
//! Lock discipline: one readers/writer lock guards the branch directory
//! (branch creation takes the writer side); one mutex guards the handle
//! pool, its LRU order, and transaction registration. The pool mutex is
//! held while a handle is opened, but never across chunk reads or writes.
//!
//! Transactions notify the pool on close through a drop ticket that holds
//! only the pool state, not the manager itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::storage::branch::BranchChunkManager;
use crate::storage::chunk::ChunkFile;
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::{KvStore, KvTransaction};
use crate::storage::types::{Order, Timestamp};

/// Default bound on concurrently open chunk files
pub const DEFAULT_MAX_OPEN_FILES: usize = 5;

struct PoolEntry {
    store: Arc<KvStore>,
    open_txns: usize,
}

struct PoolState {
    max_open_files: usize,
    entries: HashMap<PathBuf, PoolEntry>,
    /// Most recently used first
    lru: Vec<PathBuf>,
}

impl PoolState {
    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.lru.iter().position(|p| p == path) {
            self.lru.remove(pos);
        }
        self.lru.insert(0, path.to_path_buf());
    }

    fn release(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.open_txns = entry.open_txns.saturating_sub(1);
        }
        self.evict_cold();
    }

    /// Close LRU-coldest idle handles until the pool is within bounds.
    /// Busy handles are skipped; the pool may stay over the bound until
    /// their transactions close.
    fn evict_cold(&mut self) {
        if self.entries.len() <= self.max_open_files {
            return;
        }
        let mut idx = self.lru.len();
        while idx > 0 && self.entries.len() > self.max_open_files {
            idx -= 1;
            let path = self.lru[idx].clone();
            let idle = self
                .entries
                .get(&path)
                .map(|e| e.open_txns == 0)
                .unwrap_or(false);
            if idle {
                self.entries.remove(&path);
                self.lru.remove(idx);
                tracing::debug!("Evicted idle chunk handle {:?}", path);
            }
        }
    }
}

/// Drop ticket registered with every pooled transaction
///
/// Deregisters the transaction and triggers eviction when dropped. Holds
/// only the pool state so the transaction never references the manager.
pub(crate) struct HandleTicket {
    pool: Arc<Mutex<PoolState>>,
    path: PathBuf,
}

impl Drop for HandleTicket {
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.release(&self.path);
    }
}

/// A KV transaction checked out of the pool
///
/// Dropping it without `commit` rolls the underlying transaction back and
/// releases the handle either way.
pub struct PooledTransaction {
    // field order matters: the inner transaction must drop (and abort)
    // before the ticket releases the handle
    txn: Option<KvTransaction>,
    _ticket: HandleTicket,
}

impl PooledTransaction {
    fn inner(&self) -> &KvTransaction {
        self.txn.as_ref().expect("transaction already closed")
    }

    pub fn is_writable(&self) -> bool {
        self.inner().is_writable()
    }

    pub fn store(&self, table: &str, key: &[u8], value: &[u8]) -> ChronoResult<()> {
        self.inner().store(table, key, value)
    }

    pub fn load(&self, table: &str, key: &[u8]) -> ChronoResult<Option<Vec<u8>>> {
        self.inner().load(table, key)
    }

    pub fn floor(&self, table: &str, upper: &[u8]) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.inner().floor(table, upper)
    }

    pub fn scan(
        &self,
        table: &str,
        lo: &[u8],
        hi: &[u8],
        order: Order,
    ) -> ChronoResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner().scan(table, lo, hi, order)
    }

    pub fn scan_all(&self, table: &str, order: Order) -> ChronoResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner().scan_all(table, order)
    }

    pub fn last(&self, table: &str) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.inner().last(table)
    }

    pub fn commit(mut self) -> ChronoResult<()> {
        match self.txn.take() {
            Some(txn) => txn.commit(),
            None => Ok(()),
        }
    }

    pub fn rollback(mut self) -> ChronoResult<()> {
        match self.txn.take() {
            Some(txn) => txn.rollback(),
            None => Ok(()),
        }
    }
}

/// A pooled transaction bound to the chunk it was resolved against
pub struct ChunkTransaction {
    txn: PooledTransaction,
    chunk: Arc<ChunkFile>,
}

impl ChunkTransaction {
    pub fn txn(&self) -> &PooledTransaction {
        &self.txn
    }

    pub fn chunk(&self) -> &Arc<ChunkFile> {
        &self.chunk
    }

    pub fn commit(self) -> ChronoResult<()> {
        self.txn.commit()
    }

    pub fn rollback(self) -> ChronoResult<()> {
        self.txn.rollback()
    }
}

/// Process-wide manager of branch chunk directories and open chunk handles
pub struct GlobalChunkManager {
    branches_dir: PathBuf,
    backend_cache_bytes: usize,
    branch_managers: RwLock<HashMap<String, Arc<BranchChunkManager>>>,
    pool: Arc<Mutex<PoolState>>,
}

impl GlobalChunkManager {
    /// Open the manager over the branches directory, discovering existing
    /// branch subdirectories
    pub fn open(
        branches_dir: impl Into<PathBuf>,
        max_open_files: usize,
        backend_cache_bytes: usize,
    ) -> ChronoResult<Self> {
        let branches_dir = branches_dir.into();
        std::fs::create_dir_all(&branches_dir)?;

        let mut branch_managers = HashMap::new();
        for entry in std::fs::read_dir(&branches_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let manager = BranchChunkManager::open(&path, &name, backend_cache_bytes)?;
            branch_managers.insert(name, Arc::new(manager));
        }

        Ok(Self {
            branches_dir,
            backend_cache_bytes,
            branch_managers: RwLock::new(branch_managers),
            pool: Arc::new(Mutex::new(PoolState {
                max_open_files,
                entries: HashMap::new(),
                lru: Vec::new(),
            })),
        })
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.branch_managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branch_managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn branch_manager(&self, name: &str) -> ChronoResult<Arc<BranchChunkManager>> {
        self.branch_managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ChronoError::BranchUnknown(name.to_string()))
    }

    /// Create the chunk directory for a new branch
    ///
    /// Takes the writer side of the branch directory lock.
    pub fn create_branch_manager(
        &self,
        name: &str,
        initial_valid_from: Timestamp,
    ) -> ChronoResult<Arc<BranchChunkManager>> {
        let mut managers = self
            .branch_managers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = managers.get(name) {
            return Ok(Arc::clone(existing));
        }
        let dir = self.branches_dir.join(name);
        let manager = Arc::new(BranchChunkManager::create(
            dir,
            name,
            initial_valid_from,
            self.backend_cache_bytes,
        )?);
        managers.insert(name.to_string(), Arc::clone(&manager));
        tracing::info!("Created chunk directory for branch '{}'", name);
        Ok(manager)
    }

    /// Resolve branch and timestamp to a chunk, then open a durable
    /// transaction on that chunk's database
    pub fn open_transaction(&self, branch: &str, timestamp: Timestamp) -> ChronoResult<ChunkTransaction> {
        let manager = self.branch_manager(branch)?;
        let chunk = manager.chunk_for_timestamp(timestamp)?;
        let txn = self.open_transaction_on(chunk.data_path(), true)?;
        Ok(ChunkTransaction { txn, chunk })
    }

    /// Open a durable write transaction on the given chunk data file
    pub fn open_write_transaction(&self, file: &Path) -> ChronoResult<PooledTransaction> {
        self.open_transaction_on(file, true)
    }

    /// Open a bogus transaction: read-only, no durability side effects
    pub fn open_bogus_transaction(&self, file: &Path) -> ChronoResult<PooledTransaction> {
        self.open_transaction_on(file, false)
    }

    fn open_transaction_on(&self, file: &Path, durable: bool) -> ChronoResult<PooledTransaction> {
        // register the transaction and fetch the handle under the pool
        // mutex; the transaction itself begins after the mutex is released
        let store = {
            let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
            let store = match pool.entries.get_mut(file) {
                Some(entry) => {
                    entry.open_txns += 1;
                    Arc::clone(&entry.store)
                }
                None => {
                    let store = Arc::new(KvStore::open(file, self.backend_cache_bytes)?);
                    pool.entries.insert(
                        file.to_path_buf(),
                        PoolEntry {
                            store: Arc::clone(&store),
                            open_txns: 1,
                        },
                    );
                    store
                }
            };
            pool.touch(file);
            store
        };

        let ticket = HandleTicket {
            pool: Arc::clone(&self.pool),
            path: file.to_path_buf(),
        };
        let txn = if durable {
            store.begin_write()
        } else {
            store.begin_read()
        };
        match txn {
            Ok(txn) => Ok(PooledTransaction {
                txn: Some(txn),
                _ticket: ticket,
            }),
            // the ticket drop deregisters the failed attempt
            Err(e) => Err(e),
        }
    }

    /// Ensure no open handle remains for the given file
    ///
    /// Fails with `HandleBusy` while transactions are still registered
    /// against it; callers must close them first.
    pub fn ensure_closed(&self, file: &Path) -> ChronoResult<()> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        match pool.entries.get(file) {
            None => Ok(()),
            Some(entry) if entry.open_txns > 0 => {
                Err(ChronoError::HandleBusy(file.to_path_buf()))
            }
            Some(_) => {
                pool.entries.remove(file);
                if let Some(pos) = pool.lru.iter().position(|p| p == file) {
                    pool.lru.remove(pos);
                }
                Ok(())
            }
        }
    }

    /// Number of currently open chunk handles
    pub fn open_handle_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Close every handle unconditionally
    pub fn shutdown(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let count = pool.entries.len();
        pool.entries.clear();
        pool.lru.clear();
        tracing::info!("Chunk pool shut down, {} handles closed", count);
    }
}

impl std::fmt::Debug for GlobalChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalChunkManager")
            .field("branches_dir", &self.branches_dir)
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::DATA_TABLE;
    use crate::storage::types::MASTER_BRANCH;
    use tempfile::tempdir;

    const CACHE: usize = 1024 * 1024;

    fn manager_with_master(dir: &Path) -> GlobalChunkManager {
        let gcm = GlobalChunkManager::open(dir.join("branches"), DEFAULT_MAX_OPEN_FILES, CACHE)
            .unwrap();
        gcm.create_branch_manager(MASTER_BRANCH, 0).unwrap();
        gcm
    }

    #[test]
    fn test_open_transaction_resolves_chunk() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());

        let txn = gcm.open_transaction(MASTER_BRANCH, 3).unwrap();
        assert!(txn.txn().is_writable());
        assert_eq!(txn.chunk().sequence(), 0);
        txn.commit().unwrap();
    }

    #[test]
    fn test_unknown_branch() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());
        assert!(matches!(
            gcm.open_transaction("nope", 0),
            Err(ChronoError::BranchUnknown(_))
        ));
    }

    #[test]
    fn test_bogus_transaction_is_read_only() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());
        let head = gcm
            .branch_manager(MASTER_BRANCH)
            .unwrap()
            .head_chunk();

        let txn = gcm.open_bogus_transaction(head.data_path()).unwrap();
        assert!(!txn.is_writable());
        assert!(txn.store(DATA_TABLE, b"k", b"v").is_err());
    }

    #[test]
    fn test_pool_caps_open_files() {
        let dir = tempdir().unwrap();
        let gcm = GlobalChunkManager::open(dir.path().join("branches"), 5, CACHE).unwrap();

        // seven distinct chunk files across seven branches
        let mut heads = Vec::new();
        for i in 0..7 {
            let name = format!("b{}", i);
            let manager = gcm.create_branch_manager(&name, 0).unwrap();
            heads.push(manager.head_chunk());
        }

        // open a transaction on each, all concurrently live
        let txns: Vec<_> = heads
            .iter()
            .map(|h| gcm.open_bogus_transaction(h.data_path()).unwrap())
            .collect();
        assert_eq!(gcm.open_handle_count(), 7);

        // while live, nothing may be evicted
        drop(txns);

        // once all transactions are closed the pool shrinks to its bound
        assert!(gcm.open_handle_count() <= 5);
    }

    #[test]
    fn test_busy_handle_never_evicted() {
        let dir = tempdir().unwrap();
        let gcm = GlobalChunkManager::open(dir.path().join("branches"), 2, CACHE).unwrap();

        let first = gcm.create_branch_manager("b0", 0).unwrap().head_chunk();
        let held = gcm.open_bogus_transaction(first.data_path()).unwrap();

        // churn through other files to pressure the pool
        for i in 1..6 {
            let head = gcm
                .create_branch_manager(&format!("b{}", i), 0)
                .unwrap()
                .head_chunk();
            let txn = gcm.open_bogus_transaction(head.data_path()).unwrap();
            drop(txn);
        }

        // the held handle must have survived: reads still work
        assert_eq!(held.load(DATA_TABLE, b"x").unwrap(), None);
        assert!(gcm.open_handle_count() <= 3);
        drop(held);
        assert!(gcm.open_handle_count() <= 2);
    }

    #[test]
    fn test_ensure_closed() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());
        let head = gcm.branch_manager(MASTER_BRANCH).unwrap().head_chunk();

        // no handle open yet: trivially fine
        gcm.ensure_closed(head.data_path()).unwrap();

        let txn = gcm.open_bogus_transaction(head.data_path()).unwrap();
        assert!(matches!(
            gcm.ensure_closed(head.data_path()),
            Err(ChronoError::HandleBusy(_))
        ));
        drop(txn);

        gcm.ensure_closed(head.data_path()).unwrap();
        assert_eq!(gcm.open_handle_count(), 0);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());
        let head = gcm.branch_manager(MASTER_BRANCH).unwrap().head_chunk();

        let txn = gcm.open_bogus_transaction(head.data_path()).unwrap();
        drop(txn);
        assert_eq!(gcm.open_handle_count(), 1);

        gcm.shutdown();
        assert_eq!(gcm.open_handle_count(), 0);
    }

    #[test]
    fn test_writes_survive_commit() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());

        let txn = gcm.open_transaction(MASTER_BRANCH, 1).unwrap();
        txn.txn().store(DATA_TABLE, b"k", b"v").unwrap();
        txn.commit().unwrap();

        let head = gcm.branch_manager(MASTER_BRANCH).unwrap().head_chunk();
        let reader = gcm.open_bogus_transaction(head.data_path()).unwrap();
        assert_eq!(reader.load(DATA_TABLE, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_dropped_write_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let gcm = manager_with_master(dir.path());

        {
            let txn = gcm.open_transaction(MASTER_BRANCH, 1).unwrap();
            txn.txn().store(DATA_TABLE, b"k", b"v").unwrap();
            // dropped without commit
        }

        let head = gcm.branch_manager(MASTER_BRANCH).unwrap().head_chunk();
        let reader = gcm.open_bogus_transaction(head.data_path()).unwrap();
        assert_eq!(reader.load(DATA_TABLE, b"k").unwrap(), None);
    }
}
