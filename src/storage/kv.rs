//! Ordered KV store contract over redb
//!
//! Each chunk data file (and the management store) is one redb database.
//! The core consumes it as an opaque ordered map with named tables:
//! point get, ordered-predecessor lookup, inclusive range scans, and
//! transactional commit/rollback. The "bogus" flavor is a snapshot read
//! transaction: side-effect free and non-durable by construction.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use redb::{Builder, Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};

use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::types::Order;

/// Table holding temporal-key -> row bytes
pub const DATA_TABLE: &str = "data";
/// Table holding big-endian timestamp -> commit metadata record
pub const COMMITS_TABLE: &str = "commits";
/// Management store table: branch name -> branch record
pub const BRANCHES_TABLE: &str = "branches";
/// Management store table: indexer descriptors and dirty flags
pub const MANAGEMENT_TABLE: &str = "management";

fn table_def(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Handle over one on-disk ordered KV database
pub struct KvStore {
    path: PathBuf,
    db: Database,
}

impl KvStore {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>, cache_bytes: usize) -> ChronoResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new().set_cache_size(cache_bytes).create(&path)?;
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a writable, durable transaction
    pub fn begin_write(&self) -> ChronoResult<KvTransaction> {
        Ok(KvTransaction::Write(self.db.begin_write()?))
    }

    /// Begin a bogus transaction: a read-only snapshot with no durability
    /// side effects, usable only for reads
    pub fn begin_read(&self) -> ChronoResult<KvTransaction> {
        Ok(KvTransaction::Read(self.db.begin_read()?))
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("path", &self.path).finish()
    }
}

/// One transaction over a [`KvStore`]
///
/// A read transaction answers every query against the snapshot it was
/// opened on; a write transaction additionally accepts `store` calls and
/// must be finished with `commit` or `rollback`.
pub enum KvTransaction {
    Write(redb::WriteTransaction),
    Read(redb::ReadTransaction),
}

/// Dispatch a read-style operation to whichever table flavor the
/// transaction carries, treating a missing table as empty.
macro_rules! with_table {
    ($self:expr, $table:expr, $missing:expr, $op:expr) => {
        match $self {
            KvTransaction::Write(txn) => match txn.open_table(table_def($table)) {
                Ok(t) => $op(&t),
                Err(TableError::TableDoesNotExist(_)) => Ok($missing),
                Err(e) => Err(e.into()),
            },
            KvTransaction::Read(txn) => match txn.open_table(table_def($table)) {
                Ok(t) => $op(&t),
                Err(TableError::TableDoesNotExist(_)) => Ok($missing),
                Err(e) => Err(e.into()),
            },
        }
    };
}

impl KvTransaction {
    pub fn is_writable(&self) -> bool {
        matches!(self, KvTransaction::Write(_))
    }

    /// Store a key/value pair in the named table
    pub fn store(&self, table: &str, key: &[u8], value: &[u8]) -> ChronoResult<()> {
        match self {
            KvTransaction::Write(txn) => {
                let mut t = txn.open_table(table_def(table))?;
                t.insert(key, value)?;
                Ok(())
            }
            KvTransaction::Read(_) => Err(ChronoError::StorageBackend(
                "store called on a read-only transaction".to_string(),
            )),
        }
    }

    /// Point lookup in the named table
    pub fn load(&self, table: &str, key: &[u8]) -> ChronoResult<Option<Vec<u8>>> {
        with_table!(self, table, None, |t: &_| load_in(t, key))
    }

    /// Greatest entry with key `<= upper`, if any
    pub fn floor(&self, table: &str, upper: &[u8]) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
        with_table!(self, table, None, |t: &_| floor_in(t, upper))
    }

    /// All entries with `lo <= key <= hi`, in the requested order
    pub fn scan(
        &self,
        table: &str,
        lo: &[u8],
        hi: &[u8],
        order: Order,
    ) -> ChronoResult<Vec<(Vec<u8>, Vec<u8>)>> {
        with_table!(self, table, Vec::new(), |t: &_| scan_in(
            t,
            Bound::Included(lo),
            Bound::Included(hi),
            order
        ))
    }

    /// Every entry in the named table, in the requested order
    pub fn scan_all(&self, table: &str, order: Order) -> ChronoResult<Vec<(Vec<u8>, Vec<u8>)>> {
        with_table!(self, table, Vec::new(), |t: &_| scan_in(
            t,
            Bound::Unbounded,
            Bound::Unbounded,
            order
        ))
    }

    /// The greatest entry in the named table, if any
    pub fn last(&self, table: &str) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
        with_table!(self, table, None, |t: &_| last_in(t))
    }

    /// Commit the transaction. For a read transaction this simply releases
    /// the snapshot.
    pub fn commit(self) -> ChronoResult<()> {
        match self {
            KvTransaction::Write(txn) => {
                txn.commit()?;
                Ok(())
            }
            KvTransaction::Read(_) => Ok(()),
        }
    }

    /// Roll the transaction back, discarding any writes
    pub fn rollback(self) -> ChronoResult<()> {
        match self {
            KvTransaction::Write(txn) => {
                txn.abort()?;
                Ok(())
            }
            KvTransaction::Read(_) => Ok(()),
        }
    }
}

fn load_in<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    key: &[u8],
) -> ChronoResult<Option<Vec<u8>>> {
    Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
}

fn floor_in<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    upper: &[u8],
) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
    let mut range = table.range::<&[u8]>((Bound::Unbounded, Bound::Included(upper)))?;
    match range.next_back() {
        Some(entry) => {
            let (k, v) = entry?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

fn last_in<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
) -> ChronoResult<Option<(Vec<u8>, Vec<u8>)>> {
    let mut range = table.range::<&[u8]>((Bound::<&[u8]>::Unbounded, Bound::<&[u8]>::Unbounded))?;
    match range.next_back() {
        Some(entry) => {
            let (k, v) = entry?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

fn scan_in<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    lo: Bound<&[u8]>,
    hi: Bound<&[u8]>,
    order: Order,
) -> ChronoResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut range = table.range::<&[u8]>((lo, hi))?;
    let mut out = Vec::new();
    match order {
        Order::Ascending => {
            for entry in range {
                let (k, v) = entry?;
                out.push((k.value().to_vec(), v.value().to_vec()));
            }
        }
        Order::Descending => {
            while let Some(entry) = range.next_back() {
                let (k, v) = entry?;
                out.push((k.value().to_vec(), v.value().to_vec()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CACHE: usize = 1024 * 1024;

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_write().unwrap();
        txn.store(DATA_TABLE, b"a", b"1").unwrap();
        txn.store(DATA_TABLE, b"b", b"2").unwrap();
        txn.commit().unwrap();

        let txn = store.begin_read().unwrap();
        assert_eq!(txn.load(DATA_TABLE, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.load(DATA_TABLE, b"c").unwrap(), None);
    }

    #[test]
    fn test_missing_table_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_read().unwrap();
        assert_eq!(txn.load(COMMITS_TABLE, b"x").unwrap(), None);
        assert!(txn
            .scan_all(COMMITS_TABLE, Order::Ascending)
            .unwrap()
            .is_empty());
        assert_eq!(txn.floor(COMMITS_TABLE, b"x").unwrap(), None);
        assert_eq!(txn.last(COMMITS_TABLE).unwrap(), None);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_write().unwrap();
        txn.store(DATA_TABLE, b"a", b"1").unwrap();
        txn.rollback().unwrap();

        let txn = store.begin_read().unwrap();
        assert_eq!(txn.load(DATA_TABLE, b"a").unwrap(), None);
    }

    #[test]
    fn test_read_transaction_rejects_store() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_read().unwrap();
        assert!(txn.store(DATA_TABLE, b"a", b"1").is_err());
    }

    #[test]
    fn test_floor() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_write().unwrap();
        txn.store(DATA_TABLE, b"b", b"1").unwrap();
        txn.store(DATA_TABLE, b"d", b"2").unwrap();
        txn.commit().unwrap();

        let txn = store.begin_read().unwrap();
        assert_eq!(
            txn.floor(DATA_TABLE, b"c").unwrap(),
            Some((b"b".to_vec(), b"1".to_vec()))
        );
        assert_eq!(
            txn.floor(DATA_TABLE, b"d").unwrap(),
            Some((b"d".to_vec(), b"2".to_vec()))
        );
        assert_eq!(txn.floor(DATA_TABLE, b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_orders() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let txn = store.begin_write().unwrap();
        for key in [b"a", b"b", b"c", b"d"] {
            txn.store(DATA_TABLE, key, key).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin_read().unwrap();
        let asc = txn.scan(DATA_TABLE, b"b", b"c", Order::Ascending).unwrap();
        assert_eq!(
            asc.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );

        let desc = txn.scan(DATA_TABLE, b"a", b"d", Order::Descending).unwrap();
        assert_eq!(desc.first().unwrap().0, b"d".to_vec());
        assert_eq!(desc.last().unwrap().0, b"a".to_vec());
    }

    #[test]
    fn test_snapshot_isolation_for_reads() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db"), CACHE).unwrap();

        let setup = store.begin_write().unwrap();
        setup.store(DATA_TABLE, b"a", b"old").unwrap();
        setup.commit().unwrap();

        let reader = store.begin_read().unwrap();
        let writer = store.begin_write().unwrap();
        writer.store(DATA_TABLE, b"a", b"new").unwrap();
        writer.commit().unwrap();

        // the earlier snapshot still sees the old value
        assert_eq!(
            reader.load(DATA_TABLE, b"a").unwrap(),
            Some(b"old".to_vec())
        );
        drop(reader);

        let fresh = store.begin_read().unwrap();
        assert_eq!(fresh.load(DATA_TABLE, b"a").unwrap(), Some(b"new".to_vec()));
    }
}
