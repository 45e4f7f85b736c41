//! SQLite-backed index document store
//!
//! Documents live in a single SQLite database under
//! `temporalIndex_master/`, with secondary indices on the document
//! identity `(branch, keyspace, key, index_name)` and on `valid_to`.
//! The indexer descriptors and the per-index dirty flags are persisted
//! as management keys in the management KV store, not in SQLite, so a
//! torn index database can always be rebuilt from base data.
//!
//! The backend is single-writer (the commit pipeline) and multi-reader;
//! callers serialize access through a mutex because the connection is
//! not Sync.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OpenFlags};

use crate::index::extractor::{ExtractorRegistry, IndexExtractor, IndexerMap, ValueExtractor};
use crate::index::{
    IndexDocument, IndexModifications, IndexStats, IndexValue, SearchSpec, INDEX_DIRECTORY,
    MANAGEMENT_KEY_DIRTY, MANAGEMENT_KEY_INDEXERS,
};
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::{KvStore, MANAGEMENT_TABLE};
use crate::storage::types::{Timestamp, MASTER_BRANCH, OPEN_END};

const VALUE_KIND_TEXT: i64 = 0;
const VALUE_KIND_LONG: i64 = 1;
const VALUE_KIND_DOUBLE: i64 = 2;

/// Document store with validity intervals and persisted indexer state
pub struct IndexBackend {
    conn: Connection,
    management: Arc<KvStore>,
    registry: ExtractorRegistry,
    indexers: IndexerMap,
    dirty: BTreeMap<String, bool>,
}

impl IndexBackend {
    /// Open (or create) the index store under the given root directory
    pub fn open(root: &Path, management: Arc<KvStore>) -> ChronoResult<Self> {
        let index_dir = root.join(INDEX_DIRECTORY);
        std::fs::create_dir_all(&index_dir)?;
        let path = index_dir.join("index.db");

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                branch TEXT NOT NULL,
                keyspace TEXT NOT NULL,
                key TEXT NOT NULL,
                index_name TEXT NOT NULL,
                value_kind INTEGER NOT NULL,
                value_text TEXT,
                value_int INTEGER,
                value_real REAL,
                valid_from INTEGER NOT NULL,
                valid_to INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_identity
             ON documents(branch, keyspace, key, index_name)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_valid_to ON documents(valid_to)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lookup
             ON documents(branch, keyspace, index_name, valid_from)",
            [],
        )?;

        let indexers = load_management_map::<IndexerMap>(&management, MANAGEMENT_KEY_INDEXERS)?
            .unwrap_or_default();
        let dirty = load_management_map::<BTreeMap<String, bool>>(&management, MANAGEMENT_KEY_DIRTY)?
            .unwrap_or_default();

        Ok(Self {
            conn,
            management,
            registry: ExtractorRegistry::new(),
            indexers,
            dirty,
        })
    }

    // ==================== Indexer management ====================

    /// Register (or extend) an index with one more extractor
    ///
    /// A new or extended index is dirty until rebuilt: its documents do
    /// not yet reflect the existing base data.
    pub fn create_index(&mut self, name: &str, extractor: IndexExtractor) -> ChronoResult<()> {
        if name.is_empty() {
            return Err(ChronoError::InvalidArgument(
                "index name must not be empty".to_string(),
            ));
        }
        let extractors = self.indexers.entry(name.to_string()).or_default();
        if !extractors.contains(&extractor) {
            extractors.push(extractor);
        }
        self.persist_indexers()?;
        self.dirty.insert(name.to_string(), true);
        self.persist_dirty()?;
        tracing::info!("Registered index '{}' (dirty until rebuilt)", name);
        Ok(())
    }

    /// Remove an index: its descriptor, dirty flag, and every document
    pub fn drop_index(&mut self, name: &str) -> ChronoResult<()> {
        if self.indexers.remove(name).is_none() {
            return Err(ChronoError::IndexUnknown(name.to_string()));
        }
        self.persist_indexers()?;
        self.dirty.remove(name);
        self.persist_dirty()?;
        self.conn
            .execute("DELETE FROM documents WHERE index_name = ?", params![name])?;
        tracing::info!("Dropped index '{}'", name);
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexers.contains_key(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexers.keys().cloned().collect()
    }

    pub fn indexers(&self) -> &IndexerMap {
        &self.indexers
    }

    /// Derive the deduplicated set of indexed values a row produces for
    /// one index
    pub fn extract_values(&self, index_name: &str, row: &[u8]) -> ChronoResult<Vec<IndexValue>> {
        let extractors = self
            .indexers
            .get(index_name)
            .ok_or_else(|| ChronoError::IndexUnknown(index_name.to_string()))?;
        let mut values: Vec<IndexValue> = Vec::new();
        for extractor in extractors {
            for value in extractor.extract(row, &self.registry)? {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    pub fn register_extractor(&mut self, name: impl Into<String>, extractor: Arc<dyn ValueExtractor>) {
        self.registry.register(name, extractor);
    }

    // ==================== Dirty-state management ====================

    pub fn is_dirty(&self, name: &str) -> ChronoResult<bool> {
        if !self.has_index(name) {
            return Err(ChronoError::IndexUnknown(name.to_string()));
        }
        Ok(self.dirty.get(name).copied().unwrap_or(false))
    }

    pub fn set_dirty(&mut self, name: &str, dirty: bool) -> ChronoResult<()> {
        self.dirty.insert(name.to_string(), dirty);
        self.persist_dirty()
    }

    pub fn dirty_indices(&self) -> Vec<String> {
        self.dirty
            .iter()
            .filter(|(_, &d)| d)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Reject queries against unknown or dirty indices
    pub fn ensure_queryable(&self, name: &str) -> ChronoResult<()> {
        if self.is_dirty(name)? {
            return Err(ChronoError::IndexDirty(name.to_string()));
        }
        Ok(())
    }

    // ==================== Document management ====================

    /// Atomically apply the three disjoint modification sets of a commit:
    /// validity terminations, creations, and hard deletions
    pub fn apply_modifications(&mut self, mods: &IndexModifications) -> ChronoResult<()> {
        if mods.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut terminate = tx.prepare_cached(
                "UPDATE documents SET valid_to = ? WHERE id = ?",
            )?;
            for termination in &mods.terminations {
                terminate.execute(params![
                    to_sql_timestamp(termination.valid_to),
                    termination.document_id
                ])?;
            }

            let mut insert = tx.prepare_cached(
                "INSERT INTO documents
                 (id, branch, keyspace, key, index_name,
                  value_kind, value_text, value_int, value_real,
                  valid_from, valid_to)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for doc in &mods.creations {
                let (kind, text, int, real) = encode_value(&doc.value);
                insert.execute(params![
                    doc.id,
                    doc.branch,
                    doc.keyspace,
                    doc.key,
                    doc.index_name,
                    kind,
                    text,
                    int,
                    real,
                    to_sql_timestamp(doc.valid_from),
                    to_sql_timestamp(doc.valid_to),
                ])?;
            }

            let mut delete = tx.prepare_cached("DELETE FROM documents WHERE id = ?")?;
            for id in &mods.deletions {
                delete.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Documents for one identity whose validity is still open
    pub fn open_documents(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        index_name: &str,
    ) -> ChronoResult<Vec<IndexDocument>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, branch, keyspace, key, index_name,
                    value_kind, value_text, value_int, value_real,
                    valid_from, valid_to
             FROM documents
             WHERE branch = ? AND keyspace = ? AND key = ? AND index_name = ?
               AND valid_to = ?",
        )?;
        let rows = stmt.query_map(
            params![branch, keyspace, key, index_name, to_sql_timestamp(OPEN_END)],
            row_to_document,
        )?;
        collect_documents(rows)
    }

    /// Branch-local documents valid at `timestamp` whose value satisfies
    /// the search condition
    pub fn get_matching_local(
        &self,
        branch: &str,
        keyspace: &str,
        timestamp: Timestamp,
        spec: &SearchSpec,
    ) -> ChronoResult<Vec<IndexDocument>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, branch, keyspace, key, index_name,
                    value_kind, value_text, value_int, value_real,
                    valid_from, valid_to
             FROM documents
             WHERE branch = ? AND keyspace = ? AND index_name = ?
               AND valid_from <= ? AND valid_to > ?",
        )?;
        let t = to_sql_timestamp(timestamp);
        let rows = stmt.query_map(
            params![branch, keyspace, spec.index_name, t, t],
            row_to_document,
        )?;
        let docs = collect_documents(rows)?;
        Ok(docs
            .into_iter()
            .filter(|doc| spec.condition.matches(&doc.value))
            .collect())
    }

    /// Keys whose index state at `timestamp` is fully described by
    /// branch-local documents (any document with `valid_from <= timestamp`)
    pub fn touched_keys_local(
        &self,
        branch: &str,
        keyspace: &str,
        index_name: &str,
        timestamp: Timestamp,
    ) -> ChronoResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT key FROM documents
             WHERE branch = ? AND keyspace = ? AND index_name = ?
               AND valid_from <= ?",
        )?;
        let rows = stmt.query_map(
            params![branch, keyspace, index_name, to_sql_timestamp(timestamp)],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove every document of one index (used by rebuild)
    pub fn clear_index(&mut self, index_name: &str) -> ChronoResult<()> {
        self.conn.execute(
            "DELETE FROM documents WHERE index_name = ?",
            params![index_name],
        )?;
        Ok(())
    }

    pub fn document_count(&self) -> ChronoResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            document_count: self.document_count().unwrap_or(0),
            index_count: self.indexers.len(),
            dirty_count: self.dirty_indices().len(),
        }
    }

    /// Force a WAL checkpoint (called on shutdown)
    pub fn checkpoint(&mut self) -> ChronoResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Make every document write fail, leaving reads intact. Simulates a
    /// torn index writer for crash tests.
    #[cfg(test)]
    pub(crate) fn fail_writes_for_tests(&mut self) -> ChronoResult<()> {
        self.conn.execute_batch(
            "CREATE TRIGGER chronodb_fail_insert BEFORE INSERT ON documents
             BEGIN SELECT RAISE(ABORT, 'injected index failure'); END;
             CREATE TRIGGER chronodb_fail_update BEFORE UPDATE ON documents
             BEGIN SELECT RAISE(ABORT, 'injected index failure'); END;",
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn heal_for_tests(&mut self) -> ChronoResult<()> {
        self.conn.execute_batch(
            "DROP TRIGGER chronodb_fail_insert;
             DROP TRIGGER chronodb_fail_update;",
        )?;
        Ok(())
    }

    // ==================== Management-store persistence ====================

    fn persist_indexers(&self) -> ChronoResult<()> {
        store_management_map(&self.management, MANAGEMENT_KEY_INDEXERS, &self.indexers)
    }

    fn persist_dirty(&self) -> ChronoResult<()> {
        store_management_map(&self.management, MANAGEMENT_KEY_DIRTY, &self.dirty)
    }
}

fn management_key(prefix: &str) -> Vec<u8> {
    // kept per-branch in the key format for compatibility; all branches
    // share the master-scoped entry
    format!("{}_{}", prefix, MASTER_BRANCH).into_bytes()
}

fn load_management_map<T: serde::de::DeserializeOwned>(
    management: &KvStore,
    prefix: &str,
) -> ChronoResult<Option<T>> {
    let txn = management.begin_read()?;
    match txn.load(MANAGEMENT_TABLE, &management_key(prefix))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn store_management_map<T: serde::Serialize>(
    management: &KvStore,
    prefix: &str,
    value: &T,
) -> ChronoResult<()> {
    let txn = management.begin_write()?;
    txn.store(
        MANAGEMENT_TABLE,
        &management_key(prefix),
        &serde_json::to_vec(value)?,
    )?;
    txn.commit()
}

fn to_sql_timestamp(timestamp: Timestamp) -> i64 {
    if timestamp == OPEN_END {
        i64::MAX
    } else {
        timestamp as i64
    }
}

fn from_sql_timestamp(timestamp: i64) -> Timestamp {
    if timestamp == i64::MAX {
        OPEN_END
    } else {
        timestamp as u64
    }
}

fn encode_value(value: &IndexValue) -> (i64, Option<String>, Option<i64>, Option<f64>) {
    match value {
        IndexValue::Text(s) => (VALUE_KIND_TEXT, Some(s.clone()), None, None),
        IndexValue::Long(n) => (VALUE_KIND_LONG, None, Some(*n), None),
        IndexValue::Double(n) => (VALUE_KIND_DOUBLE, None, None, Some(*n)),
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexDocument> {
    let kind: i64 = row.get(5)?;
    let value = match kind {
        VALUE_KIND_LONG => IndexValue::Long(row.get(7)?),
        VALUE_KIND_DOUBLE => IndexValue::Double(row.get(8)?),
        _ => IndexValue::Text(row.get::<_, Option<String>>(6)?.unwrap_or_default()),
    };
    Ok(IndexDocument {
        id: row.get(0)?,
        branch: row.get(1)?,
        keyspace: row.get(2)?,
        key: row.get(3)?,
        index_name: row.get(4)?,
        value,
        valid_from: from_sql_timestamp(row.get(9)?),
        valid_to: from_sql_timestamp(row.get(10)?),
    })
}

fn collect_documents(
    rows: impl Iterator<Item = rusqlite::Result<IndexDocument>>,
) -> ChronoResult<Vec<IndexDocument>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DocumentTermination;
    use tempfile::tempdir;

    const CACHE: usize = 1024 * 1024;

    fn open_backend(root: &Path) -> IndexBackend {
        let management = Arc::new(KvStore::open(root.join("management.db"), CACHE).unwrap());
        IndexBackend::open(root, management).unwrap()
    }

    fn doc(key: &str, value: &str, from: Timestamp, to: Timestamp) -> IndexDocument {
        IndexDocument::new(
            MASTER_BRANCH,
            "ks",
            key,
            "name",
            IndexValue::Text(value.to_string()),
            from,
            to,
        )
    }

    #[test]
    fn test_create_index_starts_dirty() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());

        backend
            .create_index("name", IndexExtractor::Utf8Text)
            .unwrap();
        assert!(backend.has_index("name"));
        assert!(backend.is_dirty("name").unwrap());
        assert!(matches!(
            backend.ensure_queryable("name"),
            Err(ChronoError::IndexDirty(_))
        ));

        backend.set_dirty("name", false).unwrap();
        backend.ensure_queryable("name").unwrap();
    }

    #[test]
    fn test_unknown_index() {
        let dir = tempdir().unwrap();
        let backend = open_backend(dir.path());
        assert!(matches!(
            backend.is_dirty("ghost"),
            Err(ChronoError::IndexUnknown(_))
        ));
        assert!(matches!(
            backend.ensure_queryable("ghost"),
            Err(ChronoError::IndexUnknown(_))
        ));
    }

    #[test]
    fn test_indexer_map_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut backend = open_backend(dir.path());
            backend
                .create_index("name", IndexExtractor::json_field("first_name"))
                .unwrap();
            backend
                .create_index("name", IndexExtractor::json_field("last_name"))
                .unwrap();
            backend.set_dirty("name", false).unwrap();
        }
        let backend = open_backend(dir.path());
        assert_eq!(backend.indexers()["name"].len(), 2);
        assert!(!backend.is_dirty("name").unwrap());
    }

    #[test]
    fn test_apply_modifications_and_validity() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());
        backend
            .create_index("name", IndexExtractor::Utf8Text)
            .unwrap();
        backend.set_dirty("name", false).unwrap();

        let first = doc("k1", "alice", 1, OPEN_END);
        let first_id = first.id.clone();
        backend
            .apply_modifications(&IndexModifications {
                creations: vec![first],
                ..Default::default()
            })
            .unwrap();

        // terminate at 5 and create the successor
        backend
            .apply_modifications(&IndexModifications {
                terminations: vec![DocumentTermination {
                    document_id: first_id,
                    valid_to: 5,
                }],
                creations: vec![doc("k1", "bob", 5, OPEN_END)],
                ..Default::default()
            })
            .unwrap();

        let spec = SearchSpec::text_equals("name", "alice");
        let before = backend
            .get_matching_local(MASTER_BRANCH, "ks", 4, &spec)
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].key, "k1");

        // at t=5 the old value is gone, the new one matches
        assert!(backend
            .get_matching_local(MASTER_BRANCH, "ks", 5, &spec)
            .unwrap()
            .is_empty());
        let after = backend
            .get_matching_local(MASTER_BRANCH, "ks", 5, &SearchSpec::text_equals("name", "bob"))
            .unwrap();
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_deletions_remove_documents() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());

        let d = doc("k1", "alice", 1, OPEN_END);
        let id = d.id.clone();
        backend
            .apply_modifications(&IndexModifications {
                creations: vec![d],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(backend.document_count().unwrap(), 1);

        backend
            .apply_modifications(&IndexModifications {
                deletions: vec![id],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(backend.document_count().unwrap(), 0);
    }

    #[test]
    fn test_open_documents_and_touched_keys() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());

        backend
            .apply_modifications(&IndexModifications {
                creations: vec![doc("k1", "alice", 1, 5), doc("k1", "bob", 5, OPEN_END)],
                ..Default::default()
            })
            .unwrap();

        let open = backend
            .open_documents(MASTER_BRANCH, "ks", "k1", "name")
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].value, IndexValue::Text("bob".to_string()));

        let touched = backend
            .touched_keys_local(MASTER_BRANCH, "ks", "name", 3)
            .unwrap();
        assert_eq!(touched, vec!["k1"]);
        assert!(backend
            .touched_keys_local(MASTER_BRANCH, "ks", "name", 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_extract_values_dedups_across_extractors() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());
        backend
            .create_index("name", IndexExtractor::json_field("a"))
            .unwrap();
        backend
            .create_index("name", IndexExtractor::json_field("b"))
            .unwrap();

        let values = backend
            .extract_values("name", br#"{"a": "x", "b": "x"}"#)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Text("x".to_string())]);
    }

    #[test]
    fn test_drop_index() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());
        backend
            .create_index("name", IndexExtractor::Utf8Text)
            .unwrap();
        backend
            .apply_modifications(&IndexModifications {
                creations: vec![doc("k1", "alice", 1, OPEN_END)],
                ..Default::default()
            })
            .unwrap();

        backend.drop_index("name").unwrap();
        assert!(!backend.has_index("name"));
        assert_eq!(backend.document_count().unwrap(), 0);
        assert!(matches!(
            backend.drop_index("name"),
            Err(ChronoError::IndexUnknown(_))
        ));
    }

    #[test]
    fn test_numeric_documents_roundtrip() {
        let dir = tempdir().unwrap();
        let mut backend = open_backend(dir.path());

        let age = IndexDocument::new(
            MASTER_BRANCH,
            "ks",
            "k1",
            "age",
            IndexValue::Long(41),
            1,
            OPEN_END,
        );
        let score = IndexDocument::new(
            MASTER_BRANCH,
            "ks",
            "k2",
            "age",
            IndexValue::Double(3.5),
            1,
            OPEN_END,
        );
        backend
            .apply_modifications(&IndexModifications {
                creations: vec![age, score],
                ..Default::default()
            })
            .unwrap();

        let spec = SearchSpec::number("age", crate::index::NumberMatch::GreaterThan, 3.0);
        let matches = backend
            .get_matching_local(MASTER_BRANCH, "ks", 2, &spec)
            .unwrap();
        assert_eq!(matches.len(), 2);

        let exact = SearchSpec::number("age", crate::index::NumberMatch::Equals, 41.0);
        let matches = backend
            .get_matching_local(MASTER_BRANCH, "ks", 2, &exact)
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value, IndexValue::Long(41));
    }
}
