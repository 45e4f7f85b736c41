//! Transactional commit pipeline
//!
//! A commit writes base data, index modifications, and commit metadata
//! with all-or-nothing visibility:
//!
//! 1. the caller holds the per-branch commit lock
//! 2. the next timestamp is allocated (rollover first if the head is full)
//! 3. mutations go into the head chunk through one KV transaction
//! 4. index modifications are computed against the pre-commit state
//! 5. commit metadata is written into the same KV transaction
//! 6. the KV transaction commits, then the index writer commits
//!
//! Any failure before the KV commit rolls everything back with no visible
//! state change. If the index write fails *after* the KV commit, the base
//! data stays durable, the affected indices are marked dirty, and the
//! caller receives `IndexWriteFailed`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::index::{DocumentTermination, IndexBackend, IndexDocument, IndexModifications};
use crate::storage::branch::BranchInfo;
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::kv::COMMITS_TABLE;
use crate::storage::matrix::{RowLookup, TemporalMatrix};
use crate::storage::pool::GlobalChunkManager;
use crate::storage::resolver::BranchResolver;
use crate::storage::types::{
    validate_keyspace_and_key, CommitMetadata, Mutation, Timestamp, MAX_TIMESTAMP, OPEN_END,
};

/// Result of one committed batch
#[derive(Debug)]
pub struct CommitOutcome {
    pub timestamp: Timestamp,
    /// Every `(keyspace, key)` the commit touched, for cache invalidation
    pub touched: Vec<(String, String)>,
    /// Set when the base data committed but the index write failed
    pub index_error: Option<ChronoError>,
}

/// Coordinates base-data writes, index modifications, and commit metadata
pub struct CommitPipeline {
    pool: Arc<GlobalChunkManager>,
    index: Arc<Mutex<IndexBackend>>,
    /// Head chunk row threshold triggering automatic rollover; 0 disables
    rollover_row_threshold: u64,
}

impl CommitPipeline {
    pub fn new(
        pool: Arc<GlobalChunkManager>,
        index: Arc<Mutex<IndexBackend>>,
        rollover_row_threshold: u64,
    ) -> Self {
        Self {
            pool,
            index,
            rollover_row_threshold,
        }
    }

    /// Execute one commit. The caller must hold the branch's commit lock
    /// and pass a consistent snapshot of the branch directory.
    pub fn execute(
        &self,
        infos: &HashMap<String, BranchInfo>,
        branch: &str,
        last_committed: Timestamp,
        mutations: Vec<Mutation>,
        payload: Option<Vec<u8>>,
    ) -> ChronoResult<CommitOutcome> {
        if mutations.is_empty() && payload.is_none() {
            return Err(ChronoError::InvalidArgument(
                "commit carries neither mutations nor metadata".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for mutation in &mutations {
            validate_keyspace_and_key(&mutation.keyspace, &mutation.key)?;
            if !seen.insert((mutation.keyspace.clone(), mutation.key.clone())) {
                return Err(ChronoError::InvalidArgument(format!(
                    "duplicate key in commit: ({}, {})",
                    mutation.keyspace, mutation.key
                )));
            }
        }

        let manager = self.pool.branch_manager(branch)?;

        // allocate the commit timestamp, rolling the head over first when
        // it has reached its capacity
        if self.rollover_row_threshold > 0
            && manager.head_chunk().metadata().row_count >= self.rollover_row_threshold
        {
            manager.perform_rollover(last_committed)?;
        }
        let timestamp = last_committed + 1;
        if timestamp > MAX_TIMESTAMP {
            return Err(ChronoError::BranchStalled(format!(
                "branch '{}' has exhausted its logical time range",
                branch
            )));
        }

        // compute index modifications against the pre-commit state
        let modifications = self.compute_index_modifications(
            infos,
            branch,
            last_committed,
            timestamp,
            &mutations,
        )?;

        // write base data and commit metadata in one KV transaction
        let txn = self.pool.open_transaction(branch, timestamp)?;
        let matrix = TemporalMatrix::new(Arc::clone(&self.pool), Arc::clone(&manager));
        for mutation in &mutations {
            matrix.put(
                &txn,
                &mutation.keyspace,
                &mutation.key,
                timestamp,
                &mutation.row_value(),
            )?;
        }
        let metadata = CommitMetadata {
            timestamp,
            committed_at: Utc::now(),
            payload,
        };
        txn.txn().store(
            COMMITS_TABLE,
            &timestamp.to_be_bytes(),
            &serde_json::to_vec(&metadata)?,
        )?;

        let head = Arc::clone(txn.chunk());
        let row_count = mutations.len() as u64;
        txn.commit()?;

        tracing::debug!(
            "Committed {} mutations on branch '{}' at t={}",
            row_count,
            branch,
            timestamp
        );

        // the row count is advisory (rollover policy); a failed sidecar
        // update must not fail a durable commit
        if row_count > 0 {
            if let Err(e) = head.add_rows(row_count) {
                tracing::warn!("Failed to update chunk row count: {}", e);
            }
        }

        // base data is durable from here on; an index failure only
        // degrades the index
        let index_error = self.apply_index_modifications(&modifications);

        Ok(CommitOutcome {
            timestamp,
            touched: mutations
                .into_iter()
                .map(|m| (m.keyspace, m.key))
                .collect(),
            index_error,
        })
    }

    /// Diff the pre-commit index state against the new values: terminate
    /// documents whose value disappears, create documents for new values,
    /// and materialize branch-local shadows for values inherited from an
    /// ancestor branch.
    fn compute_index_modifications(
        &self,
        infos: &HashMap<String, BranchInfo>,
        branch: &str,
        last_committed: Timestamp,
        timestamp: Timestamp,
        mutations: &[Mutation],
    ) -> ChronoResult<IndexModifications> {
        let backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let index_names = backend.index_names();
        let mut mods = IndexModifications::default();
        if index_names.is_empty() {
            return Ok(mods);
        }

        let branch_info = infos
            .get(branch)
            .ok_or_else(|| ChronoError::BranchUnknown(branch.to_string()))?;

        for mutation in mutations {
            let new_row = mutation.value.as_deref();
            // the pre-commit value, resolved through the branch chain;
            // only needed to build shadows when no local documents exist
            let mut inherited_row: Option<Option<Vec<u8>>> = None;

            for index_name in &index_names {
                let new_values = match new_row {
                    Some(bytes) => backend.extract_values(index_name, bytes)?,
                    None => Vec::new(),
                };
                let open_docs = backend.open_documents(
                    branch,
                    &mutation.keyspace,
                    &mutation.key,
                    index_name,
                )?;

                if !open_docs.is_empty() {
                    for doc in &open_docs {
                        if !new_values.contains(&doc.value) {
                            mods.terminations.push(DocumentTermination {
                                document_id: doc.id.clone(),
                                valid_to: timestamp,
                            });
                        }
                    }
                    for value in new_values {
                        if !open_docs.iter().any(|d| d.value == value) {
                            mods.creations.push(IndexDocument::new(
                                branch,
                                &mutation.keyspace,
                                &mutation.key,
                                index_name,
                                value,
                                timestamp,
                                OPEN_END,
                            ));
                        }
                    }
                    continue;
                }

                // no branch-local documents: the prior value (if any) was
                // inherited from an ancestor and must be shadowed locally
                // so child queries and masking stay correct
                if branch_info.origin.is_some() {
                    let old_row = match &inherited_row {
                        Some(cached) => cached.clone(),
                        None => {
                            let looked_up = chain_lookup(
                                &self.pool,
                                infos,
                                branch,
                                &mutation.keyspace,
                                &mutation.key,
                                last_committed,
                            )?;
                            inherited_row = Some(looked_up.clone());
                            looked_up
                        }
                    };
                    let shadow_from = branch_info.branching_timestamp + 1;
                    if let Some(old_bytes) = old_row {
                        let old_values = backend.extract_values(index_name, &old_bytes)?;
                        for value in &old_values {
                            let continues = new_values.contains(value);
                            let valid_to = if continues { OPEN_END } else { timestamp };
                            if shadow_from < valid_to {
                                mods.creations.push(IndexDocument::new(
                                    branch,
                                    &mutation.keyspace,
                                    &mutation.key,
                                    index_name,
                                    value.clone(),
                                    shadow_from,
                                    valid_to,
                                ));
                            }
                        }
                        for value in new_values {
                            if !old_values.contains(&value) {
                                mods.creations.push(IndexDocument::new(
                                    branch,
                                    &mutation.keyspace,
                                    &mutation.key,
                                    index_name,
                                    value,
                                    timestamp,
                                    OPEN_END,
                                ));
                            }
                        }
                        continue;
                    }
                }

                for value in new_values {
                    mods.creations.push(IndexDocument::new(
                        branch,
                        &mutation.keyspace,
                        &mutation.key,
                        index_name,
                        value,
                        timestamp,
                        OPEN_END,
                    ));
                }
            }
        }
        Ok(mods)
    }

    /// Commit the index writer; on failure mark every index dirty and
    /// return the error for the caller to surface as `IndexWriteFailed`
    fn apply_index_modifications(&self, modifications: &IndexModifications) -> Option<ChronoError> {
        if modifications.is_empty() {
            return None;
        }
        let mut backend = self.index.lock().unwrap_or_else(|e| e.into_inner());
        match backend.apply_modifications(modifications) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("Index write failed after base-data commit: {}", e);
                for name in backend.index_names() {
                    if let Err(flag_err) = backend.set_dirty(&name, true) {
                        tracing::error!(
                            "Failed to persist dirty flag for index '{}': {}",
                            name,
                            flag_err
                        );
                    }
                }
                Some(e)
            }
        }
    }
}

/// Point-in-time read through the branch chain: the first branch holding
/// a version answers; a tombstone is a definitive absence.
pub(crate) fn chain_lookup(
    pool: &Arc<GlobalChunkManager>,
    infos: &HashMap<String, BranchInfo>,
    branch: &str,
    keyspace: &str,
    key: &str,
    timestamp: Timestamp,
) -> ChronoResult<Option<Vec<u8>>> {
    for step in BranchResolver::resolve(infos, branch, timestamp)? {
        let manager = pool.branch_manager(&step.branch)?;
        let matrix = TemporalMatrix::new(Arc::clone(pool), manager);
        match matrix.get(keyspace, key, step.upper)? {
            RowLookup::Value(value) => return Ok(Some(value)),
            RowLookup::Tombstone => return Ok(None),
            RowLookup::None => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::KvStore;
    use crate::storage::pool::DEFAULT_MAX_OPEN_FILES;
    use crate::storage::types::MASTER_BRANCH;
    use std::path::Path;
    use tempfile::tempdir;

    const CACHE: usize = 1024 * 1024;

    struct Fixture {
        pool: Arc<GlobalChunkManager>,
        index: Arc<Mutex<IndexBackend>>,
        pipeline: CommitPipeline,
        infos: HashMap<String, BranchInfo>,
    }

    fn setup(dir: &Path) -> Fixture {
        let pool = Arc::new(
            GlobalChunkManager::open(dir.join("branches"), DEFAULT_MAX_OPEN_FILES, CACHE).unwrap(),
        );
        pool.create_branch_manager(MASTER_BRANCH, 0).unwrap();
        let management = Arc::new(KvStore::open(dir.join("management.db"), CACHE).unwrap());
        let index = Arc::new(Mutex::new(IndexBackend::open(dir, management).unwrap()));
        let pipeline = CommitPipeline::new(Arc::clone(&pool), Arc::clone(&index), 0);
        let mut infos = HashMap::new();
        infos.insert(MASTER_BRANCH.to_string(), BranchInfo::master());
        Fixture {
            pool,
            index,
            pipeline,
            infos,
        }
    }

    fn commit(fixture: &Fixture, last: Timestamp, mutations: Vec<Mutation>) -> CommitOutcome {
        fixture
            .pipeline
            .execute(&fixture.infos, MASTER_BRANCH, last, mutations, None)
            .unwrap()
    }

    #[test]
    fn test_commit_allocates_next_timestamp() {
        let dir = tempdir().unwrap();
        let fixture = setup(dir.path());

        let outcome = commit(&fixture, 0, vec![Mutation::put("ks", "a", "x")]);
        assert_eq!(outcome.timestamp, 1);
        assert!(outcome.index_error.is_none());
        assert_eq!(outcome.touched, vec![("ks".to_string(), "a".to_string())]);

        let outcome = commit(&fixture, 1, vec![Mutation::put("ks", "a", "y")]);
        assert_eq!(outcome.timestamp, 2);
    }

    #[test]
    fn test_commit_rejects_duplicates_and_empty() {
        let dir = tempdir().unwrap();
        let fixture = setup(dir.path());

        let err = fixture
            .pipeline
            .execute(
                &fixture.infos,
                MASTER_BRANCH,
                0,
                vec![
                    Mutation::put("ks", "a", "x"),
                    Mutation::put("ks", "a", "y"),
                ],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ChronoError::InvalidArgument(_)));

        let err = fixture
            .pipeline
            .execute(&fixture.infos, MASTER_BRANCH, 0, Vec::new(), None)
            .unwrap_err();
        assert!(matches!(err, ChronoError::InvalidArgument(_)));

        // metadata-only commits are allowed
        let outcome = fixture
            .pipeline
            .execute(
                &fixture.infos,
                MASTER_BRANCH,
                0,
                Vec::new(),
                Some(b"tag".to_vec()),
            )
            .unwrap();
        assert_eq!(outcome.timestamp, 1);
    }

    #[test]
    fn test_commit_writes_data_and_metadata_atomically() {
        let dir = tempdir().unwrap();
        let fixture = setup(dir.path());

        commit(&fixture, 0, vec![Mutation::put("ks", "a", "x")]);

        let head = fixture
            .pool
            .branch_manager(MASTER_BRANCH)
            .unwrap()
            .head_chunk();
        let txn = fixture.pool.open_bogus_transaction(head.data_path()).unwrap();
        let (key, value) = txn.last(COMMITS_TABLE).unwrap().unwrap();
        assert_eq!(key, 1u64.to_be_bytes().to_vec());
        let metadata: CommitMetadata = serde_json::from_slice(&value).unwrap();
        assert_eq!(metadata.timestamp, 1);
    }

    #[test]
    fn test_rollover_on_row_threshold() {
        let dir = tempdir().unwrap();
        let pool = Arc::new(
            GlobalChunkManager::open(
                dir.path().join("branches"),
                DEFAULT_MAX_OPEN_FILES,
                CACHE,
            )
            .unwrap(),
        );
        pool.create_branch_manager(MASTER_BRANCH, 0).unwrap();
        let management =
            Arc::new(KvStore::open(dir.path().join("management.db"), CACHE).unwrap());
        let index = Arc::new(Mutex::new(
            IndexBackend::open(dir.path(), management).unwrap(),
        ));
        let pipeline = CommitPipeline::new(Arc::clone(&pool), index, 2);
        let mut infos = HashMap::new();
        infos.insert(MASTER_BRANCH.to_string(), BranchInfo::master());

        for (last, key) in [(0u64, "a"), (1, "b"), (2, "c")] {
            pipeline
                .execute(
                    &infos,
                    MASTER_BRANCH,
                    last,
                    vec![Mutation::put("ks", key, "v")],
                    None,
                )
                .unwrap();
        }

        // two rows fill chunk 0; the third commit first rolls over
        let manager = pool.branch_manager(MASTER_BRANCH).unwrap();
        assert_eq!(manager.chunk_count(), 2);
        assert_eq!(manager.head_chunk().period().from(), 3);

        // all three versions remain readable across the chunk boundary
        let matrix = TemporalMatrix::new(Arc::clone(&pool), manager);
        assert_eq!(
            matrix.get("ks", "a", 10).unwrap(),
            RowLookup::Value(b"v".to_vec())
        );
        assert_eq!(
            matrix.get("ks", "c", 10).unwrap(),
            RowLookup::Value(b"v".to_vec())
        );
    }

    #[test]
    fn test_index_modifications_terminate_and_create() {
        let dir = tempdir().unwrap();
        let fixture = setup(dir.path());
        {
            let mut backend = fixture.index.lock().unwrap();
            backend
                .create_index("raw", crate::index::IndexExtractor::Utf8Text)
                .unwrap();
            backend.set_dirty("raw", false).unwrap();
        }

        commit(&fixture, 0, vec![Mutation::put("ks", "a", "alice")]);
        commit(&fixture, 1, vec![Mutation::put("ks", "a", "bob")]);
        commit(&fixture, 2, vec![Mutation::delete("ks", "a")]);

        let backend = fixture.index.lock().unwrap();
        let spec = crate::index::SearchSpec::text_equals("raw", "alice");
        assert_eq!(
            backend
                .get_matching_local(MASTER_BRANCH, "ks", 1, &spec)
                .unwrap()
                .len(),
            1
        );
        // superseded at t=2
        assert!(backend
            .get_matching_local(MASTER_BRANCH, "ks", 2, &spec)
            .unwrap()
            .is_empty());
        let bob = crate::index::SearchSpec::text_equals("raw", "bob");
        assert_eq!(
            backend
                .get_matching_local(MASTER_BRANCH, "ks", 2, &bob)
                .unwrap()
                .len(),
            1
        );
        // tombstoned at t=3
        assert!(backend
            .get_matching_local(MASTER_BRANCH, "ks", 3, &bob)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unchanged_indexed_value_keeps_document() {
        let dir = tempdir().unwrap();
        let fixture = setup(dir.path());
        {
            let mut backend = fixture.index.lock().unwrap();
            backend
                .create_index("name", crate::index::IndexExtractor::json_field("name"))
                .unwrap();
            backend.set_dirty("name", false).unwrap();
        }

        commit(
            &fixture,
            0,
            vec![Mutation::put("ks", "a", br#"{"name":"x","age":1}"#.to_vec())],
        );
        commit(
            &fixture,
            1,
            vec![Mutation::put("ks", "a", br#"{"name":"x","age":2}"#.to_vec())],
        );

        let backend = fixture.index.lock().unwrap();
        // the indexed value never changed, so the original document is
        // still the one valid document
        assert_eq!(backend.document_count().unwrap(), 1);
        let docs = backend
            .open_documents(MASTER_BRANCH, "ks", "a", "name")
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].valid_from, 1);
    }

    #[test]
    fn test_chain_lookup_falls_through_to_origin() {
        let dir = tempdir().unwrap();
        let mut fixture = setup(dir.path());

        commit(&fixture, 0, vec![Mutation::put("ks", "a", "master-value")]);

        fixture.pool.create_branch_manager("child", 2).unwrap();
        fixture
            .infos
            .insert("child".to_string(), BranchInfo::fork("child", MASTER_BRANCH, 1));

        let value = chain_lookup(
            &fixture.pool,
            &fixture.infos,
            "child",
            "ks",
            "a",
            5,
        )
        .unwrap();
        assert_eq!(value, Some(b"master-value".to_vec()));
    }
}
