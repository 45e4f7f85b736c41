//! Branch resolution for time-travel reads
//!
//! A read at `(branch, T)` may need to consult ancestor branches: commits
//! on a branch occur strictly after its branching timestamp, so anything
//! at or before the fork point lives on the origin (recursively). The
//! resolver computes the chain of `(branch, effective upper timestamp)`
//! pairs a read must walk, nearest branch first. Commits always target
//! the first requested branch; no parent data is ever copied into
//! children.

use std::collections::HashMap;

use crate::storage::branch::BranchInfo;
use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::types::Timestamp;

/// One step of a read chain: consult `branch` at timestamps `<= upper`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchStep {
    pub branch: String,
    pub upper: Timestamp,
}

/// Computes branch consultation chains from a snapshot of branch records
pub struct BranchResolver;

impl BranchResolver {
    /// The chain of branches a read at `(branch, timestamp)` must consult,
    /// in order. Branches whose own history cannot cover the timestamp
    /// (reads at or before their fork point) are skipped entirely.
    pub fn resolve(
        infos: &HashMap<String, BranchInfo>,
        branch: &str,
        timestamp: Timestamp,
    ) -> ChronoResult<Vec<BranchStep>> {
        let mut steps = Vec::new();
        let mut current = branch.to_string();
        let mut upper = timestamp;
        loop {
            let info = infos
                .get(&current)
                .ok_or_else(|| ChronoError::BranchUnknown(current.clone()))?;
            match &info.origin {
                Some(origin) => {
                    if upper <= info.branching_timestamp {
                        // nothing on this branch can be visible at `upper`
                        current = origin.clone();
                        continue;
                    }
                    steps.push(BranchStep {
                        branch: current.clone(),
                        upper,
                    });
                    upper = info.branching_timestamp;
                    current = origin.clone();
                }
                None => {
                    steps.push(BranchStep {
                        branch: current,
                        upper,
                    });
                    return Ok(steps);
                }
            }
        }
    }

    /// Every branch that transitively forks off `branch`
    pub fn descendants(infos: &HashMap<String, BranchInfo>, branch: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![branch.to_string()];
        while let Some(parent) = frontier.pop() {
            for info in infos.values() {
                if info.origin.as_deref() == Some(parent.as_str()) {
                    out.push(info.name.clone());
                    frontier.push(info.name.clone());
                }
            }
        }
        out
    }
}
