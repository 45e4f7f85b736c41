//! Core data types for the temporal storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Timestamp`: per-branch logical time
//! - `Period`: a half-open validity interval
//! - `RowValue`: a stored value or a tombstone
//! - `Mutation`: one key change inside a commit
//! - `CommitMetadata`: the persisted record of a commit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::error::{ChronoError, ChronoResult};

/// Per-branch logical time. `0` means "no commit yet".
pub type Timestamp = u64;

/// Largest valid commit timestamp (63 bits).
pub const MAX_TIMESTAMP: Timestamp = i64::MAX as u64;

/// Sentinel for an open (unbounded) interval end.
pub const OPEN_END: Timestamp = u64::MAX;

/// Name of the root branch.
pub const MASTER_BRANCH: &str = "master";

/// Scan direction for history and commit-log queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// A half-open time interval `[from, to)`
///
/// `to == OPEN_END` marks the head interval, which has no upper bound yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    from: Timestamp,
    to: Timestamp,
}

impl Period {
    /// Create a closed interval `[from, to)`
    ///
    /// # Panics
    /// Panics if `from >= to`.
    pub fn closed(from: Timestamp, to: Timestamp) -> Self {
        assert!(from < to, "Period: from must be less than to");
        Self { from, to }
    }

    /// Create an open interval `[from, +inf)`
    pub fn open(from: Timestamp) -> Self {
        Self { from, to: OPEN_END }
    }

    pub fn from(&self) -> Timestamp {
        self.from
    }

    pub fn to(&self) -> Timestamp {
        self.to
    }

    pub fn is_open(&self) -> bool {
        self.to == OPEN_END
    }

    /// Check if a timestamp falls within this interval
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.from && timestamp < self.to
    }

    /// Check if this interval intersects the inclusive range `[lo, hi]`
    pub fn intersects_range(&self, lo: Timestamp, hi: Timestamp) -> bool {
        self.from <= hi && lo < self.to
    }
}

/// A stored row: either a live value or a tombstone marking deletion
///
/// Wire form is a single tag byte (`0x00` tombstone, `0x01` value)
/// followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowValue {
    Value(Vec<u8>),
    Tombstone,
}

const ROW_TAG_TOMBSTONE: u8 = 0x00;
const ROW_TAG_VALUE: u8 = 0x01;

impl RowValue {
    /// Encode into the stored wire form
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RowValue::Tombstone => vec![ROW_TAG_TOMBSTONE],
            RowValue::Value(payload) => {
                let mut buf = Vec::with_capacity(payload.len() + 1);
                buf.push(ROW_TAG_VALUE);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode from the stored wire form
    pub fn decode(bytes: &[u8]) -> ChronoResult<Self> {
        match bytes.first() {
            Some(&ROW_TAG_TOMBSTONE) => Ok(RowValue::Tombstone),
            Some(&ROW_TAG_VALUE) => Ok(RowValue::Value(bytes[1..].to_vec())),
            Some(tag) => Err(ChronoError::InvalidEncoding(format!(
                "unknown row tag: {:#04x}",
                tag
            ))),
            None => Err(ChronoError::InvalidEncoding("empty row".to_string())),
        }
    }

    /// The live payload, or `None` for a tombstone
    pub fn as_option(&self) -> Option<&[u8]> {
        match self {
            RowValue::Value(payload) => Some(payload.as_slice()),
            RowValue::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, RowValue::Tombstone)
    }
}

impl From<Option<Vec<u8>>> for RowValue {
    fn from(value: Option<Vec<u8>>) -> Self {
        match value {
            Some(payload) => RowValue::Value(payload),
            None => RowValue::Tombstone,
        }
    }
}

/// One key change inside a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub keyspace: String,
    pub key: String,
    /// `None` deletes the key (writes a tombstone)
    pub value: Option<Vec<u8>>,
}

impl Mutation {
    /// Write a value
    pub fn put(
        keyspace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Delete a key
    pub fn delete(keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
            value: None,
        }
    }

    pub fn row_value(&self) -> RowValue {
        self.value.clone().into()
    }
}

/// The persisted record of one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Logical commit timestamp
    pub timestamp: Timestamp,
    /// Wall-clock instant at which the commit was made
    pub committed_at: DateTime<Utc>,
    /// Optional caller-supplied payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

/// One base-data row observed by a modification scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationRecord {
    pub timestamp: Timestamp,
    pub keyspace: String,
    pub key: String,
}

/// Reject branch names that cannot be used as directory names or map keys
pub fn validate_branch_name(name: &str) -> ChronoResult<()> {
    if name.is_empty() {
        return Err(ChronoError::InvalidArgument(
            "branch name must not be empty".to_string(),
        ));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(ChronoError::InvalidArgument(format!(
            "malformed branch name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Reject keyspaces and keys that would break the temporal key encoding
pub fn validate_keyspace_and_key(keyspace: &str, key: &str) -> ChronoResult<()> {
    if keyspace.is_empty() {
        return Err(ChronoError::InvalidArgument(
            "keyspace must not be empty".to_string(),
        ));
    }
    if keyspace.contains('\0') || key.contains('\0') {
        return Err(ChronoError::InvalidArgument(
            "keyspace and key must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

/// Reject timestamps outside the 63-bit logical range
pub fn validate_timestamp(timestamp: Timestamp) -> ChronoResult<()> {
    if timestamp > MAX_TIMESTAMP {
        return Err(ChronoError::InvalidArgument(format!(
            "timestamp {} exceeds the maximum of {}",
            timestamp, MAX_TIMESTAMP
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_contains() {
        let period = Period::closed(1000, 2000);

        assert!(!period.contains(999));
        assert!(period.contains(1000));
        assert!(period.contains(1999));
        assert!(!period.contains(2000));

        let head = Period::open(5);
        assert!(head.contains(5));
        assert!(head.contains(MAX_TIMESTAMP));
        assert!(!head.contains(4));
    }

    #[test]
    fn test_period_intersects_range() {
        let period = Period::closed(10, 20);

        assert!(period.intersects_range(0, 10));
        assert!(period.intersects_range(15, 16));
        assert!(period.intersects_range(19, 100));
        assert!(!period.intersects_range(0, 9));
        assert!(!period.intersects_range(20, 30));

        let head = Period::open(21);
        assert!(head.intersects_range(20, 21));
        assert!(!head.intersects_range(0, 20));
    }

    #[test]
    fn test_row_value_roundtrip() {
        let value = RowValue::Value(b"hello".to_vec());
        assert_eq!(RowValue::decode(&value.encode()).unwrap(), value);

        let tombstone = RowValue::Tombstone;
        assert_eq!(RowValue::decode(&tombstone.encode()).unwrap(), tombstone);

        // Empty payload is a valid value, distinct from a tombstone
        let empty = RowValue::Value(Vec::new());
        let decoded = RowValue::decode(&empty.encode()).unwrap();
        assert_eq!(decoded, empty);
        assert!(!decoded.is_tombstone());
    }

    #[test]
    fn test_row_value_decode_rejects_garbage() {
        assert!(matches!(
            RowValue::decode(&[]),
            Err(ChronoError::InvalidEncoding(_))
        ));
        assert!(matches!(
            RowValue::decode(&[0x7f, 1, 2]),
            Err(ChronoError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_commit_metadata_roundtrip() {
        let meta = CommitMetadata {
            timestamp: 42,
            committed_at: Utc::now(),
            payload: Some(b"release".to_vec()),
        };
        let json = serde_json::to_vec(&meta).unwrap();
        let restored: CommitMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(meta, restored);
    }

    #[test]
    fn test_branch_name_validation() {
        assert!(validate_branch_name("master").is_ok());
        assert!(validate_branch_name("feature-1").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("a/b").is_err());
        assert!(validate_branch_name("..").is_err());
    }

    #[test]
    fn test_keyspace_key_validation() {
        assert!(validate_keyspace_and_key("default", "k").is_ok());
        assert!(validate_keyspace_and_key("default", "").is_ok());
        assert!(validate_keyspace_and_key("", "k").is_err());
        assert!(validate_keyspace_and_key("ks\0", "k").is_err());
        assert!(validate_keyspace_and_key("ks", "k\0ey").is_err());
    }
}
