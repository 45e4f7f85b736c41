//! Secondary temporal index
//!
//! Indexed field values are kept as *documents* carrying a validity
//! interval `[valid_from, valid_to)` per `(branch, keyspace, key, index)`.
//! A commit terminates the validity of superseded documents at the commit
//! timestamp and creates new ones starting there, so an index query at any
//! past timestamp sees exactly the values that were live then.
//!
//! - **extractor**: descriptors for the functions that derive indexed
//!   values from stored rows
//! - **backend**: the SQLite-backed document store

pub mod backend;
pub mod extractor;

pub use backend::IndexBackend;
pub use extractor::{ExtractorRegistry, IndexExtractor, IndexerMap, ValueExtractor};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::types::{Timestamp, OPEN_END};

/// Management-store key prefix for the persisted indexer map
pub const MANAGEMENT_KEY_INDEXERS: &str = "chronodb_indexers";
/// Management-store key prefix for the persisted dirty-flag map
pub const MANAGEMENT_KEY_DIRTY: &str = "chronodb_indexdirty";
/// Directory holding the index store; shared by all branches
pub const INDEX_DIRECTORY: &str = "temporalIndex_master";

/// A value produced by an extractor and stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IndexValue {
    Text(String),
    Long(i64),
    Double(f64),
}

impl std::fmt::Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexValue::Text(s) => write!(f, "{}", s),
            IndexValue::Long(n) => write!(f, "{}", n),
            IndexValue::Double(n) => write!(f, "{}", n),
        }
    }
}

/// One index document: an indexed value with its validity interval
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    /// Synthetic document id
    pub id: String,
    pub branch: String,
    pub keyspace: String,
    pub key: String,
    pub index_name: String,
    pub value: IndexValue,
    pub valid_from: Timestamp,
    /// `OPEN_END` while the document is still valid
    pub valid_to: Timestamp,
}

impl IndexDocument {
    pub fn new(
        branch: impl Into<String>,
        keyspace: impl Into<String>,
        key: impl Into<String>,
        index_name: impl Into<String>,
        value: IndexValue,
        valid_from: Timestamp,
        valid_to: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            branch: branch.into(),
            keyspace: keyspace.into(),
            key: key.into(),
            index_name: index_name.into(),
            value,
            valid_from,
            valid_to,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to == OPEN_END
    }

    pub fn valid_at(&self, timestamp: Timestamp) -> bool {
        self.valid_from <= timestamp && timestamp < self.valid_to
    }
}

/// Terminates a document's validity at a commit timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTermination {
    pub document_id: String,
    pub valid_to: Timestamp,
}

/// The three disjoint operation sets applied atomically per commit
#[derive(Debug, Clone, Default)]
pub struct IndexModifications {
    pub terminations: Vec<DocumentTermination>,
    pub creations: Vec<IndexDocument>,
    /// Hard removals by document id
    pub deletions: Vec<String>,
}

impl IndexModifications {
    pub fn is_empty(&self) -> bool {
        self.terminations.is_empty() && self.creations.is_empty() && self.deletions.is_empty()
    }

    /// Names of every index touched by these modifications
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .creations
            .iter()
            .map(|d| d.index_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// String predicate flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatch {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
}

/// Numeric predicate flavors, applied to both long and double values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberMatch {
    Equals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

/// Predicate over indexed values
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Text {
        op: TextMatch,
        value: String,
        case_insensitive: bool,
    },
    Number {
        op: NumberMatch,
        value: f64,
    },
}

impl Condition {
    pub fn matches(&self, value: &IndexValue) -> bool {
        match (self, value) {
            (
                Condition::Text {
                    op,
                    value: needle,
                    case_insensitive,
                },
                IndexValue::Text(haystack),
            ) => {
                let (haystack, needle) = if *case_insensitive {
                    (haystack.to_lowercase(), needle.to_lowercase())
                } else {
                    (haystack.clone(), needle.clone())
                };
                match op {
                    TextMatch::Equals => haystack == needle,
                    TextMatch::NotEquals => haystack != needle,
                    TextMatch::Contains => haystack.contains(&needle),
                    TextMatch::StartsWith => haystack.starts_with(&needle),
                    TextMatch::EndsWith => haystack.ends_with(&needle),
                }
            }
            (Condition::Number { op, value: rhs }, IndexValue::Long(n)) => {
                Self::compare(*n as f64, *op, *rhs)
            }
            (Condition::Number { op, value: rhs }, IndexValue::Double(n)) => {
                Self::compare(*n, *op, *rhs)
            }
            // type-mismatched predicates match nothing
            _ => false,
        }
    }

    fn compare(lhs: f64, op: NumberMatch, rhs: f64) -> bool {
        match op {
            NumberMatch::Equals => lhs == rhs,
            NumberMatch::GreaterThan => lhs > rhs,
            NumberMatch::GreaterOrEqual => lhs >= rhs,
            NumberMatch::LessThan => lhs < rhs,
            NumberMatch::LessOrEqual => lhs <= rhs,
        }
    }
}

/// A query against one index: which index, and which values qualify
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpec {
    pub index_name: String,
    pub condition: Condition,
}

impl SearchSpec {
    pub fn new(index_name: impl Into<String>, condition: Condition) -> Self {
        Self {
            index_name: index_name.into(),
            condition,
        }
    }

    /// Case-sensitive string equality
    pub fn text_equals(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            index_name,
            Condition::Text {
                op: TextMatch::Equals,
                value: value.into(),
                case_insensitive: false,
            },
        )
    }

    pub fn text_contains(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            index_name,
            Condition::Text {
                op: TextMatch::Contains,
                value: value.into(),
                case_insensitive: false,
            },
        )
    }

    pub fn number(index_name: impl Into<String>, op: NumberMatch, value: f64) -> Self {
        Self::new(index_name, Condition::Number { op, value })
    }

    /// Stable textual form used as a query-cache key
    pub fn cache_key(&self) -> String {
        match &self.condition {
            Condition::Text {
                op,
                value,
                case_insensitive,
            } => format!(
                "{}|text|{:?}|{}|{}",
                self.index_name, op, case_insensitive, value
            ),
            Condition::Number { op, value } => {
                format!("{}|num|{:?}|{}", self.index_name, op, value)
            }
        }
    }
}

/// Statistics about the index store
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub document_count: u64,
    pub index_count: usize,
    pub dirty_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_validity() {
        let mut doc = IndexDocument::new("master", "ks", "k", "name", IndexValue::Text("x".into()), 5, OPEN_END);
        assert!(doc.is_open());
        assert!(!doc.valid_at(4));
        assert!(doc.valid_at(5));
        assert!(doc.valid_at(1_000_000));

        doc.valid_to = 9;
        assert!(!doc.is_open());
        assert!(doc.valid_at(8));
        assert!(!doc.valid_at(9));
    }

    #[test]
    fn test_text_conditions() {
        let value = IndexValue::Text("Johnson".to_string());

        let eq = Condition::Text {
            op: TextMatch::Equals,
            value: "Johnson".into(),
            case_insensitive: false,
        };
        assert!(eq.matches(&value));

        let ci = Condition::Text {
            op: TextMatch::Equals,
            value: "johnson".into(),
            case_insensitive: true,
        };
        assert!(ci.matches(&value));

        let contains = Condition::Text {
            op: TextMatch::Contains,
            value: "hns".into(),
            case_insensitive: false,
        };
        assert!(contains.matches(&value));

        let starts = Condition::Text {
            op: TextMatch::StartsWith,
            value: "John".into(),
            case_insensitive: false,
        };
        assert!(starts.matches(&value));
        assert!(!starts.matches(&IndexValue::Text("Smith".into())));

        // text predicate never matches numeric values
        assert!(!eq.matches(&IndexValue::Long(42)));
    }

    #[test]
    fn test_number_conditions() {
        let gt = Condition::Number {
            op: NumberMatch::GreaterThan,
            value: 10.0,
        };
        assert!(gt.matches(&IndexValue::Long(11)));
        assert!(!gt.matches(&IndexValue::Long(10)));
        assert!(gt.matches(&IndexValue::Double(10.5)));
        assert!(!gt.matches(&IndexValue::Text("11".into())));
    }

    #[test]
    fn test_cache_key_distinguishes_specs() {
        let a = SearchSpec::text_equals("name", "x");
        let b = SearchSpec::text_equals("name", "y");
        let c = SearchSpec::text_contains("name", "x");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_eq!(a.cache_key(), SearchSpec::text_equals("name", "x").cache_key());
    }
}
