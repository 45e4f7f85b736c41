//! Index extractors
//!
//! An extractor derives the set of indexed values from a stored row.
//! Extractors are user-supplied, so only their *descriptor* (a tagged
//! variant, or a registered name plus parameters) is persisted, never a
//! serialized closure. Named extractors are resolved at runtime through
//! the [`ExtractorRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::index::IndexValue;
use crate::storage::error::{ChronoError, ChronoResult};

/// Persisted indexer map: index name -> extractors feeding it
///
/// An index may be fed by several extractors; multiplicities survive a
/// save/load round-trip.
pub type IndexerMap = BTreeMap<String, Vec<IndexExtractor>>;

/// Runtime implementation of a named extractor
pub trait ValueExtractor: Send + Sync {
    /// Derive the indexed values for one stored row. An empty result means
    /// the row contributes nothing to the index.
    fn extract(&self, value: &[u8], params: &BTreeMap<String, String>) -> Vec<IndexValue>;
}

/// Persisted descriptor of one extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexExtractor {
    /// Index the whole value decoded as UTF-8 text
    Utf8Text,
    /// Parse the value as JSON and index the field at the given dot path.
    /// Scalars index directly; arrays index each scalar element
    /// (multi-valued).
    JsonField { field: String },
    /// A named implementation registered at runtime
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, String>,
    },
}

impl IndexExtractor {
    pub fn json_field(field: impl Into<String>) -> Self {
        IndexExtractor::JsonField {
            field: field.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        IndexExtractor::Named {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Derive the indexed values for one stored row
    pub fn extract(&self, value: &[u8], registry: &ExtractorRegistry) -> ChronoResult<Vec<IndexValue>> {
        match self {
            IndexExtractor::Utf8Text => Ok(match std::str::from_utf8(value) {
                Ok(text) => vec![IndexValue::Text(text.to_string())],
                Err(_) => Vec::new(),
            }),
            IndexExtractor::JsonField { field } => Ok(extract_json_field(value, field)),
            IndexExtractor::Named { name, params } => {
                let implementation = registry.get(name).ok_or_else(|| {
                    ChronoError::InvalidArgument(format!(
                        "no extractor implementation registered under '{}'",
                        name
                    ))
                })?;
                Ok(implementation.extract(value, params))
            }
        }
    }
}

fn extract_json_field(value: &[u8], field: &str) -> Vec<IndexValue> {
    let parsed: serde_json::Value = match serde_json::from_slice(value) {
        Ok(parsed) => parsed,
        // non-JSON rows simply contribute nothing
        Err(_) => return Vec::new(),
    };
    let mut node = &parsed;
    for segment in field.split('.') {
        match node.get(segment) {
            Some(next) => node = next,
            None => return Vec::new(),
        }
    }
    match node {
        serde_json::Value::Array(items) => items.iter().filter_map(scalar_to_value).collect(),
        other => scalar_to_value(other).into_iter().collect(),
    }
}

fn scalar_to_value(node: &serde_json::Value) -> Option<IndexValue> {
    match node {
        serde_json::Value::String(s) => Some(IndexValue::Text(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(IndexValue::Long(i))
            } else {
                n.as_f64().map(IndexValue::Double)
            }
        }
        serde_json::Value::Bool(b) => Some(IndexValue::Text(b.to_string())),
        _ => None,
    }
}

/// Runtime registry of named extractor implementations
#[derive(Default)]
pub struct ExtractorRegistry {
    named: HashMap<String, Arc<dyn ValueExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, extractor: Arc<dyn ValueExtractor>) {
        self.named.insert(name.into(), extractor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ValueExtractor>> {
        self.named.get(name).cloned()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_extractor() {
        let registry = ExtractorRegistry::new();
        let values = IndexExtractor::Utf8Text
            .extract(b"hello", &registry)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Text("hello".to_string())]);

        // invalid UTF-8 contributes nothing
        let values = IndexExtractor::Utf8Text
            .extract(&[0xff, 0xfe], &registry)
            .unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_json_field_extractor() {
        let registry = ExtractorRegistry::new();
        let row = br#"{"person": {"last_name": "Johnson", "age": 41, "scores": [1.5, 2]}}"#;

        let values = IndexExtractor::json_field("person.last_name")
            .extract(row, &registry)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Text("Johnson".to_string())]);

        let values = IndexExtractor::json_field("person.age")
            .extract(row, &registry)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Long(41)]);

        // arrays are multi-valued
        let values = IndexExtractor::json_field("person.scores")
            .extract(row, &registry)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Double(1.5), IndexValue::Long(2)]);

        // missing field and non-JSON rows contribute nothing
        assert!(IndexExtractor::json_field("person.missing")
            .extract(row, &registry)
            .unwrap()
            .is_empty());
        assert!(IndexExtractor::json_field("x")
            .extract(b"not json", &registry)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_named_extractor() {
        struct FirstByte;
        impl ValueExtractor for FirstByte {
            fn extract(&self, value: &[u8], _params: &BTreeMap<String, String>) -> Vec<IndexValue> {
                value
                    .first()
                    .map(|b| vec![IndexValue::Long(*b as i64)])
                    .unwrap_or_default()
            }
        }

        let mut registry = ExtractorRegistry::new();
        registry.register("first-byte", Arc::new(FirstByte));

        let values = IndexExtractor::named("first-byte")
            .extract(b"abc", &registry)
            .unwrap();
        assert_eq!(values, vec![IndexValue::Long(97)]);

        // unregistered names fail loudly
        assert!(IndexExtractor::named("ghost")
            .extract(b"abc", &registry)
            .is_err());
    }

    #[test]
    fn test_descriptor_roundtrip_preserves_multiplicities() {
        let mut map = IndexerMap::new();
        map.insert(
            "name".to_string(),
            vec![
                IndexExtractor::json_field("first_name"),
                IndexExtractor::json_field("last_name"),
            ],
        );
        map.insert("raw".to_string(), vec![IndexExtractor::Utf8Text]);

        let json = serde_json::to_vec(&map).unwrap();
        let restored: IndexerMap = serde_json::from_slice(&json).unwrap();
        assert_eq!(map, restored);
        assert_eq!(restored["name"].len(), 2);
    }
}
