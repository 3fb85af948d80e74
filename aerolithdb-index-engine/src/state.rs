//! # Engine State: Persisted Document Shape
//!
//! The single state document the engine upserts into a well-known
//! collection (§6 "State document shape (emitted)"): a `querySet` subtree
//! and a `sampler` subtree, the latter keyed by field paths that must have
//! their `.` separators escaped because some backends forbid dots in
//! document keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;
use crate::profile::QueryProfile;
use crate::stats::{CollectionStatistics, IndexStatistics};

/// The fixed stand-in for `.` in any persisted map key (field path or
/// `collection-indexName` key), since some backends reject literal dots in
/// document field names.
const DOT_ESCAPE: &str = "_____";

pub fn encode_key(raw: &str) -> String {
    raw.replace('.', DOT_ESCAPE)
}

pub fn decode_key(encoded: &str) -> String {
    encoded.replace(DOT_ESCAPE, ".")
}

/// `CollectionStatistics.fields` is itself a `{fieldPath -> FieldStatistics}`
/// map, so its keys need the same dot-escaping as the outer collection-name
/// and `collection-indexName` keys (§6: "all field-path map keys").
fn encode_collection_statistics_keys(mut value: Value) -> Value {
    if let Value::Object(obj) = &mut value {
        if let Some(Value::Object(fields)) = obj.get_mut("fields") {
            let encoded: serde_json::Map<String, Value> = std::mem::take(fields)
                .into_iter()
                .map(|(path, stats)| (encode_key(&path), stats))
                .collect();
            *fields = encoded;
        }
    }
    value
}

fn decode_collection_statistics_keys(mut value: Value) -> Value {
    if let Value::Object(obj) = &mut value {
        if let Some(Value::Object(fields)) = obj.get_mut("fields") {
            let decoded: serde_json::Map<String, Value> = std::mem::take(fields)
                .into_iter()
                .map(|(path, stats)| (decode_key(&path), stats))
                .collect();
            *fields = decoded;
        }
    }
    value
}

/// A profiling-stream record as consumed from the database's system-owned
/// profile collection (§6 "Profile record shape (consumed)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub ns: String,
    /// The predicate; `$query`/`query` aliasing is resolved by the caller
    /// before this record is constructed.
    pub query: Value,
    #[serde(default)]
    pub orderby: Option<Value>,
    /// Nested operator tree; only consulted for its `IXSCAN` nodes'
    /// `keyPattern`, which is out of scope for recommendation itself.
    #[serde(default)]
    pub exec_stats: Option<Value>,
}

/// The `sampler` subtree of the persisted state document.
#[derive(Debug, Clone, Default)]
pub struct SamplerState {
    pub collection_statistics: HashMap<String, CollectionStatistics>,
    pub index_statistics: HashMap<String, IndexStatistics>,
}

/// The full persisted engine state document.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub query_set: Vec<QueryProfile>,
    pub sampler: SamplerState,
}

impl EngineState {
    /// Render to the JSON-safe document shape, escaping `.` in every
    /// sampler map key, including the nested per-field-path keys inside
    /// each collection's `fields` map.
    pub fn to_document(&self) -> Value {
        let collection_statistics: serde_json::Map<String, Value> = self
            .sampler
            .collection_statistics
            .iter()
            .map(|(name, stats)| {
                let value = serde_json::to_value(stats).unwrap_or(Value::Null);
                (encode_key(name), encode_collection_statistics_keys(value))
            })
            .collect();

        let index_statistics: serde_json::Map<String, Value> = self
            .sampler
            .index_statistics
            .iter()
            .map(|(key, stats)| {
                (
                    encode_key(key),
                    serde_json::to_value(stats).unwrap_or(Value::Null),
                )
            })
            .collect();

        serde_json::json!({
            "querySet": self.query_set,
            "sampler": {
                "collectionStatistics": collection_statistics,
                "indexStatistics": index_statistics,
            }
        })
    }

    /// Parse back from the JSON-safe document shape.
    pub fn from_document(value: &Value) -> Result<Self, EngineError> {
        let query_set: Vec<QueryProfile> = value
            .get("querySet")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::Transient {
                context: "parsing querySet from state document".to_string(),
                source: e.into(),
            })?
            .unwrap_or_default();

        let mut collection_statistics = HashMap::new();
        let mut index_statistics = HashMap::new();

        if let Some(sampler) = value.get("sampler") {
            if let Some(Value::Object(map)) = sampler.get("collectionStatistics") {
                for (key, entry) in map {
                    let decoded_entry = decode_collection_statistics_keys(entry.clone());
                    let stats: CollectionStatistics =
                        serde_json::from_value(decoded_entry).map_err(|e| EngineError::Transient {
                            context: format!("parsing collection statistics for {key}"),
                            source: e.into(),
                        })?;
                    collection_statistics.insert(decode_key(key), stats);
                }
            }
            if let Some(Value::Object(map)) = sampler.get("indexStatistics") {
                for (key, entry) in map {
                    let stats: IndexStatistics =
                        serde_json::from_value(entry.clone()).map_err(|e| EngineError::Transient {
                            context: format!("parsing index statistics for {key}"),
                            source: e.into(),
                        })?;
                    index_statistics.insert(decode_key(key), stats);
                }
            }
        }

        Ok(EngineState {
            query_set,
            sampler: SamplerState {
                collection_statistics,
                index_statistics,
            },
        })
    }
}
