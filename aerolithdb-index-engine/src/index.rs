//! # Compound Indexes and Index Sets
//!
//! [`CompoundIndex`] is an ordered sequence of `(field, direction)` pairs
//! bound to a collection. [`IndexSet`] groups indexes per collection and
//! provides the diffing helpers the reconciler needs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::field::FieldPath;

/// Sort direction of one field in a compound index, or `Hashed` for a
/// single-field hashed index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
    Hashed,
}

impl Direction {
    pub fn from_sign(sign: i8) -> Self {
        if sign < 0 {
            Direction::Desc
        } else {
            Direction::Asc
        }
    }

    fn token(self) -> &'static str {
        match self {
            Direction::Asc => "1",
            Direction::Desc => "-1",
            Direction::Hashed => "hashed",
        }
    }
}

/// One `(field, direction)` entry in a compound index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    pub path: FieldPath,
    pub direction: Direction,
}

/// An ordered sequence of index keys bound to one collection namespace.
///
/// Two indexes are the same iff their key sequences are pointwise equal.
/// The canonical `name` is `"auto_" + sha256(serialized sequence)`; the
/// `auto_` prefix is the ownership marker the reconciler relies on to decide
/// which indexes it may drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundIndex {
    pub namespace: String,
    pub keys: Vec<IndexKey>,
}

impl CompoundIndex {
    pub fn new(namespace: impl Into<String>, keys: Vec<IndexKey>) -> Self {
        Self {
            namespace: namespace.into(),
            keys,
        }
    }

    pub fn single_hashed(namespace: impl Into<String>, path: FieldPath) -> Self {
        Self::new(
            namespace,
            vec![IndexKey {
                path,
                direction: Direction::Hashed,
            }],
        )
    }

    /// Whether `self` is an index-prefix of `other`: `self`'s sequence
    /// equals the leading `|self|` entries of `other`'s, and `self` is
    /// strictly shorter.
    pub fn is_prefix_of(&self, other: &CompoundIndex) -> bool {
        self.namespace == other.namespace
            && self.keys.len() < other.keys.len()
            && self.keys == other.keys[..self.keys.len()]
    }

    fn serialized_sequence(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.namespace);
        out.push('|');
        for key in &self.keys {
            out.push_str(&key.path);
            out.push(':');
            out.push_str(key.direction.token());
            out.push(',');
        }
        out
    }

    /// Canonical name: `"auto_" + sha256(namespace + serialized sequence)`.
    pub fn canonical_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.serialized_sequence().as_bytes());
        format!("auto_{:x}", hasher.finalize())
    }

    pub fn is_primary_key_only(&self) -> bool {
        self.keys.len() == 1 && self.keys[0].path == crate::field::PRIMARY_KEY_FIELD
    }

    pub fn field_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.keys.iter().map(|k| &k.path)
    }
}

/// A recommended or observed index, identified by a stable name. `name` for
/// engine-recommended indexes is the canonical sha256 name; for
/// database-reported existing indexes it is whatever name the database
/// assigned (which may or may not carry the `auto_` ownership prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedIndex {
    pub name: String,
    pub index: CompoundIndex,
}

impl NamedIndex {
    pub fn recommended(index: CompoundIndex) -> Self {
        let name = index.canonical_name();
        Self { name, index }
    }

    pub fn is_auto_owned(&self) -> bool {
        self.name.starts_with("auto_")
    }
}

/// A set of indexes, grouped per collection namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSet {
    indexes: Vec<NamedIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self { indexes: Vec::new() }
    }

    pub fn insert(&mut self, index: NamedIndex) {
        if !self.indexes.iter().any(|existing| existing == &index) {
            self.indexes.push(index);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedIndex> {
        self.indexes.iter()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Group the set's indexes by collection namespace.
    pub fn by_collection(&self) -> BTreeMap<String, Vec<&NamedIndex>> {
        let mut grouped: BTreeMap<String, Vec<&NamedIndex>> = BTreeMap::new();
        for index in &self.indexes {
            grouped
                .entry(index.index.namespace.clone())
                .or_default()
                .push(index);
        }
        grouped
    }

    /// Indexes present in `self` but not in `other`, compared by canonical
    /// sequence equality (same namespace + same key sequence), regardless of
    /// name.
    pub fn difference<'a>(&'a self, other: &IndexSet) -> Vec<&'a NamedIndex> {
        self.indexes
            .iter()
            .filter(|mine| !other.indexes.iter().any(|theirs| theirs.index == mine.index))
            .collect()
    }

    /// Indexes present in both sets, by canonical sequence equality.
    pub fn intersection<'a>(&'a self, other: &IndexSet) -> Vec<&'a NamedIndex> {
        self.indexes
            .iter()
            .filter(|mine| other.indexes.iter().any(|theirs| theirs.index == mine.index))
            .collect()
    }
}

/// Canonicalization table used by the reduction loop (§9 "shared-object
/// identity after reduction"): candidates are keyed by their canonical
/// sequence string, so that two profiles that end up with identical index
/// sequences share the same `Arc<CompoundIndex>`.
#[derive(Debug, Default)]
pub struct IndexCanonicalizer {
    by_sequence: std::collections::HashMap<String, Arc<CompoundIndex>>,
}

impl IndexCanonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonicalize(&mut self, index: CompoundIndex) -> Arc<CompoundIndex> {
        let key = index.serialized_sequence();
        self.by_sequence
            .entry(key)
            .or_insert_with(|| Arc::new(index))
            .clone()
    }

    pub fn clear(&mut self) {
        self.by_sequence.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str, direction: Direction) -> IndexKey {
        IndexKey {
            path: path.to_string(),
            direction,
        }
    }

    #[test]
    fn prefix_detection() {
        let x = CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]);
        let xy = CompoundIndex::new(
            "db.c",
            vec![key("x", Direction::Asc), key("y", Direction::Asc)],
        );
        assert!(x.is_prefix_of(&xy));
        assert!(!xy.is_prefix_of(&x));
        assert!(!x.is_prefix_of(&x));
    }

    #[test]
    fn canonical_name_stable_and_prefixed() {
        let idx = CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]);
        let name = idx.canonical_name();
        assert!(name.starts_with("auto_"));
        assert_eq!(name, idx.canonical_name());
    }

    #[test]
    fn canonicalizer_shares_identical_sequences() {
        let mut canon = IndexCanonicalizer::new();
        let a = canon.canonicalize(CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]));
        let b = canon.canonicalize(CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn ownership_rule_on_named_index() {
        let idx = CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]);
        let recommended = NamedIndex::recommended(idx.clone());
        assert!(recommended.is_auto_owned());

        let user_owned = NamedIndex {
            name: "user_email_unique".to_string(),
            index: idx,
        };
        assert!(!user_owned.is_auto_owned());
    }
}
