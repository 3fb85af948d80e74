//! # Query Profiles and Naïve/Optimized Index Derivation
//!
//! A [`QueryProfile`] is the canonical triple (exact-match fields, ordered
//! sort keys, range/multi-value fields) produced by the decomposer. This
//! module also owns the mapping from a profile to its naïve index (no
//! statistics needed) and its optimized indexes (statistics-driven field
//! ordering, hash-mode splitting, and multikey-parallel-array splitting).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::field::FieldPath;
use crate::index::{CompoundIndex, Direction, IndexKey};
use crate::stats::{CollectionStatistics, FieldStatistics};

/// `{source, version}` metadata captured from a `$comment` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySource {
    pub source: String,
    pub version: String,
}

/// A canonical (exact set, ordered sort, range set) triple derived from an
/// observed query, plus the bookkeeping needed to merge re-observations and
/// expire stale profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProfile {
    pub namespace: String,

    /// Exact-match fields, in first-observed order (deduplicated). Order
    /// matters for the naïve index; equivalence compares these as a set.
    pub exact: Vec<FieldPath>,

    /// Ordered sort keys with direction, exactly as observed.
    pub sort: Vec<(FieldPath, i8)>,

    /// Range/multi-value fields, in first-observed order (deduplicated).
    pub range: Vec<FieldPath>,

    pub usage_count: u64,
    pub last_query_time: DateTime<Utc>,
    pub sources: Vec<QuerySource>,
}

fn as_set(fields: &[FieldPath]) -> BTreeSet<&FieldPath> {
    fields.iter().collect()
}

fn push_unique(fields: &mut Vec<FieldPath>, path: &str) {
    if !fields.iter().any(|existing| existing == path) {
        fields.push(path.to_string());
    }
}

impl QueryProfile {
    pub fn new(
        namespace: String,
        exact: Vec<FieldPath>,
        sort: Vec<(FieldPath, i8)>,
        range: Vec<FieldPath>,
        sources: Vec<QuerySource>,
    ) -> Self {
        Self {
            namespace,
            exact,
            sort,
            range,
            usage_count: 1,
            last_query_time: Utc::now(),
            sources,
        }
    }

    /// Two profiles are equivalent iff they share namespace, the same exact
    /// set, the same sort keys with the same direction on each key, and the
    /// same range set.
    pub fn is_equivalent(&self, other: &QueryProfile) -> bool {
        self.namespace == other.namespace
            && as_set(&self.exact) == as_set(&other.exact)
            && self.sort == other.sort
            && as_set(&self.range) == as_set(&other.range)
    }

    /// Merge a re-observation of an equivalent profile into `self`: union
    /// usage counts, the later timestamp, and deduplicated sources.
    pub fn merge_observation(&mut self, other: &QueryProfile) {
        debug_assert!(self.is_equivalent(other));
        self.usage_count += other.usage_count;
        if other.last_query_time > self.last_query_time {
            self.last_query_time = other.last_query_time;
        }
        for source in &other.sources {
            if !self.sources.contains(source) {
                self.sources.push(source.clone());
            }
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, cutoff: Option<chrono::Duration>) -> bool {
        match cutoff {
            Some(cutoff) => now.signed_duration_since(self.last_query_time) > cutoff,
            None => false,
        }
    }

    /// All fields this profile references, in exact → sort → range order.
    pub fn all_fields(&self) -> Vec<&FieldPath> {
        self.exact
            .iter()
            .chain(self.sort.iter().map(|(p, _)| p))
            .chain(self.range.iter())
            .collect()
    }

    /// The naïve index: exact fields (insertion order), then sort fields
    /// (preserving given directions), then range fields. Requires no
    /// statistics; used only as a fallback.
    pub fn naive_index(&self) -> CompoundIndex {
        let mut keys = Vec::new();
        for field in &self.exact {
            keys.push(IndexKey {
                path: field.clone(),
                direction: Direction::Asc,
            });
        }
        for (field, sign) in &self.sort {
            keys.push(IndexKey {
                path: field.clone(),
                direction: Direction::from_sign(*sign),
            });
        }
        for field in &self.range {
            keys.push(IndexKey {
                path: field.clone(),
                direction: Direction::Asc,
            });
        }
        CompoundIndex::new(self.namespace.clone(), keys)
    }

    /// Optimized indexes: one or more compound indexes plus separate
    /// single-field hashed indexes, derived from fresh collection
    /// statistics. See SPEC_FULL.md §4.2 for the full seven-step algorithm.
    pub fn optimized_indexes(
        &self,
        stats: &CollectionStatistics,
        minimum_cardinality: u64,
        mut on_missing_field: impl FnMut(&str),
    ) -> OptimizedIndexes {
        let resolve = |field: &str, on_missing: &mut dyn FnMut(&str)| -> FieldStatistics {
            let sampled_key = crate::field::insert_array_markers(field, &stats.known_array_prefixes);
            match stats.fields.get(&sampled_key) {
                Some(s) => s.clone(),
                None => {
                    on_missing(field);
                    // `sampled_key` is already in marked form, so its array
                    // ancestors (themselves marked, e.g. "a.[].b") are what
                    // `known_array_prefixes` actually stores; a raw
                    // `field.starts_with` against the unmarked query path
                    // would never match those marked ancestor strings.
                    let array_prefixes = crate::field::array_ancestors(&sampled_key)
                        .into_iter()
                        .filter(|p| stats.known_array_prefixes.contains(p))
                        .collect();
                    FieldStatistics::synthesize_missing(minimum_cardinality, array_prefixes)
                }
            }
        };

        let mut exact_stats: Vec<(FieldPath, FieldStatistics)> = self
            .exact
            .iter()
            .map(|f| (f.clone(), resolve(f, &mut on_missing_field)))
            .collect();
        let mut range_stats: Vec<(FieldPath, FieldStatistics)> = self
            .range
            .iter()
            .map(|f| (f.clone(), resolve(f, &mut on_missing_field)))
            .collect();
        let sort_stats: Vec<(FieldPath, FieldStatistics, i8)> = self
            .sort
            .iter()
            .map(|(f, sign)| (f.clone(), resolve(f, &mut on_missing_field), *sign))
            .collect();

        // Step 2: exact sorted by descending cardinality, range by ascending
        // cardinality. Stable on ties.
        exact_stats.sort_by(|a, b| b.1.cardinality.cmp(&a.1.cardinality));
        range_stats.sort_by(|a, b| a.1.cardinality.cmp(&b.1.cardinality));

        // Step 3: drop fields below the minimum cardinality; revert wholesale
        // if that would empty the coverage.
        let drop_low = |fields: &[(FieldPath, FieldStatistics)]| -> Vec<(FieldPath, FieldStatistics)> {
            fields
                .iter()
                .filter(|(_, s)| s.cardinality >= minimum_cardinality)
                .cloned()
                .collect()
        };
        let exact_dropped = drop_low(&exact_stats);
        let range_dropped = drop_low(&range_stats);
        let sort_dropped: Vec<(FieldPath, FieldStatistics, i8)> = sort_stats
            .iter()
            .filter(|(_, s, _)| s.cardinality >= minimum_cardinality)
            .cloned()
            .collect();

        let (exact_final, range_final, sort_final) =
            if exact_dropped.is_empty() && range_dropped.is_empty() && sort_dropped.is_empty() {
                (exact_stats, range_stats, sort_stats)
            } else {
                (exact_dropped, range_dropped, sort_dropped)
            };

        // Step 6: canonicalize sort direction so the first sort key is +1.
        let sign_flip = sort_final.first().map(|(_, _, sign)| *sign).unwrap_or(1);

        // Step 4: split off hash-mode fields into separate single-field
        // indexes; keep only normal-mode fields in the compound ordering.
        let mut hashed = Vec::new();
        let mut ordered: Vec<(FieldPath, Direction, BTreeSet<FieldPath>)> = Vec::new();

        for (field, stat) in &exact_final {
            if stat.is_hash_mode() {
                hashed.push(field.clone());
            } else {
                ordered.push((field.clone(), Direction::Asc, stat.array_prefixes.clone()));
            }
        }
        for (field, stat, sign) in &sort_final {
            if stat.is_hash_mode() {
                hashed.push(field.clone());
            } else {
                let canon_sign = sign * sign_flip;
                ordered.push((
                    field.clone(),
                    Direction::from_sign(canon_sign),
                    stat.array_prefixes.clone(),
                ));
            }
        }
        for (field, stat) in &range_final {
            if stat.is_hash_mode() {
                hashed.push(field.clone());
            } else {
                ordered.push((field.clone(), Direction::Asc, stat.array_prefixes.clone()));
            }
        }

        let hashed_indexes: Vec<CompoundIndex> = hashed
            .into_iter()
            .map(|field| CompoundIndex::single_hashed(self.namespace.clone(), field))
            .collect();

        // Step 5: split by array prefix if more than one distinct prefix is
        // present among the remaining fields.
        let mut distinct_prefixes: BTreeSet<FieldPath> = BTreeSet::new();
        for (_, _, prefixes) in &ordered {
            distinct_prefixes.extend(prefixes.iter().cloned());
        }

        let mut compounds = Vec::new();
        if ordered.is_empty() {
            // every referenced field was dropped or hash-mode; no compound
        } else if distinct_prefixes.len() <= 1 {
            let keys = ordered
                .into_iter()
                .map(|(path, direction, _)| IndexKey { path, direction })
                .collect();
            compounds.push(CompoundIndex::new(self.namespace.clone(), keys));
        } else {
            for prefix in &distinct_prefixes {
                let keys: Vec<IndexKey> = ordered
                    .iter()
                    .filter(|(_, _, prefixes)| prefixes.is_empty() || prefixes.contains(prefix))
                    .map(|(path, direction, _)| IndexKey {
                        path: path.clone(),
                        direction: *direction,
                    })
                    .collect();
                if !keys.is_empty() {
                    compounds.push(CompoundIndex::new(self.namespace.clone(), keys));
                }
            }
        }

        OptimizedIndexes {
            compounds,
            hashed: hashed_indexes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptimizedIndexes {
    pub compounds: Vec<CompoundIndex>,
    pub hashed: Vec<CompoundIndex>,
}
