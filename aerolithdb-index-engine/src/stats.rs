//! # Field and Index Statistics
//!
//! Statistics derived by the [`crate::sampler`] and consumed by
//! [`crate::profile`] (naïve → optimized index derivation) and
//! [`crate::queryset`] (field-reduction by sampling).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::field::FieldPath;

/// Whether a field should be indexed normally, or demoted to a separate
/// single-field hashed index because its values are too large to index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldMode {
    Normal,
    Hash,
}

/// Per-field statistics derived from a random document sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStatistics {
    /// Distinct-value count observed in the sample.
    pub cardinality: u64,

    /// Maximum stringified value length observed for this field.
    pub longest: usize,

    /// `Hash` iff `longest` exceeded the configured indexable-value bound.
    pub mode: FieldMode,

    /// Paths of the arrays this field is nested inside of (ancestors of the
    /// field's path that were array markers during flattening).
    pub array_prefixes: BTreeSet<FieldPath>,
}

impl FieldStatistics {
    /// Synthesize statistics for a field that was referenced by a query but
    /// never observed in the sample (§4.2 step 1 / §7 "sampling statistic
    /// miss"). Callers are expected to emit a warning alongside this call.
    pub fn synthesize_missing(
        minimum_cardinality: u64,
        enclosing_known_prefixes: BTreeSet<FieldPath>,
    ) -> Self {
        Self {
            mode: FieldMode::Normal,
            cardinality: minimum_cardinality,
            longest: 1,
            array_prefixes: enclosing_known_prefixes,
        }
    }

    pub fn is_hash_mode(&self) -> bool {
        matches!(self.mode, FieldMode::Hash)
    }
}

/// Statistics for every sampled field of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub fields: HashMap<FieldPath, FieldStatistics>,
    pub known_array_prefixes: BTreeSet<FieldPath>,
    pub last_sample_time: DateTime<Utc>,
}

impl CollectionStatistics {
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
            known_array_prefixes: BTreeSet::new(),
            last_sample_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Whether these statistics are still fresh under the configured
    /// `cardinality_update_interval`, or whether the collection must be
    /// resampled before use.
    pub fn is_fresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let age_secs = now.signed_duration_since(self.last_sample_time).num_seconds();
        age_secs >= 0 && age_secs < interval.as_secs() as i64
    }
}

/// Average distinct key count (and derived reduction ratio) at one prefix
/// position of a candidate compound index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPositionStatistics {
    pub path: FieldPath,
    pub current_average_distinct: f64,
    pub last_average_distinct: f64,
    /// `currentAverageDistinct[k] / currentAverageDistinct[k-1]`, with
    /// position `-1` defined as the total sampled document count.
    pub reduction: f64,
}

/// Per-prefix-length statistics for one candidate compound index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatistics {
    /// Indexed by prefix length - 1, i.e. `positions[0]` is the statistics
    /// for the index's first field alone.
    pub positions: Vec<IndexPositionStatistics>,
    pub last_sample_time: DateTime<Utc>,
}

impl IndexStatistics {
    pub fn reduction_at(&self, position: usize) -> Option<f64> {
        self.positions.get(position).map(|p| p.reduction)
    }
}
