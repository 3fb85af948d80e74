//! # Index Advisor Configuration
//!
//! Flat configuration record for the index-recommendation engine, with the
//! defaults and knobs enumerated in the external-interfaces section of the
//! specification this engine implements.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Comprehensive configuration for the index advisor engine.
///
/// Every field has a default; `profile_level = -1` is a sentinel meaning
/// "do not reconfigure the source" rather than an actual profiling level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of documents considered for index-statistics sampling.
    /// Collection-statistics sampling uses `sample_size / 10`.
    pub sample_size: u64,

    /// Total seconds over which a single sampling pass paces its requests.
    pub sample_speed_secs: u64,

    /// How long cardinality/field statistics remain fresh before a resample
    /// is required.
    pub cardinality_update_interval: Duration,

    /// Fields with fewer distinct sampled values than this are dropped from
    /// candidate indexes.
    pub minimum_cardinality: u64,

    /// A prefix position whose reduction ratio exceeds this is considered
    /// non-selective enough to remove. `1.0` disables field reduction.
    pub minimum_reduction: f64,

    /// Enable index extension (§4.4) after reduction.
    pub index_extension: bool,

    /// Values whose serialized length exceeds this threshold are demoted to
    /// hash-mode fields and split into separate single-field hashed indexes.
    pub longest_indexable_value: usize,

    /// Forget query profiles whose `last_query_time` is older than this many
    /// days. `-1` disables forgetting.
    pub recent_queries_only_days: i64,

    /// Profiles observed fewer than this many times are ignored during
    /// recommendation.
    pub minimum_query_count: u64,

    /// Seconds between the end of one synchronization cycle and the start of
    /// the next.
    pub index_synchronization_interval_secs: u64,

    /// Profiling level to request from the database on startup. `-1` leaves
    /// the current setting as-is.
    pub profile_level: i32,

    /// Whether `run_sync_cycle` actually issues create/drop actions, or only
    /// computes and reports them.
    pub do_changes: bool,

    /// When reporting, show only the actions that differ from the existing
    /// index set.
    pub show_changes_only: bool,

    pub simple: bool,
    pub verbose: bool,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_size: 100_000,
            sample_speed_secs: 600,
            cardinality_update_interval: Duration::from_secs(30 * 24 * 60 * 60),
            minimum_cardinality: 3,
            minimum_reduction: 0.70,
            index_extension: true,
            longest_indexable_value: 500,
            recent_queries_only_days: -1,
            minimum_query_count: 1,
            index_synchronization_interval_secs: 60,
            profile_level: 2,
            do_changes: false,
            show_changes_only: false,
            simple: false,
            verbose: false,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `config.json` in the working directory,
    /// falling back to (and persisting) defaults when absent.
    ///
    /// Mirrors the teacher's `AerolithsConfig::load`/`save` convention: a
    /// hierarchical multi-source loader is overkill here since this engine
    /// exposes no CLI surface (that surface is out of scope, see
    /// SPEC_FULL.md §1), so a single JSON file with environment-derived
    /// defaults is sufficient.
    pub async fn load_or_default() -> Result<Self> {
        match tokio::fs::read_to_string("config.json").await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse config.json: {e}")),
            Err(_) => {
                let config = Self::default();
                config.save().await?;
                Ok(config)
            }
        }
    }

    /// Persist the configuration as pretty-printed JSON.
    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write("config.json", content).await?;
        Ok(())
    }

    pub fn recent_queries_cutoff(&self) -> Option<chrono::Duration> {
        if self.recent_queries_only_days < 0 {
            None
        } else {
            Some(chrono::Duration::days(self.recent_queries_only_days))
        }
    }
}
