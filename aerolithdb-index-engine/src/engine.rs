//! # IndexAdvisor: Top-Level Orchestrator
//!
//! Composes the Decomposer, Sampler, QuerySet, and Reconciler behind the
//! external collaborator traits. Mirrors the teacher's `QueryEngine`: a
//! plain struct with async methods over `Arc`-held subsystems, rather than
//! an actor. Mutable state lives behind `parking_lot::Mutex` and is never
//! held across a suspension point (§5 "cooperatively serialized").

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::collaborators::{SharedDocumentSampler, SharedIndexAdmin, SharedProfileSource, SharedStateStore};
use crate::config::EngineConfig;
use crate::decomposer;
use crate::errors::EngineError;
use crate::queryset::QuerySet;
use crate::reconciler::{self, ReconciliationPlan};
use crate::sampler::Sampler;
use crate::state::{EngineState, ProfileRecord, SamplerState};
use crate::stats::{CollectionStatistics, IndexStatistics};

/// Owns every piece of mutable engine state and drives one
/// observe/sample/synchronize cycle over the external collaborators.
pub struct IndexAdvisor {
    config: EngineConfig,
    profile_source: SharedProfileSource,
    document_sampler: SharedDocumentSampler,
    index_admin: SharedIndexAdmin,
    state_store: SharedStateStore,

    query_set: Mutex<QuerySet>,
    collection_statistics: Mutex<HashMap<String, CollectionStatistics>>,
    index_statistics: Mutex<HashMap<String, IndexStatistics>>,
}

impl IndexAdvisor {
    pub fn new(
        config: EngineConfig,
        profile_source: SharedProfileSource,
        document_sampler: SharedDocumentSampler,
        index_admin: SharedIndexAdmin,
        state_store: SharedStateStore,
    ) -> Self {
        Self {
            config,
            profile_source,
            document_sampler,
            index_admin,
            state_store,
            query_set: Mutex::new(QuerySet::new()),
            collection_statistics: Mutex::new(HashMap::new()),
            index_statistics: Mutex::new(HashMap::new()),
        }
    }

    /// Restore `QuerySet` and cached statistics from the persisted state
    /// document, if one exists.
    pub async fn restore_state(&self) -> Result<(), EngineError> {
        if let Some(state) = self.state_store.load().await? {
            let mut query_set = self.query_set.lock();
            for profile in state.query_set {
                query_set.observe(profile);
            }
            drop(query_set);
            *self.collection_statistics.lock() = state.sampler.collection_statistics;
            *self.index_statistics.lock() = state.sampler.index_statistics;
        }
        Ok(())
    }

    /// Persist the current `QuerySet` and cached statistics as the engine
    /// state document. Fatal on failure (§7).
    pub async fn persist_state(&self) -> Result<(), EngineError> {
        let query_set: Vec<_> = self
            .query_set
            .lock()
            .entries()
            .iter()
            .map(|entry| entry.profile.clone())
            .collect();
        let state = EngineState {
            query_set,
            sampler: SamplerState {
                collection_statistics: self.collection_statistics.lock().clone(),
                index_statistics: self.index_statistics.lock().clone(),
            },
        };
        self.state_store
            .save(&state)
            .await
            .map_err(|e| EngineError::StatePersistenceFailed(anyhow::anyhow!(e)))
    }

    /// Decompose one profiling-stream record and merge its profiles into
    /// the query set. Unrecognized operators are logged by the decomposer
    /// itself and never abort this call.
    pub fn observe_query(&self, record: &ProfileRecord) {
        let sort = record.orderby.as_ref();
        let profiles = decomposer::decompose(&record.ns, &record.query, sort);
        let mut query_set = self.query_set.lock();
        for profile in profiles {
            query_set.observe(profile);
        }
    }

    /// Drain the profiling stream until exhausted, observing every record.
    /// A `None` from the source ends the drain normally; a fatal collaborator
    /// error propagates per §7.
    pub async fn drain_profile_stream(&self) -> Result<u64, EngineError> {
        let mut observed = 0;
        while let Some(record) = self.profile_source.next_profile_record().await? {
            self.observe_query(&record);
            observed += 1;
        }
        Ok(observed)
    }

    /// Resample a collection's field statistics if they are missing or
    /// stale under `cardinality_update_interval`.
    pub async fn run_sampling_if_stale(&self, namespace: &str) -> Result<(), EngineError> {
        let now = chrono::Utc::now();
        let needs_sampling = match self.collection_statistics.lock().get(namespace) {
            Some(stats) => !stats.is_fresh(now, self.config.cardinality_update_interval),
            None => true,
        };
        if !needs_sampling {
            return Ok(());
        }

        let sampler = Sampler::new(self.document_sampler.as_ref(), Duration::from_secs(self.config.sample_speed_secs));
        let stats = sampler
            .sample_collection(namespace, self.config.sample_size, self.config.longest_indexable_value)
            .await?;
        self.collection_statistics.lock().insert(namespace.to_string(), stats);
        Ok(())
    }

    /// Run one full reduce → simplify → extend → reconcile cycle and,
    /// when `config.do_changes` is set, apply the resulting actions through
    /// `IndexAdmin`.
    pub async fn run_sync_cycle(&self) -> Result<HashMap<String, ReconciliationPlan>, EngineError> {
        self.query_set
            .lock()
            .expire_stale(chrono::Utc::now(), self.config.recent_queries_cutoff());

        let namespaces: Vec<String> = {
            let query_set = self.query_set.lock();
            query_set
                .entries()
                .iter()
                .map(|entry| entry.profile.namespace.clone())
                .collect()
        };
        for namespace in &namespaces {
            self.run_sampling_if_stale(namespace).await?;
        }

        {
            let collection_stats = self.collection_statistics.lock();
            let mut query_set = self.query_set.lock();
            query_set.compute_candidates(
                |ns| collection_stats.get(ns).cloned(),
                &self.config,
                |ns, field| warn!(namespace = %ns, field = %field, "field referenced by query missing from sampled statistics"),
            );
        }

        self.query_set.lock().reduce_indexes();

        self.refresh_index_statistics(&namespaces).await?;
        {
            let index_stats = self.index_statistics.lock();
            self.query_set.lock().simplify(
                |index| {
                    let key = format!("{}-{}", index.namespace, index.canonical_name());
                    index_stats.get(&key).cloned().unwrap_or(IndexStatistics {
                        positions: Vec::new(),
                        last_sample_time: chrono::Utc::now(),
                    })
                },
                self.config.minimum_reduction,
            );
        }

        if self.config.index_extension {
            let collection_stats = self.collection_statistics.lock();
            self.query_set
                .lock()
                .extend(|ns| collection_stats.get(ns).cloned());
        }

        self.refresh_index_statistics(&namespaces).await?;

        let recommended = self.query_set.lock().recommended_index_set();
        let mut plans = HashMap::new();
        for (namespace, indexes) in recommended.by_collection() {
            let existing = self.index_admin.list_indexes(&namespace).await?;
            let mut recommended_for_ns = crate::index::IndexSet::new();
            for index in indexes {
                recommended_for_ns.insert(index.clone());
            }
            let plan = reconciler::reconcile(&recommended_for_ns, &existing);

            if self.config.do_changes {
                for index in &plan.create {
                    if let Err(e) = self.index_admin.create_index(&namespace, &index.index).await {
                        match &e {
                            EngineError::IndexTooLarge { field, .. } => {
                                warn!(namespace = %namespace, index = %index.name, field = %field, "index rejected as too large, demoting field to hash mode");
                                if let Some(stats) = self.collection_statistics.lock().get_mut(&namespace) {
                                    if let Some(field_stats) = stats.fields.get_mut(field) {
                                        field_stats.mode = crate::stats::FieldMode::Hash;
                                    }
                                }
                            }
                            _ => {
                                warn!(namespace = %namespace, error = %e, "failed to create recommended index");
                            }
                        }
                    }
                }
                for index in &plan.drop {
                    if let Err(e) = self.index_admin.drop_index(&namespace, &index.name).await {
                        warn!(namespace = %namespace, index = %index.name, error = %e, "failed to drop index");
                    }
                }
            }
            info!(namespace = %namespace, create = plan.create.len(), drop = plan.drop.len(), keep = plan.keep.len(), "synchronization cycle plan");
            plans.insert(namespace, plan);
        }

        self.persist_state().await?;
        Ok(plans)
    }

    async fn refresh_index_statistics(&self, namespaces: &[String]) -> Result<(), EngineError> {
        let sampler = Sampler::new(self.document_sampler.as_ref(), Duration::from_secs(self.config.sample_speed_secs));
        for namespace in namespaces {
            let candidates: Vec<_> = {
                let query_set = self.query_set.lock();
                query_set
                    .entries()
                    .iter()
                    .filter(|entry| entry.profile.namespace == *namespace)
                    .flat_map(|entry| entry.candidates.iter().map(|c| (**c).clone()))
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }
            let fresh = sampler
                .sample_indexes(namespace, &candidates, self.config.sample_size)
                .await?;
            self.index_statistics.lock().extend(fresh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDocumentSampler, InMemoryIndexAdmin, InMemoryProfileSource, InMemoryStateStore};
    use serde_json::json;
    use std::sync::Arc;

    fn advisor_with_records(records: Vec<ProfileRecord>) -> IndexAdvisor {
        let mut collections = HashMap::new();
        collections.insert(
            "db.users".to_string(),
            vec![
                json!({"status": "a", "name": "x"}),
                json!({"status": "b", "name": "y"}),
                json!({"status": "a", "name": "z"}),
            ],
        );
        IndexAdvisor::new(
            EngineConfig::default(),
            Arc::new(InMemoryProfileSource::new(records)),
            Arc::new(InMemoryDocumentSampler::new(collections)),
            Arc::new(InMemoryIndexAdmin::new()),
            Arc::new(InMemoryStateStore::new()),
        )
    }

    #[tokio::test]
    async fn drains_profile_stream_into_query_set() {
        let advisor = advisor_with_records(vec![ProfileRecord {
            ns: "db.users".to_string(),
            query: json!({"status": "a"}),
            orderby: None,
            exec_stats: None,
        }]);
        let observed = advisor.drain_profile_stream().await.unwrap();
        assert_eq!(observed, 1);
        assert_eq!(advisor.query_set.lock().entries().len(), 1);
    }

    #[tokio::test]
    async fn persist_and_restore_round_trips_query_set() {
        let advisor = advisor_with_records(vec![ProfileRecord {
            ns: "db.users".to_string(),
            query: json!({"status": "a"}),
            orderby: None,
            exec_stats: None,
        }]);
        advisor.drain_profile_stream().await.unwrap();
        advisor.persist_state().await.unwrap();

        let restored = advisor_with_records(vec![]);
        restored.state_store.save(&EngineState {
            query_set: advisor
                .query_set
                .lock()
                .entries()
                .iter()
                .map(|e| e.profile.clone())
                .collect(),
            sampler: SamplerState::default(),
        }).await.unwrap();
        restored.restore_state().await.unwrap();
        assert_eq!(restored.query_set.lock().entries().len(), 1);
    }

    /// §4.5 / §7: a create-index rejection for "value too large to index"
    /// demotes that field to hash mode on the sampler side rather than
    /// propagating as a failure, so the next cycle avoids the combination.
    #[tokio::test]
    async fn index_too_large_demotes_field_to_hash_mode() {
        let mut collections = HashMap::new();
        collections.insert(
            "db.users".to_string(),
            vec![
                json!({"status": "a", "blob": "x"}),
                json!({"status": "b", "blob": "y"}),
                json!({"status": "a", "blob": "z"}),
            ],
        );
        let mut config = EngineConfig::default();
        config.do_changes = true;
        config.minimum_cardinality = 1;
        // Disable field-reduction-by-sampling so the candidate index still
        // carries `blob` by the time the reconciler attempts to create it.
        config.minimum_reduction = 1.0;

        let index_admin = Arc::new(InMemoryIndexAdmin::new());
        index_admin.reject_field_as_too_large("blob");

        let advisor = IndexAdvisor::new(
            config,
            Arc::new(InMemoryProfileSource::new(vec![ProfileRecord {
                ns: "db.users".to_string(),
                query: json!({"status": "a", "blob": "x"}),
                orderby: None,
                exec_stats: None,
            }])),
            Arc::new(InMemoryDocumentSampler::new(collections)),
            index_admin,
            Arc::new(InMemoryStateStore::new()),
        );

        advisor.drain_profile_stream().await.unwrap();
        advisor.run_sync_cycle().await.unwrap();

        let stats = advisor.collection_statistics.lock();
        let blob_stats = stats.get("db.users").unwrap().fields.get("blob").unwrap();
        assert!(blob_stats.is_hash_mode());
    }
}
