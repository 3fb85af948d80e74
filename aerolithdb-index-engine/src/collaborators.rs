//! # External Collaborator Traits
//!
//! The engine treats the database transport, the profiling stream, and
//! state persistence as external collaborators, reached only through these
//! narrow `async_trait` seams, the same pattern the teacher uses at its
//! plugin boundary. The in-memory implementations here exist only for tests
//! and the demo binary; they carry no wire protocol, authentication, or
//! retry logic of their own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::EngineError;
use crate::index::{CompoundIndex, IndexSet, NamedIndex};
use crate::state::{EngineState, ProfileRecord};

/// Tails the database's system-owned query profiling stream.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn next_profile_record(&self) -> Result<Option<ProfileRecord>, EngineError>;
}

/// Random-access document reads for sampling, distinct from the sampling
/// algorithm itself ([`crate::sampler::Sampler`]).
#[async_trait]
pub trait DocumentSampler: Send + Sync {
    async fn count(&self, namespace: &str) -> Result<u64, EngineError>;
    async fn fetch_at(&self, namespace: &str, indices: &[u64]) -> Result<Vec<Value>, EngineError>;
}

/// Index create/drop/list against the database.
#[async_trait]
pub trait IndexAdmin: Send + Sync {
    async fn create_index(&self, namespace: &str, index: &CompoundIndex) -> Result<(), EngineError>;
    async fn drop_index(&self, namespace: &str, name: &str) -> Result<(), EngineError>;
    async fn list_indexes(&self, namespace: &str) -> Result<IndexSet, EngineError>;
}

/// Upsert/read of the single engine state document.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<EngineState>, EngineError>;
    async fn save(&self, state: &EngineState) -> Result<(), EngineError>;
}

/// An in-memory profiling stream fed by a fixed queue, for tests and the
/// demo binary. Returns `Ok(None)` once drained, rather than the fatal
/// "stream ended" condition a real profiling cursor running dry would raise.
/// Callers choose how to interpret exhaustion.
#[derive(Debug, Default)]
pub struct InMemoryProfileSource {
    records: Mutex<std::collections::VecDeque<ProfileRecord>>,
}

impl InMemoryProfileSource {
    pub fn new(records: Vec<ProfileRecord>) -> Self {
        Self {
            records: Mutex::new(records.into()),
        }
    }
}

#[async_trait]
impl ProfileSource for InMemoryProfileSource {
    async fn next_profile_record(&self) -> Result<Option<ProfileRecord>, EngineError> {
        Ok(self.records.lock().pop_front())
    }
}

/// An in-memory collection set, for tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryDocumentSampler {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl InMemoryDocumentSampler {
    pub fn new(collections: HashMap<String, Vec<Value>>) -> Self {
        Self {
            collections: Mutex::new(collections),
        }
    }
}

#[async_trait]
impl DocumentSampler for InMemoryDocumentSampler {
    async fn count(&self, namespace: &str) -> Result<u64, EngineError> {
        Ok(self
            .collections
            .lock()
            .get(namespace)
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }

    async fn fetch_at(&self, namespace: &str, indices: &[u64]) -> Result<Vec<Value>, EngineError> {
        let collections = self.collections.lock();
        let Some(docs) = collections.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(indices
            .iter()
            .filter_map(|&i| docs.get(i as usize).cloned())
            .collect())
    }
}

/// An in-memory index registry, for tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryIndexAdmin {
    indexes: Mutex<HashMap<String, Vec<NamedIndex>>>,
    /// Field paths whose appearance in a create request simulates the
    /// database's "value too large to index" rejection, for exercising the
    /// hash-mode demotion side effect without a real transport.
    reject_fields_too_large: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryIndexAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, namespace: &str, indexes: Vec<NamedIndex>) {
        self.indexes.lock().insert(namespace.to_string(), indexes);
    }

    /// Any subsequent `create_index` call for an index referencing `field`
    /// fails with [`EngineError::IndexTooLarge`] instead of succeeding.
    pub fn reject_field_as_too_large(&self, field: &str) {
        self.reject_fields_too_large.lock().insert(field.to_string());
    }
}

#[async_trait]
impl IndexAdmin for InMemoryIndexAdmin {
    async fn create_index(&self, namespace: &str, index: &CompoundIndex) -> Result<(), EngineError> {
        let rejected = self.reject_fields_too_large.lock();
        if let Some(offending) = index
            .field_paths()
            .find(|path| rejected.contains(path.as_str()))
        {
            return Err(EngineError::IndexTooLarge {
                index: index.canonical_name(),
                field: offending.clone(),
            });
        }
        drop(rejected);
        let named = NamedIndex::recommended(index.clone());
        self.indexes
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .push(named);
        Ok(())
    }

    async fn drop_index(&self, namespace: &str, name: &str) -> Result<(), EngineError> {
        let mut indexes = self.indexes.lock();
        if let Some(list) = indexes.get_mut(namespace) {
            list.retain(|named| named.name != name);
        }
        Ok(())
    }

    async fn list_indexes(&self, namespace: &str) -> Result<IndexSet, EngineError> {
        let mut set = IndexSet::new();
        if let Some(list) = self.indexes.lock().get(namespace) {
            for named in list {
                set.insert(named.clone());
            }
        }
        Ok(set)
    }
}

/// An in-memory state document, for tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: Mutex<Option<EngineState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<Option<EngineState>, EngineError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &EngineState) -> Result<(), EngineError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

pub type SharedProfileSource = Arc<dyn ProfileSource>;
pub type SharedDocumentSampler = Arc<dyn DocumentSampler>;
pub type SharedIndexAdmin = Arc<dyn IndexAdmin>;
pub type SharedStateStore = Arc<dyn StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Direction, IndexKey};

    #[tokio::test]
    async fn in_memory_document_sampler_fetches_by_index() {
        let mut collections = HashMap::new();
        collections.insert(
            "db.c".to_string(),
            vec![Value::from(1), Value::from(2), Value::from(3)],
        );
        let sampler = InMemoryDocumentSampler::new(collections);
        assert_eq!(sampler.count("db.c").await.unwrap(), 3);
        let fetched = sampler.fetch_at("db.c", &[0, 2]).await.unwrap();
        assert_eq!(fetched, vec![Value::from(1), Value::from(3)]);
    }

    #[tokio::test]
    async fn in_memory_index_admin_create_then_drop() {
        let admin = InMemoryIndexAdmin::new();
        let index = CompoundIndex::new(
            "db.c",
            vec![IndexKey {
                path: "x".into(),
                direction: Direction::Asc,
            }],
        );
        admin.create_index("db.c", &index).await.unwrap();
        let listed = admin.list_indexes("db.c").await.unwrap();
        assert_eq!(listed.len(), 1);

        let name = listed.iter().next().unwrap().name.clone();
        admin.drop_index("db.c", &name).await.unwrap();
        let listed = admin.list_indexes("db.c").await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn in_memory_state_store_round_trips() {
        let store = InMemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&EngineState::default()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
