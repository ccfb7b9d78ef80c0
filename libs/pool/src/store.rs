//! Tracking-record store and owner resolution.
//!
//! The store only creates and updates records. Removal is always indirect:
//! the engine deletes a record's owning machine and ownership garbage
//! collection removes the record afterwards, so drain/cordon tied to the
//! owner runs first. The in-memory implementation collapses that chain:
//! deleting an owner immediately drops its records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{OwnerMachine, OwnerRef, PoolLabels, TrackingRecord};

/// Store of per-instance tracking records.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// List records whose labels exactly match the given pool labels.
    async fn list(&self, labels: &PoolLabels) -> anyhow::Result<Vec<TrackingRecord>>;

    /// Create a new record. Fails if a record with the same name exists.
    async fn create(&self, record: TrackingRecord) -> anyhow::Result<()>;

    /// Persist changes to an existing record's state or status.
    async fn update(&self, record: &TrackingRecord) -> anyhow::Result<()>;
}

/// Resolves and deletes the machine object owning a tracking record.
#[async_trait]
pub trait OwnerResolver: Send + Sync {
    /// Resolve a record's owning machine, or `None` if it has not been
    /// adopted yet.
    async fn get_owner(&self, record: &TrackingRecord) -> anyhow::Result<Option<OwnerMachine>>;

    /// Delete an owning machine, triggering drain and eventual garbage
    /// collection of the records it owns.
    async fn delete_owner(&self, owner: &OwnerMachine) -> anyhow::Result<()>;
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, TrackingRecord>,
    owners: HashMap<String, OwnerMachine>,
}

/// In-memory store for testing and development.
///
/// With `auto_adopt` enabled (the default), every created record
/// immediately gets an owning machine, the way the surrounding pool
/// controller would adopt records in a real deployment.
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    auto_adopt: bool,
    uid_counter: std::sync::atomic::AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            auto_adopt: true,
            uid_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// A store that never adopts records, leaving them ownerless.
    pub fn without_adoption() -> Self {
        Self {
            auto_adopt: false,
            ..Self::new()
        }
    }

    fn next_uid(&self) -> String {
        let n = self
            .uid_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("uid-{n:08}")
    }

    /// Number of records currently held.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Fetch a record by name.
    pub async fn get(&self, name: &str) -> Option<TrackingRecord> {
        self.state.read().await.records.get(name).cloned()
    }

    /// Insert a record directly, bypassing `create` semantics (test setup).
    pub async fn insert(&self, record: TrackingRecord) {
        let mut state = self.state.write().await;
        if let Some(owner) = &record.owner {
            state.owners.insert(
                owner.name.clone(),
                OwnerMachine {
                    name: owner.name.clone(),
                    uid: owner.uid.clone(),
                },
            );
        }
        state.records.insert(record.name.clone(), record);
    }

    /// Adopt one existing record, creating its owning machine.
    pub async fn adopt(&self, record_name: &str) {
        let uid = self.next_uid();
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get_mut(record_name) {
            let owner = OwnerMachine {
                name: format!("machine-{record_name}"),
                uid,
            };
            record.owner = Some(OwnerRef {
                kind: "Machine".to_string(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
            });
            state.owners.insert(owner.name.clone(), owner);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackingStore for InMemoryStore {
    async fn list(&self, labels: &PoolLabels) -> anyhow::Result<Vec<TrackingRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.labels.matches(labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut record: TrackingRecord) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.name) {
            anyhow::bail!("tracking record {} already exists", record.name);
        }

        if self.auto_adopt {
            let owner = OwnerMachine {
                name: format!("machine-{}", record.name),
                uid: self.next_uid(),
            };
            record.owner = Some(OwnerRef {
                kind: "Machine".to_string(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
            });
            state.owners.insert(owner.name.clone(), owner);
        }

        debug!(record = %record.name, provider_id = %record.provider_id, "Created tracking record");
        state.records.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update(&self, record: &TrackingRecord) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        match state.records.get_mut(&record.name) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => anyhow::bail!("tracking record {} not found", record.name),
        }
    }
}

#[async_trait]
impl OwnerResolver for InMemoryStore {
    async fn get_owner(&self, record: &TrackingRecord) -> anyhow::Result<Option<OwnerMachine>> {
        let state = self.state.read().await;
        let Some(owner_ref) = &record.owner else {
            return Ok(None);
        };
        Ok(state.owners.get(&owner_ref.name).cloned())
    }

    async fn delete_owner(&self, owner: &OwnerMachine) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.owners.remove(&owner.name);
        // Ownership GC: records referencing this owner go with it.
        state
            .records
            .retain(|_, r| r.owner.as_ref().map(|o| o.name.as_str()) != Some(owner.name.as_str()));
        debug!(owner = %owner.name, "Deleted owner machine");
        Ok(())
    }
}
