//! Instance directory: the read-only cloud-side view of a scale set.
//!
//! A snapshot may be absent while the provider has nothing to report yet
//! (or the backing resource is still being created). Absence is not an
//! error; the engine leaves existing tracking records untouched until a
//! snapshot becomes available again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{FleetMember, ImageSpec, ProviderId, ProvisioningState};

/// Point-in-time view of a scale set and its instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSetSnapshot {
    /// Provisioning state of the scale set itself.
    pub state: ProvisioningState,

    /// The model the scale set currently rolls out, when reported.
    pub image: Option<ImageSpec>,

    /// Instances keyed by provider ID.
    pub members: BTreeMap<ProviderId, FleetMember>,
}

/// Read-only provider of scale-set snapshots.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Fetch the current snapshot, or `None` if no cloud-side information
    /// is available yet.
    async fn snapshot(&self) -> anyhow::Result<Option<ScaleSetSnapshot>>;
}

/// In-memory directory for testing and development.
#[derive(Default)]
pub struct InMemoryDirectory {
    inner: RwLock<Option<ScaleSetSnapshot>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot.
    pub async fn set_snapshot(&self, snapshot: ScaleSetSnapshot) {
        *self.inner.write().await = Some(snapshot);
    }

    /// Drop the snapshot, simulating an unavailable directory.
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    /// Upsert one member, keeping the rest of the snapshot.
    pub async fn put_member(&self, member: FleetMember) {
        let mut inner = self.inner.write().await;
        if let Some(snapshot) = inner.as_mut() {
            snapshot.members.insert(member.provider_id.clone(), member);
        }
    }

    /// Remove one member out-of-band.
    pub async fn remove_member(&self, provider_id: &ProviderId) {
        let mut inner = self.inner.write().await;
        if let Some(snapshot) = inner.as_mut() {
            snapshot.members.remove(provider_id);
        }
    }

    /// Set the scale set's own provisioning state.
    pub async fn set_state(&self, state: ProvisioningState) {
        let mut inner = self.inner.write().await;
        if let Some(snapshot) = inner.as_mut() {
            snapshot.state = state;
        }
    }
}

#[async_trait]
impl InstanceDirectory for InMemoryDirectory {
    async fn snapshot(&self) -> anyhow::Result<Option<ScaleSetSnapshot>> {
        Ok(self.inner.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BootstrapState;

    fn member(id: &str) -> FleetMember {
        FleetMember {
            provider_id: ProviderId::new(format!("vmss_{id}")),
            instance_id: id.to_string(),
            state: ProvisioningState::Succeeded,
            bootstrap: BootstrapState::Succeeded,
            image: None,
        }
    }

    #[tokio::test]
    async fn snapshot_absent_until_set() {
        let directory = InMemoryDirectory::new();
        assert!(directory.snapshot().await.unwrap().is_none());

        directory
            .set_snapshot(ScaleSetSnapshot {
                state: ProvisioningState::Succeeded,
                image: None,
                members: BTreeMap::new(),
            })
            .await;
        assert!(directory.snapshot().await.unwrap().is_some());

        directory.clear().await;
        assert!(directory.snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn member_upsert_and_removal() {
        let directory = InMemoryDirectory::new();
        directory
            .set_snapshot(ScaleSetSnapshot {
                state: ProvisioningState::Succeeded,
                image: None,
                members: BTreeMap::new(),
            })
            .await;

        directory.put_member(member("0")).await;
        directory.put_member(member("1")).await;
        let snapshot = directory.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.members.len(), 2);

        directory.remove_member(&ProviderId::new("vmss_0")).await;
        let snapshot = directory.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.members.len(), 1);
    }
}
