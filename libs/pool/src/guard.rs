//! Long-running-operation guard.
//!
//! Cloud create/update/delete calls against a scale set are asynchronous
//! and can outlive many reconcile passes. A descriptor is set when such a
//! call is issued and removed once its terminal outcome is observed. While
//! any descriptor exists for a pool's backing resource, the engine must not
//! start a new policy-driven scale change; creations are exempt because
//! they mirror instances that already physically exist.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of asynchronous operation against a cloud resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Put,
    Patch,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Put,
        OperationKind::Patch,
        OperationKind::Delete,
    ];
}

/// Descriptor of one outstanding asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Name of the cloud resource the operation targets.
    pub resource: String,

    /// Service the resource belongs to.
    pub service: String,

    pub kind: OperationKind,

    /// Opaque resume token for polling the operation.
    pub future_data: String,

    pub started_at: DateTime<Utc>,
}

/// Keyed store of in-flight operation descriptors.
///
/// Keys are (resource, service, kind); at most one descriptor exists per
/// key. The guard itself is plain data; the owner of a reconcile pass has
/// exclusive access for the duration of the pass.
#[derive(Debug, Default, Clone)]
pub struct OperationGuard {
    entries: BTreeMap<(String, String, OperationKind), OperationDescriptor>,
}

impl OperationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a descriptor under its (resource, service, kind) key.
    pub fn set(&mut self, descriptor: OperationDescriptor) {
        self.entries.insert(
            (
                descriptor.resource.clone(),
                descriptor.service.clone(),
                descriptor.kind,
            ),
            descriptor,
        );
    }

    pub fn get(
        &self,
        resource: &str,
        service: &str,
        kind: OperationKind,
    ) -> Option<&OperationDescriptor> {
        self.entries
            .get(&(resource.to_string(), service.to_string(), kind))
    }

    /// Remove a descriptor once its operation reached a terminal outcome.
    pub fn delete(&mut self, resource: &str, service: &str, kind: OperationKind) {
        self.entries
            .remove(&(resource.to_string(), service.to_string(), kind));
    }

    /// Whether any put/patch/delete is outstanding for a resource.
    pub fn any_in_flight(&self, resource: &str, service: &str) -> bool {
        OperationKind::ALL
            .iter()
            .any(|kind| self.get(resource, service, *kind).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(resource: &str, kind: OperationKind) -> OperationDescriptor {
        OperationDescriptor {
            resource: resource.to_string(),
            service: "scalesets".to_string(),
            kind,
            future_data: "token".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut guard = OperationGuard::new();
        assert!(guard.get("pool0", "scalesets", OperationKind::Put).is_none());

        guard.set(descriptor("pool0", OperationKind::Put));
        assert!(guard.get("pool0", "scalesets", OperationKind::Put).is_some());
        // Different kind, same resource: distinct key.
        assert!(guard.get("pool0", "scalesets", OperationKind::Delete).is_none());

        guard.delete("pool0", "scalesets", OperationKind::Put);
        assert!(guard.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_descriptor() {
        let mut guard = OperationGuard::new();
        guard.set(descriptor("pool0", OperationKind::Patch));

        let mut newer = descriptor("pool0", OperationKind::Patch);
        newer.future_data = "token-2".to_string();
        guard.set(newer);

        let stored = guard.get("pool0", "scalesets", OperationKind::Patch).unwrap();
        assert_eq!(stored.future_data, "token-2");
    }

    #[test]
    fn any_in_flight_covers_all_kinds() {
        let mut guard = OperationGuard::new();
        assert!(!guard.any_in_flight("pool0", "scalesets"));

        guard.set(descriptor("pool0", OperationKind::Delete));
        assert!(guard.any_in_flight("pool0", "scalesets"));
        assert!(!guard.any_in_flight("pool1", "scalesets"));
        assert!(!guard.any_in_flight("pool0", "disks"));
    }
}
