//! Node correlator: joins a tracking record to its cluster node.
//!
//! Lookup is by the stored back-reference when one exists, otherwise by
//! provider ID. Absence of a node is not an error; it is one of three
//! distinguishable waiting states, each surfaced as a `NodeHealthy`
//! condition. The node itself is never mutated.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{PoolError, PoolResult};
use crate::nodes::NodeSource;
use crate::store::TrackingStore;
use crate::types::{reason, Condition, ConditionType, Node, NodeRef, TrackingRecord};

pub struct NodeCorrelator {
    nodes: Arc<dyn NodeSource>,
    store: Arc<dyn TrackingStore>,
}

impl NodeCorrelator {
    pub fn new(nodes: Arc<dyn NodeSource>, store: Arc<dyn TrackingStore>) -> Self {
        Self { nodes, store }
    }

    /// Fold node readiness and identity into one tracking record, and
    /// persist the result.
    #[instrument(skip(self, record), fields(record = %record.name))]
    pub async fn update(&self, record: &mut TrackingRecord) -> PoolResult<()> {
        match &record.node_ref {
            Some(node_ref) => {
                let node = self.lookup_by_ref(record, node_ref.clone()).await?;
                match node {
                    Some(node) => self.fold_node(record, &node),
                    None => {
                        // The reference went stale: the node is gone.
                        debug!("Referenced node not found");
                        record.ready = false;
                        record.set_condition(Condition::unsatisfied(
                            ConditionType::NodeHealthy,
                            reason::NODE_NOT_FOUND,
                            "referenced node no longer exists",
                        ));
                    }
                }
            }
            None if record.provider_id.is_empty() => {
                debug!("No node reference and no provider ID yet");
                record.set_condition(Condition::unsatisfied(
                    ConditionType::NodeHealthy,
                    reason::WAITING_FOR_NODE_REF,
                    "waiting for a node reference",
                ));
            }
            None => {
                let node = self
                    .nodes
                    .by_provider_id(&record.provider_id)
                    .await
                    .map_err(|source| PoolError::NodeLookup {
                        record: record.name.clone(),
                        source,
                    })?;
                match node {
                    Some(node) => self.fold_node(record, &node),
                    None => {
                        debug!(provider_id = %record.provider_id, "Node not registered yet");
                        record.set_condition(Condition::unsatisfied(
                            ConditionType::NodeHealthy,
                            reason::NODE_PROVISIONING,
                            "node is still provisioning",
                        ));
                    }
                }
            }
        }

        self.store
            .update(record)
            .await
            .map_err(|source| PoolError::UpdateRecord {
                name: record.name.clone(),
                source,
            })
    }

    async fn lookup_by_ref(
        &self,
        record: &TrackingRecord,
        node_ref: NodeRef,
    ) -> PoolResult<Option<Node>> {
        self.nodes
            .by_ref(&node_ref)
            .await
            .map_err(|source| PoolError::NodeLookup {
                record: record.name.clone(),
                source,
            })
    }

    fn fold_node(&self, record: &mut TrackingRecord, node: &Node) {
        record.ready = node.ready;
        record.node_ref = Some(NodeRef::from_node(node));
        record.node_version = Some(node.version.clone());
        if node.ready {
            record.set_condition(Condition::satisfied(ConditionType::NodeHealthy));
        } else {
            record.set_condition(Condition::unsatisfied(
                ConditionType::NodeHealthy,
                reason::NODE_NOT_READY,
                "node is registered but not ready",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::InMemoryNodes;
    use crate::store::InMemoryStore;
    use crate::types::{PoolLabels, ProviderId, ProvisioningState};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(provider_id: &str) -> TrackingRecord {
        TrackingRecord {
            name: format!("pool0-{provider_id}"),
            provider_id: ProviderId::new(provider_id),
            instance_id: "0".to_string(),
            labels: PoolLabels {
                cluster: "c1".into(),
                pool: "pool0".into(),
                machine_pool: "pool0".into(),
            },
            annotations: BTreeMap::new(),
            finalizers: vec![],
            owner: None,
            state: ProvisioningState::Succeeded,
            latest_model_applied: true,
            ready: false,
            node_ref: None,
            node_version: None,
            conditions: vec![],
            created_at: Utc::now(),
        }
    }

    fn node(name: &str, provider_id: &str, ready: bool) -> Node {
        Node {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: format!("uid-{name}"),
            provider_id: Some(ProviderId::new(provider_id)),
            ready,
            version: "v1.29.2".to_string(),
        }
    }

    async fn correlator_with(nodes: InMemoryNodes) -> (NodeCorrelator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (
            NodeCorrelator::new(Arc::new(nodes), store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn folds_ready_node_by_provider_id() {
        let nodes = InMemoryNodes::new();
        nodes.add(node("n1", "vmss_a", true)).await;
        let (correlator, store) = correlator_with(nodes).await;

        let mut rec = record("vmss_a");
        store.insert(rec.clone()).await;
        correlator.update(&mut rec).await.unwrap();

        assert!(rec.ready);
        assert_eq!(rec.node_version.as_deref(), Some("v1.29.2"));
        let node_ref = rec.node_ref.as_ref().unwrap();
        assert_eq!(node_ref.name, "n1");
        assert_eq!(node_ref.kind, "Node");
        assert!(rec.condition(ConditionType::NodeHealthy).unwrap().satisfied);

        // Persisted, not just mutated in place.
        assert!(store.get(&rec.name).await.unwrap().ready);
    }

    #[tokio::test]
    async fn unready_node_marks_condition() {
        let nodes = InMemoryNodes::new();
        nodes.add(node("n1", "vmss_a", false)).await;
        let (correlator, store) = correlator_with(nodes).await;

        let mut rec = record("vmss_a");
        store.insert(rec.clone()).await;
        correlator.update(&mut rec).await.unwrap();

        assert!(!rec.ready);
        let cond = rec.condition(ConditionType::NodeHealthy).unwrap();
        assert_eq!(cond.reason.as_deref(), Some(reason::NODE_NOT_READY));
    }

    #[tokio::test]
    async fn missing_node_without_provider_id_waits_for_ref() {
        let (correlator, store) = correlator_with(InMemoryNodes::new()).await;

        let mut rec = record("");
        store.insert(rec.clone()).await;
        correlator.update(&mut rec).await.unwrap();

        let cond = rec.condition(ConditionType::NodeHealthy).unwrap();
        assert_eq!(cond.reason.as_deref(), Some(reason::WAITING_FOR_NODE_REF));
    }

    #[tokio::test]
    async fn missing_node_with_provider_id_is_provisioning() {
        let (correlator, store) = correlator_with(InMemoryNodes::new()).await;

        let mut rec = record("vmss_a");
        store.insert(rec.clone()).await;
        correlator.update(&mut rec).await.unwrap();

        let cond = rec.condition(ConditionType::NodeHealthy).unwrap();
        assert_eq!(cond.reason.as_deref(), Some(reason::NODE_PROVISIONING));
    }

    #[tokio::test]
    async fn stale_reference_reports_node_not_found() {
        let nodes = InMemoryNodes::new();
        let n = node("n1", "vmss_a", true);
        let (correlator, store) = correlator_with(nodes).await;

        let mut rec = record("vmss_a");
        rec.node_ref = Some(NodeRef::from_node(&n));
        rec.ready = true;
        store.insert(rec.clone()).await;

        correlator.update(&mut rec).await.unwrap();

        assert!(!rec.ready);
        let cond = rec.condition(ConditionType::NodeHealthy).unwrap();
        assert_eq!(cond.reason.as_deref(), Some(reason::NODE_NOT_FOUND));
    }
}
