//! Reconciliation loop for one machine pool.
//!
//! Drives the engine on a fixed interval until shutdown. Each tick is one
//! pass; a failed pass is logged and retried on the next tick, so the loop
//! itself never dies on a transient error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use vmfleet_pool::correlator::NodeCorrelator;
use vmfleet_pool::{PoolAggregate, PoolReconciler, TrackingStore};

/// Controller loop configuration.
pub struct ControllerConfig {
    /// Interval between reconcile passes.
    pub reconcile_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// Controller for a single machine pool.
pub struct Controller {
    reconciler: PoolReconciler,
    correlator: NodeCorrelator,
    store: Arc<dyn TrackingStore>,
    pool: Mutex<PoolAggregate>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        reconciler: PoolReconciler,
        correlator: NodeCorrelator,
        store: Arc<dyn TrackingStore>,
        pool: PoolAggregate,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            correlator,
            store,
            pool: Mutex::new(pool),
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting pool reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconcile pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconcile pass plus node correlation for every record.
    async fn tick(&self) -> anyhow::Result<()> {
        let mut pool = self.pool.lock().await;

        let outcome = self.reconciler.reconcile(&mut pool).await?;
        debug!(
            created = outcome.records_created,
            deleted_out_of_band = outcome.deleted_out_of_band,
            deleted_by_policy = outcome.deleted_by_policy,
            "Pass outcome"
        );

        // One record's failed correlation must not starve the rest.
        for mut record in self.store.list(&pool.labels()).await? {
            if let Err(e) = self.correlator.update(&mut record).await {
                warn!(record = %record.name, error = %e, "Node correlation failed, continuing");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::RwLock;
    use vmfleet_pool::types::{BootstrapState, PoolLabels, PoolSpec};
    use vmfleet_pool::{
        FleetMember, InMemoryDirectory, InMemoryNodes, InMemoryStore, Node, OperationGuard,
        ProviderId, ProvisioningState, ScaleSetSnapshot, TrackingRecord,
    };
    use vmfleet_rollout::RolloutStrategy;

    /// Store wrapper whose updates fail for one record.
    struct StuckUpdateStore {
        inner: Arc<InMemoryStore>,
        fail_for: String,
    }

    #[async_trait]
    impl TrackingStore for StuckUpdateStore {
        async fn list(&self, labels: &PoolLabels) -> anyhow::Result<Vec<TrackingRecord>> {
            self.inner.list(labels).await
        }

        async fn create(&self, record: TrackingRecord) -> anyhow::Result<()> {
            self.inner.create(record).await
        }

        async fn update(&self, record: &TrackingRecord) -> anyhow::Result<()> {
            if record.name == self.fail_for {
                anyhow::bail!("simulated update conflict");
            }
            self.inner.update(record).await
        }
    }

    fn member(id: &str) -> FleetMember {
        FleetMember {
            provider_id: ProviderId::new(format!("vmss_{id}")),
            instance_id: id.to_string(),
            state: ProvisioningState::Succeeded,
            bootstrap: BootstrapState::Succeeded,
            image: None,
        }
    }

    fn ready_node(id: &str) -> Node {
        Node {
            name: format!("node-{id}"),
            namespace: "default".to_string(),
            uid: format!("node-uid-{id}"),
            provider_id: Some(ProviderId::new(format!("vmss_{id}"))),
            ready: true,
            version: "v1.29.2".to_string(),
        }
    }

    #[tokio::test]
    async fn one_failed_correlation_does_not_abort_the_rest() {
        let directory = Arc::new(InMemoryDirectory::new());
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(StuckUpdateStore {
            inner: inner.clone(),
            fail_for: "pool0-a".to_string(),
        });
        let guard = Arc::new(RwLock::new(OperationGuard::new()));
        let nodes = Arc::new(InMemoryNodes::new());

        let mut members = BTreeMap::new();
        for m in [member("a"), member("b")] {
            members.insert(m.provider_id.clone(), m);
        }
        directory
            .set_snapshot(ScaleSetSnapshot {
                state: ProvisioningState::Succeeded,
                image: None,
                members,
            })
            .await;
        nodes.add(ready_node("a")).await;
        nodes.add(ready_node("b")).await;

        let reconciler = PoolReconciler::new(directory, store.clone(), inner.clone(), guard);
        let correlator = NodeCorrelator::new(nodes, store.clone());
        let pool = PoolAggregate::new(PoolSpec {
            name: "pool0".to_string(),
            cluster: "c1".to_string(),
            machine_pool: "pool0".to_string(),
            resource_name: "pool0".to_string(),
            service: "scalesets".to_string(),
            desired_replicas: 2,
            strategy: RolloutStrategy::default(),
            externally_managed_replicas: false,
            image: None,
        });
        let controller = Controller::new(
            reconciler,
            correlator,
            store,
            pool,
            ControllerConfig::default(),
        );

        // The tick survives the conflict on a, and b still gets its node
        // readiness folded in and persisted.
        controller.tick().await.unwrap();
        assert!(inner.get("pool0-b").await.unwrap().ready);
        assert!(!inner.get("pool0-a").await.unwrap().ready);
    }
}
