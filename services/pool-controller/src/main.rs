//! vmfleet pool controller binary.
//!
//! Wires the reconciliation engine to in-memory collaborators and runs the
//! loop. Production deployments embed the engine with real providers; this
//! binary is the development harness.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, RwLock};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmfleet_pool::correlator::NodeCorrelator;
use vmfleet_pool::types::PoolSpec;
use vmfleet_pool::{
    InMemoryDirectory, InMemoryNodes, InMemoryStore, OperationGuard, PoolAggregate, PoolReconciler,
};
use vmfleet_pool_controller::{Config, Controller, ControllerConfig};
use vmfleet_rollout::RolloutStrategy;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing; RUST_LOG overrides the configured level.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmfleet pool controller");
    info!(
        pool = %config.pool_name,
        cluster = %config.cluster_name,
        desired_replicas = config.desired_replicas,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // In-memory collaborators (development harness).
    let directory = Arc::new(InMemoryDirectory::new());
    let store = Arc::new(InMemoryStore::new());
    let nodes = Arc::new(InMemoryNodes::new());
    let guard = Arc::new(RwLock::new(OperationGuard::new()));

    let reconciler = PoolReconciler::new(directory, store.clone(), store.clone(), guard);
    let correlator = NodeCorrelator::new(nodes, store.clone());

    let pool = PoolAggregate::new(PoolSpec {
        name: config.pool_name.clone(),
        cluster: config.cluster_name.clone(),
        machine_pool: config.machine_pool_name.clone(),
        resource_name: config.pool_name.clone(),
        service: "scalesets".to_string(),
        desired_replicas: config.desired_replicas,
        strategy: RolloutStrategy::default(),
        externally_managed_replicas: false,
        image: None,
    });

    let controller = Controller::new(
        reconciler,
        correlator,
        store,
        pool,
        ControllerConfig {
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
        },
    );

    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            controller.run(shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = controller_handle => {
            info!("Controller exited");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Pool controller shutdown complete");
    Ok(())
}
