//! Machine-pool reconciliation core.
//!
//! Keeps a declarative machine pool in sync with the members of a
//! cloud-managed scale set, and propagates per-instance lifecycle into
//! tracking records and their cluster nodes.
//!
//! ## Architecture
//!
//! - [`directory::InstanceDirectory`]: read-only cloud-side view of the
//!   scale set's instances.
//! - [`store::TrackingStore`] / [`store::OwnerResolver`]: per-instance
//!   tracking records and their owning machine objects. Records are only
//!   ever removed by deleting their owner.
//! - [`engine::PoolReconciler`]: diffs directory against store, creates
//!   and deletes records, applies the rollout strategy, and keeps pool
//!   bookkeeping current.
//! - [`correlator::NodeCorrelator`]: joins each record to its cluster node
//!   and folds readiness back into the record.
//! - [`guard::OperationGuard`]: gates scale-down while an asynchronous
//!   cloud operation is still in flight.
//!
//! In-memory collaborator implementations are provided for testing and
//! development; production deployments inject their own.

pub mod correlator;
pub mod directory;
pub mod engine;
pub mod error;
pub mod guard;
pub mod images;
pub mod nodes;
pub mod status;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use correlator::NodeCorrelator;
pub use directory::{InMemoryDirectory, InstanceDirectory, ScaleSetSnapshot};
pub use engine::{PassOutcome, PoolReconciler};
pub use error::{PoolError, PoolResult};
pub use guard::{OperationDescriptor, OperationGuard, OperationKind};
pub use nodes::{InMemoryNodes, NodeSource};
pub use store::{InMemoryStore, OwnerResolver, TrackingStore};
pub use types::{
    FleetMember, Node, PoolAggregate, PoolSpec, PoolStatus, ProviderId, ProvisioningState,
    TrackingRecord,
};
