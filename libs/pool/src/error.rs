//! Error types for pool reconciliation.

use thiserror::Error;
use vmfleet_rollout::RolloutError;

use crate::types::ProviderId;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during a reconciliation pass.
///
/// Every variant carries the identity of the record or resource involved so
/// that a failure in a loop over many records stays attributable. All
/// variants are transient from the engine's point of view: the next pass
/// retries whatever did not converge.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Fetching the instance directory snapshot failed.
    #[error("directory snapshot for scale set {resource}: {source}")]
    Directory {
        resource: String,
        source: anyhow::Error,
    },

    /// Listing tracking records failed.
    #[error("listing tracking records for pool {pool}: {source}")]
    ListRecords {
        pool: String,
        source: anyhow::Error,
    },

    /// Creating a tracking record failed.
    #[error("creating tracking record for {provider_id}: {source}")]
    CreateRecord {
        provider_id: ProviderId,
        source: anyhow::Error,
    },

    /// Persisting a tracking record update failed.
    #[error("updating tracking record {name}: {source}")]
    UpdateRecord { name: String, source: anyhow::Error },

    /// Resolving or deleting a record's owning machine failed.
    #[error("deleting owner machine for {provider_id}: {source}")]
    DeleteOwner {
        provider_id: ProviderId,
        source: anyhow::Error,
    },

    /// Looking up a cluster node failed.
    #[error("node lookup for record {record}: {source}")]
    NodeLookup {
        record: String,
        source: anyhow::Error,
    },

    /// The deployment strategy could not compute a surge or victim set.
    #[error("deployment strategy: {0}")]
    Policy(#[from] RolloutError),
}
