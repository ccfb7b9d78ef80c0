//! Domain model for machine pools and their tracked members.
//!
//! Three independently-updated views of the same fleet meet here:
//!
//! - [`FleetMember`]: what the cloud scale set reports for one instance.
//! - [`TrackingRecord`]: the per-instance object this system owns.
//! - [`Node`]: the cluster node that eventually joins from that instance.
//!
//! The [`PoolAggregate`] is the desired-state object tying them together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vmfleet_rollout::{RolloutStrategy, ScaleCandidate};

/// Finalizer placed on tracking records created by the engine.
pub const TRACKING_RECORD_FINALIZER: &str = "vmfleet.io/machine-pool-machine";

/// Annotation carrying the model fingerprint a record was created against.
pub const MODEL_FINGERPRINT_ANNOTATION: &str = "vmfleet.io/model-fingerprint";

/// Condition reason strings.
pub mod reason {
    pub const CREATING: &str = "Creating";
    pub const DELETING: &str = "Deleting";
    pub const SCALING_UP: &str = "ScalingUp";
    pub const SCALING_DOWN: &str = "ScalingDown";
    pub const ROLLING_UPDATE: &str = "RollingUpdateInProgress";
    pub const WAITING_FOR_RUNNING: &str = "WaitingForRunning";
    pub const NODE_NOT_FOUND: &str = "NodeNotFound";
    pub const WAITING_FOR_NODE_REF: &str = "WaitingForNodeRef";
    pub const NODE_PROVISIONING: &str = "NodeProvisioning";
    pub const NODE_NOT_READY: &str = "NodeNotReady";
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}

/// Stable provider identifier for a scale-set instance.
///
/// Canonical form is `vmss_<resourceID>`, derived from the cloud resource
/// ID. Underscores are replaced with dashes where the ID is used as a name
/// component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Build the canonical provider ID from a cloud resource ID.
    pub fn from_resource_id(resource_id: &str) -> Self {
        Self(format!("vmss_{resource_id}"))
    }

    /// Wrap an already-canonical provider ID string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The ID normalized for use as a name component (`_` → `-`).
    pub fn name_component(&self) -> String {
        self.0.replace('_', "-")
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operational state reported by the cloud provider, for a scale set or a
/// single instance.
///
/// Providers may report custom strings; those are carried as opaque
/// non-terminal labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Deleting,
    Deleted,
    Failed,
    #[serde(untagged)]
    Other(String),
}

impl ProvisioningState {
    /// The resource reached a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Deleted)
    }

    /// The instance is on its way out of the fleet.
    pub fn is_departing(&self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Succeeded => "Succeeded",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
            Self::Failed => "Failed",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bootstrap/provisioning sub-state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Creating,
    Succeeded,
    Failed,
}

/// Image/model reference shapes the provider understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSpec {
    /// Direct resource-ID reference.
    Id { id: String },

    /// Shared gallery image.
    Gallery {
        gallery: String,
        name: String,
        version: String,
    },

    /// Marketplace image.
    Marketplace {
        publisher: String,
        offer: String,
        sku: String,
        version: String,
    },
}

impl ImageSpec {
    /// SHA-256 fingerprint of the canonical serialized form.
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"));
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("sha256:{}", hex::encode(&hasher.finalize()[..16]))
    }
}

/// One compute instance as the cloud scale set reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetMember {
    pub provider_id: ProviderId,

    /// Instance identifier within the scale set.
    pub instance_id: String,

    pub state: ProvisioningState,
    pub bootstrap: BootstrapState,

    /// Image the instance is currently running, when the provider reports it.
    pub image: Option<ImageSpec>,
}

/// Correlation labels between a pool and its tracking records.
///
/// All three must match exactly for a record to belong to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLabels {
    pub cluster: String,
    pub pool: String,
    pub machine_pool: String,
}

impl PoolLabels {
    pub fn matches(&self, other: &PoolLabels) -> bool {
        self == other
    }
}

/// Compact back-reference to a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub api_version: String,
}

/// Back-reference to the machine object owning a tracking record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A cluster node, read-only from this crate's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub provider_id: Option<ProviderId>,
    pub ready: bool,

    /// Software version the node reports.
    pub version: String,
}

impl NodeRef {
    pub fn from_node(node: &Node) -> Self {
        Self {
            kind: "Node".to_string(),
            namespace: node.namespace.clone(),
            name: node.name.clone(),
            uid: node.uid.clone(),
            api_version: "v1".to_string(),
        }
    }
}

/// A status condition on a pool or a tracking record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub satisfied: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl Condition {
    pub fn satisfied(condition_type: ConditionType) -> Self {
        Self {
            condition_type,
            satisfied: true,
            reason: None,
            message: None,
        }
    }

    pub fn unsatisfied(
        condition_type: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            satisfied: false,
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }
}

/// Condition types carried on pools and tracking records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// The backing scale set is up and running.
    ScaleSetRunning,

    /// All members run the pool's current model.
    ModelUpdated,

    /// Observed replicas match desired replicas.
    DesiredReplicas,

    /// The instance behind a tracking record is running.
    InstanceRunning,

    /// The record's cluster node is present and ready.
    NodeHealthy,

    /// The last reconcile pass reported an unresolved error.
    ReconcileError,
}

fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

fn clear_condition(conditions: &mut Vec<Condition>, condition_type: ConditionType) {
    conditions.retain(|c| c.condition_type != condition_type);
}

/// Per-instance tracking record, one per fleet member while it exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Record name, derived from the pool name and the instance identifier.
    pub name: String,

    pub provider_id: ProviderId,
    pub instance_id: String,

    pub labels: PoolLabels,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,

    /// Back-reference to the owning machine object, when adopted.
    pub owner: Option<OwnerRef>,

    /// Mirror of the cloud-side provisioning state.
    pub state: ProvisioningState,

    /// Whether the instance runs the pool's current model.
    pub latest_model_applied: bool,

    pub ready: bool,
    pub node_ref: Option<NodeRef>,
    pub node_version: Option<String>,

    pub conditions: Vec<Condition>,
    pub created_at: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition);
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

impl ScaleCandidate for TrackingRecord {
    fn candidate_id(&self) -> &str {
        self.provider_id.as_str()
    }

    fn is_failed(&self) -> bool {
        matches!(self.state, ProvisioningState::Failed)
    }

    fn is_deleting(&self) -> bool {
        self.state.is_departing()
    }

    fn has_latest_model(&self) -> bool {
        self.latest_model_applied
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// The machine object owning a tracking record.
///
/// Deleting it is the only sanctioned way to remove a record: drain and
/// cordon run against the owner, then ownership garbage collection removes
/// the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerMachine {
    pub name: String,
    pub uid: String,
}

/// Desired state of a machine pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub cluster: String,

    /// Name of the machine-pool resource records correlate back to. May
    /// differ from `name` when the pool object is named independently.
    pub machine_pool: String,

    /// Name of the backing scale-set resource.
    pub resource_name: String,

    /// Service the backing resource belongs to, for operation gating.
    pub service: String,

    pub desired_replicas: i64,
    pub strategy: RolloutStrategy,

    /// Replicas are managed by an external autoscaler; the engine must not
    /// scale down on its own.
    pub externally_managed_replicas: bool,

    /// The pool's current model. Members running anything else are stale.
    pub image: Option<ImageSpec>,
}

/// Observed state of a machine pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Count of ready tracking records as of the last completed pass.
    pub replicas: i64,

    /// Provider IDs of all current tracking records (unordered multiset).
    pub provider_ids: Vec<ProviderId>,

    /// Scale-set state as last reported by the instance directory.
    pub scale_set_state: Option<ProvisioningState>,

    pub provisioning_state: Option<ProvisioningState>,
    pub ready: bool,
    pub conditions: Vec<Condition>,
}

impl PoolStatus {
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition);
    }

    pub fn clear_condition(&mut self, condition_type: ConditionType) {
        clear_condition(&mut self.conditions, condition_type);
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// A machine pool: desired state plus observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAggregate {
    pub spec: PoolSpec,
    pub status: PoolStatus,
}

impl PoolAggregate {
    pub fn new(spec: PoolSpec) -> Self {
        Self {
            spec,
            status: PoolStatus::default(),
        }
    }

    /// Correlation labels tracking records of this pool must carry.
    pub fn labels(&self) -> PoolLabels {
        PoolLabels {
            cluster: self.spec.cluster.clone(),
            pool: self.spec.name.clone(),
            machine_pool: self.spec.machine_pool.clone(),
        }
    }
}
