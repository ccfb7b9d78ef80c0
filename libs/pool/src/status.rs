//! Pool provisioning-state machine.
//!
//! Folds the scale set's cloud-reported state and the desired-vs-observed
//! replica comparison into the pool's provisioning state, readiness, and
//! conditions. Pure over the aggregate: evaluating twice with unchanged
//! inputs produces unchanged outputs.

use tracing::debug;

use crate::error::PoolError;
use crate::types::{reason, Condition, ConditionType, PoolAggregate, ProvisioningState};

/// Recompute the pool's provisioning state, readiness, and conditions.
///
/// Runs once per reconcile pass, after replica/provider-ID bookkeeping.
/// Does nothing until the directory has reported a scale-set state at
/// least once.
pub fn apply_pool_status(pool: &mut PoolAggregate) {
    let Some(state) = pool.status.scale_set_state.clone() else {
        return;
    };

    let desired = pool.spec.desired_replicas;
    let observed = pool.status.replicas;

    match state {
        ProvisioningState::Succeeded if observed == desired => {
            pool.status.provisioning_state = Some(ProvisioningState::Succeeded);
            pool.status.ready = true;
            pool.status
                .set_condition(Condition::satisfied(ConditionType::ScaleSetRunning));
            pool.status
                .set_condition(Condition::satisfied(ConditionType::ModelUpdated));
            pool.status
                .set_condition(Condition::satisfied(ConditionType::DesiredReplicas));
        }
        ProvisioningState::Succeeded => {
            // The scale set settled but the fleet has not: force Updating
            // until replica counts agree.
            let (scaling_reason, direction) = if desired > observed {
                (reason::SCALING_UP, "up")
            } else {
                (reason::SCALING_DOWN, "down")
            };
            debug!(desired, observed, direction, "Replica mismatch, pool updating");

            pool.status.provisioning_state = Some(ProvisioningState::Updating);
            pool.status.ready = false;
            pool.status
                .set_condition(Condition::satisfied(ConditionType::ScaleSetRunning));
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::DesiredReplicas,
                scaling_reason,
                format!("scaling {direction}: desired {desired}, observed {observed}"),
            ));
        }
        ProvisioningState::Updating => {
            pool.status.provisioning_state = Some(ProvisioningState::Updating);
            pool.status.ready = false;
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::ModelUpdated,
                reason::ROLLING_UPDATE,
                "scale set is rolling out a new model",
            ));
        }
        ProvisioningState::Creating => {
            pool.status.provisioning_state = Some(ProvisioningState::Creating);
            pool.status.ready = false;
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::ScaleSetRunning,
                reason::CREATING,
                "scale set is creating",
            ));
        }
        ProvisioningState::Deleting => {
            pool.status.provisioning_state = Some(ProvisioningState::Deleting);
            pool.status.ready = false;
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::ScaleSetRunning,
                reason::DELETING,
                "scale set is deleting",
            ));
        }
        other => {
            // Failed, Deleted, or a provider-specific label: surface the
            // raw state as the reason.
            let raw = other.as_str().to_string();
            pool.status.provisioning_state = Some(other);
            pool.status.ready = false;
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::ScaleSetRunning,
                raw.clone(),
                format!("scale set reported state {raw}"),
            ));
        }
    }
}

/// Fold the outcome of a pass's errors into the pool status.
///
/// Any unresolved error forces readiness false and leaves a non-fatal
/// condition carrying the reason and message; a clean pass clears it.
pub fn apply_pass_error(pool: &mut PoolAggregate, error: Option<&PoolError>) {
    match error {
        Some(err) => {
            pool.status.ready = false;
            pool.status.set_condition(Condition::unsatisfied(
                ConditionType::ReconcileError,
                reason::RECONCILE_ERROR,
                err.to_string(),
            ));
        }
        None => pool.status.clear_condition(ConditionType::ReconcileError),
    }
}
