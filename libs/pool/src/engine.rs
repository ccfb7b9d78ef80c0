//! The machine-pool reconciliation engine.
//!
//! One pass diffs the cloud-side instance directory against the tracking
//! store, creates records for new instances, deletes records for instances
//! removed out-of-band, applies the deployment strategy to shrink toward
//! the desired count, and recomputes the pool's replica bookkeeping and
//! provisioning state.
//!
//! Ordering within a pass:
//!
//! 1. Creation is unconditional: it mirrors instances that already exist.
//! 2. Out-of-band removals resolve before policy scale-down, and a pass
//!    that performs them defers scale-down to the next pass.
//! 3. Scale-down is skipped while a put/patch/delete is in flight for the
//!    backing resource, or while replicas are externally managed.
//! 4. Bookkeeping and the status fold always run over whatever the pass
//!    actually converged; per-record failures are collected and the first
//!    one is surfaced after bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::directory::{InstanceDirectory, ScaleSetSnapshot};
use crate::error::{PoolError, PoolResult};
use crate::guard::OperationGuard;
use crate::images::{default_predicate, ImageCache, ImagesEqual};
use crate::status::{apply_pass_error, apply_pool_status};
use crate::store::{OwnerResolver, TrackingStore};
use crate::types::{
    reason, Condition, ConditionType, FleetMember, PoolAggregate, ProviderId, TrackingRecord,
    MODEL_FINGERPRINT_ANNOTATION, TRACKING_RECORD_FINALIZER,
};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    /// No cloud-side information was available; records were left alone.
    pub no_snapshot: bool,

    pub records_created: usize,
    pub deleted_out_of_band: usize,
    pub deleted_by_policy: usize,

    /// Policy scale-down was deferred (out-of-band removals, in-flight
    /// operation, or externally managed replicas).
    pub scale_down_deferred: bool,
}

/// The reconciliation engine for one or more machine pools.
///
/// Holds no internal locks beyond the shared operation guard; each pool is
/// reconciled by at most one logical worker at a time, enforced by the
/// surrounding controller.
pub struct PoolReconciler {
    directory: Arc<dyn InstanceDirectory>,
    store: Arc<dyn TrackingStore>,
    owners: Arc<dyn OwnerResolver>,
    guard: Arc<RwLock<OperationGuard>>,
    images_equal: ImagesEqual,
}

impl PoolReconciler {
    pub fn new(
        directory: Arc<dyn InstanceDirectory>,
        store: Arc<dyn TrackingStore>,
        owners: Arc<dyn OwnerResolver>,
        guard: Arc<RwLock<OperationGuard>>,
    ) -> Self {
        Self {
            directory,
            store,
            owners,
            guard,
            images_equal: default_predicate(),
        }
    }

    /// Replace the image-equality predicate.
    pub fn with_images_equal(mut self, images_equal: ImagesEqual) -> Self {
        self.images_equal = images_equal;
        self
    }

    /// Run a single reconciliation pass for one pool.
    ///
    /// Best-effort per record: a failure on one record does not stop the
    /// others, but the first failure is returned once bookkeeping has run,
    /// so the pass is retried on the next trigger.
    #[instrument(skip(self, pool), fields(pool = %pool.spec.name))]
    pub async fn reconcile(&self, pool: &mut PoolAggregate) -> PoolResult<PassOutcome> {
        let mut outcome = PassOutcome::default();
        let mut errors: Vec<PoolError> = Vec::new();

        let snapshot = match self.directory.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(source) => {
                return Err(self.fail_pass(
                    pool,
                    PoolError::Directory {
                        resource: pool.spec.resource_name.clone(),
                        source,
                    },
                ))
            }
        };

        let Some(snapshot) = snapshot else {
            // Nothing to verify against: never touch records we cannot see
            // cloud-side. The status fold still runs over the last
            // observed scale-set state so a terminal pool stays consistent.
            debug!("No directory snapshot available, leaving records untouched");
            outcome.no_snapshot = true;
            apply_pool_status(pool);
            return Ok(outcome);
        };

        pool.status.scale_set_state = Some(snapshot.state.clone());

        let labels = pool.labels();
        let mut records = match self.store.list(&labels).await {
            Ok(records) => records,
            Err(source) => {
                return Err(self.fail_pass(
                    pool,
                    PoolError::ListRecords {
                        pool: pool.spec.name.clone(),
                        source,
                    },
                ))
            }
        };

        // Step 4: create records for new cloud-side instances.
        outcome.records_created = self
            .create_missing_records(pool, &snapshot, &mut records, &mut errors)
            .await;

        // Step 5: resolve out-of-band removals.
        outcome.deleted_out_of_band = self
            .delete_departed_records(&snapshot.members, &mut records, &mut errors)
            .await;

        if outcome.deleted_out_of_band > 0 {
            // Out-of-band removal takes priority over policy scale-down;
            // re-evaluate the rest next pass.
            debug!(
                deleted = outcome.deleted_out_of_band,
                "Out-of-band removals processed, deferring scale-down"
            );
            outcome.scale_down_deferred = true;
        } else {
            let gated = {
                let guard = self.guard.read().await;
                guard.any_in_flight(&pool.spec.resource_name, &pool.spec.service)
            };
            if gated {
                debug!("Long-running operation in flight, deferring scale-down");
                outcome.scale_down_deferred = true;
            } else if pool.spec.externally_managed_replicas {
                debug!("Replicas externally managed, skipping scale-down");
                outcome.scale_down_deferred = true;
            } else {
                // Steps 6–7: policy-driven scale-down.
                outcome.deleted_by_policy = self
                    .scale_down(pool, &mut records, &mut errors)
                    .await;
            }
        }

        // Keep surviving records' state mirrors in sync with the cloud view.
        self.refresh_records(pool, &snapshot, &mut records, &mut errors)
            .await;

        // Step 8: bookkeeping always reflects the store as last observed.
        pool.status.replicas = records.iter().filter(|r| r.ready).count() as i64;
        pool.status.provider_ids = records.iter().map(|r| r.provider_id.clone()).collect();

        // Step 9: provisioning-state machine and error fold.
        apply_pool_status(pool);
        apply_pass_error(pool, errors.first());

        info!(
            created = outcome.records_created,
            deleted_out_of_band = outcome.deleted_out_of_band,
            deleted_by_policy = outcome.deleted_by_policy,
            deferred = outcome.scale_down_deferred,
            ready_replicas = pool.status.replicas,
            errors = errors.len(),
            "Reconcile pass complete"
        );

        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Abort the pass on a whole-pass failure. The error is folded into
    /// the pool status first so readiness drops and the condition carries
    /// the cause, rather than leaving a stale converged status behind.
    fn fail_pass(&self, pool: &mut PoolAggregate, err: PoolError) -> PoolError {
        warn!(error = %err, "Reconcile pass aborted");
        apply_pass_error(pool, Some(&err));
        err
    }

    /// Create tracking records for snapshot members with no matching
    /// record, skipping members already departing. Returns the number
    /// created; created records are appended to `records` so bookkeeping
    /// sees them.
    async fn create_missing_records(
        &self,
        pool: &PoolAggregate,
        snapshot: &ScaleSetSnapshot,
        records: &mut Vec<TrackingRecord>,
        errors: &mut Vec<PoolError>,
    ) -> usize {
        let known: BTreeMap<&ProviderId, ()> =
            records.iter().map(|r| (&r.provider_id, ())).collect();
        let to_create: Vec<&FleetMember> = snapshot
            .members
            .values()
            .filter(|m| !known.contains_key(&m.provider_id) && !m.state.is_departing())
            .collect();
        drop(known);

        let mut cache = ImageCache::new();
        let mut created = 0;
        for member in to_create {
            let record = self.new_record(pool, snapshot, member, &mut cache);
            debug!(
                provider_id = %member.provider_id,
                record = %record.name,
                "Creating tracking record"
            );
            match self.store.create(record.clone()).await {
                Ok(()) => {
                    records.push(record);
                    created += 1;
                }
                Err(source) => {
                    warn!(provider_id = %member.provider_id, error = %source, "Failed to create tracking record");
                    errors.push(PoolError::CreateRecord {
                        provider_id: member.provider_id.clone(),
                        source,
                    });
                }
            }
        }
        created
    }

    /// Build a fresh tracking record for a fleet member.
    fn new_record(
        &self,
        pool: &PoolAggregate,
        snapshot: &ScaleSetSnapshot,
        member: &FleetMember,
        cache: &mut ImageCache,
    ) -> TrackingRecord {
        let name = format!(
            "{}-{}",
            pool.spec.name,
            member.instance_id.replace('_', "-")
        );

        let mut annotations = std::collections::BTreeMap::new();
        if let Some(image) = &member.image {
            annotations.insert(
                MODEL_FINGERPRINT_ANNOTATION.to_string(),
                cache.fingerprint(image),
            );
        }

        let mut record = TrackingRecord {
            name,
            provider_id: member.provider_id.clone(),
            instance_id: member.instance_id.clone(),
            labels: pool.labels(),
            annotations,
            finalizers: vec![TRACKING_RECORD_FINALIZER.to_string()],
            owner: None,
            state: member.state.clone(),
            latest_model_applied: self.member_has_latest_model(pool, snapshot, member),
            ready: false,
            node_ref: None,
            node_version: None,
            conditions: Vec::new(),
            created_at: Utc::now(),
        };
        record.set_condition(Condition::unsatisfied(
            ConditionType::InstanceRunning,
            reason::WAITING_FOR_RUNNING,
            "instance is not yet running",
        ));
        record
    }

    fn member_has_latest_model(
        &self,
        pool: &PoolAggregate,
        snapshot: &ScaleSetSnapshot,
        member: &FleetMember,
    ) -> bool {
        let desired = pool.spec.image.as_ref().or(snapshot.image.as_ref());
        match (desired, member.image.as_ref()) {
            (Some(desired), Some(actual)) => (self.images_equal)(desired, actual),
            // Without both sides of the comparison, assume current rather
            // than churn the member.
            _ => true,
        }
    }

    /// Delete records whose instances disappeared from the cloud side.
    /// Successfully deleted records are removed from `records`.
    async fn delete_departed_records(
        &self,
        members: &BTreeMap<ProviderId, FleetMember>,
        records: &mut Vec<TrackingRecord>,
        errors: &mut Vec<PoolError>,
    ) -> usize {
        let departed: Vec<TrackingRecord> = records
            .iter()
            .filter(|r| !members.contains_key(&r.provider_id))
            .cloned()
            .collect();

        let mut deleted = 0;
        for record in departed {
            info!(
                record = %record.name,
                provider_id = %record.provider_id,
                "Instance removed out-of-band, deleting owner"
            );
            if self.delete_via_owner(&record, errors).await {
                records.retain(|r| r.name != record.name);
                deleted += 1;
            }
        }
        deleted
    }

    /// Apply the deployment strategy to shrink toward the desired count.
    async fn scale_down(
        &self,
        pool: &PoolAggregate,
        records: &mut Vec<TrackingRecord>,
        errors: &mut Vec<PoolError>,
    ) -> usize {
        let victims = match pool
            .spec
            .strategy
            .select_victims(pool.spec.desired_replicas, records)
        {
            Ok(victims) => victims,
            Err(err) => {
                // Policy failure aborts only this step; the rest of the
                // pass stands.
                warn!(error = %err, "Deployment strategy failed, skipping scale-down");
                errors.push(PoolError::Policy(err));
                return 0;
            }
        };

        let selected: Vec<TrackingRecord> = victims.iter().map(|&i| records[i].clone()).collect();
        let mut deleted = 0;
        for record in selected {
            info!(
                record = %record.name,
                provider_id = %record.provider_id,
                "Selected for scale-down, deleting owner"
            );
            if self.delete_via_owner(&record, errors).await {
                records.retain(|r| r.name != record.name);
                deleted += 1;
            }
        }
        deleted
    }

    /// The owning-machine deletion path. A record with no resolvable owner
    /// is left alone: the pool controller is expected to adopt it, after
    /// which the next pass retries. Returns whether the owner was deleted.
    async fn delete_via_owner(
        &self,
        record: &TrackingRecord,
        errors: &mut Vec<PoolError>,
    ) -> bool {
        match self.owners.get_owner(record).await {
            Ok(Some(owner)) => match self.owners.delete_owner(&owner).await {
                Ok(()) => true,
                Err(source) => {
                    warn!(record = %record.name, owner = %owner.name, error = %source, "Failed to delete owner machine");
                    errors.push(PoolError::DeleteOwner {
                        provider_id: record.provider_id.clone(),
                        source,
                    });
                    false
                }
            },
            Ok(None) => {
                // Racing the owner's creation is worse than waiting a pass.
                debug!(record = %record.name, "Record has no owner yet, skipping deletion");
                false
            }
            Err(source) => {
                warn!(record = %record.name, error = %source, "Failed to resolve owner machine");
                errors.push(PoolError::DeleteOwner {
                    provider_id: record.provider_id.clone(),
                    source,
                });
                false
            }
        }
    }

    /// Mirror each surviving record's provisioning state and latest-model
    /// flag from the snapshot, persisting only actual changes.
    async fn refresh_records(
        &self,
        pool: &PoolAggregate,
        snapshot: &ScaleSetSnapshot,
        records: &mut [TrackingRecord],
        errors: &mut Vec<PoolError>,
    ) {
        for record in records.iter_mut() {
            let Some(member) = snapshot.members.get(&record.provider_id) else {
                continue;
            };

            let latest = self.member_has_latest_model(pool, snapshot, member);
            if record.state == member.state && record.latest_model_applied == latest {
                continue;
            }

            record.state = member.state.clone();
            record.latest_model_applied = latest;
            if let Err(source) = self.store.update(record).await {
                warn!(record = %record.name, error = %source, "Failed to persist record state mirror");
                errors.push(PoolError::UpdateRecord {
                    name: record.name.clone(),
                    source,
                });
            }
        }
    }
}
