//! Rolling-update strategy primitives.
//!
//! This library decides *how* a machine pool changes shape, without ever
//! touching the pool itself:
//!
//! - **Surge**: how many instances above the desired count may transiently
//!   exist while a rolling update replaces old-model machines.
//! - **Victim selection**: which tracked machines to delete when the pool
//!   must shrink toward the desired count.
//!
//! # Invariants
//!
//! - Selection is deterministic: the same candidate set and desired count
//!   always yield the same victims (stable ordering, provider-ID tie-break).
//! - Selection never proposes more victims than the excess over desired.
//! - A strategy with no rolling-update policy configured surges zero and
//!   selects nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Strategy errors.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Desired replica count is malformed.
    #[error("invalid desired replica count: {0}")]
    InvalidReplicas(i64),
}

/// Maximum surge above the desired replica count during a rolling update.
///
/// Either an absolute instance count or a percentage of the desired count
/// (rounded up, so any non-zero percentage of a non-empty pool surges at
/// least one instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxSurge {
    Count(u32),
    Percent(u32),
}

impl MaxSurge {
    /// Resolve the surge budget for a desired replica count.
    pub fn resolve(&self, desired: i64) -> Result<u32, RolloutError> {
        if desired < 0 {
            return Err(RolloutError::InvalidReplicas(desired));
        }
        Ok(match self {
            MaxSurge::Count(n) => *n,
            MaxSurge::Percent(pct) => {
                // Round up: 10% of 15 replicas allows 2 extra instances.
                ((desired as u64 * *pct as u64).div_ceil(100)) as u32
            }
        })
    }
}

impl Default for MaxSurge {
    fn default() -> Self {
        MaxSurge::Count(1)
    }
}

/// Which end of the pool to shrink from when scaling down.
///
/// Failed and already-deleting machines are always drained first regardless
/// of this setting; the priority only orders the healthy remainder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePriority {
    /// Delete the longest-lived machines first.
    #[default]
    Oldest,

    /// Delete the most recently created machines first.
    Newest,
}

/// Deployment strategy for a machine pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Replace machines gradually, allowing a bounded surge above desired.
    RollingUpdate {
        max_surge: MaxSurge,
        delete_priority: DeletePriority,
    },

    /// No rollout policy: zero surge, never selects victims.
    None,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::RollingUpdate {
            max_surge: MaxSurge::default(),
            delete_priority: DeletePriority::default(),
        }
    }
}

/// A machine eligible for scale-down, as the strategy sees it.
///
/// Implemented by the pool's tracking record type; keeps this crate free of
/// the pool domain model.
pub trait ScaleCandidate {
    /// Stable identifier, used as the deterministic tie-break.
    fn candidate_id(&self) -> &str;

    /// The machine reported a terminal failure.
    fn is_failed(&self) -> bool;

    /// The machine is already on its way out.
    fn is_deleting(&self) -> bool;

    /// The machine runs the pool's current model/image.
    fn has_latest_model(&self) -> bool;

    /// Creation time, for oldest/newest ordering.
    fn created_at(&self) -> DateTime<Utc>;
}

/// Drain classes, drained in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DrainClass {
    Failed = 0,
    Deleting = 1,
    StaleModel = 2,
    Healthy = 3,
}

fn drain_class<T: ScaleCandidate>(c: &T) -> DrainClass {
    if c.is_failed() {
        DrainClass::Failed
    } else if c.is_deleting() {
        DrainClass::Deleting
    } else if !c.has_latest_model() {
        DrainClass::StaleModel
    } else {
        DrainClass::Healthy
    }
}

impl RolloutStrategy {
    /// How many instances above `desired` may exist during a rolling update.
    pub fn surge(&self, desired: i64) -> Result<u32, RolloutError> {
        match self {
            RolloutStrategy::RollingUpdate { max_surge, .. } => max_surge.resolve(desired),
            RolloutStrategy::None => {
                if desired < 0 {
                    return Err(RolloutError::InvalidReplicas(desired));
                }
                Ok(0)
            }
        }
    }

    /// Select machines to delete to shrink `candidates` toward `desired`.
    ///
    /// Returns indices into `candidates`, at most `len - desired` of them.
    /// Failed machines go first, then machines already deleting, then
    /// machines on a stale model, then healthy machines in the configured
    /// priority order. Ties break on candidate ID so repeated selection over
    /// an unchanged set yields the same victims.
    pub fn select_victims<T: ScaleCandidate>(
        &self,
        desired: i64,
        candidates: &[T],
    ) -> Result<Vec<usize>, RolloutError> {
        if desired < 0 {
            return Err(RolloutError::InvalidReplicas(desired));
        }

        let delete_priority = match self {
            RolloutStrategy::RollingUpdate {
                delete_priority, ..
            } => *delete_priority,
            RolloutStrategy::None => return Ok(Vec::new()),
        };

        let excess = candidates.len().saturating_sub(desired as usize);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| {
            let (ca, cb) = (&candidates[a], &candidates[b]);
            drain_class(ca)
                .cmp(&drain_class(cb))
                .then_with(|| match delete_priority {
                    DeletePriority::Oldest => ca.created_at().cmp(&cb.created_at()),
                    DeletePriority::Newest => cb.created_at().cmp(&ca.created_at()),
                })
                .then_with(|| ca.candidate_id().cmp(cb.candidate_id()))
        });

        order.truncate(excess);
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    struct Fake {
        id: &'static str,
        failed: bool,
        deleting: bool,
        latest: bool,
        created: DateTime<Utc>,
    }

    impl Fake {
        fn healthy(id: &'static str, created_secs: i64) -> Self {
            Self {
                id,
                failed: false,
                deleting: false,
                latest: true,
                created: Utc.timestamp_opt(created_secs, 0).unwrap(),
            }
        }
    }

    impl ScaleCandidate for Fake {
        fn candidate_id(&self) -> &str {
            self.id
        }
        fn is_failed(&self) -> bool {
            self.failed
        }
        fn is_deleting(&self) -> bool {
            self.deleting
        }
        fn has_latest_model(&self) -> bool {
            self.latest
        }
        fn created_at(&self) -> DateTime<Utc> {
            self.created
        }
    }

    fn rolling(max_surge: MaxSurge, delete_priority: DeletePriority) -> RolloutStrategy {
        RolloutStrategy::RollingUpdate {
            max_surge,
            delete_priority,
        }
    }

    #[rstest]
    #[case(MaxSurge::Count(1), 3, 1)]
    #[case(MaxSurge::Count(0), 3, 0)]
    #[case(MaxSurge::Percent(10), 15, 2)] // 1.5 rounds up
    #[case(MaxSurge::Percent(50), 4, 2)]
    #[case(MaxSurge::Percent(100), 3, 3)]
    #[case(MaxSurge::Percent(25), 0, 0)]
    fn surge_resolution(#[case] surge: MaxSurge, #[case] desired: i64, #[case] expected: u32) {
        let strategy = rolling(surge, DeletePriority::Oldest);
        assert_eq!(strategy.surge(desired).unwrap(), expected);
    }

    #[test]
    fn surge_rejects_negative_desired() {
        let strategy = RolloutStrategy::default();
        assert!(matches!(
            strategy.surge(-1),
            Err(RolloutError::InvalidReplicas(-1))
        ));
    }

    #[test]
    fn noop_strategy_surges_zero_and_selects_nothing() {
        let strategy = RolloutStrategy::None;
        assert_eq!(strategy.surge(5).unwrap(), 0);

        let candidates = vec![Fake::healthy("a", 1), Fake::healthy("b", 2)];
        assert!(strategy.select_victims(0, &candidates).unwrap().is_empty());
    }

    #[test]
    fn no_victims_when_at_or_below_desired() {
        let strategy = RolloutStrategy::default();
        let candidates = vec![Fake::healthy("a", 1), Fake::healthy("b", 2)];

        assert!(strategy.select_victims(2, &candidates).unwrap().is_empty());
        assert!(strategy.select_victims(5, &candidates).unwrap().is_empty());
    }

    #[test]
    fn oldest_priority_drains_longest_lived_first() {
        let strategy = rolling(MaxSurge::default(), DeletePriority::Oldest);
        let candidates = vec![
            Fake::healthy("b", 200),
            Fake::healthy("a", 100),
            Fake::healthy("c", 300),
        ];

        let victims = strategy.select_victims(1, &candidates).unwrap();
        assert_eq!(victims, vec![1, 0]); // a (100) then b (200)
    }

    #[test]
    fn newest_priority_drains_most_recent_first() {
        let strategy = rolling(MaxSurge::default(), DeletePriority::Newest);
        let candidates = vec![
            Fake::healthy("b", 200),
            Fake::healthy("a", 100),
            Fake::healthy("c", 300),
        ];

        let victims = strategy.select_victims(1, &candidates).unwrap();
        assert_eq!(victims, vec![2, 0]); // c (300) then b (200)
    }

    #[test]
    fn failed_machines_drain_before_healthy_regardless_of_age() {
        let strategy = rolling(MaxSurge::default(), DeletePriority::Oldest);
        let mut failed = Fake::healthy("z-newest", 999);
        failed.failed = true;
        let candidates = vec![Fake::healthy("a", 1), failed, Fake::healthy("b", 2)];

        let victims = strategy.select_victims(2, &candidates).unwrap();
        assert_eq!(victims, vec![1]);
    }

    #[test]
    fn stale_model_drains_before_healthy() {
        let strategy = rolling(MaxSurge::default(), DeletePriority::Oldest);
        let mut stale = Fake::healthy("stale", 500);
        stale.latest = false;
        let candidates = vec![Fake::healthy("old-but-current", 1), stale];

        let victims = strategy.select_victims(1, &candidates).unwrap();
        assert_eq!(victims, vec![1]);
    }

    #[test]
    fn selection_is_deterministic_under_ties() {
        let strategy = rolling(MaxSurge::default(), DeletePriority::Oldest);
        // Same creation time: tie-break must fall to the ID.
        let candidates = vec![
            Fake::healthy("charlie", 100),
            Fake::healthy("alpha", 100),
            Fake::healthy("bravo", 100),
        ];

        let first = strategy.select_victims(1, &candidates).unwrap();
        let second = strategy.select_victims(1, &candidates).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![1, 2]); // alpha, bravo
    }

    #[test]
    fn select_rejects_negative_desired() {
        let strategy = RolloutStrategy::default();
        let candidates: Vec<Fake> = vec![];
        assert!(strategy.select_victims(-3, &candidates).is_err());
    }
}
