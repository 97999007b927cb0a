//! Pure planning half of the fleet reconciler.
//!
//! Every pass rebuilds owner snapshots from the live cluster, feeds them
//! through [`plan`], and executes the returned operations. Keeping the
//! decision logic free of API calls makes the graceful-termination and
//! rolling-replacement rules directly testable.

use chrono::{DateTime, Duration, Utc};

use crate::controller::pods::PodClass;
use crate::controller::termination::TerminationPhase;
use crate::crd::OwnerKind;

#[derive(Clone, Debug)]
pub struct PodState {
    pub name: String,
    pub class: PodClass,
    pub termination: TerminationPhase,
}

/// Read-only snapshot of one fleet owner and its pods.
#[derive(Clone, Debug)]
pub struct OwnerState {
    pub name: String,
    pub kind: OwnerKind,
    pub created_at: DateTime<Utc>,
    pub deleting: bool,
    pub template_hash: Option<String>,
    /// The owner has finished creating its declared replica count.
    pub synced: bool,
    pub sync_time: Option<DateTime<Utc>>,
    pub termination: TerminationPhase,
    pub unregistration_requested_at: Option<DateTime<Utc>>,
    pub pods: Vec<PodState>,
}

impl OwnerState {
    pub fn running(&self) -> i64 {
        self.count(PodClass::Running)
    }

    pub fn pending(&self) -> i64 {
        self.count(PodClass::Pending)
    }

    fn count(&self, class: PodClass) -> i64 {
        self.pods.iter().filter(|p| p.class == class).count() as i64
    }

    fn all_pods_completed(&self) -> bool {
        !self.pods.is_empty()
            && self.pods.iter().all(|p| p.class == PodClass::Completed)
    }

    /// Pods that must carry the unregistration-complete annotation (or be
    /// deleting already) before the owner may be considered done.
    fn unsafe_pods(&self) -> impl Iterator<Item = &PodState> {
        self.pods
            .iter()
            .filter(|p| p.class != PodClass::Terminating)
    }

    fn unregistration_settled(&self) -> bool {
        self.unsafe_pods()
            .all(|p| p.termination == TerminationPhase::Complete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    AllPodsCompleted,
    UnregistrationComplete,
    UnregistrationTimedOut,
    StaleTemplate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FleetOp {
    DeleteOwner {
        owner: String,
        reason: DeleteReason,
    },
    MarkUnregistrationComplete {
        owner: String,
    },
    /// Phase 1/2 of graceful termination: annotate every listed pod, then
    /// the owner itself, idempotently. Nothing is deleted yet.
    RequestUnregistration {
        owner: String,
        pods: Vec<String>,
    },
    CreateOwners {
        count: i64,
    },
}

#[derive(Clone, Debug, Default)]
pub struct FleetPlan {
    pub ops: Vec<FleetOp>,
    /// An owner had not finished creating its replicas; steps after the
    /// cleanup pre-pass were skipped this pass.
    pub halted: bool,
    /// Owners at the desired template hash, oldest first; callers derive
    /// status counts from it.
    pub cohort: Vec<String>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    /// Retained-replica accounting fell below desired, which the walk
    /// cannot produce from consistent inputs. Recoverable: the caller
    /// requeues with backoff and emits a diagnostic event.
    #[error("retained replica accounting invalid: retained {retained} < desired {desired}")]
    InvalidRetainedCount { retained: i64, desired: i64 },
}

pub struct PlanInput<'a> {
    pub desired: i64,
    pub desired_hash: &'a str,
    pub owners: &'a [OwnerState],
    pub ephemeral: bool,
    /// From the paired autoscaler status; guards against recreating
    /// ephemeral agents that legitimately finished one-shot work.
    pub last_scale_out: Option<DateTime<Utc>>,
    pub unregistration_timeout: Duration,
    pub now: DateTime<Utc>,
}

pub fn plan(input: PlanInput<'_>) -> Result<FleetPlan, PlanError> {
    let mut ops = Vec::new();
    let mut survivors: Vec<&OwnerState> = Vec::new();
    let mut halted = false;
    let mut last_sync: Option<DateTime<Utc>> = None;

    // Cleanup pre-pass over every live owner.
    for owner in input.owners.iter().filter(|o| !o.deleting) {
        if owner.all_pods_completed() {
            // 100% completed pods: safe to delete outright, no race.
            ops.push(FleetOp::DeleteOwner {
                owner: owner.name.clone(),
                reason: DeleteReason::AllPodsCompleted,
            });
            continue;
        }
        match owner.termination {
            TerminationPhase::Complete => {
                ops.push(FleetOp::DeleteOwner {
                    owner: owner.name.clone(),
                    reason: DeleteReason::UnregistrationComplete,
                });
                continue;
            }
            TerminationPhase::Requested | TerminationPhase::Started => {
                if let Some(requested_at) = owner.unregistration_requested_at
                {
                    if requested_at + input.unregistration_timeout
                        <= input.now
                    {
                        ops.push(FleetOp::DeleteOwner {
                            owner: owner.name.clone(),
                            reason: DeleteReason::UnregistrationTimedOut,
                        });
                        continue;
                    }
                }
                if owner.unregistration_settled() {
                    ops.push(FleetOp::MarkUnregistrationComplete {
                        owner: owner.name.clone(),
                    });
                    continue;
                }
            }
            TerminationPhase::None => {}
        }
        if !owner.synced {
            // Wait for consistency before making any scaling decision.
            halted = true;
        }
        if let Some(t) = owner.sync_time {
            last_sync = Some(last_sync.map_or(t, |cur| cur.max(t)));
        }
        survivors.push(owner);
    }

    if halted {
        return Ok(FleetPlan {
            ops,
            halted,
            cohort: vec![],
        });
    }

    let mut cohort: Vec<&OwnerState> = survivors
        .iter()
        .copied()
        .filter(|o| o.template_hash.as_deref() == Some(input.desired_hash))
        .collect();
    cohort.sort_by_key(|o| o.created_at);
    let mut stale: Vec<&OwnerState> = survivors
        .iter()
        .copied()
        .filter(|o| o.template_hash.as_deref() != Some(input.desired_hash))
        .collect();
    stale.sort_by_key(|o| o.created_at);

    let running: i64 = cohort.iter().map(|o| o.running()).sum();
    let pending: i64 = cohort.iter().map(|o| o.pending()).sum();

    if input.desired > pending + running {
        let ephemeral_done = input.ephemeral
            && matches!(
                (last_sync, input.last_scale_out),
                (Some(sync), Some(out)) if sync > out
            );
        if ephemeral_done {
            // Agents finished one-shot work after the last scale-out;
            // recreating them would resurrect capacity nobody asked for.
        } else {
            ops.push(FleetOp::CreateOwners {
                count: input.desired - (pending + running),
            });
        }
    } else if input.desired <= running {
        let mut retained = 0i64;
        let mut candidates: Vec<&OwnerState> = Vec::new();
        for owner in cohort.iter().rev() {
            if owner.running() == 0 || retained >= input.desired {
                candidates.push(owner);
            } else {
                retained += owner.running();
            }
        }
        if retained == input.desired {
            for owner in candidates {
                ops.push(FleetOp::RequestUnregistration {
                    owner: owner.name.clone(),
                    pods: owner
                        .unsafe_pods()
                        .map(|p| p.name.clone())
                        .collect(),
                });
            }
        } else if retained > input.desired {
            // More pods must finish or transition first; wait.
        } else {
            return Err(PlanError::InvalidRetainedCount {
                retained,
                desired: input.desired,
            });
        }
    }
    // else: pending pods cover the gap; wait for them to settle.

    // Rolling replacement: at most one stale owner per pass, and only once
    // the desired-hash cohort fully carries the load.
    if running >= input.desired {
        if let Some(oldest_stale) = stale.first() {
            ops.push(FleetOp::DeleteOwner {
                owner: oldest_stale.name.clone(),
                reason: DeleteReason::StaleTemplate,
            });
        }
    }

    Ok(FleetPlan {
        ops,
        halted,
        cohort: cohort.iter().map(|o| o.name.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "abc123";
    const OLD_HASH: &str = "zzz999";

    fn pod(name: &str, class: PodClass) -> PodState {
        PodState {
            name: name.into(),
            class,
            termination: TerminationPhase::None,
        }
    }

    fn owner(name: &str, hash: &str, pods: Vec<PodState>) -> OwnerState {
        OwnerState {
            name: name.into(),
            kind: OwnerKind::StatefulSet,
            created_at: Utc::now() - Duration::seconds(3600),
            deleting: false,
            template_hash: Some(hash.into()),
            synced: true,
            sync_time: Some(Utc::now() - Duration::seconds(3600)),
            termination: TerminationPhase::None,
            unregistration_requested_at: None,
            pods,
        }
    }

    fn input<'a>(desired: i64, owners: &'a [OwnerState]) -> PlanInput<'a> {
        PlanInput {
            desired,
            desired_hash: HASH,
            owners,
            ephemeral: false,
            last_scale_out: None,
            unregistration_timeout: Duration::seconds(600),
            now: Utc::now(),
        }
    }

    #[test]
    fn scale_up_creates_exactly_the_shortfall() {
        // replicas 1 -> 2 with an unchanged hash: a single create op, no
        // replacement of the existing owner.
        let owners =
            vec![owner("a", HASH, vec![pod("a-0", PodClass::Running)])];
        let plan = plan(input(2, &owners)).unwrap();
        assert_eq!(plan.ops, vec![FleetOp::CreateOwners { count: 1 }]);
        assert_eq!(plan.cohort, vec!["a".to_string()]);
    }

    #[test]
    fn steady_state_plans_nothing() {
        let owners = vec![
            owner("a", HASH, vec![pod("a-0", PodClass::Running)]),
            owner("b", HASH, vec![pod("b-0", PodClass::Running)]),
        ];
        let plan = plan(input(2, &owners)).unwrap();
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn template_change_creates_new_owner_before_deleting_stale() {
        let owners =
            vec![owner("old", OLD_HASH, vec![pod("old-0", PodClass::Running)])];
        let plan = plan(input(1, &owners)).unwrap();
        // Cohort at the new hash is empty: create first, do not delete the
        // stale owner while it still carries the load.
        assert_eq!(plan.ops, vec![FleetOp::CreateOwners { count: 1 }]);
    }

    #[test]
    fn stale_owner_deleted_only_after_cohort_runs_fully() {
        let owners = vec![
            owner("old", OLD_HASH, vec![pod("old-0", PodClass::Running)]),
            owner("new", HASH, vec![pod("new-0", PodClass::Running)]),
        ];
        let plan = plan(input(1, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::DeleteOwner {
                owner: "old".into(),
                reason: DeleteReason::StaleTemplate,
            }]
        );
    }

    #[test]
    fn at_most_one_stale_owner_deleted_per_pass() {
        let owners = vec![
            owner("old-1", OLD_HASH, vec![pod("o1-0", PodClass::Running)]),
            owner("old-2", OLD_HASH, vec![pod("o2-0", PodClass::Running)]),
            owner("new", HASH, vec![pod("new-0", PodClass::Running)]),
        ];
        let plan = plan(input(1, &owners)).unwrap();
        let deletes = plan
            .ops
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    FleetOp::DeleteOwner {
                        reason: DeleteReason::StaleTemplate,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(deletes, 1);
    }

    #[test]
    fn retirement_requests_unregistration_without_deleting() {
        let mut older = owner("a", HASH, vec![pod("a-0", PodClass::Running)]);
        older.created_at = Utc::now() - Duration::seconds(7200);
        let newer = owner("b", HASH, vec![pod("b-0", PodClass::Running)]);
        let owners = vec![older, newer];
        let plan = plan(input(1, &owners)).unwrap();
        // The newest owner is retained; the oldest becomes a retirement
        // candidate and only gets annotated.
        assert_eq!(
            plan.ops,
            vec![FleetOp::RequestUnregistration {
                owner: "a".into(),
                pods: vec!["a-0".into()],
            }]
        );
    }

    #[test]
    fn owner_with_zero_running_pods_is_retired_first() {
        let empty = owner("empty", HASH, vec![]);
        let busy = owner("busy", HASH, vec![pod("b-0", PodClass::Running)]);
        let owners = vec![empty, busy];
        let plan = plan(input(1, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::RequestUnregistration {
                owner: "empty".into(),
                pods: vec![],
            }]
        );
    }

    #[test]
    fn retained_above_desired_waits() {
        // Two owners with two running pods each cannot be split to reach
        // desired=3; the pass must wait, not annotate.
        let owners = vec![
            owner(
                "a",
                HASH,
                vec![pod("a-0", PodClass::Running), pod("a-1", PodClass::Running)],
            ),
            owner(
                "b",
                HASH,
                vec![pod("b-0", PodClass::Running), pod("b-1", PodClass::Running)],
            ),
        ];
        let plan = plan(input(3, &owners)).unwrap();
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn completed_owner_deleted_outright() {
        let owners =
            vec![owner("done", HASH, vec![pod("d-0", PodClass::Completed)])];
        let plan = plan(input(0, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::DeleteOwner {
                owner: "done".into(),
                reason: DeleteReason::AllPodsCompleted,
            }]
        );
    }

    #[test]
    fn requested_owner_not_deleted_until_pods_settle() {
        let mut o = owner(
            "retiring",
            HASH,
            vec![pod("r-0", PodClass::Running), pod("r-1", PodClass::Running)],
        );
        o.termination = TerminationPhase::Requested;
        o.unregistration_requested_at = Some(Utc::now());
        let owners = vec![o];
        let plan = plan(input(0, &owners)).unwrap();
        // No delete and no complete-mark while unsafe pods are still
        // missing their completion annotation.
        assert!(
            !plan
                .ops
                .iter()
                .any(|op| matches!(op, FleetOp::DeleteOwner { .. })),
            "owner must not be deleted before unregistration settles"
        );
        assert!(
            !plan.ops.iter().any(|op| matches!(
                op,
                FleetOp::MarkUnregistrationComplete { .. }
            ))
        );
    }

    #[test]
    fn requested_owner_marked_complete_when_pods_settle() {
        let mut settled = pod("r-0", PodClass::Running);
        settled.termination = TerminationPhase::Complete;
        let terminating = pod("r-1", PodClass::Terminating);
        let mut o = owner("retiring", HASH, vec![settled, terminating]);
        o.termination = TerminationPhase::Requested;
        o.unregistration_requested_at = Some(Utc::now());
        let owners = vec![o];
        let plan = plan(input(0, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::MarkUnregistrationComplete {
                owner: "retiring".into(),
            }]
        );
    }

    #[test]
    fn complete_owner_is_deleted() {
        let mut o = owner("gone", HASH, vec![pod("g-0", PodClass::Running)]);
        o.termination = TerminationPhase::Complete;
        let owners = vec![o];
        let plan = plan(input(0, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::DeleteOwner {
                owner: "gone".into(),
                reason: DeleteReason::UnregistrationComplete,
            }]
        );
    }

    #[test]
    fn unregistration_hard_timeout_forces_deletion() {
        let mut o = owner("stuck", HASH, vec![pod("s-0", PodClass::Running)]);
        o.termination = TerminationPhase::Requested;
        o.unregistration_requested_at =
            Some(Utc::now() - Duration::seconds(700));
        let owners = vec![o];
        let plan = plan(input(0, &owners)).unwrap();
        assert_eq!(
            plan.ops,
            vec![FleetOp::DeleteOwner {
                owner: "stuck".into(),
                reason: DeleteReason::UnregistrationTimedOut,
            }]
        );
    }

    #[test]
    fn unsynced_owner_halts_the_pass() {
        let mut unsynced = owner("slow", HASH, vec![]);
        unsynced.synced = false;
        let owners = vec![unsynced];
        let plan = plan(input(3, &owners)).unwrap();
        assert!(plan.halted);
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn ephemeral_agents_finished_after_scale_out_are_not_recreated() {
        let now = Utc::now();
        let mut o = owner("a", HASH, vec![]);
        o.sync_time = Some(now - Duration::seconds(10));
        let owners = vec![o];
        let mut i = input(2, &owners);
        i.ephemeral = true;
        i.last_scale_out = Some(now - Duration::seconds(60));
        let plan = plan(i).unwrap();
        assert!(
            !plan
                .ops
                .iter()
                .any(|op| matches!(op, FleetOp::CreateOwners { .. })),
            "finished ephemeral agents must not be recreated"
        );
    }

    #[test]
    fn ephemeral_guard_does_not_apply_before_scale_out() {
        let now = Utc::now();
        let mut o = owner("a", HASH, vec![]);
        o.sync_time = Some(now - Duration::seconds(120));
        let owners = vec![o];
        let mut i = input(2, &owners);
        i.ephemeral = true;
        i.last_scale_out = Some(now - Duration::seconds(60));
        let plan = plan(i).unwrap();
        // sync predates the scale-out: the shortfall is real. The owner
        // itself has zero running pods and is also retired separately.
        assert!(
            plan.ops
                .iter()
                .any(|op| *op == FleetOp::CreateOwners { count: 2 })
        );
    }

    #[test]
    fn deleting_owners_are_ignored() {
        let mut gone = owner("gone", HASH, vec![pod("g-0", PodClass::Running)]);
        gone.deleting = true;
        let live = owner("live", HASH, vec![pod("l-0", PodClass::Running)]);
        let owners = vec![gone, live];
        let plan = plan(input(1, &owners)).unwrap();
        assert!(plan.ops.is_empty());
        assert_eq!(plan.cohort, vec!["live".to_string()]);
    }

    #[test]
    fn registration_timed_out_pods_are_not_usable_capacity() {
        let owners = vec![owner(
            "a",
            HASH,
            vec![
                pod("a-0", PodClass::Running),
                pod("a-1", PodClass::RegistrationTimedOut),
            ],
        )];
        let plan = plan(input(2, &owners)).unwrap();
        // The stuck pod does not count: one unit is still missing.
        assert_eq!(plan.ops, vec![FleetOp::CreateOwners { count: 1 }]);
    }
}
