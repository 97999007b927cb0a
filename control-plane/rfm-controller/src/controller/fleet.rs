//! Fleet control loop: maps the target's declared replica count onto owner
//! objects and executes the planner's operations, including the
//! annotation-driven graceful-termination protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

use super::events::{REASON_INVALID_STATE, build_obj_ref, emit_event};
use super::owner::{
    annotate_owner, annotate_pod, create_owner, delete_owner,
    list_owner_states, template_hash,
};
use super::plan::{FleetOp, OwnerState, PlanInput, plan};
use super::termination::{TerminationPhase, Transition, transition_from};
use super::{ControllerContext, ReconcileErr, unregistration};
use crate::crd::{
    ANNOTATION_SYNC_TIME, HorizontalRunnerAutoscaler, OwnerKind, RunnerSet,
    RunnerSetStatus,
};

#[instrument(skip_all, fields(namespace = %rs.namespace().unwrap_or_default(), runner_set = %rs.name_any()))]
pub async fn reconcile(
    rs: Arc<RunnerSet>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = rs.namespace().ok_or_else(|| {
        ReconcileErr::Config("runnerset has no namespace".into())
    })?;
    let name = rs.name_any();
    let now = Utc::now();

    let desired = rs.spec.replicas.unwrap_or(1);
    let desired_hash = template_hash(&rs.spec.template);

    let registration_timeout = chrono::Duration::seconds(
        ctx.cfg.fleet.registration_timeout_secs as i64,
    );
    let unregistration_timeout = chrono::Duration::seconds(
        ctx.cfg.fleet.unregistration_timeout_secs as i64,
    );

    let owners =
        list_owner_states(&ctx.client, &ns, &name, now, registration_timeout)
            .await?;
    let kinds: BTreeMap<String, OwnerKind> =
        owners.iter().map(|o| (o.name.clone(), o.kind)).collect();

    let last_scale_out = paired_last_scale_out(&ctx, &ns, &name).await?;

    let fleet_plan = match plan(PlanInput {
        desired,
        desired_hash: &desired_hash,
        owners: &owners,
        ephemeral: rs.spec.ephemeral,
        last_scale_out,
        unregistration_timeout,
        now,
    }) {
        Ok(p) => p,
        Err(e) => {
            let obj_ref = build_obj_ref(
                crate::crd::API_VERSION,
                "RunnerSet",
                &ns,
                &name,
                rs.meta().uid.as_deref(),
            );
            emit_event(
                &ctx.recorder,
                &obj_ref,
                EventType::Warning,
                REASON_INVALID_STATE,
                "Reconcile",
                Some(e.to_string()),
            )
            .await;
            return Err(ReconcileErr::InvalidState(e.to_string()));
        }
    };

    for op in &fleet_plan.ops {
        execute_op(&ctx, &ns, &rs, &owners, &kinds, op, now).await?;
    }

    // Phase 2/3 of graceful termination runs out of band of the planner:
    // each annotated pod is walked against GitHub's runner inventory.
    if let Some(github) = ctx.github.as_ref() {
        for owner in &owners {
            if matches!(
                owner.termination,
                TerminationPhase::Requested | TerminationPhase::Started
            ) {
                unregistration::advance_pods(
                    &ctx.client,
                    github.as_ref(),
                    &ns,
                    &rs.spec.template,
                    owner,
                    now,
                )
                .await?;
            }
        }
    }

    // First observation of a consistent owner stamps its sync time; the
    // ephemeral-done guard keys on the freshest of these.
    for owner in &owners {
        if owner.synced && owner.sync_time.is_none() {
            annotate_owner(
                &ctx.client,
                &ns,
                owner.kind,
                &owner.name,
                ANNOTATION_SYNC_TIME,
                &now.to_rfc3339(),
            )
            .await?;
        }
    }

    update_status(&ctx, &ns, &rs, desired, &owners, &fleet_plan.cohort)
        .await?;

    Ok(Action::requeue(tokio::time::Duration::from_secs(
        ctx.cfg.sync_interval_secs,
    )))
}

/// Last scale-out instant of the autoscaler paired with this target, if
/// one exists. Feeds the ephemeral-done guard.
async fn paired_last_scale_out(
    ctx: &ControllerContext,
    ns: &str,
    target: &str,
) -> Result<Option<chrono::DateTime<Utc>>, ReconcileErr> {
    let api: Api<HorizontalRunnerAutoscaler> =
        Api::namespaced(ctx.client.clone(), ns);
    let hras = api.list(&ListParams::default()).await?;
    Ok(hras
        .items
        .iter()
        .filter(|h| h.spec.scale_target_ref.name == target)
        .filter_map(|h| {
            h.status
                .as_ref()
                .and_then(|s| s.last_successful_scale_out_time)
        })
        .max())
}

async fn execute_op(
    ctx: &ControllerContext,
    ns: &str,
    rs: &RunnerSet,
    owners: &[OwnerState],
    kinds: &BTreeMap<String, OwnerKind>,
    op: &FleetOp,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileErr> {
    match op {
        FleetOp::CreateOwners { count } => {
            let desired_hash = template_hash(&rs.spec.template);
            for _ in 0..*count {
                let created =
                    create_owner(&ctx.client, ns, rs, &desired_hash).await?;
                info!(namespace = ns, owner = %created, "fleet owner created");
            }
        }
        FleetOp::DeleteOwner { owner, reason } => {
            if let Some(kind) = kinds.get(owner) {
                info!(namespace = ns, owner = %owner, ?reason, "fleet owner deleted");
                delete_owner(&ctx.client, ns, *kind, owner).await?;
            }
        }
        FleetOp::MarkUnregistrationComplete { owner } => {
            let state = owners.iter().find(|o| &o.name == owner);
            if let (Some(state), Some(kind)) = (state, kinds.get(owner)) {
                advance_owner(ctx, ns, *kind, state, TerminationPhase::Complete, now)
                    .await?;
            }
        }
        FleetOp::RequestUnregistration { owner, pods } => {
            let state = owners.iter().find(|o| &o.name == owner);
            let Some(state) = state else { return Ok(()) };
            for pod in pods {
                let phase = state
                    .pods
                    .iter()
                    .find(|p| &p.name == pod)
                    .map(|p| p.termination)
                    .unwrap_or(TerminationPhase::None);
                if let Some((key, value)) =
                    checked_transition(phase, TerminationPhase::Requested, now)?
                {
                    annotate_pod(&ctx.client, ns, pod, key, &value).await?;
                }
            }
            if let Some(kind) = kinds.get(owner) {
                advance_owner(
                    ctx,
                    ns,
                    *kind,
                    state,
                    TerminationPhase::Requested,
                    now,
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn advance_owner(
    ctx: &ControllerContext,
    ns: &str,
    kind: OwnerKind,
    state: &OwnerState,
    next: TerminationPhase,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileErr> {
    if let Some((key, value)) =
        checked_transition(state.termination, next, now)?
    {
        annotate_owner(&ctx.client, ns, kind, &state.name, key, &value)
            .await?;
    }
    Ok(())
}

/// Guards one phase transition. A concurrent pass having won the race is
/// logged and skipped; a genuinely illegal jump surfaces as the recoverable
/// invalid-state error.
fn checked_transition(
    current: TerminationPhase,
    next: TerminationPhase,
    now: chrono::DateTime<Utc>,
) -> Result<Option<(&'static str, String)>, ReconcileErr> {
    match transition_from(current, next, now) {
        Ok(Transition::Advance(key, value)) => Ok(Some((key, value))),
        Ok(Transition::AlreadyDone) => {
            warn!(?current, ?next, "termination phase already recorded");
            Ok(None)
        }
        Err(e) => Err(ReconcileErr::InvalidState(e.to_string())),
    }
}

/// Derives the status the reconcile would persist from the desired-hash
/// cohort. Pure so the patch-skip comparison is directly testable.
fn fleet_status(
    desired: i64,
    owners: &[OwnerState],
    cohort: &[String],
    generation: Option<i64>,
) -> RunnerSetStatus {
    let in_cohort = |o: &&OwnerState| cohort.contains(&o.name);
    let running: i64 =
        owners.iter().filter(in_cohort).map(|o| o.running()).sum();
    let pending: i64 =
        owners.iter().filter(in_cohort).map(|o| o.pending()).sum();

    RunnerSetStatus {
        desired_replicas: Some(desired),
        current_replicas: Some(running + pending),
        ready_replicas: Some(running),
        available_replicas: Some(running),
        updated_replicas: Some(running + pending),
        observed_generation: generation,
    }
}

async fn update_status(
    ctx: &ControllerContext,
    ns: &str,
    rs: &RunnerSet,
    desired: i64,
    owners: &[OwnerState],
    cohort: &[String],
) -> Result<(), ReconcileErr> {
    let status = fleet_status(desired, owners, cohort, rs.meta().generation);
    if rs.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let api: Api<RunnerSet> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({"status": status});
    api.patch_status(
        &rs.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::pods::PodClass;
    use crate::controller::plan::PodState;

    fn owner(name: &str, running: usize, pending: usize) -> OwnerState {
        let mut pods = Vec::new();
        for i in 0..running {
            pods.push(PodState {
                name: format!("{name}-r{i}"),
                class: PodClass::Running,
                termination: TerminationPhase::None,
            });
        }
        for i in 0..pending {
            pods.push(PodState {
                name: format!("{name}-p{i}"),
                class: PodClass::Pending,
                termination: TerminationPhase::None,
            });
        }
        OwnerState {
            name: name.into(),
            kind: OwnerKind::StatefulSet,
            created_at: chrono::Utc::now(),
            deleting: false,
            template_hash: Some("abc123".into()),
            synced: true,
            sync_time: None,
            termination: TerminationPhase::None,
            unregistration_requested_at: None,
            pods,
        }
    }

    #[test]
    fn status_counts_only_cohort_owners() {
        let owners = vec![owner("a", 2, 1), owner("stale", 3, 0)];
        let cohort = vec!["a".to_string()];
        let status = fleet_status(3, &owners, &cohort, Some(4));
        assert_eq!(status.desired_replicas, Some(3));
        assert_eq!(status.current_replicas, Some(3));
        assert_eq!(status.ready_replicas, Some(2));
        assert_eq!(status.observed_generation, Some(4));
    }

    #[test]
    fn identical_snapshot_derives_an_equal_status() {
        let owners = vec![owner("a", 2, 0)];
        let cohort = vec!["a".to_string()];
        // Equal statuses are what the caller skips the patch on.
        let first = fleet_status(2, &owners, &cohort, Some(1));
        let second = fleet_status(2, &owners, &cohort, Some(1));
        assert_eq!(first, second);
        // Any count movement makes the comparison fail.
        let moved = fleet_status(2, &[owner("a", 1, 1)], &cohort, Some(1));
        assert_ne!(first, moved);
    }
}
