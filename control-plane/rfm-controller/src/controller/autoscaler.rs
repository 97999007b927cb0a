//! Autoscaler control loop: polls GitHub telemetry, folds in webhook
//! capacity reservations and writes the resulting replica count onto the
//! fleet target.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument};

use super::events::{
    REASON_CONFIG_ERROR, REASON_RUNNER_SET_SCALED, REASON_SCALING_TRIGGERED,
    build_obj_ref, emit_event,
};
use super::{ControllerContext, ReconcileErr};
use crate::autoscaler::batch::{ReservationApplier, TriggerAmount};
use crate::autoscaler::estimator::{EstimatorError, EstimatorInput, estimate};
use crate::autoscaler::hysteresis::{HysteresisInput, apply_hysteresis};
use crate::autoscaler::reservations::{apply_triggers, valid_sum};
use crate::crd::{
    HorizontalRunnerAutoscaler, HorizontalRunnerAutoscalerStatus,
    ReservationCombination, RunnerSet,
};

#[instrument(skip_all, fields(namespace = %hra.namespace().unwrap_or_default(), autoscaler = %hra.name_any()))]
pub async fn reconcile(
    hra: Arc<HorizontalRunnerAutoscaler>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = hra
        .namespace()
        .ok_or_else(|| ReconcileErr::Config("autoscaler has no namespace".into()))?;
    let name = hra.name_any();
    let now = Utc::now();

    let obj_ref = build_obj_ref(
        crate::crd::API_VERSION,
        "HorizontalRunnerAutoscaler",
        &ns,
        &name,
        hra.meta().uid.as_deref(),
    );

    let (min, max) = match (hra.spec.min_replicas, hra.spec.max_replicas) {
        (Some(min), Some(max)) if min <= max => (min, max),
        _ => {
            let msg =
                "minReplicas and maxReplicas must both be set, min <= max";
            emit_event(
                &ctx.recorder,
                &obj_ref,
                EventType::Warning,
                REASON_CONFIG_ERROR,
                "Scale",
                Some(msg.to_string()),
            )
            .await;
            return Err(ReconcileErr::Config(msg.to_string()));
        }
    };

    let target_name = hra.spec.scale_target_ref.name.clone();
    let rs_api: Api<RunnerSet> = Api::namespaced(ctx.client.clone(), &ns);
    let target = rs_api.get(&target_name).await.map_err(|e| match e {
        kube::Error::Api(ref ae) if ae.code == 404 => ReconcileErr::Config(
            format!("scale target runnerset {ns}/{target_name} not found"),
        ),
        other => ReconcileErr::Kube(other),
    })?;

    // Base demand: metric-driven when a metric is configured, else the
    // floor (webhook reservations then provide the only lift).
    let suggested = if let Some(metric) = hra.spec.metrics.first() {
        let github = ctx.github.as_ref().ok_or_else(|| {
            ReconcileErr::Config(
                "metric configured but no github token available".into(),
            )
        })?;
        let demand = match estimate(
            github.as_ref(),
            EstimatorInput {
                min_replicas: Some(min),
                max_replicas: Some(max),
                metric: Some(metric),
                organization: target.spec.template.organization.as_deref(),
                repository: target.spec.template.repository.as_deref(),
            },
        )
        .await
        {
            Ok(demand) => demand,
            Err(EstimatorError::Github(g)) => {
                return Err(ReconcileErr::Github(g));
            }
            Err(cfg) => {
                emit_event(
                    &ctx.recorder,
                    &obj_ref,
                    EventType::Warning,
                    REASON_CONFIG_ERROR,
                    "Scale",
                    Some(cfg.to_string()),
                )
                .await;
                return Err(ReconcileErr::Config(cfg.to_string()));
            }
        };
        debug!(
            namespace = %ns, autoscaler = %name,
            queued = demand.queued, in_progress = demand.in_progress,
            "metric demand computed"
        );
        demand.desired
    } else if !hra.spec.scale_up_triggers.is_empty() {
        min
    } else {
        let msg = "neither metrics nor scaleUpTriggers configured";
        emit_event(
            &ctx.recorder,
            &obj_ref,
            EventType::Warning,
            REASON_CONFIG_ERROR,
            "Scale",
            Some(msg.to_string()),
        )
        .await;
        return Err(ReconcileErr::Config(msg.to_string()));
    };

    let reserved = valid_sum(&hra.spec.capacity_reservations, now);
    let demand = combine(
        suggested,
        reserved,
        min,
        max,
        hra.spec.reservation_combination.unwrap_or_default(),
    );

    let prev_status = hra.status.clone().unwrap_or_default();
    let adopted = apply_hysteresis(HysteresisInput {
        prev_desired: prev_status.desired_replicas,
        last_scale_out: prev_status.last_successful_scale_out_time,
        scale_down_delay_secs: hra
            .spec
            .scale_down_delay_seconds_after_scale_out
            .or(Some(ctx.cfg.fleet.scale_down_delay_secs as i64)),
        new_demand: demand,
        now,
    });

    // Write the target's replica count only when it actually moves.
    if target.spec.replicas != Some(adopted) {
        let patch = json!({"spec": {"replicas": adopted}});
        rs_api
            .patch(
                &target_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(
            namespace = %ns, autoscaler = %name, target = %target_name,
            from = ?target.spec.replicas, to = adopted, reserved,
            "fleet target rescaled"
        );
        emit_event(
            &ctx.recorder,
            &obj_ref,
            EventType::Normal,
            REASON_RUNNER_SET_SCALED,
            "Scale",
            Some(format!(
                "scaled runnerset {target_name} from {:?} to {adopted}",
                target.spec.replicas
            )),
        )
        .await;
    }

    let status =
        next_status(&prev_status, adopted, hra.meta().generation, now);
    if status != prev_status {
        let hra_api: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(ctx.client.clone(), &ns);
        let patch = json!({"status": status});
        hra_api
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
    }

    Ok(Action::requeue(Duration::from_secs(
        ctx.cfg.sync_interval_secs,
    )))
}

/// Folds the valid reservation sum into the metric-suggested count per
/// the configured combination rule, then clamps to the bounds.
fn combine(
    suggested: i64,
    reserved: i64,
    min: i64,
    max: i64,
    rule: ReservationCombination,
) -> i64 {
    let combined = match rule {
        ReservationCombination::Additive => suggested + reserved,
        ReservationCombination::Maximum => suggested.max(min + reserved),
    };
    combined.clamp(min, max)
}

/// Derives the status the reconcile would persist. The scale-out anchor
/// only moves when the adopted count rises; an unchanged result compares
/// equal to the previous status so the caller skips the patch.
fn next_status(
    prev: &HorizontalRunnerAutoscalerStatus,
    adopted: i64,
    generation: Option<i64>,
    now: chrono::DateTime<Utc>,
) -> HorizontalRunnerAutoscalerStatus {
    let scaled_out = prev
        .desired_replicas
        .map(|p| adopted > p)
        .unwrap_or(adopted > 0);
    HorizontalRunnerAutoscalerStatus {
        desired_replicas: Some(adopted),
        last_successful_scale_out_time: if scaled_out {
            Some(now)
        } else {
            prev.last_successful_scale_out_time
        },
        observed_generation: generation,
    }
}

/// Persists batched trigger pledges onto an autoscaler.
///
/// The full reservation list is rewritten under optimistic concurrency: a
/// stale read fails the replace and the batch pipeline retries the target
/// on its backoff schedule.
pub struct KubeReservationApplier {
    client: Client,
    recorder: kube::runtime::events::Recorder,
}

impl KubeReservationApplier {
    pub fn new(
        client: Client,
        recorder: kube::runtime::events::Recorder,
    ) -> Self {
        Self { client, recorder }
    }
}

#[async_trait]
impl ReservationApplier for KubeReservationApplier {
    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        triggers: &[TriggerAmount],
    ) -> anyhow::Result<()> {
        let api: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(self.client.clone(), namespace);
        let mut hra = api.get(name).await?;
        let now = Utc::now();
        let pending: Vec<(i64, chrono::Duration)> = triggers
            .iter()
            .map(|t| (t.amount, chrono::Duration::seconds(t.duration_seconds)))
            .collect();
        let before = hra.spec.capacity_reservations.len();
        hra.spec.capacity_reservations = apply_triggers(
            std::mem::take(&mut hra.spec.capacity_reservations),
            &pending,
            now,
        );
        api.replace(name, &PostParams::default(), &hra).await?;
        info!(
            namespace, autoscaler = name,
            reservations_before = before,
            reservations_after = hra.spec.capacity_reservations.len(),
            "capacity reservations updated"
        );
        let pledged: i64 = triggers.iter().map(|t| t.amount).sum();
        let obj_ref = build_obj_ref(
            crate::crd::API_VERSION,
            "HorizontalRunnerAutoscaler",
            namespace,
            name,
            hra.meta().uid.as_deref(),
        );
        emit_event(
            &self.recorder,
            &obj_ref,
            EventType::Normal,
            REASON_SCALING_TRIGGERED,
            "Scale",
            Some(format!(
                "webhook triggers pledged {pledged} replicas"
            )),
        )
        .await;
        Ok(())
    }
}
