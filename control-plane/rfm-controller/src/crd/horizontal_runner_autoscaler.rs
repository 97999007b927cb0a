use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Autoscaler resource: converts GitHub job-queue telemetry and webhook
/// capacity reservations into a replica count on a fleet target.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rfm.io",
    version = "v1alpha1",
    kind = "HorizontalRunnerAutoscaler",
    plural = "horizontalrunnerautoscalers",
    shortname = "hra",
    namespaced,
    status = "HorizontalRunnerAutoscalerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerSpec {
    pub scale_target_ref: ScaleTargetRef,
    pub min_replicas: Option<i64>,
    pub max_replicas: Option<i64>,
    /// Grace period suppressing scale-down after the last scale-out.
    /// Defaults to the controller-wide setting (10 minutes).
    pub scale_down_delay_seconds_after_scale_out: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
    /// Time-bounded pledges of extra capacity, maintained by the webhook
    /// batch pipeline. Expired entries are pruned lazily: they are excluded
    /// from sums and dropped whenever the list is rewritten.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capacity_reservations: Vec<CapacityReservation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_up_triggers: Vec<ScaleUpTrigger>,
    /// How reservation totals combine with metric-derived demand.
    pub reservation_combination: Option<ReservationCombination>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// Target kind; defaults to RunnerSet.
    pub kind: Option<ScaleTargetKind>,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ScaleTargetKind {
    RunnerSet,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReservationCombination {
    /// desired = clamp(metric demand + valid reservation sum)
    #[default]
    Additive,
    /// desired = clamp(max(metric demand, min + valid reservation sum))
    Maximum,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub type_: MetricType,
    /// Explicit repositories to poll ("name" within the target organization
    /// or fully qualified "owner/name"). When empty the repository bound to
    /// the target is used, else org auto-discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_names: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MetricType {
    TotalNumberOfQueuedAndInProgressWorkflowRuns,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservation {
    pub effective_time: Option<chrono::DateTime<chrono::Utc>>,
    pub expiration_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Signed: positive entries pledge capacity, a later negative entry of
    /// equal magnitude cancels the first structurally matching pledge.
    pub replicas: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpTrigger {
    pub github_event: GithubEventScaleUpTrigger,
    /// Replicas pledged per matching delivery.
    pub amount: i64,
    /// Lifetime of the pledge.
    pub duration_seconds: i64,
}

/// Filters mapping an inbound webhook delivery to a trigger. Exactly one
/// event family should be set per trigger.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GithubEventScaleUpTrigger {
    pub push: Option<PushEventFilter>,
    pub pull_request: Option<PullRequestEventFilter>,
    pub check_run: Option<CheckRunEventFilter>,
    pub workflow_dispatch: Option<WorkflowDispatchEventFilter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct PushEventFilter {}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestEventFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckRunEventFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct WorkflowDispatchEventFilter {}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i64>,
    /// Updated whenever the adopted replica count rises; anchors the
    /// scale-down grace window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_scale_out_time:
        Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
