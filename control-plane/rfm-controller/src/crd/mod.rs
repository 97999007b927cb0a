pub mod horizontal_runner_autoscaler;
pub mod runner;
pub mod runner_set;

pub use horizontal_runner_autoscaler::{
    CapacityReservation, CheckRunEventFilter, GithubEventScaleUpTrigger,
    HorizontalRunnerAutoscaler, HorizontalRunnerAutoscalerSpec,
    HorizontalRunnerAutoscalerStatus, MetricSpec, MetricType,
    PullRequestEventFilter, PushEventFilter, ReservationCombination,
    ScaleTargetKind, ScaleTargetRef, ScaleUpTrigger,
    WorkflowDispatchEventFilter,
};
pub use runner::{Runner, RunnerSpec, RunnerStatus};
pub use runner_set::{
    OwnerKind, RunnerPodTemplate, RunnerSet, RunnerSetSpec, RunnerSetStatus,
};

/// apiVersion shared by all fleet resources; the `rfm.io` group also
/// prefixes the fleet-owned labels and annotations.
pub const API_VERSION: &str = "rfm.io/v1alpha1";

pub const LABEL_RUNNER_SET_NAME: &str = "rfm.io/runner-set-name";
pub const LABEL_TEMPLATE_HASH: &str = "rfm.io/template-hash";
pub const ANNOTATION_RUNNER_ID: &str = "rfm.io/runner-id";
pub const ANNOTATION_SYNC_TIME: &str = "rfm.io/sync-time";
