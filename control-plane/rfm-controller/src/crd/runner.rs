use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::runner_set::RunnerPodTemplate;

/// Single-pod fleet owner. Its pass-through pod reconciler lives outside
/// this controller; the fleet reconciler only creates, annotates and
/// deletes Runner objects and observes their pod.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rfm.io",
    version = "v1alpha1",
    kind = "Runner",
    plural = "runners",
    namespaced,
    status = "RunnerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    pub template: RunnerPodTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Registration id reported by the agent once it appears in the GitHub
    /// runner registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<i64>,
}
