use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fleet target resource. Declares a desired agent count and a pod
/// template; the fleet reconciler maps the count onto owner objects
/// (StatefulSets or single-pod Runners) and drives graceful termination
/// before any agent is destroyed.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rfm.io",
    version = "v1alpha1",
    kind = "RunnerSet",
    plural = "runnersets",
    namespaced,
    status = "RunnerSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    pub replicas: Option<i64>,
    /// Ephemeral agents run exactly one job and self-terminate. The fleet
    /// reconciler uses this to tell "disappeared because done" apart from
    /// "disappeared unexpectedly".
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    /// Kind of owner object created when scaling up. Existing owners of
    /// either kind are always reconciled.
    pub owner_kind: Option<OwnerKind>,
    pub template: RunnerPodTemplate,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum OwnerKind {
    #[default]
    StatefulSet,
    Runner,
}

/// Pod template hints for agent pods. Hashed deterministically to detect
/// drift; a hash change triggers rolling replacement of owners.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodTemplate {
    /// GitHub organization the agents register against.
    pub organization: Option<String>,
    /// Repository ("owner/name") the agents register against.
    pub repository: Option<String>,
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runner_groups: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_replicas: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i64>,
    /// Pods under owners whose template hash matches the current spec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
