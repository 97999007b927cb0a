use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::crd::ANNOTATION_RUNNER_ID;

/// Per-reconcile classification of an agent pod. Recomputed every pass,
/// never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodClass {
    Completed,
    Running,
    Terminating,
    /// Running but never registered with GitHub inside the allowed window;
    /// reported separately so usable capacity excludes stuck agents.
    RegistrationTimedOut,
    Pending,
}

pub fn classify_pod(
    pod: &Pod,
    now: DateTime<Utc>,
    registration_timeout: Duration,
) -> PodClass {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodClass::Terminating;
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    match phase {
        "Succeeded" | "Failed" => PodClass::Completed,
        "Running" => {
            if registration_timed_out(pod, now, registration_timeout) {
                PodClass::RegistrationTimedOut
            } else {
                PodClass::Running
            }
        }
        _ => PodClass::Pending,
    }
}

/// Running pod, no recorded registration id, Ready condition last turned
/// true longer ago than the timeout.
fn registration_timed_out(
    pod: &Pod,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let registered = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(ANNOTATION_RUNNER_ID))
        .unwrap_or(false);
    if registered {
        return false;
    }
    let ready_since = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "Ready" && c.status == "True")
        })
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0);
    match ready_since {
        Some(since) => since + timeout <= now,
        None => false,
    }
}
