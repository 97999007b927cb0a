use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};

pub const REASON_SCALING_TRIGGERED: &str = "ScalingTriggered";
pub const REASON_RUNNER_SET_SCALED: &str = "RunnerSetScaled";
pub const REASON_CONFIG_ERROR: &str = "ConfigurationError";
pub const REASON_INVALID_STATE: &str = "InvalidState";

pub fn build_obj_ref(
    api_version: &str,
    kind: &str,
    ns: &str,
    name: &str,
    uid: Option<&str>,
) -> ObjectReference {
    ObjectReference {
        api_version: Some(api_version.to_string()),
        kind: Some(kind.to_string()),
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        uid: uid.map(|u| u.to_string()),
        ..Default::default()
    }
}

pub async fn emit_event(
    recorder: &Recorder,
    obj_ref: &ObjectReference,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            obj_ref,
        )
        .await;
}
