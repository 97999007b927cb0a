//! Kube-facing half of the fleet reconciler: snapshot building, owner
//! creation and the annotation/delete primitives the planner's operations
//! are executed with.
//!
//! Two owner kinds exist behind one capability set: a StatefulSet-backed
//! group owner and the single-pod Runner resource. Both carry the
//! runner-set-name and template-hash labels; their pods carry an
//! owner-name label the pod listing keys on (the owner index).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::controller::pods::classify_pod;
use crate::controller::plan::{OwnerState, PodState};
use crate::controller::termination::{
    ANNOTATION_UNREGISTRATION_REQUEST, TerminationPhase,
};
use crate::crd::{
    ANNOTATION_SYNC_TIME, LABEL_RUNNER_SET_NAME, LABEL_TEMPLATE_HASH,
    OwnerKind, Runner, RunnerPodTemplate, RunnerSet, RunnerSpec,
};

pub const LABEL_OWNER_NAME: &str = "rfm.io/owner-name";

const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/rfm-io/runner:latest";

/// Deterministic fingerprint of a pod template; drift in the hash triggers
/// rolling replacement of owners.
pub fn template_hash(template: &RunnerPodTemplate) -> String {
    let canonical =
        serde_json::to_vec(template).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(digest)[..10].to_string()
}

fn runner_set_selector(name: &str) -> String {
    format!("{LABEL_RUNNER_SET_NAME}={name}")
}

fn owner_selector(owner: &str) -> String {
    format!("{LABEL_OWNER_NAME}={owner}")
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Builds the per-reconcile snapshot of every live owner under a target.
pub async fn list_owner_states(
    client: &Client,
    ns: &str,
    runner_set: &str,
    now: DateTime<Utc>,
    registration_timeout: Duration,
) -> Result<Vec<OwnerState>, kube::Error> {
    let lp = ListParams::default().labels(&runner_set_selector(runner_set));
    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), ns);
    let runner_api: Api<Runner> = Api::namespaced(client.clone(), ns);
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), ns);

    let mut owners = Vec::new();
    for sts in sts_api.list(&lp).await? {
        let pods =
            list_pod_states(&pod_api, &sts.name_any(), now, registration_timeout)
                .await?;
        owners.push(stateful_set_state(&sts, pods));
    }
    for runner in runner_api.list(&lp).await? {
        let pods = list_pod_states(
            &pod_api,
            &runner.name_any(),
            now,
            registration_timeout,
        )
        .await?;
        owners.push(runner_state(&runner, pods));
    }
    Ok(owners)
}

async fn list_pod_states(
    pod_api: &Api<Pod>,
    owner: &str,
    now: DateTime<Utc>,
    registration_timeout: Duration,
) -> Result<Vec<PodState>, kube::Error> {
    let lp = ListParams::default().labels(&owner_selector(owner));
    let mut out = Vec::new();
    for pod in pod_api.list(&lp).await? {
        let annotations =
            pod.metadata.annotations.clone().unwrap_or_default();
        out.push(PodState {
            name: pod.name_any(),
            class: classify_pod(&pod, now, registration_timeout),
            termination: TerminationPhase::of(&annotations),
        });
    }
    Ok(out)
}

fn common_state(
    meta: &ObjectMeta,
    kind: OwnerKind,
    synced: bool,
    pods: Vec<PodState>,
) -> OwnerState {
    let annotations = meta.annotations.clone().unwrap_or_default();
    OwnerState {
        name: meta.name.clone().unwrap_or_default(),
        kind,
        created_at: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        deleting: meta.deletion_timestamp.is_some(),
        template_hash: meta
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_TEMPLATE_HASH))
            .cloned(),
        synced,
        sync_time: annotations
            .get(ANNOTATION_SYNC_TIME)
            .and_then(|s| parse_rfc3339(s)),
        termination: TerminationPhase::of(&annotations),
        unregistration_requested_at: annotations
            .get(ANNOTATION_UNREGISTRATION_REQUEST)
            .and_then(|s| parse_rfc3339(s)),
        pods,
    }
}

fn stateful_set_state(sts: &StatefulSet, pods: Vec<PodState>) -> OwnerState {
    let declared = sts
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let synced = sts
        .status
        .as_ref()
        .map(|s| {
            s.observed_generation.unwrap_or(0)
                >= sts.metadata.generation.unwrap_or(0)
                && s.replicas == declared
        })
        .unwrap_or(false);
    common_state(&sts.metadata, OwnerKind::StatefulSet, synced, pods)
}

fn runner_state(runner: &Runner, pods: Vec<PodState>) -> OwnerState {
    // A Runner declares exactly one pod; it is synced once that pod exists.
    let synced = !pods.is_empty();
    common_state(&runner.metadata, OwnerKind::Runner, synced, pods)
}

/// DNS-1123 safe suffix alphabet for owner names.
const SUFFIX_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd',
    'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

fn new_owner_name(runner_set: &str) -> String {
    format!("{runner_set}-{}", nanoid::nanoid!(6, &SUFFIX_ALPHABET))
}

fn owner_labels(
    runner_set: &str,
    owner: &str,
    hash: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_RUNNER_SET_NAME.to_string(), runner_set.to_string()),
        (LABEL_OWNER_NAME.to_string(), owner.to_string()),
        (LABEL_TEMPLATE_HASH.to_string(), hash.to_string()),
    ])
}

fn owner_ref_for(rs: &RunnerSet) -> Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>> {
    let uid = rs.meta().uid.clone()?;
    Some(vec![
        k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: crate::crd::API_VERSION.to_string(),
            kind: "RunnerSet".to_string(),
            name: rs.name_any(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        },
    ])
}

fn runner_pod_template(
    rs: &RunnerSet,
    labels: &BTreeMap<String, String>,
) -> PodTemplateSpec {
    let template = &rs.spec.template;
    let mut pod_labels = template.labels.clone();
    pod_labels.extend(labels.clone());
    let env: Vec<EnvVar> = template
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "runner".to_string(),
                image: Some(
                    template
                        .image
                        .clone()
                        .unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string()),
                ),
                env: if env.is_empty() { None } else { Some(env) },
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
    }
}

/// Creates one owner object of the target's configured kind. One owner per
/// missing unit: the StatefulSet variant also declares a single replica.
pub async fn create_owner(
    client: &Client,
    ns: &str,
    rs: &RunnerSet,
    hash: &str,
) -> Result<String, kube::Error> {
    let runner_set = rs.name_any();
    let name = new_owner_name(&runner_set);
    let labels = owner_labels(&runner_set, &name, hash);
    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(ns.to_string()),
        labels: Some(labels.clone()),
        owner_references: owner_ref_for(rs),
        ..Default::default()
    };
    match rs.spec.owner_kind.unwrap_or_default() {
        OwnerKind::StatefulSet => {
            let sts = StatefulSet {
                metadata: meta,
                spec: Some(StatefulSetSpec {
                    replicas: Some(1),
                    service_name: runner_set.clone(),
                    selector: LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            LABEL_OWNER_NAME.to_string(),
                            name.clone(),
                        )])),
                        ..Default::default()
                    },
                    template: runner_pod_template(rs, &labels),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), ns);
            api.create(&PostParams::default(), &sts).await?;
        }
        OwnerKind::Runner => {
            let runner = Runner {
                metadata: meta,
                spec: RunnerSpec {
                    template: rs.spec.template.clone(),
                },
                status: None,
            };
            let api: Api<Runner> = Api::namespaced(client.clone(), ns);
            api.create(&PostParams::default(), &runner).await?;
        }
    }
    Ok(name)
}

/// Persists a single metadata annotation on an owner of either kind.
pub async fn annotate_owner(
    client: &Client,
    ns: &str,
    kind: OwnerKind,
    name: &str,
    key: &str,
    value: &str,
) -> Result<(), kube::Error> {
    let patch = json!({"metadata": {"annotations": {key: value}}});
    match kind {
        OwnerKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), ns);
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        OwnerKind::Runner => {
            let api: Api<Runner> = Api::namespaced(client.clone(), ns);
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

pub async fn annotate_pod(
    client: &Client,
    ns: &str,
    name: &str,
    key: &str,
    value: &str,
) -> Result<(), kube::Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), ns);
    let patch = json!({"metadata": {"annotations": {key: value}}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Deletes an owner; the orchestration API's owner-reference cascade
/// removes its pods.
pub async fn delete_owner(
    client: &Client,
    ns: &str,
    kind: OwnerKind,
    name: &str,
) -> Result<(), kube::Error> {
    match kind {
        OwnerKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), ns);
            let _ = api.delete(name, &DeleteParams::default()).await?;
        }
        OwnerKind::Runner => {
            let api: Api<Runner> = Api::namespaced(client.clone(), ns);
            let _ = api.delete(name, &DeleteParams::default()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(image: &str) -> RunnerPodTemplate {
        RunnerPodTemplate {
            organization: Some("acme".into()),
            repository: None,
            image: Some(image.into()),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            runner_groups: vec![],
        }
    }

    #[test]
    fn template_hash_is_deterministic() {
        let a = template_hash(&template("img:1"));
        let b = template_hash(&template("img:1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn template_hash_tracks_drift() {
        let a = template_hash(&template("img:1"));
        let b = template_hash(&template("img:2"));
        assert_ne!(a, b);
    }

    #[test]
    fn owner_names_are_prefixed_and_unique() {
        let a = new_owner_name("pool");
        let b = new_owner_name("pool");
        assert!(a.starts_with("pool-"));
        assert_ne!(a, b);
    }
}
