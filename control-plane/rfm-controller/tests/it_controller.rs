// Integration tests require a running Kubernetes cluster with the rfm.io
// CRDs applied. Ignored by default.

use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    Client,
    api::{Api, DeleteParams, ListParams, PostParams},
};
use rfm_controller::config::ControllerConfig;
use rfm_controller::controller::{ControllerContext, run_controllers};
use rfm_controller::crd::{
    LABEL_RUNNER_SET_NAME, RunnerPodTemplate, RunnerSet, RunnerSetSpec,
};
use tokio_util::sync::CancellationToken;

const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];

#[test_log::test(tokio::test)]
#[ignore]
async fn fleet_controller_creates_owners_for_runner_set() {
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    let name = format!("rfm-it-{}", nanoid::nanoid!(6, &DIGITS));

    let api: Api<RunnerSet> = Api::namespaced(client.clone(), ns);
    let rs = RunnerSet::new(
        &name,
        RunnerSetSpec {
            replicas: Some(2),
            ephemeral: true,
            owner_kind: None,
            template: RunnerPodTemplate {
                organization: Some("acme".into()),
                ..Default::default()
            },
        },
    );
    api.create(&PostParams::default(), &rs)
        .await
        .expect("create runnerset");

    let cfg = ControllerConfig::init_from_hashmap(
        &std::collections::HashMap::new(),
    )
    .expect("config");
    let ctx = Arc::new(ControllerContext::new(client.clone(), cfg, None));
    let cancel = CancellationToken::new();
    let ctrl_cancel = cancel.clone();
    let ctrl = tokio::spawn(async move {
        let _ = run_controllers(ctx, ctrl_cancel).await;
    });

    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), ns);
    let lp = ListParams::default()
        .labels(&format!("{LABEL_RUNNER_SET_NAME}={name}"));

    let mut owners = 0;
    for _ in 0..30 {
        owners = sts_api.list(&lp).await.expect("list owners").items.len();
        if owners >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    cancel.cancel();
    let _ = api.delete(&name, &DeleteParams::default()).await;
    let _ = ctrl.await;

    assert!(owners >= 2, "expected 2 owners, saw {owners}");
}
