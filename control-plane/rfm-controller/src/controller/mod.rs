use std::sync::Arc;

use futures_util::StreamExt;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::{Controller, controller::Action, watcher::Config};
use kube::{Api, Client};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::crd::{HorizontalRunnerAutoscaler, RunnerSet};
use rfm_github::ActionsApi;

pub mod autoscaler;
pub mod events;
pub mod fleet;
pub mod owner;
pub mod plan;
pub mod pods;
pub mod termination;
pub mod unregistration;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    /// Surfaced as an event on the target; the framework retries with
    /// backoff.
    #[error("configuration error: {0}")]
    Config(String),
    /// Transient: orchestration API unavailable or optimistic-conflict.
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("github api error: {0}")]
    Github(#[from] rfm_github::GithubError),
    /// Invariant violation; requeued with backoff instead of aborting.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub cfg: ControllerConfig,
    pub github: Option<Arc<dyn ActionsApi>>,
    pub recorder: Recorder,
}

impl ControllerContext {
    pub fn new(
        client: Client,
        cfg: ControllerConfig,
        github: Option<Arc<dyn ActionsApi>>,
    ) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "rfm-controller".into(),
                instance: None,
            },
        );
        Self {
            client,
            cfg,
            github,
            recorder,
        }
    }
}

fn scoped_api<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

/// Runs both control loops until cancellation: the autoscaler loop driving
/// replica counts and the fleet loop driving owner lifecycle. Each object
/// identity reconciles independently; cross-object consistency relies on
/// the API server's optimistic concurrency alone.
pub async fn run_controllers(
    ctx: Arc<ControllerContext>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let hra_api: Api<HorizontalRunnerAutoscaler> =
        scoped_api(&ctx.client, &ctx.cfg.k8s_namespace);
    let rs_api: Api<RunnerSet> =
        scoped_api(&ctx.client, &ctx.cfg.k8s_namespace);

    let hra_ctx = ctx.clone();
    let hra_cancel = cancel.clone();
    let hra = Controller::new(hra_api, Config::default())
        .graceful_shutdown_on(async move { hra_cancel.cancelled().await })
        .run(autoscaler::reconcile, error_policy_hra, hra_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => {
                    info!(name = %obj.name, "autoscaler reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "autoscaler reconcile error"),
            }
        });

    let fleet_ctx = ctx.clone();
    let fleet_cancel = cancel.clone();
    let fleet = Controller::new(rs_api, Config::default())
        .graceful_shutdown_on(async move { fleet_cancel.cancelled().await })
        .run(fleet::reconcile, error_policy_fleet, fleet_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => {
                    info!(name = %obj.name, "fleet reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "fleet reconcile error"),
            }
        });

    tokio::join!(hra, fleet);
    Ok(())
}

fn requeue_for(error: &ReconcileErr) -> Action {
    match error {
        // Config errors rarely fix themselves; back off further.
        ReconcileErr::Config(_) => Action::requeue(Duration::from_secs(120)),
        ReconcileErr::InvalidState(_) => {
            Action::requeue(Duration::from_secs(30))
        }
        _ => Action::requeue(Duration::from_secs(15)),
    }
}

fn error_policy_hra(
    _obj: Arc<HorizontalRunnerAutoscaler>,
    error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    requeue_for(error)
}

fn error_policy_fleet(
    _obj: Arc<RunnerSet>,
    error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    requeue_for(error)
}
