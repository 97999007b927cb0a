use std::net::SocketAddr;
use std::sync::Arc;

use kube::Client;
use tokio::{task::JoinHandle, try_join};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    autoscaler::batch::BatchScaler,
    autoscaler::queue::WorkQueue,
    config::ControllerConfig,
    controller::autoscaler::KubeReservationApplier,
    controller::{ControllerContext, run_controllers},
    web::{KubeTriggerSource, WebhookState, run_http_server},
};
use rfm_github::{ActionsApi, HttpActionsApi};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &ControllerConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

fn build_github(
    cfg: &ControllerConfig,
) -> anyhow::Result<Option<Arc<dyn ActionsApi>>> {
    let Some(token) = cfg.github.token.clone() else {
        info!("no github token configured; metric estimation disabled");
        return Ok(None);
    };
    let api =
        HttpActionsApi::with_base_url(cfg.github.base_url.clone(), token)?;
    Ok(Some(Arc::new(api)))
}

pub fn spawn_controllers(
    ctx: Arc<ControllerContext>,
    cancel: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controllers(ctx, cancel).await })
}

pub fn spawn_http(
    addr: SocketAddr,
    state: WebhookState,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr, state).await })
}

/// Drains the webhook queue into the batch pipeline. Producers push
/// non-blocking (overflow is surfaced to GitHub as a retryable failure);
/// from here on the bounded batch queue applies backpressure by awaiting.
pub fn spawn_queue_bridge(
    queue: WorkQueue<crate::autoscaler::batch::ScaleTarget>,
    batch: Arc<BatchScaler>,
    cancel: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let rx = queue.receiver();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                recv = rx.recv_async() => match recv {
                    Ok(target) => batch.submit(target).await?,
                    Err(_) => return Ok(()),
                },
            }
        }
    })
}

/// Start the control loops, the webhook server and the reservation batch
/// pipeline, and wait until any of them finishes or shutdown is signaled.
pub async fn run_all(
    client: Client,
    cfg: ControllerConfig,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    let http_addr = compute_http_addr(&cfg);
    let github = build_github(&cfg)?;
    let ctx = Arc::new(ControllerContext::new(
        client.clone(),
        cfg.clone(),
        github,
    ));

    let applier = Arc::new(KubeReservationApplier::new(
        client.clone(),
        ctx.recorder.clone(),
    ));
    let batch = Arc::new(BatchScaler::start(
        applier,
        cfg.webhook.batch_queue_capacity,
        std::time::Duration::from_secs(cfg.webhook.batch_interval_secs),
        cancel.clone(),
    ));

    let queue = WorkQueue::new(cfg.webhook.webhook_queue_capacity);
    let state = WebhookState {
        source: Arc::new(KubeTriggerSource::new(
            client.clone(),
            cfg.k8s_namespace.clone(),
        )),
        queue: queue.clone(),
        secret: cfg.webhook.secret.clone(),
    };

    let controllers = spawn_controllers(ctx, cancel.clone());
    let http = spawn_http(http_addr, state);
    let bridge = spawn_queue_bridge(queue, batch, cancel.clone());

    let (c_res, h_res, b_res) = try_join!(controllers, http, bridge)?;
    c_res?;
    h_res?;
    b_res?;
    Ok(())
}
