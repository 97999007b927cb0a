//! Webhook ingress: one POST endpoint receiving GitHub deliveries and
//! feeding matched scale-up triggers into the bounded batch queue.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use kube::api::{Api, ListParams};
use kube::Client;
use serde::Deserialize;
use sha2::Sha256;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::autoscaler::batch::ScaleTarget;
use crate::autoscaler::queue::WorkQueue;
use crate::crd::{HorizontalRunnerAutoscaler, ScaleUpTrigger};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Autoscalers eligible for webhook-driven scale-up. The kube-backed
/// implementation lists the live objects; tests substitute a fixed set.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    async fn autoscalers(&self) -> anyhow::Result<Vec<TriggerEntry>>;
}

#[derive(Clone, Debug)]
pub struct TriggerEntry {
    pub namespace: String,
    pub name: String,
    pub triggers: Vec<ScaleUpTrigger>,
}

pub struct KubeTriggerSource {
    client: Client,
    namespace: String,
}

impl KubeTriggerSource {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }
}

#[async_trait]
impl TriggerSource for KubeTriggerSource {
    async fn autoscalers(&self) -> anyhow::Result<Vec<TriggerEntry>> {
        let api: Api<HorizontalRunnerAutoscaler> = if self.namespace.is_empty()
        {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };
        let hras = api.list(&ListParams::default()).await?;
        Ok(hras
            .items
            .into_iter()
            .filter_map(|h| {
                let ns = h.metadata.namespace.clone()?;
                let name = h.metadata.name.clone()?;
                Some(TriggerEntry {
                    namespace: ns,
                    name,
                    triggers: h.spec.scale_up_triggers.clone(),
                })
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub source: Arc<dyn TriggerSource>,
    pub queue: WorkQueue<ScaleTarget>,
    pub secret: Option<String>,
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

pub async fn run_http_server(
    addr: SocketAddr,
    state: WebhookState,
) -> anyhow::Result<()> {
    let app = build_router(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    info!("webhook HTTP listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

/// Decoded subset of a delivery: just enough to evaluate trigger filters.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Delivery {
    Ping,
    Push,
    PullRequest {
        action: String,
        branch: Option<String>,
    },
    CheckRun {
        action: String,
        status: Option<String>,
    },
    WorkflowDispatch,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    #[serde(default)]
    action: String,
    pull_request: Option<PullRequestRef>,
}

#[derive(Deserialize)]
struct PullRequestRef {
    base: Option<BranchRef>,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    ref_: String,
}

#[derive(Deserialize)]
struct CheckRunPayload {
    #[serde(default)]
    action: String,
    check_run: Option<CheckRunRef>,
}

#[derive(Deserialize)]
struct CheckRunRef {
    status: Option<String>,
}

/// `Ok(None)` means an event type this controller does not scale on.
fn decode_delivery(
    kind: &str,
    body: &[u8],
) -> Result<Option<Delivery>, serde_json::Error> {
    let delivery = match kind {
        "ping" => Delivery::Ping,
        "push" => Delivery::Push,
        "pull_request" => {
            let payload: PullRequestPayload = serde_json::from_slice(body)?;
            Delivery::PullRequest {
                action: payload.action,
                branch: payload
                    .pull_request
                    .and_then(|pr| pr.base)
                    .map(|b| b.ref_),
            }
        }
        "check_run" => {
            let payload: CheckRunPayload = serde_json::from_slice(body)?;
            Delivery::CheckRun {
                action: payload.action,
                status: payload.check_run.and_then(|c| c.status),
            }
        }
        "workflow_dispatch" => Delivery::WorkflowDispatch,
        _ => return Ok(None),
    };
    Ok(Some(delivery))
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

fn match_trigger(trigger: &ScaleUpTrigger, delivery: &Delivery) -> bool {
    let ev = &trigger.github_event;
    match delivery {
        Delivery::Push => ev.push.is_some(),
        Delivery::PullRequest { action, branch } => {
            ev.pull_request.as_ref().is_some_and(|f| {
                list_matches(&f.types, action)
                    && branch
                        .as_deref()
                        .map(|b| list_matches(&f.branches, b))
                        .unwrap_or(f.branches.is_empty())
            })
        }
        Delivery::CheckRun { action, status } => {
            ev.check_run.as_ref().is_some_and(|f| {
                list_matches(&f.types, action)
                    && status
                        .as_deref()
                        .map(|s| list_matches(&f.statuses, s))
                        .unwrap_or(f.statuses.is_empty())
            })
        }
        Delivery::WorkflowDispatch => ev.workflow_dispatch.is_some(),
        Delivery::Ping => false,
    }
}

fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
    else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.secret.as_deref() {
        let header = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, header) {
            warn!("webhook delivery failed signature verification");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "signature verification failed",
            )
                .into_response();
        }
    }

    let Some(kind) = headers.get(HEADER_EVENT).and_then(|v| v.to_str().ok())
    else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing X-GitHub-Event header",
        )
            .into_response();
    };

    let delivery = match decode_delivery(kind, &body) {
        Ok(Some(d)) => d,
        Ok(None) => {
            info!(kind, "ignoring unhandled github event type");
            return (StatusCode::OK, "").into_response();
        }
        Err(e) => {
            warn!(kind, error = %e, "failed to decode github event payload");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to decode event payload",
            )
                .into_response();
        }
    };

    if delivery == Delivery::Ping {
        return (StatusCode::OK, "pong").into_response();
    }

    let entries = match state.source.autoscalers().await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "failed to list autoscalers");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to list autoscalers",
            )
                .into_response();
        }
    };

    let mut targets = Vec::new();
    let mut first_match: Option<(String, i64)> = None;
    for entry in &entries {
        for trigger in &entry.triggers {
            if !match_trigger(trigger, &delivery) {
                continue;
            }
            if first_match.is_none() {
                first_match = Some((entry.name.clone(), trigger.amount));
            }
            targets.push(ScaleTarget {
                namespace: entry.namespace.clone(),
                name: entry.name.clone(),
                amount: trigger.amount,
                duration_seconds: trigger.duration_seconds,
            });
        }
    }

    let Some((name, amount)) = first_match else {
        return (
            StatusCode::OK,
            "no horizontalrunnerautoscaler to scale for this github event",
        )
            .into_response();
    };

    // Enqueue the whole match set or nothing; a partial hand-off would
    // double-count the accepted triggers when GitHub redelivers.
    if !state.queue.try_push_all(targets) {
        warn!("scale trigger queue full; rejecting delivery");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "scale trigger queue full, retry delivery",
        )
            .into_response();
    }

    (StatusCode::OK, format!("scaled {name} by {amount}")).into_response()
}
