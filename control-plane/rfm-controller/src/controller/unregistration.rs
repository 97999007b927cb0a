//! GitHub-side half of graceful termination.
//!
//! Once the planner has annotated a pod as unregistration-requested, this
//! module walks it through the remaining phases against GitHub's runner
//! inventory: issue the removal call, then confirm the agent is gone from
//! the listing before the pod is marked safe to destroy.

use chrono::{DateTime, Duration, Utc};
use kube::Client;
use rfm_github::{ActionsApi, GithubError, RunnerAgent, RunnerScope};
use tracing::{debug, warn};

use super::ReconcileErr;
use super::owner::annotate_pod;
use super::plan::OwnerState;
use super::termination::{
    ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_UNREGISTRATION_START,
    TerminationPhase,
};
use crate::crd::RunnerPodTemplate;

/// GitHub's runner listing lags reality by up to about a minute. An agent
/// absent from the listing only proves it unregistered once the request is
/// older than this window.
const LISTING_STALENESS_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnregisterStep {
    Wait,
    Remove { id: i64 },
    MarkComplete,
}

fn next_step(
    phase: TerminationPhase,
    runner: Option<&RunnerAgent>,
    requested_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> UnregisterStep {
    match phase {
        TerminationPhase::Requested => match runner {
            Some(r) if r.busy => UnregisterStep::Wait,
            Some(r) => UnregisterStep::Remove { id: r.id },
            // Never seen in the listing: either it never registered or the
            // listing is stale. Only the former is safe to conclude.
            None => match requested_at {
                Some(at)
                    if at + Duration::seconds(LISTING_STALENESS_SECS)
                        <= now =>
                {
                    UnregisterStep::MarkComplete
                }
                _ => UnregisterStep::Wait,
            },
        },
        TerminationPhase::Started => match runner {
            Some(r) if r.busy => UnregisterStep::Wait,
            // Removal was issued but the agent re-appeared; retry.
            Some(r) => UnregisterStep::Remove { id: r.id },
            None => UnregisterStep::MarkComplete,
        },
        TerminationPhase::None | TerminationPhase::Complete => {
            UnregisterStep::Wait
        }
    }
}

fn scope_of(template: &RunnerPodTemplate) -> Option<RunnerScope> {
    if let Some(full) = template.repository.as_deref() {
        let (owner, name) = full.split_once('/')?;
        return Some(RunnerScope::Repository {
            owner: owner.to_string(),
            name: name.to_string(),
        });
    }
    template
        .organization
        .clone()
        .map(RunnerScope::Organization)
}

/// Advances every annotated pod of one owner by at most one phase.
pub async fn advance_pods(
    client: &Client,
    api: &dyn ActionsApi,
    ns: &str,
    template: &RunnerPodTemplate,
    owner: &OwnerState,
    now: DateTime<Utc>,
) -> Result<(), ReconcileErr> {
    let Some(scope) = scope_of(template) else {
        warn!(
            owner = %owner.name,
            "no organization or repository bound; cannot unregister agents"
        );
        return Ok(());
    };
    let runners = api.list_runners(&scope).await?;

    for pod in &owner.pods {
        if !matches!(
            pod.termination,
            TerminationPhase::Requested | TerminationPhase::Started
        ) {
            continue;
        }
        // Agents register under their pod name.
        let agent = runners.iter().find(|r| r.name == pod.name);
        match next_step(
            pod.termination,
            agent,
            owner.unregistration_requested_at,
            now,
        ) {
            UnregisterStep::Wait => {
                debug!(pod = %pod.name, phase = ?pod.termination, "unregistration waiting");
            }
            UnregisterStep::Remove { id } => {
                match api.remove_runner(&scope, id).await {
                    Ok(()) => {
                        if pod.termination == TerminationPhase::Requested {
                            annotate_pod(
                                client,
                                ns,
                                &pod.name,
                                ANNOTATION_UNREGISTRATION_START,
                                &now.to_rfc3339(),
                            )
                            .await?;
                        }
                    }
                    // 422: the agent picked up a job between the listing
                    // and the removal call. Try again next pass.
                    Err(GithubError::Api(code)) if code.as_u16() == 422 => {
                        warn!(pod = %pod.name, "agent became busy; removal deferred");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            UnregisterStep::MarkComplete => {
                annotate_pod(
                    client,
                    ns,
                    &pod.name,
                    ANNOTATION_UNREGISTRATION_COMPLETE,
                    &now.to_rfc3339(),
                )
                .await?;
            }
        }
    }
    Ok(())
}
