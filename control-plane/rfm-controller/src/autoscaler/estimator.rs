use rfm_github::{ActionsApi, GithubError};
use tracing::{debug, warn};

use crate::crd::{MetricSpec, MetricType};

/// Auto-discovery cap: at most this many most-recently-pushed repositories
/// are polled when neither an explicit list nor a bound repository exists.
const MAX_DISCOVERED_REPOSITORIES: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum EstimatorError {
    #[error("minReplicas and maxReplicas must both be set")]
    MissingBounds,
    #[error("no metric configured for the scale target")]
    NoMetric,
    #[error("repository auto-discovery for org {0} yielded no repositories")]
    NoRepositories(String),
    #[error("neither organization, repository nor repositoryNames resolve a scope")]
    UnresolvedScope,
    #[error(transparent)]
    Github(#[from] GithubError),
}

pub struct EstimatorInput<'a> {
    pub min_replicas: Option<i64>,
    pub max_replicas: Option<i64>,
    pub metric: Option<&'a MetricSpec>,
    /// Organization the target's agents register against, if any.
    pub organization: Option<&'a str>,
    /// Repository ("owner/name") the target's agents register against.
    pub repository: Option<&'a str>,
}

/// Demand computed from workflow-run telemetry, with diagnostic counters
/// for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Demand {
    pub desired: i64,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub unknown: usize,
}

/// Converts outstanding/running workflow telemetry into a replica count
/// clamped to the configured bounds.
///
/// Per repository: runs are classified by status; for queued/in-progress
/// runs that expose an id, a per-job listing refines the count (job-level
/// counts replace the run-level one). A failed or empty job listing falls
/// back to the run-level classification.
pub async fn estimate(
    api: &dyn ActionsApi,
    input: EstimatorInput<'_>,
) -> Result<Demand, EstimatorError> {
    let (min, max) = match (input.min_replicas, input.max_replicas) {
        (Some(min), Some(max)) => (min, max),
        _ => return Err(EstimatorError::MissingBounds),
    };
    let metric = input.metric.ok_or(EstimatorError::NoMetric)?;
    // Unknown metric strings never reach here: the CRD enum rejects them
    // at decode time.
    let MetricType::TotalNumberOfQueuedAndInProgressWorkflowRuns =
        metric.type_;

    let repos = resolve_repositories(api, &input, metric).await?;

    let mut queued = 0usize;
    let mut in_progress = 0usize;
    let mut completed = 0usize;
    let mut unknown = 0usize;

    for (owner, repo) in &repos {
        let runs = api.list_workflow_runs(owner, repo).await?;
        for run in runs {
            let status = run.classify();
            if !status.counts_as_demand() {
                match status {
                    rfm_github::RunStatus::Completed => completed += 1,
                    _ => unknown += 1,
                }
                continue;
            }
            // Refine with per-job counts when the run exposes an id.
            let mut refined = false;
            if let Some(run_id) = run.id {
                match api.list_workflow_jobs(owner, repo, run_id).await {
                    Ok(jobs) if !jobs.is_empty() => {
                        for job in jobs {
                            match job.classify() {
                                rfm_github::RunStatus::Queued => queued += 1,
                                rfm_github::RunStatus::InProgress => {
                                    in_progress += 1
                                }
                                rfm_github::RunStatus::Completed => {
                                    completed += 1
                                }
                                rfm_github::RunStatus::Other => unknown += 1,
                            }
                        }
                        refined = true;
                    }
                    Ok(_) => {
                        warn!(%owner, %repo, run_id, "job listing empty; falling back to run-level count");
                    }
                    Err(e) => {
                        warn!(%owner, %repo, run_id, error=%e, "job listing failed; falling back to run-level count");
                    }
                }
            }
            if !refined {
                match status {
                    rfm_github::RunStatus::Queued => queued += 1,
                    rfm_github::RunStatus::InProgress => in_progress += 1,
                    _ => {}
                }
            }
        }
    }

    let required = (queued + in_progress) as i64;
    let desired = required.clamp(min, max);
    debug!(
        required,
        desired, queued, in_progress, completed, unknown,
        "demand estimate"
    );
    Ok(Demand {
        desired,
        queued,
        in_progress,
        completed,
        unknown,
    })
}

/// Resolution order: explicit repositoryNames from the metric, else the
/// single repository bound to the target, else auto-discovery over the
/// organization.
async fn resolve_repositories(
    api: &dyn ActionsApi,
    input: &EstimatorInput<'_>,
    metric: &MetricSpec,
) -> Result<Vec<(String, String)>, EstimatorError> {
    if !metric.repository_names.is_empty() {
        let mut out = Vec::new();
        for entry in &metric.repository_names {
            match split_full_name(entry) {
                Some((owner, name)) => out.push((owner, name)),
                None => match input.organization {
                    Some(org) => out.push((org.to_string(), entry.clone())),
                    None => return Err(EstimatorError::UnresolvedScope),
                },
            }
        }
        return Ok(out);
    }
    if let Some(full) = input.repository {
        return split_full_name(full)
            .map(|r| vec![r])
            .ok_or(EstimatorError::UnresolvedScope);
    }
    if let Some(org) = input.organization {
        let repos = api.list_repositories(org).await?;
        let discovered: Vec<(String, String)> = repos
            .into_iter()
            .take(MAX_DISCOVERED_REPOSITORIES)
            .map(|r| (org.to_string(), r.name))
            .collect();
        if discovered.is_empty() {
            return Err(EstimatorError::NoRepositories(org.to_string()));
        }
        return Ok(discovered);
    }
    Err(EstimatorError::UnresolvedScope)
}

fn split_full_name(full: &str) -> Option<(String, String)> {
    let mut parts = full.splitn(2, '/');
    let owner = parts.next()?.trim();
    let name = parts.next()?.trim();
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}
