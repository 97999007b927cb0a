//! GitHub Actions telemetry client used by the fleet autoscaler.
//!
//! The controller only needs a narrow slice of the Actions API: workflow
//! run/job listings to estimate demand, and the self-hosted runner registry
//! to unregister agents before their pods are destroyed. The [`ActionsApi`]
//! trait is the seam the controller programs against; [`HttpActionsApi`] is
//! the production implementation.
//!
//! GitHub serves runner listings from a cache with roughly a 60 second
//! staleness window. Callers that retry unregistration must keep retrying
//! for longer than that window before concluding an agent is gone.

pub mod client;
pub mod types;

pub use client::HttpActionsApi;
pub use types::{
    Repository, RunStatus, RunnerAgent, RunnerScope, WorkflowJob, WorkflowRun,
};

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum GithubError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("github api returned status {0}")]
    Api(reqwest::StatusCode),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// Read/unregister surface of the GitHub Actions API consumed by the
/// controller. Implementations are expected to be cheap to clone.
#[async_trait]
pub trait ActionsApi: Send + Sync {
    /// Most recently pushed repositories of an organization, excluding
    /// archived and disabled ones. Used for metric auto-discovery; callers
    /// cap the result at 10.
    async fn list_repositories(
        &self,
        org: &str,
    ) -> Result<Vec<Repository>, GithubError>;

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRun>, GithubError>;

    async fn list_workflow_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<Vec<WorkflowJob>, GithubError>;

    async fn list_runners(
        &self,
        scope: &RunnerScope,
    ) -> Result<Vec<RunnerAgent>, GithubError>;

    async fn remove_runner(
        &self,
        scope: &RunnerScope,
        id: i64,
    ) -> Result<(), GithubError>;
}
