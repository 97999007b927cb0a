use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::types::{
    Repository, RunnerAgent, RunnerScope, WorkflowJob, WorkflowRun,
};
use crate::{ActionsApi, GithubError};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;

/// Production [`ActionsApi`] implementation over the GitHub REST API.
///
/// The base URL is configurable so tests can point it at a local mock and
/// enterprise installations can point it at their own API host.
#[derive(Clone)]
pub struct HttpActionsApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobsPage {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

#[derive(Deserialize)]
struct RunnersPage {
    #[serde(default)]
    runners: Vec<RunnerAgent>,
}

impl HttpActionsApi {
    pub fn new(token: String) -> Result<Self, GithubError> {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), token)
    }

    pub fn with_base_url(
        base_url: String,
        token: String,
    ) -> Result<Self, GithubError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("rfm-controller")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, GithubError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "github api get");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GithubError::Api(status));
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| GithubError::Decode(e.to_string()))
    }

    fn runners_path(scope: &RunnerScope) -> String {
        match scope {
            RunnerScope::Organization(org) => {
                format!("/orgs/{org}/actions/runners")
            }
            RunnerScope::Repository { owner, name } => {
                format!("/repos/{owner}/{name}/actions/runners")
            }
        }
    }
}

#[async_trait]
impl ActionsApi for HttpActionsApi {
    async fn list_repositories(
        &self,
        org: &str,
    ) -> Result<Vec<Repository>, GithubError> {
        let repos: Vec<Repository> = self
            .get_json(&format!(
                "/orgs/{org}/repos?sort=pushed&per_page={PER_PAGE}"
            ))
            .await?;
        Ok(repos
            .into_iter()
            .filter(|r| !r.archived && !r.disabled)
            .collect())
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRun>, GithubError> {
        let page: RunsPage = self
            .get_json(&format!(
                "/repos/{owner}/{repo}/actions/runs?per_page={PER_PAGE}"
            ))
            .await?;
        Ok(page.workflow_runs)
    }

    async fn list_workflow_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<Vec<WorkflowJob>, GithubError> {
        let page: JobsPage = self
            .get_json(&format!(
                "/repos/{owner}/{repo}/actions/runs/{run_id}/jobs?per_page={PER_PAGE}"
            ))
            .await?;
        Ok(page.jobs)
    }

    async fn list_runners(
        &self,
        scope: &RunnerScope,
    ) -> Result<Vec<RunnerAgent>, GithubError> {
        let page: RunnersPage = self
            .get_json(&format!(
                "{}?per_page={PER_PAGE}",
                Self::runners_path(scope)
            ))
            .await?;
        Ok(page.runners)
    }

    async fn remove_runner(
        &self,
        scope: &RunnerScope,
        id: i64,
    ) -> Result<(), GithubError> {
        let url = format!(
            "{}{}/{id}",
            self.base_url,
            Self::runners_path(scope)
        );
        debug!(%url, "github api delete runner");
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GithubError::Api(status));
        }
        Ok(())
    }
}
