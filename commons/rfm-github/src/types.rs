use serde::{Deserialize, Serialize};

/// Registration scope of a runner pool: a whole organization or a single
/// repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerScope {
    Organization(String),
    Repository { owner: String, name: String },
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerScope::Organization(org) => write!(f, "{org}"),
            RunnerScope::Repository { owner, name } => {
                write!(f, "{owner}/{name}")
            }
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct WorkflowRun {
    pub id: Option<i64>,
    pub status: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct WorkflowJob {
    pub id: Option<i64>,
    pub status: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RunnerAgent {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub busy: bool,
}

/// Coarse classification shared by workflow runs and jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    InProgress,
    Queued,
    Other,
}

impl RunStatus {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("completed") => RunStatus::Completed,
            Some("in_progress") => RunStatus::InProgress,
            Some("queued") => RunStatus::Queued,
            _ => RunStatus::Other,
        }
    }

    pub fn counts_as_demand(self) -> bool {
        matches!(self, RunStatus::InProgress | RunStatus::Queued)
    }
}

impl WorkflowRun {
    pub fn classify(&self) -> RunStatus {
        RunStatus::parse(self.status.as_deref())
    }
}

impl WorkflowJob {
    pub fn classify(&self) -> RunStatus {
        RunStatus::parse(self.status.as_deref())
    }
}
