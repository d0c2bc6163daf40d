use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunId;
use crate::config::RunOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobAction {
    Run(RunOverrides),
    Diff {
        #[serde(default)]
        baseline: Option<RunId>,
        #[serde(default)]
        candidate: Option<RunId>,
    },
}

impl JobAction {
    pub fn label(&self) -> &'static str {
        match self {
            JobAction::Run(_) => "run",
            JobAction::Diff { .. } => "diff",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobLogLine {
    pub seq: i64,
    pub line: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub target: String,
    #[sqlx(json)]
    pub action: JobAction,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub run_id: Option<i64>,
    pub cancel_requested: bool,
    pub error: Option<String>,
    #[sqlx(skip)]
    #[serde(default)]
    pub logs: Vec<JobLogLine>,
}
