use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::Normalizer;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next(self) -> RunId {
        RunId(self.0 + 1)
    }

    /// Zero-padded so lexical and numeric ordering agree on disk.
    pub fn dir_name(self) -> String {
        format!("{:06}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(RunId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Subdomains,
    Probe,
    Crawl,
    Fuzz,
    Scan,
    ZapBaseline,
    Report,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::Subdomains,
        StageName::Probe,
        StageName::Crawl,
        StageName::Fuzz,
        StageName::Scan,
        StageName::ZapBaseline,
        StageName::Report,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Subdomains => "subdomains",
            StageName::Probe => "probe",
            StageName::Crawl => "crawl",
            StageName::Fuzz => "fuzz",
            StageName::Scan => "scan",
            StageName::ZapBaseline => "zap_baseline",
            StageName::Report => "report",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Ok,
    /// Completed in an interrupted run and carried over without re-running.
    Resumed,
    SkippedMissingTool,
    SkippedDisabled,
    SkippedNoInput,
    Failed,
    Timeout,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Ok => "ok",
            StageStatus::Resumed => "resumed",
            StageStatus::SkippedMissingTool => "skipped-missing-tool",
            StageStatus::SkippedDisabled => "skipped-disabled",
            StageStatus::SkippedNoInput => "skipped-no-input",
            StageStatus::Failed => "failed",
            StageStatus::Timeout => "timeout",
        }
    }

    pub fn is_skip(self) -> bool {
        matches!(
            self,
            StageStatus::SkippedMissingTool | StageStatus::SkippedDisabled | StageStatus::SkippedNoInput
        )
    }

    /// Output from this stage is complete and usable downstream.
    pub fn is_completed(self) -> bool {
        matches!(self, StageStatus::Ok | StageStatus::Resumed)
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, StageStatus::Failed | StageStatus::Timeout)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw file written by a stage, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub path: String,
    pub format: Normalizer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<RawArtifact>,
    pub duration_ms: u64,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageResult {
    pub fn skipped(stage: StageName, status: StageStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            artifacts: Vec::new(),
            duration_ms: 0,
            tool_version: None,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether completing with this status moves the workspace's current-run pointer.
    pub fn advances_current(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Partial)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workspace: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub preset: String,
    pub scan_profile: String,
    pub stages: BTreeMap<StageName, bool>,
    pub config_fingerprint: String,
    /// Relative to the workspace root.
    pub artifact_dir: String,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Interrupted run whose completed stages were carried into this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<RunId>,
}
