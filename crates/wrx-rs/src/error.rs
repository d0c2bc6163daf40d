use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WrxError {
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("tool {tool} exited with code {code}")]
    ToolInvocationFailed { tool: String, code: i32 },

    #[error("tool {tool} timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("workspace io error at {path}: {source}")]
    WorkspaceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `holder` names what occupies the workspace, e.g. `run 3` or `job <id>`.
    #[error("a run is already in progress for workspace {workspace} ({holder})")]
    ConcurrentRunConflict { workspace: String, holder: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("run not found: {workspace}/{run}")]
    RunNotFound { workspace: String, run: String },

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, WrxError>;

impl WrxError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WrxError::WorkspaceIo {
            path: path.into(),
            source,
        }
    }
}

/// Attaches a path to `std::io::Result` values so they surface as `WorkspaceIo`.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| WrxError::io(path, e))
    }
}
