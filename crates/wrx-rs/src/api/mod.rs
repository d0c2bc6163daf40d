//! HTTP surface for the GUI and other collaborators.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::{
    adapters::{doctor as probe_tools, DoctorReport},
    config::{AppConfig, MissingToolPolicy, RunOverrides, TargetConfig},
    diff::{diff_runs, DiffResult},
    error::{Result, WrxError},
    jobs::JobManager,
    models::{Job, JobAction, JobLogLine, RunId, RunRecord, Summary},
    workspace::{RunSelector, Store, WorkspaceInfo},
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
    pub config: Arc<AppConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/doctor", get(doctor))
        .route("/api/targets", get(list_targets).post(create_target))
        .route("/api/targets/:target/config", get(get_config).put(update_config))
        .route("/api/targets/:target/runs", get(list_runs))
        .route("/api/targets/:target/runs/:run/summary", get(get_summary))
        .route("/api/targets/:target/runs/:run/renormalize", get(renormalize))
        .route("/api/targets/:target/diff", get(get_diff))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/logs", get(job_logs))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

impl IntoResponse for WrxError {
    fn into_response(self) -> Response {
        let status = match &self {
            WrxError::JobNotFound(_) | WrxError::RunNotFound { .. } | WrxError::WorkspaceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WrxError::ConcurrentRunConflict { .. } => StatusCode::CONFLICT,
            WrxError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": "wrx-rs"}))
}

/// Store work for a handler, on the blocking pool.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    state.jobs.runner().store().blocking(f).await
}

#[derive(Debug, Serialize)]
pub struct DoctorResponse {
    #[serde(flatten)]
    pub report: DoctorReport,
    pub scope_allowlist: Vec<String>,
    pub worker_pool_size: usize,
    pub missing_tool_policy: MissingToolPolicy,
}

pub async fn doctor(State(state): State<AppState>) -> Json<DoctorResponse> {
    let runner = state.jobs.runner();
    let report = probe_tools(runner.registry(), runner.store().base_dir()).await;
    Json(DoctorResponse {
        report,
        scope_allowlist: state.config.scope_allowlist.clone(),
        worker_pool_size: state.config.worker_pool_size,
        missing_tool_policy: state.config.missing_tool_policy,
    })
}

pub async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<WorkspaceInfo>>> {
    Ok(Json(with_store(&state, |s| s.list_workspaces()).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    target: String,
    #[serde(default)]
    seed_hosts: Vec<String>,
}

pub async fn create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if req.target.trim().is_empty() {
        return Err(WrxError::InvalidConfig("target must not be empty".into()));
    }
    let workspace = with_store(&state, move |s| s.init(&req.target, req.seed_hosts)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "slug": workspace.slug, "config": workspace.config })),
    ))
}

pub async fn get_config(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<TargetConfig>> {
    Ok(Json(with_store(&state, move |s| s.load(&target)).await?.config))
}

/// Replaces the stored configuration. The target name is not editable, and
/// the defaults must resolve before anything is written.
pub async fn update_config(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Json(mut config): Json<TargetConfig>,
) -> Result<Json<TargetConfig>> {
    let saved = with_store(&state, move |s| {
        let mut workspace = s.load(&target)?;
        config.target = workspace.config.target.clone();
        config.resolve(&RunOverrides::default())?;
        workspace.config = config;
        s.save_config(&workspace)?;
        Ok(workspace.config)
    })
    .await?;
    Ok(Json(saved))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<Vec<RunRecord>>> {
    Ok(Json(with_store(&state, move |s| s.list_runs(&target)).await?))
}

/// `run` is a numeric id or `current`.
pub async fn get_summary(
    State(state): State<AppState>,
    Path((target, run)): Path<(String, String)>,
) -> Result<Response> {
    let selector: RunSelector = run.parse()?;
    let summary = with_store(&state, move |s| s.load_summary(&target, selector)).await?;
    Ok(Json(summary.to_document()).into_response())
}

pub async fn renormalize(
    State(state): State<AppState>,
    Path((target, run)): Path<(String, String)>,
) -> Result<Response> {
    let selector: RunSelector = run.parse()?;
    let runner = Arc::clone(state.jobs.runner());
    let summary: Summary = tokio::task::spawn_blocking(move || {
        let run_id = runner.store().resolve_run(&target, selector)?;
        runner.renormalize(&target, run_id)
    })
    .await??;
    Ok(Json(summary.to_document()).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffQuery {
    baseline: Option<u64>,
    candidate: Option<u64>,
}

pub async fn get_diff(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffResult>> {
    let (baseline, candidate) = (query.baseline.map(RunId), query.candidate.map(RunId));
    Ok(Json(
        with_store(&state, move |s| diff_runs(s, &target, baseline, candidate)).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>> {
    Ok(Json(state.jobs.list_jobs(query.limit.clamp(1, 1000)).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    target: String,
    #[serde(flatten)]
    action: JobAction,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    let job = match req.action {
        JobAction::Run(overrides) => state.jobs.submit_run(&req.target, overrides).await?,
        JobAction::Diff { baseline, candidate } => {
            state.jobs.submit_diff(&req.target, baseline, candidate).await?
        }
    };
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Ok(Json(state.jobs.get_job(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    after: i64,
}

/// Lines after `after`, so a poller can follow a live job.
pub async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<JobLogLine>>> {
    Ok(Json(state.jobs.job_logs(&id, query.after).await?))
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Ok(Json(state.jobs.cancel_job(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::ToolRegistry,
        config::MissingToolPolicy,
        db::test_pool,
        jobs::JobStore,
        models::JobStatus,
        runner::Runner,
        workspace::Store,
    };

    async fn state(dir: &std::path::Path) -> AppState {
        let store = Store::new(dir.join("base"));
        let runner = Arc::new(Runner::new(store, ToolRegistry::default(), MissingToolPolicy::Ignore));
        let jobs = JobManager::start(JobStore::new(test_pool(dir).await), runner, 0, Vec::new())
            .await
            .unwrap();
        AppState {
            jobs,
            config: Arc::new(AppConfig::default()),
        }
    }

    #[test]
    fn errors_map_to_http_status() {
        let cases = [
            (WrxError::JobNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                WrxError::ConcurrentRunConflict {
                    workspace: "acme".into(),
                    holder: "run 1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (WrxError::InvalidConfig("bad".into()), StatusCode::BAD_REQUEST),
            (
                WrxError::io("/nope", std::io::Error::other("denied")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn target_then_queued_job_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;

        let (code, _) = create_target(
            State(state.clone()),
            Json(CreateTargetRequest {
                target: "acme".into(),
                seed_hosts: vec!["http://localhost:3000".into()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(code, StatusCode::CREATED);
        let Json(targets) = list_targets(State(state.clone())).await.unwrap();
        assert_eq!(targets[0].slug, "acme");

        let req: CreateJobRequest =
            serde_json::from_str(r#"{"target":"acme","action":"run","preset":"demo"}"#).unwrap();
        assert_eq!(
            req.action,
            JobAction::Run(RunOverrides {
                preset: Some("demo".into()),
                ..RunOverrides::default()
            })
        );
        let (code, Json(job)) = create_job(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(job.status, JobStatus::Queued);

        let Json(job) = cancel_job(State(state.clone()), Path(job.id)).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn config_update_keeps_target_and_rejects_unknown_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        state.jobs.runner().store().init("acme", Vec::new()).unwrap();

        let Json(mut config) = get_config(State(state.clone()), Path("acme".into())).await.unwrap();
        config.target = "renamed".into();
        config.seed_hosts = vec!["https://acme.test".into()];
        let Json(saved) = update_config(State(state.clone()), Path("acme".into()), Json(config.clone()))
            .await
            .unwrap();
        assert_eq!(saved.target, "acme");
        assert_eq!(saved.seed_hosts, vec!["https://acme.test"]);

        config.default_preset = "nope".into();
        let err = update_config(State(state.clone()), Path("acme".into()), Json(config))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        let Json(stored) = get_config(State(state), Path("acme".into())).await.unwrap();
        assert_eq!(stored.default_preset, saved.default_preset);
    }

    #[tokio::test]
    async fn doctor_reports_process_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path()).await;
        state.config = Arc::new(AppConfig {
            scope_allowlist: vec!["127.0.0.0/8".into()],
            ..AppConfig::default()
        });

        let Json(report) = doctor(State(state)).await;
        assert_eq!(report.scope_allowlist, vec!["127.0.0.0/8"]);
        assert!(report.report.workspace_writable);
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("workspace_writable").is_some());
    }

    #[tokio::test]
    async fn missing_summary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        state.jobs.runner().store().init("acme", Vec::new()).unwrap();

        let err = get_summary(State(state), Path(("acme".into(), "current".into())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
