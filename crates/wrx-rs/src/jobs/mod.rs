mod store;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

pub use store::{JobStore, Reconciled, INTERRUPTED_MARKER};

use crate::{
    config::RunOverrides,
    diff::diff_runs,
    error::{Result, WrxError},
    models::{
        EntityKind, Job, JobAction, JobLogLine, JobStatus, RunId, RunRecord, RunStatus, StageResult,
        StageStatus,
    },
    runner::{CancellationFlag, RunObserver, RunOutcome, Runner},
    security::in_scope,
};

const QUEUE_CAPACITY: usize = 256;

/// Bounded pool of workers consuming queued jobs.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

type Queue = Arc<Mutex<mpsc::Receiver<String>>>;

struct Inner {
    jobs: JobStore,
    runner: Arc<Runner>,
    queue: mpsc::Sender<String>,
    /// Owned here so the queue stays open whatever the worker count.
    pending: Queue,
    /// Held from the conflict check until the run job is queued.
    admission: Mutex<()>,
    cancels: Mutex<HashMap<String, CancellationFlag>>,
    scope_allowlist: Vec<String>,
}

/// Persists run progress as job log lines.
struct JobObserver {
    jobs: JobStore,
    job_id: String,
}

#[async_trait::async_trait]
impl RunObserver for JobObserver {
    async fn run_started(&self, record: &RunRecord) {
        if let Err(e) = self.jobs.set_run_id(&self.job_id, record.run_id.0).await {
            warn!(job_id = %self.job_id, error = %e, "failed to record run id");
        }
    }

    async fn log(&self, line: String) {
        info!(job_id = %self.job_id, "{line}");
        if let Err(e) = self.jobs.append_log(&self.job_id, &line).await {
            warn!(job_id = %self.job_id, error = %e, "failed to persist job log line");
        }
    }
}

impl JobManager {
    /// Reconciles interrupted jobs, then starts `workers` workers.
    pub async fn start(
        jobs: JobStore,
        runner: Arc<Runner>,
        workers: usize,
        scope_allowlist: Vec<String>,
    ) -> Result<Self> {
        let reconciled = jobs.reconcile_interrupted().await?;
        if !reconciled.failed.is_empty() || !reconciled.requeued.is_empty() {
            info!(
                failed = reconciled.failed.len(),
                requeued = reconciled.requeued.len(),
                "job history reconciled"
            );
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY.max(reconciled.requeued.len() + 1));
        let manager = Self {
            inner: Arc::new(Inner {
                jobs,
                runner,
                queue: tx,
                pending: Arc::new(Mutex::new(rx)),
                admission: Mutex::new(()),
                cancels: Mutex::new(HashMap::new()),
                scope_allowlist,
            }),
        };

        for id in reconciled.requeued {
            manager.enqueue(id).await?;
        }

        for worker in 0..workers {
            let manager = manager.clone();
            let rx = Arc::clone(&manager.inner.pending);
            tokio::spawn(async move { manager.worker_loop(worker, rx).await });
        }
        Ok(manager)
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.inner.runner
    }

    async fn enqueue(&self, id: String) -> Result<()> {
        self.inner
            .queue
            .send(id)
            .await
            .map_err(|e| WrxError::InvalidConfig(format!("job queue closed: {e}")))
    }

    /// Queues a pipeline run.
    ///
    /// Rejects seed hosts outside the scope allowlist and targets that
    /// already have a run in flight or queued.
    pub async fn submit_run(&self, target: &str, overrides: RunOverrides) -> Result<Job> {
        let store = self.inner.runner.store();
        let owned = target.to_string();
        let workspace = store.blocking(move |s| s.open(&owned)).await?;
        let resolved = workspace.config.resolve(&overrides)?;

        if let Some(outside) = resolved
            .seed_hosts
            .iter()
            .find(|seed| !in_scope(seed, &self.inner.scope_allowlist))
        {
            return Err(WrxError::InvalidConfig(format!(
                "seed host {outside} is outside the scope allowlist"
            )));
        }

        let _admission = self.inner.admission.lock().await;
        if let Some(running) = store.is_running(&workspace.slug) {
            return Err(WrxError::ConcurrentRunConflict {
                workspace: workspace.slug,
                holder: format!("run {running}"),
            });
        }
        let active = self.inner.jobs.active_for(&workspace.slug).await?;
        if let Some(job) = active.iter().find(|j| matches!(j.action, JobAction::Run(_))) {
            return Err(WrxError::ConcurrentRunConflict {
                workspace: workspace.slug,
                holder: format!("job {}", job.id),
            });
        }

        self.submit(&workspace.slug, JobAction::Run(overrides)).await
    }

    /// Queues a diff; omitted runs default to the current run and the one before it.
    pub async fn submit_diff(
        &self,
        target: &str,
        baseline: Option<RunId>,
        candidate: Option<RunId>,
    ) -> Result<Job> {
        let owned = target.to_string();
        let workspace = self.inner.runner.store().blocking(move |s| s.load(&owned)).await?;
        self.submit(&workspace.slug, JobAction::Diff { baseline, candidate })
            .await
    }

    async fn submit(&self, slug: &str, action: JobAction) -> Result<Job> {
        let job = self.inner.jobs.insert(slug, &action).await?;
        self.inner
            .jobs
            .append_log(&job.id, &format!("queued {} for {slug}", action.label()))
            .await?;
        if let Err(e) = self.enqueue(job.id.clone()).await {
            self.inner.jobs.finish(&job.id, JobStatus::Failed, Some(&e.to_string())).await?;
            return Err(e);
        }
        info!(job_id = %job.id, target = %slug, action = action.label(), "job queued");
        self.inner.jobs.get(&job.id).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.inner.jobs.get(id).await
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        self.inner.jobs.list(limit).await
    }

    pub async fn job_logs(&self, id: &str, after_seq: i64) -> Result<Vec<JobLogLine>> {
        self.inner.jobs.find(id).await?;
        self.inner.jobs.logs(id, after_seq).await
    }

    /// Queued jobs become `cancelled` at once; running ones stop at the
    /// next stage boundary. Terminal jobs are returned unchanged.
    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        let job = self.inner.jobs.find(id).await?;
        match job.status {
            JobStatus::Queued => {
                if self.inner.jobs.cancel_queued(id).await? {
                    self.inner.jobs.append_log(id, "cancelled before start").await?;
                    info!(job_id = %id, "queued job cancelled");
                } else {
                    // Claimed by a worker in the meantime.
                    self.signal_running(id).await?;
                }
            }
            JobStatus::Running => self.signal_running(id).await?,
            _ => {}
        }
        self.inner.jobs.get(id).await
    }

    async fn signal_running(&self, id: &str) -> Result<()> {
        if let Some(flag) = self.inner.cancels.lock().await.get(id) {
            flag.cancel();
        }
        if self.inner.jobs.request_cancel(id).await? {
            self.inner
                .jobs
                .append_log(id, "cancellation requested; stopping at the next stage boundary")
                .await?;
        }
        Ok(())
    }

    async fn worker_loop(self, worker: usize, rx: Queue) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(id) = next else {
                break;
            };
            if let Err(e) = self.process(&id).await {
                error!(worker, job_id = %id, error = %e, "job processing failed");
                let _ = self.inner.jobs.finish(&id, JobStatus::Failed, Some(&e.to_string())).await;
            }
        }
    }

    async fn process(&self, id: &str) -> Result<()> {
        let flag = CancellationFlag::new();
        self.inner.cancels.lock().await.insert(id.to_string(), flag.clone());
        let claimed = self.inner.jobs.claim(id).await;
        let result = match claimed {
            Ok(true) => self.execute(id, &flag).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        self.inner.cancels.lock().await.remove(id);
        result
    }

    async fn execute(&self, id: &str, flag: &CancellationFlag) -> Result<()> {
        let job = self.inner.jobs.find(id).await?;
        let observer = JobObserver {
            jobs: self.inner.jobs.clone(),
            job_id: id.to_string(),
        };
        info!(job_id = %id, target = %job.target, action = job.action.label(), "job started");

        let (status, error) = match &job.action {
            JobAction::Run(overrides) => {
                match self
                    .inner
                    .runner
                    .run(&job.target, overrides, flag, &observer)
                    .await
                {
                    Ok(RunOutcome::Completed { record, .. }) => {
                        if record.status == RunStatus::Partial {
                            let degraded: Vec<String> = record
                                .stage_results
                                .iter()
                                .filter(|r| {
                                    r.status.is_degraded() || r.status == StageStatus::SkippedMissingTool
                                })
                                .map(describe_stage)
                                .collect();
                            observer
                                .log(format!("run {} partial; degraded: {}", record.run_id, degraded.join(", ")))
                                .await;
                        }
                        job_status_for(&record)
                    }
                    Ok(RunOutcome::Reused(record)) => {
                        self.inner.jobs.set_run_id(id, record.run_id.0).await?;
                        (JobStatus::Succeeded, None)
                    }
                    Err(e) => {
                        observer.log(format!("run rejected: {e}")).await;
                        (JobStatus::Failed, Some(e.to_string()))
                    }
                }
            }
            JobAction::Diff { baseline, candidate } => {
                let (target, baseline, candidate) = (job.target.clone(), *baseline, *candidate);
                let diffed = self
                    .inner
                    .runner
                    .store()
                    .blocking(move |s| diff_runs(s, &target, baseline, candidate))
                    .await;
                match diffed {
                    Ok(result) => {
                        if let Some(run) = result.meta.candidate_run {
                            self.inner.jobs.set_run_id(id, run.0).await?;
                        }
                        for kind in EntityKind::ALL {
                            if let Some(change) = result.kind(kind) {
                                observer
                                    .log(format!("{kind}: +{} -{}", change.added.len(), change.removed.len()))
                                    .await;
                            }
                        }
                        (JobStatus::Succeeded, None)
                    }
                    Err(e) => {
                        observer.log(format!("diff failed: {e}")).await;
                        (JobStatus::Failed, Some(e.to_string()))
                    }
                }
            }
        };

        self.inner.jobs.finish(id, status, error.as_deref()).await?;
        info!(job_id = %id, status = ?status, "job finished");
        Ok(())
    }
}

fn describe_stage(result: &StageResult) -> String {
    format!("{} ({})", result.stage, result.status)
}

/// Partial runs still end the job `succeeded`.
fn job_status_for(record: &RunRecord) -> (JobStatus, Option<String>) {
    match record.status {
        RunStatus::Succeeded | RunStatus::Partial => (JobStatus::Succeeded, None),
        RunStatus::Cancelled => (JobStatus::Cancelled, None),
        RunStatus::Failed | RunStatus::Pending | RunStatus::Running => (
            JobStatus::Failed,
            Some(record.error.clone().unwrap_or_else(|| format!("run {} failed", record.run_id))),
        ),
    }
}
