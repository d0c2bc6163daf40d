//! Durable job history in sqlite.
//!
//! Every status transition and log line is committed before the call
//! returns, so history read after a restart matches what callers were told.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;

use crate::{
    error::{Result, WrxError},
    models::{Job, JobAction, JobLogLine, JobStatus},
};

pub const INTERRUPTED_MARKER: &str = "interrupted: process restarted before job completion";

const JOB_COLUMNS: &str =
    "id, target, action, status, created_at, started_at, ended_at, run_id, cancel_requested, error";

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

/// What restart reconciliation found.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub failed: Vec<String>,
    pub requeued: Vec<String>,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, target: &str, action: &JobAction) -> Result<Job> {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            action: action.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            run_id: None,
            cancel_requested: false,
            error: None,
            logs: Vec::new(),
        };
        sqlx::query(
            "INSERT INTO jobs(id, target, action, status, created_at, cancel_requested) VALUES(?, ?, ?, ?, ?, 0)",
        )
        .bind(&job.id)
        .bind(&job.target)
        .bind(serde_json::to_string(&job.action)?)
        .bind(job.status)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    /// Moves a queued job to running. False when it was cancelled (or taken) first.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("UPDATE jobs SET status=?, started_at=? WHERE id=? AND status=?")
            .bind(JobStatus::Running)
            .bind(Utc::now())
            .bind(id)
            .bind(JobStatus::Queued)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Cancels a job that has not started. False when it is no longer queued.
    pub async fn cancel_queued(&self, id: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET status=?, ended_at=?, cancel_requested=1 WHERE id=? AND status=?",
        )
        .bind(JobStatus::Cancelled)
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Queued)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn request_cancel(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("UPDATE jobs SET cancel_requested=1 WHERE id=? AND status=?")
            .bind(id)
            .bind(JobStatus::Running)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn set_run_id(&self, id: &str, run_id: u64) -> Result<()> {
        sqlx::query("UPDATE jobs SET run_id=? WHERE id=?")
            .bind(run_id as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE jobs SET status=?, ended_at=?, error=? WHERE id=?")
            .bind(status)
            .bind(Utc::now())
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Appends one line; sequence numbers start at 1 and grow per job.
    pub async fn append_log(&self, id: &str, line: &str) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            "INSERT INTO job_logs(job_id, seq, line, logged_at) \
             SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ? FROM job_logs WHERE job_id=? \
             RETURNING seq",
        )
        .bind(id)
        .bind(line)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq)
    }

    pub async fn logs(&self, id: &str, after_seq: i64) -> Result<Vec<JobLogLine>> {
        Ok(sqlx::query_as::<_, JobLogLine>(
            "SELECT seq, line, logged_at FROM job_logs WHERE job_id=? AND seq>? ORDER BY seq",
        )
        .bind(id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The job without its log lines.
    pub async fn find(&self, id: &str) -> Result<Job> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| WrxError::JobNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        let mut job = self.find(id).await?;
        job.logs = self.logs(id, 0).await?;
        Ok(job)
    }

    /// Newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY rowid DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Queued or running jobs for a target, oldest first.
    pub async fn active_for(&self, target: &str) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE target=? AND status IN (?, ?) ORDER BY rowid"
        ))
        .bind(target)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Running)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Startup pass: running jobs become failed with an interruption marker;
    /// queued jobs are handed back for re-enqueueing, oldest first.
    pub async fn reconcile_interrupted(&self) -> Result<Reconciled> {
        let running: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs WHERE status=? ORDER BY rowid")
            .bind(JobStatus::Running)
            .fetch_all(&self.pool)
            .await?;

        let mut reconciled = Reconciled::default();
        for id in running {
            self.append_log(&id, INTERRUPTED_MARKER).await?;
            self.finish(&id, JobStatus::Failed, Some(INTERRUPTED_MARKER)).await?;
            warn!(job_id = %id, "interrupted job marked failed");
            reconciled.failed.push(id);
        }

        reconciled.requeued = sqlx::query_scalar("SELECT id FROM jobs WHERE status=? ORDER BY rowid")
            .bind(JobStatus::Queued)
            .fetch_all(&self.pool)
            .await?;
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RunOverrides, db::test_pool};

    fn run_action() -> JobAction {
        JobAction::Run(RunOverrides::default())
    }

    #[tokio::test]
    async fn queued_job_cancels_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_pool(dir.path()).await);
        let job = store.insert("acme", &run_action()).await.unwrap();

        assert!(store.cancel_queued(&job.id).await.unwrap());
        assert!(!store.claim(&job.id).await.unwrap());
        let job = store.get(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.cancel_requested);
    }

    #[tokio::test]
    async fn log_sequence_grows_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_pool(dir.path()).await);
        let a = store.insert("acme", &run_action()).await.unwrap();
        let b = store.insert("acme", &run_action()).await.unwrap();

        assert_eq!(store.append_log(&a.id, "one").await.unwrap(), 1);
        assert_eq!(store.append_log(&a.id, "two").await.unwrap(), 2);
        assert_eq!(store.append_log(&b.id, "other").await.unwrap(), 1);

        let tail = store.logs(&a.id, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].line, "two");
    }

    #[tokio::test]
    async fn restart_fails_running_jobs_and_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let (running, done, queued) = {
            let store = JobStore::new(test_pool(dir.path()).await);
            let running = store.insert("acme", &run_action()).await.unwrap();
            let done = store.insert("acme", &run_action()).await.unwrap();
            let queued = store.insert("acme", &run_action()).await.unwrap();
            assert!(store.claim(&running.id).await.unwrap());
            store.append_log(&running.id, "stage probe: ok").await.unwrap();
            assert!(store.claim(&done.id).await.unwrap());
            store.finish(&done.id, JobStatus::Succeeded, None).await.unwrap();
            (running.id, done.id, queued.id)
        };

        // Fresh pool on the same file, as after a restart.
        let store = JobStore::new(test_pool(dir.path()).await);
        let reconciled = store.reconcile_interrupted().await.unwrap();
        assert_eq!(reconciled.failed, vec![running.clone()]);
        assert_eq!(reconciled.requeued, vec![queued]);

        let job = store.get(&running).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_MARKER));
        assert_eq!(job.logs.last().unwrap().line, INTERRUPTED_MARKER);
        assert_eq!(job.logs.len(), 2);
        assert_eq!(store.get(&done).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(test_pool(dir.path()).await);
        assert!(matches!(store.get("nope").await, Err(WrxError::JobNotFound(_))));
    }
}
