//! Filesystem store for workspaces and their runs.
//!
//! ```text
//! <base>/workspaces/<slug>/
//!   config                 target configuration (json)
//!   current_run            latest succeeded/partial run id
//!   runs/<000001>/
//!     run.json             run record, rewritten atomically
//!     stages.jsonl         stage results, appended while the run is live
//!     raw/<stage>/...      tool output
//!     summary.json         normalized summary
//!     diff.json            diff against the previous run
//! ```
//!
//! Every whole-file write goes through a temp file and a rename, so readers
//! see either the previous or the next version, never a torn one.

use std::{
    collections::HashMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::{
    config::{ResolvedRunConfig, TargetConfig},
    error::{IoContext, Result, WrxError},
    models::{RunId, RunRecord, RunStatus, StageResult, StageStatus, Summary},
};

const CONFIG_FILE: &str = "config";
const CURRENT_RUN_FILE: &str = "current_run";
const RUN_FILE: &str = "run.json";
const STAGES_FILE: &str = "stages.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";
pub const DIFF_FILE: &str = "diff.json";

pub const INTERRUPTED_RUN: &str = "interrupted: process restarted before run completion";

/// Filesystem-safe directory name for a target.
pub fn slugify_target(target: &str) -> String {
    let lowered = target.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let slug: String = without_scheme
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() || slug.chars().all(|c| c == '.') {
        "target".to_string()
    } else {
        slug
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).at(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    drop(file);
    fs::rename(&tmp, path).at(path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).at(path)?;
    serde_json::from_slice(&bytes).map_err(|e| WrxError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Which run a read refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelector {
    Current,
    Id(RunId),
}

impl FromStr for RunSelector {
    type Err = WrxError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("current") {
            return Ok(RunSelector::Current);
        }
        s.parse::<RunId>()
            .map(RunSelector::Id)
            .map_err(|_| WrxError::InvalidConfig(format!("invalid run id '{s}'")))
    }
}

impl fmt::Display for RunSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunSelector::Current => f.write_str("current"),
            RunSelector::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub slug: String,
    pub root: PathBuf,
    pub config: TargetConfig,
}

impl Workspace {
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.runs_dir().join(run_id.dir_name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub slug: String,
    pub target: String,
    pub seed_hosts: Vec<String>,
    pub current_run: Option<RunId>,
    pub runs: usize,
}

type ActiveRuns = Arc<Mutex<HashMap<String, RunId>>>;

/// A run that has begun but not completed. Dropping it without
/// [`Store::complete_run`] still frees the workspace for the next run.
#[derive(Debug)]
pub struct RunHandle {
    pub record: RunRecord,
    pub run_dir: PathBuf,
    active: ActiveRuns,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.record.run_id
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if active.get(&self.record.workspace) == Some(&self.record.run_id) {
                active.remove(&self.record.workspace);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    base: PathBuf,
    active: ActiveRuns,
}

impl Store {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base: base_dir.into(),
            active: Arc::default(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Runs store work on tokio's blocking pool with a handle to this store.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    fn workspaces_dir(&self) -> PathBuf {
        self.base.join("workspaces")
    }

    pub fn workspace_dir(&self, target: &str) -> PathBuf {
        self.workspaces_dir().join(slugify_target(target))
    }

    /// Creates the workspace if needed. Non-empty `seed_hosts` replace the stored ones.
    pub fn init(&self, target: &str, seed_hosts: Vec<String>) -> Result<Workspace> {
        let root = self.workspace_dir(target);
        fs::create_dir_all(root.join("runs")).at(&root)?;
        let config_path = root.join(CONFIG_FILE);

        let config = if config_path.exists() {
            let mut config: TargetConfig = read_json(&config_path)?;
            if !seed_hosts.is_empty() && config.seed_hosts != seed_hosts {
                config.seed_hosts = seed_hosts;
                write_json_atomic(&config_path, &config)?;
            }
            config
        } else {
            let config = TargetConfig::new(target.trim(), seed_hosts);
            write_json_atomic(&config_path, &config)?;
            info!(workspace = %slugify_target(target), "workspace initialised");
            config
        };

        Ok(Workspace {
            slug: slugify_target(target),
            root,
            config,
        })
    }

    /// Opens a workspace, creating it with default configuration when absent.
    pub fn open(&self, target: &str) -> Result<Workspace> {
        self.init(target, Vec::new())
    }

    /// Opens an existing workspace only.
    pub fn load(&self, target: &str) -> Result<Workspace> {
        let root = self.workspace_dir(target);
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(WrxError::WorkspaceNotFound(target.to_string()));
        }
        Ok(Workspace {
            slug: slugify_target(target),
            config: read_json(&config_path)?,
            root,
        })
    }

    pub fn save_config(&self, workspace: &Workspace) -> Result<()> {
        write_json_atomic(&workspace.root.join(CONFIG_FILE), &workspace.config)
    }

    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>> {
        let dir = self.workspaces_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut slugs: Vec<String> = fs::read_dir(&dir)
            .at(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(CONFIG_FILE).is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        slugs.sort();

        let mut infos = Vec::with_capacity(slugs.len());
        for slug in slugs {
            let workspace = match self.load(&slug) {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%slug, error = %e, "skipping unreadable workspace");
                    continue;
                }
            };
            infos.push(WorkspaceInfo {
                current_run: self.current_run(&slug)?,
                runs: self.run_ids(&workspace)?.len(),
                target: workspace.config.target.clone(),
                seed_hosts: workspace.config.seed_hosts.clone(),
                slug,
            });
        }
        Ok(infos)
    }

    fn run_ids(&self, workspace: &Workspace) -> Result<Vec<RunId>> {
        let dir = workspace.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<RunId> = fs::read_dir(&dir)
            .at(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<RunId>().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn is_running(&self, target: &str) -> Option<RunId> {
        let active = self.active.lock().ok()?;
        active.get(&slugify_target(target)).copied()
    }

    /// Allocates the next run id and marks the workspace busy.
    ///
    /// Fails with `ConcurrentRunConflict` while another run of the same
    /// workspace is live, and with `WorkspaceIo` when the run directory
    /// cannot be created.
    pub fn begin_run(
        &self,
        workspace: &Workspace,
        config: &ResolvedRunConfig,
        resumed_from: Option<RunId>,
    ) -> Result<RunHandle> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| WrxError::InvalidConfig("run registry poisoned".into()))?;
        if let Some(running) = active.get(&workspace.slug) {
            return Err(WrxError::ConcurrentRunConflict {
                workspace: workspace.slug.clone(),
                holder: format!("run {running}"),
            });
        }

        let run_id = self
            .run_ids(workspace)?
            .last()
            .copied()
            .unwrap_or_default()
            .next();
        let run_dir = workspace.run_dir(run_id);
        fs::create_dir_all(run_dir.join("raw")).at(&run_dir)?;

        let record = RunRecord {
            run_id,
            workspace: workspace.slug.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            preset: config.preset.clone(),
            scan_profile: config.scan_profile.clone(),
            stages: config.stages.clone(),
            config_fingerprint: config.fingerprint()?,
            artifact_dir: format!("runs/{}", run_id.dir_name()),
            stage_results: Vec::new(),
            error: None,
            resumed_from,
        };
        write_json_atomic(&run_dir.join(RUN_FILE), &record)?;
        active.insert(workspace.slug.clone(), run_id);
        info!(workspace = %workspace.slug, %run_id, "run started");

        Ok(RunHandle {
            record,
            run_dir,
            active: Arc::clone(&self.active),
        })
    }

    /// Appends one stage result to the append log of the live run in `run_dir`.
    pub fn append_stage_result(&self, run_dir: &Path, result: &StageResult) -> Result<()> {
        let path = run_dir.join(STAGES_FILE);
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;
        file.write_all(&line).at(&path)?;
        file.sync_data().at(&path)
    }

    /// Copies the artifacts of a completed stage from `from` into `run_dir`
    /// and returns the result recorded as `resumed`.
    pub fn carry_over_stage(&self, from: &RunRecord, prior: &StageResult, run_dir: &Path) -> Result<StageResult> {
        let source_dir = self.run_dir(&from.workspace, from.run_id);
        for artifact in &prior.artifacts {
            let source = source_dir.join(&artifact.path);
            let dest = run_dir.join(&artifact.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            fs::copy(&source, &dest).at(&source)?;
        }
        Ok(StageResult {
            status: StageStatus::Resumed,
            message: format!("resumed from run {} ({})", from.run_id, prior.message),
            duration_ms: 0,
            ..prior.clone()
        })
    }

    /// Seals the run: summary first, then the terminal record, then the
    /// current-run pointer (only for succeeded or partial runs).
    pub fn complete_run(
        &self,
        mut handle: RunHandle,
        status: RunStatus,
        summary: Option<&Summary>,
        error: Option<String>,
    ) -> Result<RunRecord> {
        if let Some(summary) = summary {
            let mut bytes = summary.to_json_pretty()?.into_bytes();
            bytes.push(b'\n');
            write_atomic(&handle.run_dir.join(SUMMARY_FILE), &bytes)?;
        }

        handle.record.status = status;
        handle.record.ended_at = Some(Utc::now());
        handle.record.error = error;
        write_json_atomic(&handle.run_dir.join(RUN_FILE), &handle.record)?;

        if status.advances_current() {
            let workspace_root = handle
                .run_dir
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.workspace_dir(&handle.record.workspace));
            write_atomic(
                &workspace_root.join(CURRENT_RUN_FILE),
                handle.record.run_id.to_string().as_bytes(),
            )?;
        }
        info!(workspace = %handle.record.workspace, run_id = %handle.record.run_id, ?status, "run completed");
        Ok(handle.record.clone())
    }

    pub fn current_run(&self, target: &str) -> Result<Option<RunId>> {
        let path = self.workspace_dir(target).join(CURRENT_RUN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).at(&path)?;
        Ok(raw.trim().parse::<RunId>().ok())
    }

    pub fn resolve_run(&self, target: &str, selector: RunSelector) -> Result<RunId> {
        match selector {
            RunSelector::Id(id) => Ok(id),
            RunSelector::Current => self.current_run(target)?.ok_or_else(|| WrxError::RunNotFound {
                workspace: slugify_target(target),
                run: "current".into(),
            }),
        }
    }

    /// Reads a run record; a live run's stage results come from its append log.
    pub fn load_run(&self, target: &str, run_id: RunId) -> Result<RunRecord> {
        let workspace = self.load(target)?;
        let run_dir = workspace.run_dir(run_id);
        let path = run_dir.join(RUN_FILE);
        if !path.exists() {
            return Err(WrxError::RunNotFound {
                workspace: workspace.slug,
                run: run_id.to_string(),
            });
        }
        let mut record: RunRecord = read_json(&path)?;
        if !record.status.is_terminal() {
            record.stage_results = read_stage_log(&run_dir.join(STAGES_FILE))?;
        }
        Ok(record)
    }

    /// Runs in creation order.
    pub fn list_runs(&self, target: &str) -> Result<Vec<RunRecord>> {
        let workspace = self.load(target)?;
        let mut runs = Vec::new();
        for id in self.run_ids(&workspace)? {
            match self.load_run(target, id) {
                Ok(record) => runs.push(record),
                Err(e) => warn!(workspace = %workspace.slug, run_id = %id, error = %e, "skipping unreadable run"),
            }
        }
        Ok(runs)
    }

    pub fn run_dir(&self, target: &str, run_id: RunId) -> PathBuf {
        self.workspace_dir(target).join("runs").join(run_id.dir_name())
    }

    pub fn load_summary(&self, target: &str, selector: RunSelector) -> Result<Summary> {
        let run_id = self.resolve_run(target, selector)?;
        let record = self.load_run(target, run_id)?;
        let path = self.run_dir(target, run_id).join(SUMMARY_FILE);
        if !record.status.is_terminal() || !path.exists() {
            return Err(WrxError::RunNotFound {
                workspace: slugify_target(target),
                run: format!("{run_id} (no summary)"),
            });
        }
        read_json(&path)
    }

    /// The latest terminal run, when it succeeded with the same configuration.
    pub fn find_reusable_run(&self, target: &str, fingerprint: &str) -> Result<Option<RunRecord>> {
        let latest = self
            .list_runs(target)?
            .into_iter()
            .rev()
            .find(|r| r.status.is_terminal());
        Ok(latest.filter(|r| r.status == RunStatus::Succeeded && r.config_fingerprint == fingerprint))
    }

    /// The latest terminal run, when it was interrupted with the same
    /// configuration and finished at least one stage.
    pub fn find_resumable_run(&self, target: &str, fingerprint: &str) -> Result<Option<RunRecord>> {
        let latest = self
            .list_runs(target)?
            .into_iter()
            .rev()
            .find(|r| r.status.is_terminal());
        Ok(latest.filter(|r| {
            r.status == RunStatus::Failed
                && r.error.as_deref() == Some(INTERRUPTED_RUN)
                && r.config_fingerprint == fingerprint
                && r.stage_results.iter().any(|s| s.status.is_completed())
        }))
    }

    /// The terminal run immediately before `run_id`, if any.
    pub fn previous_terminal_run(&self, target: &str, run_id: RunId) -> Result<Option<RunId>> {
        Ok(self
            .list_runs(target)?
            .into_iter()
            .rev()
            .filter(|r| r.run_id < run_id && r.status.advances_current())
            .map(|r| r.run_id)
            .next())
    }

    pub fn write_run_file<T: Serialize>(&self, target: &str, run_id: RunId, name: &str, value: &T) -> Result<()> {
        write_json_atomic(&self.run_dir(target, run_id).join(name), value)
    }

    pub fn read_run_file<T: DeserializeOwned>(&self, target: &str, run_id: RunId, name: &str) -> Result<Option<T>> {
        let path = self.run_dir(target, run_id).join(name);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Marks runs left `running` by a previous process as failed.
    pub fn recover_interrupted(&self) -> Result<Vec<(String, RunId)>> {
        let mut recovered = Vec::new();
        for info in self.list_workspaces()? {
            let workspace = self.load(&info.slug)?;
            for id in self.run_ids(&workspace)? {
                if self.is_running(&info.slug) == Some(id) {
                    continue;
                }
                let path = workspace.run_dir(id).join(RUN_FILE);
                let Ok(mut record) = read_json::<RunRecord>(&path) else {
                    continue;
                };
                if record.status.is_terminal() {
                    continue;
                }
                record.stage_results = read_stage_log(&workspace.run_dir(id).join(STAGES_FILE))?;
                record.status = RunStatus::Failed;
                record.ended_at = Some(Utc::now());
                record.error = Some(INTERRUPTED_RUN.into());
                write_json_atomic(&path, &record)?;
                warn!(workspace = %info.slug, run_id = %id, "interrupted run marked failed");
                recovered.push((info.slug.clone(), id));
            }
        }
        Ok(recovered)
    }
}

fn read_stage_log(path: &Path) -> Result<Vec<StageResult>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).at(path)?;
    // A torn final line from a crash is dropped; earlier lines are complete.
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RunOverrides,
        models::{RawArtifact, StageName},
        parser::Normalizer,
    };

    fn setup() -> (tempfile::TempDir, Store, Workspace, ResolvedRunConfig) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let ws = store.init("acme", vec!["http://localhost:3000".into()]).unwrap();
        let cfg = ws
            .config
            .resolve(&RunOverrides {
                preset: Some("demo".into()),
                ..RunOverrides::default()
            })
            .unwrap();
        (dir, store, ws, cfg)
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(slugify_target("https://Example.com/app/"), "example.com_app");
        assert_eq!(slugify_target("acme corp"), "acme_corp");
        assert_eq!(slugify_target("   "), "target");
        assert_eq!(slugify_target(".."), "target");
    }

    #[test]
    fn init_is_idempotent_and_updates_seeds() {
        let (_dir, store, ws, _) = setup();
        assert_eq!(ws.config.seed_hosts, vec!["http://localhost:3000"]);
        let again = store.init("acme", Vec::new()).unwrap();
        assert_eq!(again.config.seed_hosts, vec!["http://localhost:3000"]);
        let updated = store.init("acme", vec!["http://127.0.0.1:8080".into()]).unwrap();
        assert_eq!(store.load("acme").unwrap().config.seed_hosts, updated.config.seed_hosts);
        assert!(matches!(store.load("nope"), Err(WrxError::WorkspaceNotFound(_))));
    }

    #[test]
    fn run_ids_increase_in_creation_order() {
        let (_dir, store, ws, cfg) = setup();
        for _ in 0..3 {
            let handle = store.begin_run(&ws, &cfg, None).unwrap();
            store
                .complete_run(handle, RunStatus::Succeeded, Some(&Summary::default()), None)
                .unwrap();
        }
        let ids: Vec<u64> = store.list_runs("acme").unwrap().iter().map(|r| r.run_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(ws.run_dir(RunId(2)).ends_with("runs/000002"));
    }

    #[test]
    fn second_run_conflicts_until_first_is_terminal() {
        let (_dir, store, ws, cfg) = setup();
        let first = store.begin_run(&ws, &cfg, None).unwrap();
        let err = store.begin_run(&ws, &cfg, None).unwrap_err();
        assert!(matches!(err, WrxError::ConcurrentRunConflict { ref holder, .. } if holder == "run 1"));
        assert_eq!(store.is_running("acme"), Some(RunId(1)));

        store.complete_run(first, RunStatus::Failed, None, Some("boom".into())).unwrap();
        assert_eq!(store.is_running("acme"), None);
        let second = store.begin_run(&ws, &cfg, None).unwrap();
        assert_eq!(second.run_id(), RunId(2));
    }

    #[test]
    fn dropped_handle_frees_the_workspace() {
        let (_dir, store, ws, cfg) = setup();
        drop(store.begin_run(&ws, &cfg, None).unwrap());
        assert!(store.begin_run(&ws, &cfg, None).is_ok());
    }

    #[test]
    fn current_run_moves_only_on_succeeded_or_partial() {
        let (_dir, store, ws, cfg) = setup();
        let summary = Summary::default();

        let h = store.begin_run(&ws, &cfg, None).unwrap();
        store.complete_run(h, RunStatus::Partial, Some(&summary), None).unwrap();
        assert_eq!(store.current_run("acme").unwrap(), Some(RunId(1)));

        let h = store.begin_run(&ws, &cfg, None).unwrap();
        store.complete_run(h, RunStatus::Cancelled, Some(&summary), None).unwrap();
        let h = store.begin_run(&ws, &cfg, None).unwrap();
        store.complete_run(h, RunStatus::Failed, None, None).unwrap();
        assert_eq!(store.current_run("acme").unwrap(), Some(RunId(1)));

        assert!(store.load_summary("acme", RunSelector::Current).is_ok());
        assert!(matches!(
            store.load_summary("acme", RunSelector::Id(RunId(3))),
            Err(WrxError::RunNotFound { .. })
        ));
    }

    #[test]
    fn live_run_exposes_appended_stage_results() {
        let (_dir, store, ws, cfg) = setup();
        let handle = store.begin_run(&ws, &cfg, None).unwrap();
        store
            .append_stage_result(
                &handle.run_dir,
                &StageResult::skipped(StageName::Subdomains, StageStatus::SkippedDisabled, "disabled by preset"),
            )
            .unwrap();

        let live = store.load_run("acme", handle.run_id()).unwrap();
        assert_eq!(live.status, RunStatus::Running);
        assert_eq!(live.stage_results.len(), 1);
        assert!(store.load_summary("acme", RunSelector::Id(handle.run_id())).is_err());
    }

    #[test]
    fn reuse_requires_latest_terminal_success_with_same_fingerprint() {
        let (_dir, store, ws, cfg) = setup();
        let fp = cfg.fingerprint().unwrap();

        let h = store.begin_run(&ws, &cfg, None).unwrap();
        store.complete_run(h, RunStatus::Succeeded, Some(&Summary::default()), None).unwrap();
        assert_eq!(store.find_reusable_run("acme", &fp).unwrap().unwrap().run_id, RunId(1));
        assert!(store.find_reusable_run("acme", "other").unwrap().is_none());

        let h = store.begin_run(&ws, &cfg, None).unwrap();
        store.complete_run(h, RunStatus::Partial, Some(&Summary::default()), None).unwrap();
        assert!(store.find_reusable_run("acme", &fp).unwrap().is_none());
    }

    #[test]
    fn interrupted_runs_are_failed_on_recovery() {
        let (dir, store, ws, cfg) = setup();
        let handle = store.begin_run(&ws, &cfg, None).unwrap();
        let id = handle.run_id();
        std::mem::forget(handle);

        // A fresh store has no live runs, like a restarted process.
        let restarted = Store::new(dir.path());
        let recovered = restarted.recover_interrupted().unwrap();
        assert_eq!(recovered, vec![("acme".to_string(), id)]);
        let record = restarted.load_run("acme", id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.unwrap().contains("interrupted"));
    }

    #[test]
    fn interrupted_run_with_same_config_is_resumable() {
        let (dir, store, ws, cfg) = setup();
        let fp = cfg.fingerprint().unwrap();
        let handle = store.begin_run(&ws, &cfg, None).unwrap();
        let probe = StageResult {
            artifacts: vec![RawArtifact {
                path: "raw/probe/httpx.jsonl".into(),
                format: Normalizer::HttpxJsonl,
            }],
            ..StageResult::skipped(StageName::Probe, StageStatus::Ok, "1 invocation")
        };
        fs::create_dir_all(handle.run_dir.join("raw/probe")).unwrap();
        fs::write(handle.run_dir.join("raw/probe/httpx.jsonl"), "{}\n").unwrap();
        store.append_stage_result(&handle.run_dir, &probe).unwrap();
        std::mem::forget(handle);

        let restarted = Store::new(dir.path());
        assert!(restarted.find_resumable_run("acme", &fp).unwrap().is_none());
        restarted.recover_interrupted().unwrap();
        let prior = restarted.find_resumable_run("acme", &fp).unwrap().unwrap();
        assert_eq!(prior.run_id, RunId(1));
        assert!(restarted.find_resumable_run("acme", "other").unwrap().is_none());

        let next = restarted.begin_run(&ws, &cfg, Some(prior.run_id)).unwrap();
        let carried = restarted
            .carry_over_stage(&prior, &prior.stage_results[0], &next.run_dir)
            .unwrap();
        assert_eq!(carried.status, StageStatus::Resumed);
        assert_eq!(carried.artifacts, probe.artifacts);
        assert_eq!(fs::read_to_string(next.run_dir.join("raw/probe/httpx.jsonl")).unwrap(), "{}\n");
        assert_eq!(next.record.resumed_from, Some(RunId(1)));
    }

    #[tokio::test]
    async fn blocking_store_calls_return_results_and_errors() {
        let (_dir, store, _ws, _cfg) = setup();
        let runs = store.blocking(|s| s.list_runs("acme")).await.unwrap();
        assert!(runs.is_empty());
        let err = store.blocking(|s| s.load("nope")).await.unwrap_err();
        assert!(matches!(err, WrxError::WorkspaceNotFound(_)));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn selector_parsing() {
        assert_eq!("current".parse::<RunSelector>().unwrap(), RunSelector::Current);
        assert_eq!("7".parse::<RunSelector>().unwrap(), RunSelector::Id(RunId(7)));
        assert!("seven".parse::<RunSelector>().is_err());
    }
}
