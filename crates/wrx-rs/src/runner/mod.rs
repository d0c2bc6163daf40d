//! Pipeline runner: drives the stages of one run from `running` to a
//! terminal status.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use tracing::{info, warn};

use crate::{
    adapters::{InvocationOutcome, ToolAdapter, ToolProbe, ToolRegistry},
    config::{MissingToolPolicy, ResolvedRunConfig, RunOverrides},
    error::{Result, WrxError},
    models::{
        RunId, RunRecord, RunStatus, StageName, StageResult, StageStatus, Summary, SummaryMetadata,
    },
    parser::{summarize, Contribution, SummaryBuilder},
    stages::{pipeline, Stage, StageContext, StageDescriptor, StageExecution},
    workspace::{RunHandle, Store, SUMMARY_FILE},
};

/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress while a run executes. Each call completes before the
/// runner moves on, so an observer that persists lines keeps them in order.
#[async_trait::async_trait]
pub trait RunObserver: Send + Sync {
    async fn run_started(&self, _record: &RunRecord) {}

    async fn stage_finished(&self, _result: &StageResult) {}

    async fn log(&self, line: String);
}

/// Writes progress to the tracing subscriber only.
pub struct TracingObserver;

#[async_trait::async_trait]
impl RunObserver for TracingObserver {
    async fn log(&self, line: String) {
        info!(target: "wrx::run", "{line}");
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { record: RunRecord, summary: Summary },
    /// An earlier run with the same resolved configuration was returned as is.
    Reused(RunRecord),
}

impl RunOutcome {
    pub fn record(&self) -> &RunRecord {
        match self {
            RunOutcome::Completed { record, .. } | RunOutcome::Reused(record) => record,
        }
    }
}

/// Overall status from the stage results of a run that was not cancelled.
///
/// Skips never escalate, except `skipped-missing-tool` under
/// [`MissingToolPolicy::Degrade`].
pub fn fold_run_status(results: &[StageResult], policy: MissingToolPolicy) -> RunStatus {
    let degraded = results.iter().any(|r| r.status.is_degraded());
    let missing = policy == MissingToolPolicy::Degrade
        && results.iter().any(|r| r.status == StageStatus::SkippedMissingTool);
    if degraded || missing {
        RunStatus::Partial
    } else {
        RunStatus::Succeeded
    }
}

fn execution_status(exec: &StageExecution) -> (StageStatus, String) {
    if let Some(error) = &exec.error {
        return (StageStatus::Failed, error.clone());
    }
    if let Some(timed_out) = exec.outcomes.iter().find(|o| o.timed_out) {
        let secs = timed_out.duration.as_secs();
        let err = WrxError::ToolTimeout {
            tool: timed_out.tool.clone(),
            secs,
        };
        return (StageStatus::Timeout, err.to_string());
    }
    if let Some(bad) = exec.outcomes.iter().find(|o| !o.succeeded(exec.ok_codes)) {
        return (StageStatus::Failed, failure_message(bad));
    }
    let n = exec.outcomes.len();
    let message = match n {
        0 => "completed".to_string(),
        1 => "1 invocation".to_string(),
        n => format!("{n} invocations"),
    };
    (StageStatus::Ok, message)
}

fn failure_message(outcome: &InvocationOutcome) -> String {
    match (&outcome.spawn_error, outcome.exit_code) {
        (Some(e), _) => format!("{} could not be started: {e}", outcome.tool),
        (None, Some(code)) => WrxError::ToolInvocationFailed {
            tool: outcome.tool.clone(),
            code,
        }
        .to_string(),
        (None, None) => format!("{} terminated by signal", outcome.tool),
    }
}

/// Status for a stage that skips on empty input.
///
/// When every earlier producer of a required kind was itself skipped, that
/// skip reason carries over; otherwise the stage is `skipped-no-input`.
fn no_input_status(
    descriptor: &StageDescriptor,
    earlier: &[(StageDescriptor, StageStatus)],
) -> (StageStatus, String) {
    let producers: Vec<&(StageDescriptor, StageStatus)> = earlier
        .iter()
        .filter(|(d, _)| d.produces.is_some_and(|k| descriptor.requires.contains(&k)))
        .collect();
    if let Some((first, status)) = producers.first() {
        if producers.iter().all(|(_, s)| s.is_skip()) {
            return (
                *status,
                format!("{} (upstream {} {status})", descriptor.no_input_reason, first.name),
            );
        }
    }
    (StageStatus::SkippedNoInput, descriptor.no_input_reason.to_string())
}

pub struct Runner {
    store: Store,
    registry: ToolRegistry,
    policy: MissingToolPolicy,
}

struct Probed {
    adapter: Arc<dyn ToolAdapter>,
    probe: ToolProbe,
}

impl Runner {
    pub fn new(store: Store, registry: ToolRegistry, policy: MissingToolPolicy) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs the pipeline for `target`.
    ///
    /// Without `force`, an unchanged configuration reuses the latest
    /// succeeded run, and an interrupted run with the same configuration is
    /// resumed: its completed stages are carried over instead of re-run.
    ///
    /// Errors are reserved for preconditions: unknown preset, an unwritable
    /// workspace, or another run already in flight. Tool problems end up in
    /// the stage results instead.
    pub async fn run(
        &self,
        target: &str,
        overrides: &RunOverrides,
        cancel: &CancellationFlag,
        observer: &dyn RunObserver,
    ) -> Result<RunOutcome> {
        let owned = target.to_string();
        let workspace = self.store.blocking(move |s| s.open(&owned)).await?;
        let config = workspace.config.resolve(overrides)?;

        let mut resume = None;
        if !overrides.force {
            let fingerprint = config.fingerprint()?;
            let owned = target.to_string();
            let (reusable, resumable) = self
                .store
                .blocking(move |s| {
                    Ok((
                        s.find_reusable_run(&owned, &fingerprint)?,
                        s.find_resumable_run(&owned, &fingerprint)?,
                    ))
                })
                .await?;
            if let Some(existing) = reusable {
                observer
                    .log(format!(
                        "configuration unchanged since run {}; reusing it (force to re-run)",
                        existing.run_id
                    ))
                    .await;
                return Ok(RunOutcome::Reused(existing));
            }
            if let Some(prior) = &resumable {
                observer
                    .log(format!(
                        "resuming interrupted run {}; completed stages are carried over (force to re-run)",
                        prior.run_id
                    ))
                    .await;
            }
            resume = resumable;
        }

        let resumed_from = resume.as_ref().map(|r| r.run_id);
        let (ws, cfg) = (workspace.clone(), config.clone());
        let mut handle = self
            .store
            .blocking(move |s| s.begin_run(&ws, &cfg, resumed_from))
            .await?;
        observer.run_started(&handle.record).await;
        observer
            .log(format!(
                "run {} started for {} (preset {}, profile {})",
                handle.run_id(),
                config.target,
                config.preset,
                config.scan_profile
            ))
            .await;

        match self.drive(&mut handle, &config, resume.as_ref(), cancel, observer).await {
            Ok((status, summary)) => {
                observer.log(format!("run {} finished: {status}", handle.run_id())).await;
                let sealed = summary.clone();
                let record = self
                    .store
                    .blocking(move |s| s.complete_run(handle, status, Some(&sealed), None))
                    .await?;
                Ok(RunOutcome::Completed { record, summary })
            }
            Err(e) => {
                warn!(run_id = %handle.run_id(), error = %e, "run aborted");
                observer.log(format!("run {} failed: {e}", handle.run_id())).await;
                let message = e.to_string();
                self.store
                    .blocking(move |s| s.complete_run(handle, RunStatus::Failed, None, Some(message)))
                    .await?;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        handle: &mut RunHandle,
        config: &ResolvedRunConfig,
        resume: Option<&RunRecord>,
        cancel: &CancellationFlag,
        observer: &dyn RunObserver,
    ) -> Result<(RunStatus, Summary)> {
        let run_dir = handle.run_dir.clone();
        let mut builder = SummaryBuilder::new();
        let mut probes: HashMap<&'static str, Option<Probed>> = HashMap::new();
        let mut earlier: Vec<(StageDescriptor, StageStatus)> = Vec::new();
        let mut cancelled = false;
        let mut carried_versions = BTreeMap::new();

        // Completed stages of the interrupted run are carried over until the
        // first stage that has to execute again; everything after it re-runs.
        let mut carry: HashMap<StageName, StageResult> = resume
            .map(|prior| {
                prior
                    .stage_results
                    .iter()
                    .filter(|r| r.status.is_completed())
                    .map(|r| (r.stage, r.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for stage in pipeline() {
            let descriptor = stage.descriptor();
            if cancel.is_cancelled() {
                observer
                    .log(format!("cancellation observed before stage {}", descriptor.name))
                    .await;
                cancelled = true;
                break;
            }

            let result = match (resume, carry.remove(&descriptor.name)) {
                (Some(prior), Some(done)) => {
                    let (from, dir) = (prior.clone(), run_dir.clone());
                    let result = self
                        .store
                        .blocking(move |s| s.carry_over_stage(&from, &done, &dir))
                        .await?;
                    if let (Some(tool), Some(version)) = (descriptor.tool, result.tool_version.clone()) {
                        carried_versions.insert(tool.to_string(), version);
                    }
                    result
                }
                _ => {
                    let result = self
                        .run_stage(stage.as_ref(), config, &run_dir, builder.view(), &mut probes, &earlier, observer)
                        .await;
                    if !result.status.is_skip() {
                        carry.clear();
                    }
                    result
                }
            };
            builder.absorb_stage(&run_dir, &result);

            info!(
                run_id = %handle.run_id(),
                stage = %result.stage,
                status = %result.status,
                duration_ms = result.duration_ms,
                "stage finished"
            );
            observer
                .log(format!("stage {}: {} ({})", result.stage, result.status, result.message))
                .await;
            for note in &result.warnings {
                observer.log(format!("stage {}: {note}", result.stage)).await;
            }

            earlier.push((descriptor, result.status));
            let (dir, logged) = (run_dir.clone(), result.clone());
            self.store
                .blocking(move |s| s.append_stage_result(&dir, &logged))
                .await?;
            handle.record.stage_results.push(result);
            if let Some(last) = handle.record.stage_results.last() {
                observer.stage_finished(last).await;
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            fold_run_status(&handle.record.stage_results, self.policy)
        };

        let mut tool_versions = carried_versions;
        tool_versions.extend(probes.iter().filter_map(|(name, probed)| {
            let version = probed.as_ref()?.probe.version.clone()?;
            Some((name.to_string(), version))
        }));
        let metadata = metadata_for(&handle.record, config, tool_versions);
        Ok((status, builder.finish(metadata)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        config: &ResolvedRunConfig,
        run_dir: &Path,
        upstream: &Contribution,
        probes: &mut HashMap<&'static str, Option<Probed>>,
        earlier: &[(StageDescriptor, StageStatus)],
        observer: &dyn RunObserver,
    ) -> StageResult {
        let descriptor = stage.descriptor();
        let name = descriptor.name;

        if !config.stage_enabled(name) {
            return StageResult::skipped(
                name,
                StageStatus::SkippedDisabled,
                format!("disabled by preset '{}'", config.preset),
            );
        }

        let mut tool = None;
        let mut tool_version = None;
        if let Some(tool_name) = descriptor.tool {
            if !probes.contains_key(tool_name) {
                let probed = match self.registry.get(tool_name) {
                    Some(adapter) => {
                        let probe = adapter.probe().await;
                        Some(Probed { adapter, probe })
                    }
                    None => None,
                };
                probes.insert(tool_name, probed);
            }
            match probes.get(tool_name).and_then(Option::as_ref) {
                Some(p) if p.probe.available => {
                    tool = Some(Arc::clone(&p.adapter));
                    tool_version = p.probe.version.clone();
                }
                Some(p) => {
                    let detail = p.probe.detail.clone().unwrap_or_default();
                    let reason = WrxError::ToolUnavailable(format!("{tool_name}: {detail}"));
                    return StageResult::skipped(name, StageStatus::SkippedMissingTool, reason.to_string());
                }
                None => {
                    let reason = WrxError::ToolUnavailable(format!("{tool_name}: no adapter registered"));
                    return StageResult::skipped(name, StageStatus::SkippedMissingTool, reason.to_string());
                }
            }
        }

        let ctx = StageContext {
            config,
            run_dir,
            upstream,
        };
        let targets = stage.targets(&ctx).await;
        if targets.items.is_empty() && descriptor.skip_without_input {
            let (status, message) = no_input_status(&descriptor, earlier);
            return StageResult {
                warnings: targets.notes,
                ..StageResult::skipped(name, status, message)
            };
        }

        observer
            .log(format!("stage {name}: {} target(s)", targets.items.len()))
            .await;
        let started = Instant::now();
        let exec = stage.execute(&ctx, tool, targets.items).await;
        let (status, message) = execution_status(&exec);

        let mut warnings = targets.notes;
        warnings.extend(exec.notes);
        StageResult {
            stage: name,
            status,
            message,
            artifacts: exec.artifacts,
            duration_ms: started.elapsed().as_millis() as u64,
            tool_version,
            warnings,
        }
    }

    /// Rebuilds the summary of a terminal run from its raw artifacts.
    ///
    /// Stored metadata is reused, so unchanged artifacts reproduce the stored
    /// summary exactly.
    pub fn renormalize(&self, target: &str, run_id: RunId) -> Result<Summary> {
        let record = self.store.load_run(target, run_id)?;
        if !record.status.is_terminal() {
            return Err(WrxError::RunNotFound {
                workspace: record.workspace,
                run: format!("{run_id} (still running)"),
            });
        }
        let run_dir = self.store.run_dir(target, run_id);
        let metadata = match self.store.read_run_file::<Summary>(target, run_id, SUMMARY_FILE)? {
            Some(stored) => stored.metadata,
            None => {
                let workspace = self.store.load(target)?;
                let config = workspace.config.resolve(&RunOverrides {
                    preset: Some(record.preset.clone()),
                    scan_profile: Some(record.scan_profile.clone()),
                    ..RunOverrides::default()
                })?;
                metadata_for(&record, &config, versions_of(&record))
            }
        };
        Ok(summarize(&run_dir, &record.stage_results, metadata))
    }
}

/// Tool versions as recorded on the stage results, keyed by tool name.
fn versions_of(record: &RunRecord) -> BTreeMap<String, String> {
    let tools: HashMap<_, _> = pipeline()
        .iter()
        .filter_map(|s| {
            let d = s.descriptor();
            Some((d.name, d.tool?))
        })
        .collect();
    record
        .stage_results
        .iter()
        .filter_map(|r| Some((tools.get(&r.stage)?.to_string(), r.tool_version.clone()?)))
        .collect()
}

fn metadata_for(
    record: &RunRecord,
    config: &ResolvedRunConfig,
    tool_versions: BTreeMap<String, String>,
) -> SummaryMetadata {
    let artifact_paths = record
        .stage_results
        .iter()
        .flat_map(|r| &r.artifacts)
        .map(|a| {
            let key = a.path.strip_prefix("raw/").unwrap_or(&a.path).to_string();
            (key, a.path.clone())
        })
        .collect();
    SummaryMetadata {
        target: config.target.clone(),
        timestamp: record.started_at.to_rfc3339(),
        preset: config.preset.clone(),
        scan_profile: config.scan_profile.clone(),
        run_id: record.run_id,
        tool_versions,
        artifact_paths,
        parse_warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        adapters::{fake::FakeTool, DOCKER, FFUF, HTTPX, KATANA, NUCLEI, SUBFINDER},
        models::StageName,
        workspace::RunSelector,
    };

    const HTTPX_OUT: &str = "{\"url\":\"http://localhost:3000\",\"status_code\":200,\"title\":\"OWASP Juice Shop\"}\n";
    const KATANA_OUT: &str = concat!(
        "{\"request\":{\"endpoint\":\"http://localhost:3000/rest/products\"}}\n",
        "{\"request\":{\"endpoint\":\"http://localhost:3000/ftp\"}}\n",
    );

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        cancel_after: Option<(StageName, CancellationFlag)>,
    }

    #[async_trait::async_trait]
    impl RunObserver for Recorder {
        async fn stage_finished(&self, result: &StageResult) {
            if let Some((stage, flag)) = &self.cancel_after {
                if *stage == result.stage {
                    flag.cancel();
                }
            }
        }

        async fn log(&self, line: String) {
            self.lines.lock().unwrap().push(line);
        }
    }

    fn registry(httpx: FakeTool) -> ToolRegistry {
        ToolRegistry::default()
            .with(Arc::new(FakeTool::available(SUBFINDER, "")))
            .with(Arc::new(httpx))
            .with(Arc::new(FakeTool::available(KATANA, KATANA_OUT)))
            .with(Arc::new(FakeTool::available(FFUF, "")))
            .with(Arc::new(FakeTool::available(NUCLEI, "")))
            .with(Arc::new(FakeTool::missing(DOCKER)))
    }

    fn setup(httpx: FakeTool, policy: MissingToolPolicy) -> (tempfile::TempDir, Runner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init("acme", vec!["http://localhost:3000".into()]).unwrap();
        (dir, Runner::new(store, registry(httpx), policy))
    }

    fn demo() -> RunOverrides {
        RunOverrides {
            preset: Some("demo".into()),
            ..RunOverrides::default()
        }
    }

    fn status_of(record: &RunRecord, stage: StageName) -> StageStatus {
        record
            .stage_results
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.status)
            .unwrap()
    }

    #[tokio::test]
    async fn demo_run_against_local_app() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Ignore);
        let outcome = runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        let RunOutcome::Completed { record, summary } = outcome else {
            panic!("expected a fresh run");
        };

        assert_eq!(record.status, RunStatus::Succeeded);
        let stages: Vec<StageName> = record.stage_results.iter().map(|r| r.stage).collect();
        assert_eq!(stages, StageName::ALL.to_vec());
        assert_eq!(status_of(&record, StageName::Subdomains), StageStatus::SkippedDisabled);
        assert_eq!(status_of(&record, StageName::Fuzz), StageStatus::SkippedDisabled);
        assert_eq!(status_of(&record, StageName::ZapBaseline), StageStatus::SkippedMissingTool);
        assert_eq!(status_of(&record, StageName::Report), StageStatus::Ok);

        assert_eq!(summary.alive_hosts.len(), 1);
        assert_eq!(summary.alive_hosts[0].url, "http://localhost:3000");
        assert_eq!(summary.urls.len(), 2);
        assert_eq!(summary.metadata.run_id, RunId(1));
        assert!(summary.metadata.tool_versions.contains_key(HTTPX));
        assert_eq!(
            summary.metadata.artifact_paths.get("probe/httpx.jsonl").map(String::as_str),
            Some("raw/probe/httpx.jsonl")
        );

        let stored = runner.store().load_summary("acme", RunSelector::Current).unwrap();
        assert_eq!(stored, summary);
    }

    #[tokio::test]
    async fn missing_prober_skips_and_downstream_inherits() {
        let (_dir, runner) = setup(FakeTool::missing(HTTPX), MissingToolPolicy::Ignore);
        let outcome = runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        let record = outcome.record();

        assert_eq!(status_of(record, StageName::Probe), StageStatus::SkippedMissingTool);
        assert_eq!(status_of(record, StageName::Crawl), StageStatus::SkippedMissingTool);
        assert_eq!(record.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn degrade_policy_turns_missing_tools_into_partial() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Degrade);
        let outcome = runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        assert_eq!(outcome.record().status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn failing_tool_degrades_the_run_but_keeps_going() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, "").exits(1), MissingToolPolicy::Ignore);
        let outcome = runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        let record = outcome.record();

        assert_eq!(status_of(record, StageName::Probe), StageStatus::Failed);
        assert_eq!(status_of(record, StageName::Crawl), StageStatus::SkippedNoInput);
        assert_eq!(status_of(record, StageName::Report), StageStatus::Ok);
        assert_eq!(record.status, RunStatus::Partial);
        assert_eq!(runner.store().current_run("acme").unwrap(), Some(RunId(1)));
    }

    #[tokio::test]
    async fn unchanged_config_reuses_the_run_unless_forced() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Ignore);
        let cancel = CancellationFlag::new();
        let first = runner.run("acme", &demo(), &cancel, &TracingObserver).await.unwrap();
        let again = runner.run("acme", &demo(), &cancel, &TracingObserver).await.unwrap();
        assert!(matches!(again, RunOutcome::Reused(ref r) if r.run_id == first.record().run_id));

        let forced = RunOverrides {
            force: true,
            ..demo()
        };
        let third = runner.run("acme", &forced, &cancel, &TracingObserver).await.unwrap();
        assert_eq!(third.record().run_id, RunId(2));
    }

    #[tokio::test]
    async fn cancellation_stops_at_the_next_stage_boundary() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Ignore);
        let cancel = CancellationFlag::new();
        let observer = Recorder {
            cancel_after: Some((StageName::Probe, cancel.clone())),
            ..Recorder::default()
        };
        let outcome = runner.run("acme", &demo(), &cancel, &observer).await.unwrap();
        let record = outcome.record();

        assert_eq!(record.status, RunStatus::Cancelled);
        assert_eq!(record.stage_results.len(), 2);
        assert_eq!(runner.store().current_run("acme").unwrap(), None);
        let lines = observer.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("cancellation observed before stage crawl")));
    }

    #[tokio::test]
    async fn renormalize_reproduces_the_stored_summary() {
        let (dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Ignore);
        runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();

        let rebuilt = runner.renormalize("acme", RunId(1)).unwrap();
        let stored = std::fs::read_to_string(
            dir.path().join("workspaces/acme/runs/000001/summary.json"),
        )
        .unwrap();
        assert_eq!(format!("{}\n", rebuilt.to_json_pretty().unwrap()), stored);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_completed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let ws = store.init("acme", vec!["http://localhost:3000".into()]).unwrap();
        let config = ws.config.resolve(&demo()).unwrap();

        // A run that finished the probe stage before the process died.
        let handle = store.begin_run(&ws, &config, None).unwrap();
        std::fs::create_dir_all(handle.run_dir.join("raw/probe")).unwrap();
        std::fs::write(handle.run_dir.join("raw/probe/httpx.jsonl"), HTTPX_OUT).unwrap();
        let probe = StageResult {
            artifacts: vec![crate::models::RawArtifact {
                path: "raw/probe/httpx.jsonl".into(),
                format: crate::parser::Normalizer::HttpxJsonl,
            }],
            tool_version: Some("v1.6.0".into()),
            ..StageResult::skipped(StageName::Probe, StageStatus::Ok, "1 invocation")
        };
        store.append_stage_result(&handle.run_dir, &probe).unwrap();
        std::mem::forget(handle);

        let store = Store::new(dir.path());
        store.recover_interrupted().unwrap();
        let httpx = Arc::new(FakeTool::available(HTTPX, HTTPX_OUT));
        let katana = Arc::new(FakeTool::available(KATANA, KATANA_OUT));
        let registry = ToolRegistry::default()
            .with(httpx.clone())
            .with(katana.clone())
            .with(Arc::new(FakeTool::available(NUCLEI, "")))
            .with(Arc::new(FakeTool::missing(DOCKER)));
        let runner = Runner::new(store, registry, MissingToolPolicy::Ignore);

        let outcome = runner
            .run("acme", &demo(), &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        let RunOutcome::Completed { record, summary } = outcome else {
            panic!("expected a resumed run");
        };
        assert_eq!(record.run_id, RunId(2));
        assert_eq!(record.resumed_from, Some(RunId(1)));
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(status_of(&record, StageName::Probe), StageStatus::Resumed);
        assert_eq!(status_of(&record, StageName::Crawl), StageStatus::Ok);
        assert_eq!(httpx.call_count(), 0);
        assert_eq!(katana.call_count(), 1);
        assert_eq!(summary.alive_hosts.len(), 1);
        assert_eq!(summary.metadata.tool_versions.get(HTTPX).map(String::as_str), Some("v1.6.0"));
        assert!(dir.path().join("workspaces/acme/runs/000002/raw/probe/httpx.jsonl").is_file());

        // The resumed run is now the latest terminal run, so a forced run starts fresh.
        let forced = RunOverrides { force: true, ..demo() };
        let outcome = runner
            .run("acme", &forced, &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap();
        assert_eq!(status_of(outcome.record(), StageName::Probe), StageStatus::Ok);
        assert_eq!(outcome.record().resumed_from, None);
        assert_eq!(httpx.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected_before_a_run_exists() {
        let (_dir, runner) = setup(FakeTool::available(HTTPX, HTTPX_OUT), MissingToolPolicy::Ignore);
        let overrides = RunOverrides {
            preset: Some("nope".into()),
            ..RunOverrides::default()
        };
        let err = runner
            .run("acme", &overrides, &CancellationFlag::new(), &TracingObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, WrxError::InvalidConfig(_)));
        assert!(runner.store().list_runs("acme").unwrap().is_empty());
    }

    #[test]
    fn no_input_falls_back_when_a_producer_ran() {
        let stages = pipeline();
        let probe = stages[1].descriptor();
        let crawl = stages[2].descriptor();
        let (status, _) = no_input_status(&crawl, &[(probe, StageStatus::Ok)]);
        assert_eq!(status, StageStatus::SkippedNoInput);
        let (status, message) = no_input_status(&crawl, &[(probe, StageStatus::SkippedDisabled)]);
        assert_eq!(status, StageStatus::SkippedDisabled);
        assert!(message.contains("upstream probe skipped-disabled"));
    }
}
