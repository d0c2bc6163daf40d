//! Pipeline stages.
//!
//! A stage only knows how to pick its targets and launch its tool. The
//! runner owns the skip rules, status derivation and normalization, so every
//! stage is driven through the same checks in the same order.

mod content;
mod discovery;
mod report;
mod scan;
pub mod wordlist;
mod zap;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{stream, StreamExt};

use crate::{
    adapters::{Invocation, InvocationOutcome, ToolAdapter},
    config::ResolvedRunConfig,
    models::{EntityKind, RawArtifact, StageName},
    parser::{Contribution, Normalizer},
};

pub use content::{CrawlStage, FuzzStage};
pub use discovery::{ProbeStage, SubdomainsStage};
pub use report::ReportStage;
pub use scan::ScanStage;
pub use zap::ZapBaselineStage;

/// Static facts about a stage that the runner needs before running it.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub name: StageName,
    pub requires: &'static [EntityKind],
    pub produces: Option<EntityKind>,
    pub tool: Option<&'static str>,
    /// When set, an empty target set skips the stage instead of invoking the tool.
    pub skip_without_input: bool,
    pub no_input_reason: &'static str,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Targets {
    pub items: Vec<String>,
    pub notes: Vec<String>,
}

impl From<Vec<String>> for Targets {
    fn from(items: Vec<String>) -> Self {
        Self {
            items,
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StageExecution {
    pub outcomes: Vec<InvocationOutcome>,
    pub ok_codes: &'static [i32],
    pub artifacts: Vec<RawArtifact>,
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl StageExecution {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// What a stage sees while it runs.
pub struct StageContext<'a> {
    pub config: &'a ResolvedRunConfig,
    pub run_dir: &'a Path,
    /// Records normalized from every stage that ran before this one.
    pub upstream: &'a Contribution,
}

impl StageContext<'_> {
    pub fn stage_dir(&self, stage: StageName) -> PathBuf {
        self.run_dir.join("raw").join(stage.as_str())
    }

    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.run_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub fn artifact(&self, path: &Path, format: Normalizer) -> RawArtifact {
        RawArtifact {
            path: self.relative(path),
            format,
        }
    }

    pub fn invocation(&self, stage: StageName, args: Vec<String>, stdout_name: &str) -> Invocation {
        let dir = self.stage_dir(stage);
        Invocation {
            args,
            stdout_path: dir.join(stdout_name),
            stderr_path: dir.join("logs.txt"),
            working_dir: dir,
            timeout: Duration::from_secs(self.config.timeout_for(stage)),
            dry_run: self.config.dry_run,
        }
    }

    /// User-supplied args for the stage with the flags we manage ourselves removed.
    pub fn user_args(&self, stage: StageName, managed: &[&str]) -> Vec<String> {
        self.config
            .args_for(stage)
            .iter()
            .filter(|a| !managed.contains(&a.as_str()))
            .cloned()
            .collect()
    }

    pub fn alive_urls(&self) -> Vec<String> {
        sorted_unique(self.upstream.alive_hosts.iter().map(|h| h.url.clone()))
    }
}

#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> StageDescriptor;

    async fn targets(&self, ctx: &StageContext<'_>) -> Targets;

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution;
}

/// The stages in execution order.
pub fn pipeline() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SubdomainsStage),
        Box::new(ProbeStage),
        Box::new(CrawlStage),
        Box::new(FuzzStage),
        Box::new(ScanStage),
        Box::new(ZapBaselineStage),
        Box::new(ReportStage),
    ]
}

pub(crate) fn sorted_unique(items: impl IntoIterator<Item = String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Runs one invocation per entry, at most `concurrency` at a time, keeping input order.
pub(crate) async fn fan_out(
    tool: &Arc<dyn ToolAdapter>,
    invocations: Vec<Invocation>,
    concurrency: usize,
) -> Vec<InvocationOutcome> {
    stream::iter(invocations.into_iter().map(|inv| {
        let tool = Arc::clone(tool);
        async move { tool.invoke(inv).await }
    }))
    .buffered(concurrency.max(1))
    .collect()
    .await
}

pub(crate) async fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    tokio::fs::write(path, body).await
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use crate::config::{ResolvedRunConfig, RunOverrides, TargetConfig};

    pub fn resolved(preset: &str, seeds: &[&str]) -> ResolvedRunConfig {
        let cfg = TargetConfig::new("acme", seeds.iter().map(|s| s.to_string()).collect());
        cfg.resolve(&RunOverrides {
            preset: Some(preset.to_string()),
            ..RunOverrides::default()
        })
        .unwrap()
    }

    pub fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::FakeTool;

    #[test]
    fn pipeline_order_is_fixed() {
        let names: Vec<StageName> = pipeline().iter().map(|s| s.descriptor().name).collect();
        assert_eq!(names, StageName::ALL.to_vec());
    }

    #[test]
    fn every_required_kind_has_an_earlier_producer() {
        let stages = pipeline();
        for (i, stage) in stages.iter().enumerate() {
            for kind in stage.descriptor().requires {
                assert!(
                    stages[..i]
                        .iter()
                        .any(|s| s.descriptor().produces == Some(*kind)),
                    "{} requires {kind} with no producer before it",
                    stage.descriptor().name
                );
            }
        }
    }

    #[tokio::test]
    async fn fan_out_respects_concurrency_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeTool::available("katana", "").delayed(Duration::from_millis(30)));
        let tool: Arc<dyn ToolAdapter> = fake.clone();
        let invocations = (0..6)
            .map(|i| Invocation {
                args: vec![format!("-u=h{i}")],
                working_dir: dir.path().to_path_buf(),
                stdout_path: dir.path().join(format!("out_{i}.jsonl")),
                stderr_path: dir.path().join("logs.txt"),
                timeout: Duration::from_secs(5),
                dry_run: false,
            })
            .collect();

        let outcomes = fan_out(&tool, invocations, 2).await;
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes[3].stdout_path.ends_with("out_3.jsonl"));
        assert!(fake.max_in_flight.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
