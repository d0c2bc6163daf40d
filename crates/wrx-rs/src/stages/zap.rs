use std::{path::Path, sync::Arc};

use futures::StreamExt;
use url::Url;

use super::{sorted_unique, Stage, StageContext, StageDescriptor, StageExecution, Targets};
use crate::{
    adapters::{Invocation, InvocationOutcome, ToolAdapter, DOCKER},
    models::{EntityKind, RawArtifact, StageName},
    parser::Normalizer,
    security::{is_loopback_host, is_local_target},
};

const FALLBACK_IMAGE: &str = "zaproxy/zap-stable";
const DOCKER_HOST_ALIAS: &str = "host.docker.internal";
/// zap-baseline.py exits 1 for warnings and 2 for failures; both still produce reports.
const ZAP_OK: &[i32] = &[0, 1, 2];
/// `docker run` exit code when the image cannot be pulled or started.
const DOCKER_RUN_FAILED: i32 = 125;
const REPORT_FLAGS: &[&str] = &[
    "-J",
    "-r",
    "-x",
    "-w",
    "--jsonreport",
    "--report",
    "--xmlreport",
    "--mdreport",
];

pub struct ZapBaselineStage;

fn with_scheme(seed: &str) -> String {
    let seed = seed.trim();
    if seed.contains("://") {
        seed.to_string()
    } else {
        format!("http://{seed}")
    }
}

/// Loopback hosts are unreachable from inside the container under their own name.
fn container_reachable(target: &str) -> String {
    let Ok(mut url) = Url::parse(target) else {
        return target.to_string();
    };
    let loopback = url.host_str().is_some_and(is_loopback_host);
    if loopback && url.set_host(Some(DOCKER_HOST_ALIAS)).is_ok() {
        return url.to_string();
    }
    target.to_string()
}

/// Drops report flags (and their values); the stage chooses report names itself.
fn sanitize_baseline_args(args: &[String]) -> Vec<String> {
    let mut cleaned = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if REPORT_FLAGS.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        cleaned.push(arg.clone());
    }
    cleaned
}

async fn run_with_fallback(
    tool: Arc<dyn ToolAdapter>,
    image: String,
    build: impl Fn(&str) -> Invocation,
) -> InvocationOutcome {
    let outcome = tool.invoke(build(&image)).await;
    if outcome.exit_code == Some(DOCKER_RUN_FAILED) && image != FALLBACK_IMAGE {
        tracing::warn!(%image, fallback = FALLBACK_IMAGE, "zap image unavailable; retrying with fallback");
        return tool.invoke(build(FALLBACK_IMAGE)).await;
    }
    outcome
}

#[async_trait::async_trait]
impl Stage for ZapBaselineStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::ZapBaseline,
            requires: &[],
            produces: Some(EntityKind::ZapFindings),
            tool: Some(DOCKER),
            skip_without_input: true,
            no_input_reason: "no eligible target for the ZAP baseline",
        }
    }

    /// Seed hosts, else the first alive host, else the target when it is a URL.
    ///
    /// Under `local_demo_safe` anything that does not resolve to loopback is
    /// removed here, before any container starts.
    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        let mut candidates = sorted_unique(ctx.config.seed_hosts.iter().map(|s| with_scheme(s)));
        if candidates.is_empty() {
            candidates.extend(ctx.upstream.alive_hosts.first().map(|h| h.url.clone()));
        }
        if candidates.is_empty() && ctx.config.target.starts_with("http") {
            candidates.push(ctx.config.target.clone());
        }

        if !ctx.config.local_demo_safe {
            return candidates.into();
        }
        let mut targets = Targets::default();
        for candidate in candidates {
            if is_local_target(&candidate).await {
                targets.items.push(candidate);
            } else {
                tracing::warn!(target_url = %candidate, "excluded non-local host from ZAP baseline");
                targets
                    .notes
                    .push(format!("excluded non-local host {candidate} (local demo safety)"));
            }
        }
        targets
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution {
        let Some(tool) = tool else {
            return StageExecution::failed("docker adapter missing");
        };
        let stage = StageName::ZapBaseline;
        let dir = ctx.stage_dir(stage);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return StageExecution::failed(format!("cannot create {}: {e}", dir.display()));
        }
        let baseline_args = sanitize_baseline_args(&ctx.config.zap.baseline_args);
        let mount = format!("{}:/zap/wrk:rw", dir.display());

        let mut notes = Vec::new();
        let mut runs = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            let reachable = container_reachable(target);
            let rewritten = reachable != *target;
            if rewritten {
                notes.push(format!("{target} rewritten to {reachable} for the container"));
            }
            let mount = mount.clone();
            let baseline_args = baseline_args.clone();
            let stdout = format!("zap_{i}.out");
            let build = move |image: &str| {
                let mut args = vec!["run".to_string(), "--rm".to_string()];
                if rewritten {
                    args.push(format!("--add-host={DOCKER_HOST_ALIAS}:host-gateway"));
                }
                args.extend([
                    "-v".to_string(),
                    mount.clone(),
                    image.to_string(),
                    "zap-baseline.py".to_string(),
                    "-t".to_string(),
                    reachable.clone(),
                    "-J".to_string(),
                    format!("zap_{i}.json"),
                    "-r".to_string(),
                    format!("zap_{i}.html"),
                    "-x".to_string(),
                    format!("zap_{i}.xml"),
                ]);
                args.extend(baseline_args.iter().cloned());
                ctx.invocation(stage, args, &stdout)
            };
            runs.push(run_with_fallback(Arc::clone(&tool), ctx.config.zap.docker_image.clone(), build));
        }

        let outcomes = futures::stream::iter(runs)
            .buffered(ctx.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        StageExecution {
            outcomes,
            ok_codes: ZAP_OK,
            artifacts: report_artifacts(ctx, &dir, targets.len()),
            notes,
            error: None,
        }
    }
}

/// JSON reports are preferred; the XML report is parsed only when its JSON sibling is missing.
fn report_artifacts(ctx: &StageContext<'_>, dir: &Path, count: usize) -> Vec<RawArtifact> {
    let mut artifacts = Vec::new();
    for i in 0..count {
        let json = dir.join(format!("zap_{i}.json"));
        let xml = dir.join(format!("zap_{i}.xml"));
        if !json.exists() && xml.exists() {
            artifacts.push(ctx.artifact(&xml, Normalizer::ZapXml));
        } else {
            artifacts.push(ctx.artifact(&json, Normalizer::ZapJson));
        }
        let html = dir.join(format!("zap_{i}.html"));
        if html.exists() {
            artifacts.push(ctx.artifact(&html, Normalizer::Opaque));
        }
    }
    artifacts
}
