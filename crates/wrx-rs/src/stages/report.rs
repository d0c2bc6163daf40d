use std::{fmt::Write as _, sync::Arc};

use super::{Stage, StageContext, StageDescriptor, StageExecution, Targets};
use crate::{
    adapters::ToolAdapter,
    models::{EntityKind, StageName},
    parser::Normalizer,
};

/// Pure-logic stage: a plain-text digest of what the run found.
pub struct ReportStage;

#[async_trait::async_trait]
impl Stage for ReportStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Report,
            requires: &[],
            produces: None,
            tool: None,
            skip_without_input: false,
            no_input_reason: "",
        }
    }

    async fn targets(&self, _ctx: &StageContext<'_>) -> Targets {
        Targets::default()
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        _tool: Option<Arc<dyn ToolAdapter>>,
        _targets: Vec<String>,
    ) -> StageExecution {
        let found = ctx.upstream;
        let mut digest = String::new();
        let _ = writeln!(digest, "target: {}", ctx.config.target);
        let _ = writeln!(digest, "preset: {} / {}", ctx.config.preset, ctx.config.scan_profile);
        for (kind, count) in [
            (EntityKind::Subdomains, found.subdomains.len()),
            (EntityKind::AliveHosts, found.alive_hosts.len()),
            (EntityKind::Urls, found.urls.len()),
            (EntityKind::NucleiFindings, found.nuclei_findings.len()),
            (EntityKind::ZapFindings, found.zap_findings.len()),
        ] {
            let _ = writeln!(digest, "{kind}: {count}");
        }
        for finding in &found.nuclei_findings {
            let _ = writeln!(
                digest,
                "nuclei [{}] {} @ {}",
                finding.severity, finding.template_id, finding.matched_at
            );
        }
        for finding in &found.zap_findings {
            let _ = writeln!(digest, "zap [{}] {} @ {}", finding.risk, finding.alert, finding.url);
        }

        let dir = ctx.stage_dir(StageName::Report);
        let path = dir.join("digest.txt");
        let written = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => tokio::fs::write(&path, digest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            return StageExecution::failed(format!("cannot write digest: {e}"));
        }

        StageExecution {
            artifacts: vec![ctx.artifact(&path, Normalizer::Opaque)],
            ..StageExecution::default()
        }
    }
}
