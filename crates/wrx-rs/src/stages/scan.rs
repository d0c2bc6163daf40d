use std::sync::Arc;

use super::{sorted_unique, write_lines, Stage, StageContext, StageDescriptor, StageExecution, Targets};
use crate::{
    adapters::{ToolAdapter, NUCLEI},
    models::{EntityKind, StageName},
    parser::Normalizer,
};

pub struct ScanStage;

#[async_trait::async_trait]
impl Stage for ScanStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Scan,
            requires: &[EntityKind::Urls, EntityKind::AliveHosts],
            produces: Some(EntityKind::NucleiFindings),
            tool: Some(NUCLEI),
            skip_without_input: false,
            no_input_reason: "",
        }
    }

    /// Discovered URLs (or only alive hosts with `scan_hosts_only`), falling
    /// back to alive hosts, seeds and finally the target.
    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        let mut items = if ctx.config.scan_hosts_only {
            ctx.alive_urls()
        } else {
            sorted_unique(ctx.upstream.urls.iter().map(|u| u.url.clone()))
        };
        if items.is_empty() {
            items = ctx.alive_urls();
        }
        if items.is_empty() {
            items = sorted_unique(ctx.config.seed_hosts.iter().cloned());
        }
        if items.is_empty() {
            items = sorted_unique([ctx.config.target.clone()]);
        }
        items.into()
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution {
        let Some(tool) = tool else {
            return StageExecution::failed("nuclei adapter missing");
        };
        let stage = StageName::Scan;
        let list = ctx.stage_dir(stage).join("targets.txt");
        if let Err(e) = write_lines(&list, &targets).await {
            return StageExecution::failed(format!("cannot write target list: {e}"));
        }

        let mut args = vec!["-l".to_string(), list.display().to_string(), "-jsonl".to_string()];
        args.extend(ctx.user_args(stage, &["-jsonl", "-json", "-j"]));
        let inv = ctx.invocation(stage, args, "nuclei.jsonl");
        let artifact = ctx.artifact(&inv.stdout_path, Normalizer::NucleiJsonl);

        StageExecution {
            outcomes: vec![tool.invoke(inv).await],
            ok_codes: &[0],
            artifacts: vec![artifact],
            ..StageExecution::default()
        }
    }
}
