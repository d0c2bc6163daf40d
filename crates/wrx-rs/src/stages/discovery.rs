use std::{net::IpAddr, sync::Arc};

use super::{sorted_unique, write_lines, Stage, StageContext, StageDescriptor, StageExecution, Targets};
use crate::{
    adapters::{ToolAdapter, HTTPX, SUBFINDER},
    models::{EntityKind, StageName},
    parser::Normalizer,
    security::{host_of, is_loopback_host},
};

pub struct SubdomainsStage;

#[async_trait::async_trait]
impl Stage for SubdomainsStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Subdomains,
            requires: &[],
            produces: Some(EntityKind::Subdomains),
            tool: Some(SUBFINDER),
            skip_without_input: true,
            no_input_reason: "no enumerable domain (target and seeds are loopback or IP literals)",
        }
    }

    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        let candidates = std::iter::once(ctx.config.target.as_str())
            .chain(ctx.config.seed_hosts.iter().map(String::as_str))
            .filter_map(host_of)
            .filter(|h| h.contains('.') && !is_loopback_host(h) && h.parse::<IpAddr>().is_err());
        sorted_unique(candidates).into()
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution {
        let Some(tool) = tool else {
            return StageExecution::failed("subfinder adapter missing");
        };
        let stage = StageName::Subdomains;
        let list = ctx.stage_dir(stage).join("domains.txt");
        if let Err(e) = write_lines(&list, &targets).await {
            return StageExecution::failed(format!("cannot write domain list: {e}"));
        }

        let mut args = vec!["-dL".to_string(), list.display().to_string(), "-oJ".to_string()];
        args.extend(ctx.user_args(stage, &["-oJ", "-json"]));
        let inv = ctx.invocation(stage, args, "subfinder.jsonl");
        let artifact = ctx.artifact(&inv.stdout_path, Normalizer::SubfinderJsonl);
        let outcome = tool.invoke(inv).await;

        StageExecution {
            outcomes: vec![outcome],
            ok_codes: &[0],
            artifacts: vec![artifact],
            ..StageExecution::default()
        }
    }
}

pub struct ProbeStage;

#[async_trait::async_trait]
impl Stage for ProbeStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Probe,
            requires: &[EntityKind::Subdomains],
            produces: Some(EntityKind::AliveHosts),
            tool: Some(HTTPX),
            skip_without_input: false,
            no_input_reason: "",
        }
    }

    /// Enumerated subdomains, else the seed hosts, else the target itself.
    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        let mut items = sorted_unique(ctx.upstream.subdomains.iter().cloned());
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
            return StageExecution::failed("httpx adapter missing");
        };
        let stage = StageName::Probe;
        let list = ctx.stage_dir(stage).join("targets.txt");
        if let Err(e) = write_lines(&list, &targets).await {
            return StageExecution::failed(format!("cannot write target list: {e}"));
        }

        let mut args = vec!["-l".to_string(), list.display().to_string(), "-json".to_string()];
        args.extend(ctx.user_args(stage, &["-json", "-jsonl", "-j"]));
        let inv = ctx.invocation(stage, args, "httpx.jsonl");
        let artifact = ctx.artifact(&inv.stdout_path, Normalizer::HttpxJsonl);
        let outcome = tool.invoke(inv).await;

        StageExecution {
            outcomes: vec![outcome],
            ok_codes: &[0],
            artifacts: vec![artifact],
            ..StageExecution::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::fake::FakeTool,
        parser::Contribution,
        stages::testing::{read, resolved},
    };

    #[tokio::test]
    async fn subdomains_ignore_loopback_and_ip_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = resolved("quick", &["http://localhost:3000", "10.0.0.5", "https://shop.acme.test"]);
        config.target = "acme.test".into();
        let upstream = Contribution::default();
        let ctx = StageContext {
            config: &config,
            run_dir: dir.path(),
            upstream: &upstream,
        };
        let targets = SubdomainsStage.targets(&ctx).await;
        assert_eq!(targets.items, vec!["acme.test", "shop.acme.test"]);

        config.target = "acme".into();
        config.seed_hosts = vec!["http://127.0.0.1:3000".into()];
        let ctx = StageContext {
            config: &config,
            run_dir: dir.path(),
            upstream: &upstream,
        };
        assert!(SubdomainsStage.targets(&ctx).await.items.is_empty());
    }

    #[tokio::test]
    async fn probe_falls_back_to_seeds_and_writes_target_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolved("demo", &["http://localhost:3000"]);
        let upstream = Contribution::default();
        let ctx = StageContext {
            config: &config,
            run_dir: dir.path(),
            upstream: &upstream,
        };

        let targets = ProbeStage.targets(&ctx).await;
        assert_eq!(targets.items, vec!["http://localhost:3000"]);

        let fake = Arc::new(FakeTool::available(HTTPX, "{\"url\":\"http://localhost:3000\",\"status_code\":200}\n"));
        let exec = ProbeStage.execute(&ctx, Some(fake.clone()), targets.items).await;
        assert_eq!(exec.artifacts[0].path, "raw/probe/httpx.jsonl");
        assert_eq!(exec.artifacts[0].format, Normalizer::HttpxJsonl);
        assert_eq!(read(&dir.path().join("raw/probe/targets.txt")), "http://localhost:3000\n");

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0][0], "-l");
        assert_eq!(calls[0].iter().filter(|a| *a == "-json").count(), 1);
        assert!(calls[0].contains(&"-no-color".to_string()));
    }
}
