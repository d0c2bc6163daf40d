use std::sync::Arc;

use url::Url;

use super::{
    fan_out, sorted_unique, wordlist, write_lines, Stage, StageContext, StageDescriptor,
    StageExecution, Targets,
};
use crate::{
    adapters::{ToolAdapter, FFUF, KATANA},
    models::{EntityKind, StageName},
    parser::Normalizer,
};

pub struct CrawlStage;

#[async_trait::async_trait]
impl Stage for CrawlStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Crawl,
            requires: &[EntityKind::AliveHosts],
            produces: Some(EntityKind::Urls),
            tool: Some(KATANA),
            skip_without_input: true,
            no_input_reason: "no alive hosts to crawl",
        }
    }

    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        ctx.alive_urls().into()
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution {
        let Some(tool) = tool else {
            return StageExecution::failed("katana adapter missing");
        };
        let stage = StageName::Crawl;
        let extra = ctx.user_args(stage, &["-jsonl", "-json", "-j"]);

        let invocations: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(i, host)| {
                let mut args = vec!["-u".to_string(), host.clone(), "-jsonl".to_string()];
                args.extend(extra.iter().cloned());
                ctx.invocation(stage, args, &format!("katana_{i}.jsonl"))
            })
            .collect();
        let artifacts = invocations
            .iter()
            .map(|inv| ctx.artifact(&inv.stdout_path, Normalizer::KatanaJsonl))
            .collect();

        StageExecution {
            outcomes: fan_out(&tool, invocations, ctx.config.concurrency).await,
            ok_codes: &[0],
            artifacts,
            ..StageExecution::default()
        }
    }
}

pub struct FuzzStage;

/// `scheme://host[:port]` of an alive host.
fn base_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

#[async_trait::async_trait]
impl Stage for FuzzStage {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: StageName::Fuzz,
            requires: &[EntityKind::AliveHosts],
            produces: Some(EntityKind::Urls),
            tool: Some(FFUF),
            skip_without_input: true,
            no_input_reason: "no alive hosts to fuzz",
        }
    }

    async fn targets(&self, ctx: &StageContext<'_>) -> Targets {
        sorted_unique(ctx.alive_urls().iter().filter_map(|u| base_of(u))).into()
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        tool: Option<Arc<dyn ToolAdapter>>,
        targets: Vec<String>,
    ) -> StageExecution {
        let Some(tool) = tool else {
            return StageExecution::failed("ffuf adapter missing");
        };
        let stage = StageName::Fuzz;
        let dir = ctx.stage_dir(stage);
        let extra = ctx.user_args(stage, &[]);
        let mut artifacts = Vec::new();
        let mut notes = Vec::new();

        let wordlist_path = dir.join("wordlist.txt");
        let own_wordlist = !extra.iter().any(|a| a == "-w");
        if own_wordlist {
            let context = if ctx.config.fuzz_context.enabled {
                wordlist::derive_context_words(
                    ctx.upstream.urls.iter().map(|u| u.url.as_str()),
                    ctx.config.fuzz_context.max_words,
                )
            } else {
                Vec::new()
            };
            let words = wordlist::merge_words(&context);
            notes.push(format!("wordlist: {} words ({} from context)", words.len(), context.len()));
            if let Err(e) = write_lines(&wordlist_path, &words).await {
                return StageExecution::failed(format!("cannot write wordlist: {e}"));
            }
            artifacts.push(ctx.artifact(&wordlist_path, Normalizer::Opaque));
        }

        let mut invocations = Vec::new();
        for (i, base) in targets.iter().enumerate() {
            let output = dir.join(format!("ffuf_{i}.json"));
            let mut args = vec![
                "-u".to_string(),
                format!("{base}/FUZZ"),
                "-of".to_string(),
                "json".to_string(),
                "-o".to_string(),
                output.display().to_string(),
            ];
            if own_wordlist {
                args.extend(["-w".to_string(), wordlist_path.display().to_string()]);
            }
            if ctx.config.fuzz_rate_limit > 0 {
                args.extend(["-rate".to_string(), ctx.config.fuzz_rate_limit.to_string()]);
            }
            args.extend(extra.iter().cloned());
            artifacts.push(ctx.artifact(&output, Normalizer::FfufJson));
            invocations.push(ctx.invocation(stage, args, &format!("ffuf_{i}.out")));
        }

        StageExecution {
            outcomes: fan_out(&tool, invocations, ctx.config.concurrency).await,
            ok_codes: &[0],
            artifacts,
            notes,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::fake::FakeTool,
        models::{AliveHost, DiscoveredUrl},
        parser::Contribution,
        stages::testing::{read, resolved},
    };

    fn upstream() -> Contribution {
        Contribution {
            alive_hosts: vec![
                AliveHost::new("http://localhost:3000", 200),
                AliveHost::new("http://localhost:3000/login", 200),
                AliveHost::new("https://shop.acme.test", 200),
            ],
            urls: vec![
                DiscoveredUrl::new("http://localhost:3000/rest/products", StageName::Crawl),
                DiscoveredUrl::new("http://localhost:3000/rest/basket", StageName::Crawl),
            ],
            ..Contribution::default()
        }
    }

    #[test]
    fn base_drops_path_and_default_port() {
        assert_eq!(base_of("https://a.test:443/x?y=1").as_deref(), Some("https://a.test"));
        assert_eq!(base_of("http://localhost:3000/a").as_deref(), Some("http://localhost:3000"));
        assert_eq!(base_of("nonsense"), None);
    }

    #[tokio::test]
    async fn crawl_invokes_once_per_alive_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolved("bounty", &[]);
        let upstream = upstream();
        let ctx = StageContext {
            config: &config,
            run_dir: dir.path(),
            upstream: &upstream,
        };
        let targets = CrawlStage.targets(&ctx).await.items;
        assert_eq!(targets.len(), 3);

        let fake = Arc::new(FakeTool::available(KATANA, ""));
        let exec = CrawlStage.execute(&ctx, Some(fake.clone()), targets).await;
        assert_eq!(fake.call_count(), 3);
        assert_eq!(exec.outcomes.len(), 3);
        assert_eq!(exec.artifacts[2].path, "raw/crawl/katana_2.jsonl");
    }

    #[tokio::test]
    async fn fuzz_builds_wordlist_and_one_call_per_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolved("bounty", &[]);
        let upstream = upstream();
        let ctx = StageContext {
            config: &config,
            run_dir: dir.path(),
            upstream: &upstream,
        };
        let targets = FuzzStage.targets(&ctx).await.items;
        assert_eq!(targets, vec!["http://localhost:3000", "https://shop.acme.test"]);

        let fake = Arc::new(
            FakeTool::available(FFUF, "").writes("-o", r#"{"results":[{"url":"http://localhost:3000/admin"}]}"#),
        );
        let exec = FuzzStage.execute(&ctx, Some(fake.clone()), targets).await;
        assert_eq!(fake.call_count(), 2);
        assert_eq!(exec.artifacts[0].format, Normalizer::Opaque);
        assert_eq!(exec.artifacts[1].path, "raw/fuzz/ffuf_0.json");

        let words = read(&dir.path().join("raw/fuzz/wordlist.txt"));
        assert!(words.starts_with("admin\nlogin\n"));
        assert!(words.contains("rest\n"));

        let calls = fake.calls.lock().unwrap();
        let rate = calls[0].iter().position(|a| a == "-rate").unwrap();
        assert_eq!(calls[0][rate + 1], config.fuzz_rate_limit.to_string());
        assert!(calls[0].contains(&"http://localhost:3000/FUZZ".to_string()));
    }
}
