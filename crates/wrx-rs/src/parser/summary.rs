use std::{collections::HashSet, path::Path};

use super::{Contribution, Normalizer};
use crate::models::{NaturalKey, RawArtifact, StageResult, Summary, SummaryMetadata};

/// Accumulates stage contributions into one de-duplicated summary.
///
/// Order is first-seen across stages, so the same sequence of artifacts
/// always yields the same summary.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    current: Contribution,
    seen: HashSet<String>,
    warnings: Vec<String>,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, contribution: Contribution) {
        let Contribution {
            subdomains,
            alive_hosts,
            urls,
            nuclei_findings,
            zap_findings,
        } = contribution;
        push_unique(&mut self.seen, "sub", &mut self.current.subdomains, subdomains);
        push_unique(&mut self.seen, "host", &mut self.current.alive_hosts, alive_hosts);
        push_unique(&mut self.seen, "url", &mut self.current.urls, urls);
        push_unique(&mut self.seen, "nuclei", &mut self.current.nuclei_findings, nuclei_findings);
        push_unique(&mut self.seen, "zap", &mut self.current.zap_findings, zap_findings);
    }

    pub fn warn(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.warnings.extend(warnings);
    }

    /// Parses every artifact of a stage result and absorbs the records.
    pub fn absorb_stage(&mut self, run_dir: &Path, result: &StageResult) {
        for artifact in &result.artifacts {
            self.absorb_artifact(run_dir, artifact);
        }
    }

    pub fn absorb_artifact(&mut self, run_dir: &Path, artifact: &RawArtifact) {
        let parsed = Normalizer::parse_artifact(run_dir, artifact);
        self.absorb(parsed.contribution);
        self.warn(parsed.warnings);
    }

    /// Records accumulated so far; stages read their upstream inputs here.
    pub fn view(&self) -> &Contribution {
        &self.current
    }

    pub fn finish(self, mut metadata: SummaryMetadata) -> Summary {
        metadata.parse_warnings = self.warnings;
        Summary {
            metadata,
            subdomains: self.current.subdomains,
            alive_hosts: self.current.alive_hosts,
            urls: self.current.urls,
            nuclei_findings: self.current.nuclei_findings,
            zap_findings: self.current.zap_findings,
            triage: None,
        }
    }
}

fn push_unique<T: NaturalKey>(
    seen: &mut HashSet<String>,
    scope: &str,
    into: &mut Vec<T>,
    items: Vec<T>,
) {
    for item in items {
        if seen.insert(format!("{scope}::{}", item.natural_key())) {
            into.push(item);
        }
    }
}

/// Rebuilds a summary from stored stage results, in stage order.
pub fn summarize(run_dir: &Path, results: &[StageResult], metadata: SummaryMetadata) -> Summary {
    let mut builder = SummaryBuilder::new();
    for result in results {
        builder.absorb_stage(run_dir, result);
    }
    builder.finish(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AliveHost, DiscoveredUrl, StageName};

    #[test]
    fn later_duplicates_lose_to_earlier_records() {
        let mut builder = SummaryBuilder::new();
        builder.absorb(Contribution {
            urls: vec![DiscoveredUrl::new("http://h/a", StageName::Crawl)],
            ..Default::default()
        });
        builder.absorb(Contribution {
            urls: vec![
                DiscoveredUrl::new("http://h/a", StageName::Fuzz),
                DiscoveredUrl::new("http://h/admin", StageName::Fuzz),
            ],
            alive_hosts: vec![AliveHost::new("http://h/a", 200)],
            ..Default::default()
        });

        let summary = builder.finish(SummaryMetadata::default());
        assert_eq!(summary.urls.len(), 2);
        assert_eq!(summary.urls[0].source_stage, StageName::Crawl);
        // Same string under a different kind is not a duplicate.
        assert_eq!(summary.alive_hosts.len(), 1);
    }

    #[test]
    fn summarize_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw/probe")).unwrap();
        std::fs::write(
            dir.path().join("raw/probe/httpx.jsonl"),
            "{\"url\":\"http://localhost:3000\",\"status_code\":200}\n",
        )
        .unwrap();
        let result = StageResult {
            artifacts: vec![
                RawArtifact {
                    path: "raw/probe/httpx.jsonl".into(),
                    format: Normalizer::HttpxJsonl,
                },
                RawArtifact {
                    path: "raw/probe/gone.jsonl".into(),
                    format: Normalizer::HttpxJsonl,
                },
            ],
            ..StageResult::skipped(StageName::Probe, crate::models::StageStatus::Ok, "")
        };

        let a = summarize(dir.path(), std::slice::from_ref(&result), SummaryMetadata::default());
        let b = summarize(dir.path(), &[result], SummaryMetadata::default());
        assert_eq!(a, b);
        assert_eq!(a.alive_hosts.len(), 1);
        assert_eq!(a.metadata.parse_warnings.len(), 1);
        assert!(a.metadata.parse_warnings[0].starts_with("raw/probe/gone.jsonl"));
    }
}
