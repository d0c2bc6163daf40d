//! Differences between two normalized summaries.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, WrxError},
    models::{EntityKind, NaturalKey, RunId, Summary},
    workspace::{slugify_target, RunSelector, Store, DIFF_FILE},
};

/// Per-kind delta between two runs. Entries are natural keys, not full
/// records; the records stay readable from each run's normalized files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDiff {
    /// Natural keys present only in the candidate, in candidate order.
    pub added: Vec<String>,
    /// Natural keys present only in the baseline, in baseline order.
    pub removed: Vec<String>,
}

impl KindDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityDelta {
    pub baseline: usize,
    pub candidate: usize,
    pub delta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    None,
    Low,
    Medium,
    High,
}

impl Impact {
    pub fn for_changes(total: usize) -> Self {
        match total {
            0 => Impact::None,
            1..=7 => Impact::Low,
            8..=24 => Impact::Medium,
            _ => Impact::High,
        }
    }
}

/// One tile per entity kind for the GUI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCard {
    pub category: EntityKind,
    pub label: String,
    pub new_count: usize,
    pub removed_count: usize,
    pub total_changes: usize,
    pub impact: Impact,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffMeta {
    pub target: String,
    pub baseline_run: Option<RunId>,
    pub candidate_run: Option<RunId>,
    #[serde(default)]
    pub compared_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub meta: DiffMeta,
    pub changes: BTreeMap<EntityKind, KindDiff>,
    /// Per finding source (`nuclei`, `zap`), counts by severity or risk.
    pub severity_deltas: BTreeMap<String, BTreeMap<String, SeverityDelta>>,
    pub cards: Vec<DiffCard>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(KindDiff::is_empty)
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindDiff> {
        self.changes.get(&kind)
    }
}

fn keys<T: NaturalKey>(items: &[T]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .map(NaturalKey::natural_key)
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

fn kind_diff(baseline: Vec<String>, candidate: Vec<String>) -> KindDiff {
    let base: HashSet<&String> = baseline.iter().collect();
    let cand: HashSet<&String> = candidate.iter().collect();
    KindDiff {
        added: candidate.iter().filter(|k| !base.contains(k)).cloned().collect(),
        removed: baseline.iter().filter(|k| !cand.contains(k)).cloned().collect(),
    }
}

fn keys_of(summary: &Summary, kind: EntityKind) -> Vec<String> {
    match kind {
        EntityKind::Subdomains => keys(&summary.subdomains),
        EntityKind::AliveHosts => keys(&summary.alive_hosts),
        EntityKind::Urls => keys(&summary.urls),
        EntityKind::NucleiFindings => keys(&summary.nuclei_findings),
        EntityKind::ZapFindings => keys(&summary.zap_findings),
    }
}

fn tally<'a>(levels: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for level in levels {
        let level = level.trim().to_ascii_lowercase();
        let level = if level.is_empty() { "unknown".to_string() } else { level };
        *counts.entry(level).or_insert(0) += 1;
    }
    counts
}

fn severity_delta(
    baseline: BTreeMap<String, usize>,
    candidate: BTreeMap<String, usize>,
) -> BTreeMap<String, SeverityDelta> {
    let levels: std::collections::BTreeSet<&String> = baseline.keys().chain(candidate.keys()).collect();
    levels
        .into_iter()
        .map(|level| {
            let b = baseline.get(level).copied().unwrap_or(0);
            let c = candidate.get(level).copied().unwrap_or(0);
            (
                level.clone(),
                SeverityDelta {
                    baseline: b,
                    candidate: c,
                    delta: c as i64 - b as i64,
                },
            )
        })
        .collect()
}

fn label_for(kind: EntityKind) -> String {
    kind.as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pure comparison; `meta` is left for the caller to fill.
pub fn diff(baseline: &Summary, candidate: &Summary) -> DiffResult {
    let changes: BTreeMap<EntityKind, KindDiff> = EntityKind::ALL
        .iter()
        .map(|kind| (*kind, kind_diff(keys_of(baseline, *kind), keys_of(candidate, *kind))))
        .collect();

    let mut severity_deltas = BTreeMap::new();
    severity_deltas.insert(
        "nuclei".to_string(),
        severity_delta(
            tally(baseline.nuclei_findings.iter().map(|f| f.severity.as_str())),
            tally(candidate.nuclei_findings.iter().map(|f| f.severity.as_str())),
        ),
    );
    severity_deltas.insert(
        "zap".to_string(),
        severity_delta(
            tally(baseline.zap_findings.iter().map(|f| f.risk.as_str())),
            tally(candidate.zap_findings.iter().map(|f| f.risk.as_str())),
        ),
    );

    let mut cards: Vec<DiffCard> = changes
        .iter()
        .map(|(kind, d)| DiffCard {
            category: *kind,
            label: label_for(*kind),
            new_count: d.added.len(),
            removed_count: d.removed.len(),
            total_changes: d.total(),
            impact: Impact::for_changes(d.total()),
        })
        .collect();
    cards.sort_by(|a, b| {
        b.total_changes
            .cmp(&a.total_changes)
            .then_with(|| a.label.cmp(&b.label))
    });

    DiffResult {
        meta: DiffMeta::default(),
        changes,
        severity_deltas,
        cards,
    }
}

/// Diffs two runs of a workspace.
///
/// The candidate defaults to the current run and the baseline to the
/// succeeded or partial run before it. That default pair is cached as
/// `diff.json` in the candidate run directory.
pub fn diff_runs(
    store: &Store,
    target: &str,
    baseline: Option<RunId>,
    candidate: Option<RunId>,
) -> Result<DiffResult> {
    let candidate = match candidate {
        Some(id) => id,
        None => store.resolve_run(target, RunSelector::Current)?,
    };
    let previous = store.previous_terminal_run(target, candidate)?;
    let baseline = match baseline.or(previous) {
        Some(id) => id,
        None => {
            return Err(WrxError::RunNotFound {
                workspace: slugify_target(target),
                run: format!("no run before {candidate} to diff against"),
            })
        }
    };
    if baseline == candidate {
        return Err(WrxError::InvalidConfig(
            "baseline and candidate runs must differ".into(),
        ));
    }

    let cacheable = Some(baseline) == previous;
    if cacheable {
        if let Some(cached) = store.read_run_file::<DiffResult>(target, candidate, DIFF_FILE)? {
            if cached.meta.baseline_run == Some(baseline) {
                debug!(%target, %baseline, %candidate, "diff served from cache");
                return Ok(cached);
            }
        }
    }

    let before = store.load_summary(target, RunSelector::Id(baseline))?;
    let after = store.load_summary(target, RunSelector::Id(candidate))?;
    let mut result = diff(&before, &after);
    result.meta = DiffMeta {
        target: after.metadata.target.clone(),
        baseline_run: Some(baseline),
        candidate_run: Some(candidate),
        compared_at: Some(Utc::now().to_rfc3339()),
    };

    if cacheable {
        store.write_run_file(target, candidate, DIFF_FILE, &result)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RunOverrides,
        models::{AliveHost, DiscoveredUrl, NucleiFinding, RunStatus, StageName},
    };

    fn finding(template: &str, at: &str, severity: &str) -> NucleiFinding {
        NucleiFinding {
            template_id: template.into(),
            severity: severity.into(),
            name: template.into(),
            matched_at: at.into(),
            host: None,
            extracted_results: Vec::new(),
            timestamp: None,
            hash: String::new(),
            extra: Default::default(),
        }
    }

    fn sample() -> Summary {
        Summary {
            subdomains: vec!["a.acme.test".into(), "b.acme.test".into()],
            alive_hosts: vec![AliveHost::new("https://a.acme.test", 200)],
            urls: vec![
                DiscoveredUrl::new("https://a.acme.test/login", StageName::Crawl),
                DiscoveredUrl::new("https://a.acme.test/api", StageName::Crawl),
            ],
            nuclei_findings: vec![finding("tech-detect", "https://a.acme.test", "info")],
            ..Summary::default()
        }
    }

    #[test]
    fn identical_summaries_have_no_changes() {
        let s = sample();
        let result = diff(&s, &s);
        assert!(result.is_empty());
        assert!(result.cards.iter().all(|c| c.impact == Impact::None));
        assert_eq!(result.severity_deltas["nuclei"]["info"].delta, 0);
    }

    #[test]
    fn added_ignores_input_order() {
        let base = sample();
        let mut cand = sample();
        cand.urls.reverse();
        cand.urls.push(DiscoveredUrl::new("https://a.acme.test/admin", StageName::Fuzz));
        cand.subdomains.retain(|s| s != "b.acme.test");
        cand.nuclei_findings.push(finding("exposed-git", "https://a.acme.test/.git", "high"));

        let result = diff(&base, &cand);
        let urls = result.kind(EntityKind::Urls).unwrap();
        assert_eq!(urls.added, vec!["https://a.acme.test/admin"]);
        assert!(urls.removed.is_empty());
        assert_eq!(result.kind(EntityKind::Subdomains).unwrap().removed, vec!["b.acme.test"]);
        assert_eq!(
            result.kind(EntityKind::NucleiFindings).unwrap().added,
            vec!["nuclei::exposed-git::https://a.acme.test/.git"]
        );
        assert_eq!(result.severity_deltas["nuclei"]["high"].delta, 1);
    }

    #[test]
    fn impact_thresholds() {
        assert_eq!(Impact::for_changes(0), Impact::None);
        assert_eq!(Impact::for_changes(7), Impact::Low);
        assert_eq!(Impact::for_changes(8), Impact::Medium);
        assert_eq!(Impact::for_changes(25), Impact::High);
        assert_eq!(label_for(EntityKind::AliveHosts), "Alive Hosts");
    }

    #[test]
    fn cards_put_the_largest_change_first() {
        let base = Summary::default();
        let result = diff(&base, &sample());
        assert_eq!(result.cards[0].category, EntityKind::Subdomains);
        assert_eq!(result.cards[0].total_changes, 2);
        assert_eq!(result.cards.len(), EntityKind::ALL.len());
    }

    #[test]
    fn run_diff_defaults_to_previous_run_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let ws = store.init("acme", Vec::new()).unwrap();
        let cfg = ws.config.resolve(&RunOverrides::default()).unwrap();

        for summary in [sample(), sample()] {
            let handle = store.begin_run(&ws, &cfg, None).unwrap();
            store
                .complete_run(handle, RunStatus::Succeeded, Some(&summary), None)
                .unwrap();
        }

        let result = diff_runs(&store, "acme", None, None).unwrap();
        assert_eq!(result.meta.baseline_run, Some(RunId(1)));
        assert_eq!(result.meta.candidate_run, Some(RunId(2)));
        assert!(result.kind(EntityKind::Urls).unwrap().is_empty());

        let cached = store
            .read_run_file::<DiffResult>("acme", RunId(2), DIFF_FILE)
            .unwrap()
            .unwrap();
        assert_eq!(cached, result);
        assert_eq!(diff_runs(&store, "acme", None, None).unwrap(), result);

        assert!(matches!(
            diff_runs(&store, "acme", Some(RunId(2)), Some(RunId(2))),
            Err(WrxError::InvalidConfig(_))
        ));
        assert!(matches!(
            diff_runs(&store, "acme", None, Some(RunId(1))),
            Err(WrxError::RunNotFound { .. })
        ));
    }
}
