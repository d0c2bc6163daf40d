mod job;
mod run;

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

pub use job::{Job, JobAction, JobLogLine, JobStatus};
pub use run::{RawArtifact, RunId, RunRecord, RunStatus, StageName, StageResult, StageStatus};

/// Deterministic SHA-1 over trimmed key fields, joined with `|`.
pub fn stable_hash(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim())
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha1::digest(joined.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subdomains,
    AliveHosts,
    Urls,
    NucleiFindings,
    ZapFindings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Subdomains,
        EntityKind::AliveHosts,
        EntityKind::Urls,
        EntityKind::NucleiFindings,
        EntityKind::ZapFindings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Subdomains => "subdomains",
            EntityKind::AliveHosts => "alive_hosts",
            EntityKind::Urls => "urls",
            EntityKind::NucleiFindings => "nuclei_findings",
            EntityKind::ZapFindings => "zap_findings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a record across runs.
pub trait NaturalKey {
    fn natural_key(&self) -> String;
}

impl NaturalKey for String {
    fn natural_key(&self) -> String {
        self.trim().to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliveHost {
    pub url: String,
    pub status_code: u16,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tech: Vec<String>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl AliveHost {
    pub fn new(url: impl Into<String>, status_code: u16) -> Self {
        let url = url.into();
        let hash = stable_hash(&[&url, &status_code.to_string()]);
        Self {
            url,
            status_code,
            title: None,
            tech: Vec::new(),
            hash,
            extra: Map::new(),
        }
    }
}

impl NaturalKey for AliveHost {
    fn natural_key(&self) -> String {
        self.url.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    pub url: String,
    pub source_stage: StageName,
    #[serde(default)]
    pub discovered_at: Option<String>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl DiscoveredUrl {
    pub fn new(url: impl Into<String>, source_stage: StageName) -> Self {
        let url = url.into();
        let hash = stable_hash(&[&url]);
        Self {
            url,
            source_stage,
            discovered_at: None,
            hash,
            extra: Map::new(),
        }
    }
}

impl NaturalKey for DiscoveredUrl {
    fn natural_key(&self) -> String {
        self.url.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NucleiFinding {
    pub template_id: String,
    pub severity: String,
    pub name: String,
    pub matched_at: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub extracted_results: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NaturalKey for NucleiFinding {
    fn natural_key(&self) -> String {
        format!("nuclei::{}::{}", self.template_id, self.matched_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZapFinding {
    pub plugin_id: String,
    pub alert: String,
    pub risk: String,
    pub confidence: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub cweid: String,
    #[serde(default)]
    pub wascid: String,
    #[serde(default)]
    pub instances: u32,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NaturalKey for ZapFinding {
    fn natural_key(&self) -> String {
        format!("zap::{}::{}", self.plugin_id, self.url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub target: String,
    pub timestamp: String,
    pub preset: String,
    #[serde(default)]
    pub scan_profile: String,
    pub run_id: RunId,
    #[serde(default)]
    pub tool_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact_paths: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_warnings: Vec<String>,
}

/// Canonical output of one run.
///
/// `counts` is never stored on this type; it is derived when the summary is
/// written (see [`Summary::to_document`]) and ignored when read back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub metadata: SummaryMetadata,
    #[serde(default)]
    pub subdomains: Vec<String>,
    #[serde(default)]
    pub alive_hosts: Vec<AliveHost>,
    #[serde(default)]
    pub urls: Vec<DiscoveredUrl>,
    #[serde(default)]
    pub nuclei_findings: Vec<NucleiFinding>,
    #[serde(default)]
    pub zap_findings: Vec<ZapFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub subdomains: usize,
    pub alive_hosts: usize,
    pub urls: usize,
    pub nuclei_findings: usize,
    pub zap_findings: usize,
}

#[derive(Debug, Serialize)]
pub struct SummaryDocument<'a> {
    #[serde(flatten)]
    pub summary: &'a Summary,
    pub counts: Counts,
}

impl Summary {
    pub fn counts(&self) -> Counts {
        Counts {
            subdomains: self.subdomains.len(),
            alive_hosts: self.alive_hosts.len(),
            urls: self.urls.len(),
            nuclei_findings: self.nuclei_findings.len(),
            zap_findings: self.zap_findings.len(),
        }
    }

    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Subdomains => self.subdomains.len(),
            EntityKind::AliveHosts => self.alive_hosts.len(),
            EntityKind::Urls => self.urls.len(),
            EntityKind::NucleiFindings => self.nuclei_findings.len(),
            EntityKind::ZapFindings => self.zap_findings.len(),
        }
    }

    pub fn to_document(&self) -> SummaryDocument<'_> {
        SummaryDocument {
            summary: self,
            counts: self.counts(),
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.to_document())
    }
}
