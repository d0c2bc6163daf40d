//! Raw tool output to canonical records.
//!
//! Every parser is total: unreadable, empty or malformed input produces an
//! empty contribution and a warning, never an error. Records are
//! de-duplicated by natural key as they are produced; the first occurrence
//! wins and keeps its position.

mod ffuf;
mod httpx;
mod katana;
mod nuclei;
mod subfinder;
mod summary;
mod zap;

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{
    AliveHost, DiscoveredUrl, NaturalKey, NucleiFinding, RawArtifact, ZapFinding,
};

pub use summary::{summarize, SummaryBuilder};

/// The closed set of raw formats understood by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    SubfinderJsonl,
    HttpxJsonl,
    KatanaJsonl,
    FfufJson,
    NucleiJsonl,
    ZapJson,
    ZapXml,
    /// Kept as an artifact but not interpreted.
    Opaque,
}

impl Normalizer {
    pub fn parse(self, path: &Path) -> Parsed {
        self.parse_labeled(path, &path.display().to_string())
    }

    /// Parses a stored artifact; warnings name it by its run-relative path.
    pub fn parse_artifact(run_dir: &Path, artifact: &RawArtifact) -> Parsed {
        artifact
            .format
            .parse_labeled(&run_dir.join(&artifact.path), &artifact.path)
    }

    fn parse_labeled(self, path: &Path, label: &str) -> Parsed {
        let mut parsed = Parsed::default();
        if self == Normalizer::Opaque {
            return parsed;
        }
        let text = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                parsed.warn(format!("{label}: unreadable ({e})"));
                return parsed;
            }
        };
        if text.trim().is_empty() {
            parsed.warn(format!("{label}: empty output"));
            return parsed;
        }

        match self {
            Normalizer::SubfinderJsonl => {
                parsed.contribution.subdomains = subfinder::parse(&text, label, &mut parsed.warnings)
            }
            Normalizer::HttpxJsonl => {
                parsed.contribution.alive_hosts = httpx::parse(&text, label, &mut parsed.warnings)
            }
            Normalizer::KatanaJsonl => {
                parsed.contribution.urls = katana::parse(&text, label, &mut parsed.warnings)
            }
            Normalizer::FfufJson => {
                parsed.contribution.urls = ffuf::parse(&text, label, &mut parsed.warnings)
            }
            Normalizer::NucleiJsonl => {
                parsed.contribution.nuclei_findings =
                    nuclei::parse(&text, label, &mut parsed.warnings)
            }
            Normalizer::ZapJson => {
                parsed.contribution.zap_findings = zap::parse_json(&text, label, &mut parsed.warnings)
            }
            Normalizer::ZapXml => {
                parsed.contribution.zap_findings = zap::parse_xml(&text, label, &mut parsed.warnings)
            }
            Normalizer::Opaque => {}
        }
        parsed
    }
}

/// Canonical records contributed by one artifact or one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contribution {
    pub subdomains: Vec<String>,
    pub alive_hosts: Vec<AliveHost>,
    pub urls: Vec<DiscoveredUrl>,
    pub nuclei_findings: Vec<NucleiFinding>,
    pub zap_findings: Vec<ZapFinding>,
}

impl Contribution {
    pub fn is_empty(&self) -> bool {
        self.subdomains.is_empty()
            && self.alive_hosts.is_empty()
            && self.urls.is_empty()
            && self.nuclei_findings.is_empty()
            && self.zap_findings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    pub contribution: Contribution,
    pub warnings: Vec<String>,
}

impl Parsed {
    fn warn(&mut self, message: String) {
        tracing::warn!(%message, "parse warning");
        self.warnings.push(message);
    }
}

pub(crate) fn dedup_by_key<T: NaturalKey>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.natural_key()))
        .collect()
}

/// Splits JSON-lines text into objects and the non-JSON lines left over.
pub(crate) fn json_lines(text: &str) -> (Vec<Map<String, Value>>, Vec<&str>) {
    let mut objects = Vec::new();
    let mut other = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => objects.push(map),
            _ => other.push(line),
        }
    }
    (objects, other)
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Removes every alias key and returns the first non-empty scalar among them.
pub(crate) fn take_str(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            if found.is_none() {
                found = value_to_string(&value);
            }
        }
    }
    found
}

/// Accepts either an array of scalars or a comma separated string.
pub(crate) fn take_list(map: &mut Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let mut found: Option<Vec<String>> = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            if found.is_some() {
                continue;
            }
            found = match value {
                Value::Array(items) => Some(items.iter().filter_map(value_to_string).collect()),
                Value::String(s) => Some(
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect(),
                ),
                _ => None,
            };
        }
    }
    found.unwrap_or_default()
}
