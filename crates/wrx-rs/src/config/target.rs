//! Per-target configuration: presets, scan profiles and run resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    error::{Result, WrxError},
    models::StageName,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzContext {
    pub enabled: bool,
    pub max_words: usize,
}

impl Default for FuzzContext {
    fn default() -> Self {
        Self {
            enabled: true,
            max_words: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZapSettings {
    pub docker_image: String,
    pub baseline_args: Vec<String>,
    pub timeout_secs: u64,
    pub localhost_only: bool,
}

impl Default for ZapSettings {
    fn default() -> Self {
        Self {
            docker_image: "owasp/zap2docker-stable".to_string(),
            baseline_args: strings(&["-m", "3"]),
            timeout_secs: 900,
            localhost_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZapOverride {
    pub docker_image: Option<String>,
    pub baseline_args: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub localhost_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanProfile {
    pub description: String,
    pub nuclei_args: Vec<String>,
    pub nuclei_timeout_secs: Option<u64>,
    pub nuclei_allow_tags: Vec<String>,
    pub zap_baseline_args: Vec<String>,
    pub zap_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    pub description: String,
    pub concurrency: Option<usize>,
    pub scan_profile: Option<String>,
    pub seed_hosts: Vec<String>,
    pub stages: BTreeMap<StageName, bool>,
    pub tool_args: BTreeMap<StageName, Vec<String>>,
    pub timeouts: BTreeMap<StageName, u64>,
    pub fuzz_rate_limit: Option<u32>,
    pub scan_hosts_only: Option<bool>,
    pub zap: ZapOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub target: String,
    pub seed_hosts: Vec<String>,
    pub default_preset: String,
    pub default_scan_profile: String,
    pub default_concurrency: usize,
    pub timeouts: BTreeMap<StageName, u64>,
    pub tool_args: BTreeMap<StageName, Vec<String>>,
    pub fuzz_rate_limit: u32,
    pub fuzz_context: FuzzContext,
    pub zap: ZapSettings,
    pub scan_profiles: BTreeMap<String, ScanProfile>,
    pub presets: BTreeMap<String, Preset>,
}

/// Caller-supplied knobs for a single run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    pub preset: Option<String>,
    pub scan_profile: Option<String>,
    pub concurrency: Option<usize>,
    pub force: bool,
    pub dry_run: bool,
}

/// Everything a run needs, fully merged. Field order is part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRunConfig {
    pub target: String,
    pub preset: String,
    pub scan_profile: String,
    pub seed_hosts: Vec<String>,
    pub concurrency: usize,
    pub stages: BTreeMap<StageName, bool>,
    pub tool_args: BTreeMap<StageName, Vec<String>>,
    pub timeouts: BTreeMap<StageName, u64>,
    pub fuzz_rate_limit: u32,
    pub fuzz_context: FuzzContext,
    pub zap: ZapSettings,
    pub scan_hosts_only: bool,
    pub local_demo_safe: bool,
    pub dry_run: bool,
}

impl ResolvedRunConfig {
    pub fn stage_enabled(&self, stage: StageName) -> bool {
        self.stages.get(&stage).copied().unwrap_or(false)
    }

    pub fn args_for(&self, stage: StageName) -> &[String] {
        self.tool_args.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn timeout_for(&self, stage: StageName) -> u64 {
        if stage == StageName::ZapBaseline {
            return self.zap.timeout_secs;
        }
        self.timeouts.get(&stage).copied().unwrap_or(300)
    }

    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha1::digest(&canonical)))
    }
}

impl TargetConfig {
    pub fn new(target: impl Into<String>, seed_hosts: Vec<String>) -> Self {
        Self {
            target: target.into(),
            seed_hosts,
            ..Self::default()
        }
    }

    pub fn resolve(&self, overrides: &RunOverrides) -> Result<ResolvedRunConfig> {
        let preset_name = overrides
            .preset
            .clone()
            .unwrap_or_else(|| self.default_preset.clone());
        let preset = self.presets.get(&preset_name).ok_or_else(|| {
            WrxError::InvalidConfig(format!("preset '{preset_name}' not found"))
        })?;

        let profile_name = overrides
            .scan_profile
            .clone()
            .or_else(|| preset.scan_profile.clone())
            .unwrap_or_else(|| self.default_scan_profile.clone());
        let profile = self.scan_profiles.get(&profile_name).ok_or_else(|| {
            let available: Vec<&str> = self.scan_profiles.keys().map(String::as_str).collect();
            WrxError::InvalidConfig(format!(
                "scan profile '{profile_name}' not found (available: {})",
                available.join(", ")
            ))
        })?;

        let mut tool_args = self.tool_args.clone();
        for (stage, args) in &preset.tool_args {
            tool_args.insert(*stage, args.clone());
        }

        let mut scan_args = profile.nuclei_args.clone();
        let existing_scan = tool_args.remove(&StageName::Scan).unwrap_or_default();
        let has_tags = scan_args.iter().chain(existing_scan.iter()).any(|a| a == "-tags");
        let tags: Vec<&str> = profile
            .nuclei_allow_tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() && !has_tags {
            scan_args.push("-tags".to_string());
            scan_args.push(tags.join(","));
        }
        scan_args.extend(existing_scan);
        tool_args.insert(StageName::Scan, scan_args);

        let mut timeouts = self.timeouts.clone();
        for (stage, secs) in &preset.timeouts {
            timeouts.insert(*stage, *secs);
        }
        if !preset.timeouts.contains_key(&StageName::Scan) {
            if let Some(secs) = profile.nuclei_timeout_secs {
                timeouts.insert(StageName::Scan, secs);
            }
        }

        let mut zap = self.zap.clone();
        if let Some(image) = &preset.zap.docker_image {
            zap.docker_image = image.clone();
        }
        match &preset.zap.baseline_args {
            Some(args) => zap.baseline_args = args.clone(),
            None if !profile.zap_baseline_args.is_empty() => {
                zap.baseline_args = profile.zap_baseline_args.clone()
            }
            None => {}
        }
        match preset.zap.timeout_secs {
            Some(secs) => zap.timeout_secs = secs,
            None => {
                if let Some(secs) = profile.zap_timeout_secs {
                    zap.timeout_secs = secs;
                }
            }
        }
        if let Some(local) = preset.zap.localhost_only {
            zap.localhost_only = local;
        }

        let seed_hosts = if self.seed_hosts.is_empty() {
            preset.seed_hosts.clone()
        } else {
            self.seed_hosts.clone()
        };

        let stages = StageName::ALL
            .iter()
            .map(|s| (*s, preset.stages.get(s).copied().unwrap_or(false)))
            .collect();

        let concurrency = overrides
            .concurrency
            .or(preset.concurrency)
            .unwrap_or(self.default_concurrency)
            .max(1);

        Ok(ResolvedRunConfig {
            target: self.target.clone(),
            preset: preset_name,
            scan_profile: profile_name,
            seed_hosts,
            concurrency,
            stages,
            tool_args,
            timeouts,
            fuzz_rate_limit: preset.fuzz_rate_limit.unwrap_or(self.fuzz_rate_limit),
            fuzz_context: self.fuzz_context.clone(),
            local_demo_safe: zap.localhost_only,
            zap,
            scan_hosts_only: preset.scan_hosts_only.unwrap_or(false),
            dry_run: overrides.dry_run,
        })
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            seed_hosts: Vec::new(),
            default_preset: "quick".to_string(),
            default_scan_profile: "safe".to_string(),
            default_concurrency: 4,
            timeouts: stage_map(&[
                (StageName::Subdomains, 180),
                (StageName::Probe, 240),
                (StageName::Crawl, 300),
                (StageName::Fuzz, 300),
                (StageName::Scan, 420),
                (StageName::ZapBaseline, 900),
            ]),
            tool_args: BTreeMap::from([
                (StageName::Subdomains, strings(&["-silent"])),
                (StageName::Probe, strings(&["-silent"])),
                (StageName::Crawl, strings(&["-silent"])),
                (StageName::Fuzz, Vec::new()),
                (StageName::Scan, strings(&["-silent"])),
            ]),
            fuzz_rate_limit: 20,
            fuzz_context: FuzzContext::default(),
            zap: ZapSettings::default(),
            scan_profiles: default_scan_profiles(),
            presets: default_presets(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn stage_map<T: Copy>(items: &[(StageName, T)]) -> BTreeMap<StageName, T> {
    items.iter().copied().collect()
}

fn default_scan_profiles() -> BTreeMap<String, ScanProfile> {
    BTreeMap::from([
        (
            "safe".to_string(),
            ScanProfile {
                description: "Conservative defaults for repeatable recon.".to_string(),
                nuclei_args: strings(&["-rate-limit", "12", "-timeout", "8", "-severity", "critical,high,medium"]),
                nuclei_timeout_secs: Some(300),
                nuclei_allow_tags: strings(&["misconfig", "tech"]),
                zap_baseline_args: strings(&["-m", "2"]),
                zap_timeout_secs: Some(600),
            },
        ),
        (
            "balanced".to_string(),
            ScanProfile {
                description: "Balanced signal and depth.".to_string(),
                nuclei_args: strings(&["-rate-limit", "20", "-timeout", "10", "-severity", "critical,high,medium"]),
                nuclei_timeout_secs: Some(600),
                nuclei_allow_tags: strings(&["misconfig", "tech", "exposure"]),
                zap_baseline_args: strings(&["-m", "3"]),
                zap_timeout_secs: Some(900),
            },
        ),
        (
            "deep".to_string(),
            ScanProfile {
                description: "Deeper passive coverage and broader severities.".to_string(),
                nuclei_args: strings(&["-rate-limit", "25", "-timeout", "12", "-severity", "critical,high,medium,low"]),
                nuclei_timeout_secs: Some(900),
                nuclei_allow_tags: strings(&["misconfig", "tech", "exposure", "cve"]),
                zap_baseline_args: strings(&["-m", "5"]),
                zap_timeout_secs: Some(1200),
            },
        ),
    ])
}

fn enabled(stages: &[StageName]) -> BTreeMap<StageName, bool> {
    StageName::ALL
        .iter()
        .map(|s| (*s, stages.contains(s)))
        .collect()
}

fn default_presets() -> BTreeMap<String, Preset> {
    use StageName::*;

    BTreeMap::from([
        (
            "demo".to_string(),
            Preset {
                description: "Safe localhost demo against a local web app on http://localhost:3000.".to_string(),
                concurrency: Some(2),
                scan_profile: Some("safe".to_string()),
                seed_hosts: strings(&["http://localhost:3000"]),
                stages: enabled(&[Probe, Crawl, ZapBaseline, Report]),
                tool_args: BTreeMap::from([
                    (Probe, strings(&["-silent", "-no-color"])),
                    (Crawl, strings(&["-silent", "-depth", "2", "-concurrency", "5", "-timeout", "8"])),
                    (Scan, strings(&["-silent", "-rate-limit", "20", "-timeout", "10", "-severity", "critical,high"])),
                ]),
                timeouts: stage_map(&[(Probe, 120), (Crawl, 90), (Scan, 120)]),
                zap: ZapOverride {
                    baseline_args: Some(strings(&["-m", "3"])),
                    timeout_secs: Some(900),
                    localhost_only: Some(true),
                    ..ZapOverride::default()
                },
                ..Preset::default()
            },
        ),
        (
            "quick".to_string(),
            Preset {
                description: "Fast signal collection for triage.".to_string(),
                concurrency: Some(3),
                scan_profile: Some("safe".to_string()),
                stages: enabled(&[Subdomains, Probe, Scan, Report]),
                tool_args: BTreeMap::from([(Scan, strings(&["-severity", "critical,high"]))]),
                ..Preset::default()
            },
        ),
        (
            "bounty".to_string(),
            Preset {
                description: "Balanced preset for bug bounty workflows.".to_string(),
                concurrency: Some(5),
                scan_profile: Some("balanced".to_string()),
                stages: enabled(&[Subdomains, Probe, Crawl, Fuzz, Scan, Report]),
                tool_args: BTreeMap::from([(Scan, strings(&["-severity", "critical,high,medium"]))]),
                timeouts: stage_map(&[(Scan, 900)]),
                ..Preset::default()
            },
        ),
        (
            "deep".to_string(),
            Preset {
                description: "Thorough but slower reconnaissance pass.".to_string(),
                concurrency: Some(8),
                scan_profile: Some("deep".to_string()),
                stages: enabled(&[Subdomains, Probe, Crawl, Fuzz, Scan, Report]),
                tool_args: BTreeMap::from([
                    (Crawl, strings(&["-depth", "4"])),
                    (Scan, strings(&["-severity", "critical,high,medium,low"])),
                ]),
                timeouts: stage_map(&[(Crawl, 600), (Scan, 900)]),
                fuzz_rate_limit: Some(10),
                ..Preset::default()
            },
        ),
    ])
}
