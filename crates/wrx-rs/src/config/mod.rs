mod target;

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use target::{
    FuzzContext, Preset, ResolvedRunConfig, RunOverrides, ScanProfile, TargetConfig, ZapOverride,
    ZapSettings,
};

/// How a `skipped-missing-tool` stage affects the overall run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingToolPolicy {
    /// Treated like any other skip; the run can still succeed.
    #[default]
    Ignore,
    /// Escalates the run to `partial`.
    Degrade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub base_dir: PathBuf,
    pub database_url: Option<String>,
    pub worker_pool_size: usize,
    pub scope_allowlist: Vec<String>,
    pub missing_tool_policy: MissingToolPolicy,
    pub probe_timeout_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("WRX_CONFIG").unwrap_or_else(|_| "wrx.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();

        if let Ok(v) = env::var("WRX_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = env::var("WRX_PORT") {
            cfg.port = v.parse().unwrap_or(cfg.port);
        }
        if let Ok(v) = env::var("WRX_BASE_DIR") {
            cfg.base_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("WRX_DATABASE_URL") {
            cfg.database_url = Some(v);
        }
        if let Ok(v) = env::var("WRX_WORKERS") {
            cfg.worker_pool_size = v.parse().unwrap_or(cfg.worker_pool_size);
        }
        if let Ok(v) = env::var("WRX_SCOPE_ALLOWLIST") {
            cfg.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        cfg.worker_pool_size = cfg.worker_pool_size.max(1);
        Ok(cfg)
    }

    /// Job history lives next to the workspaces unless overridden.
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.base_dir.join(".wrx").join("jobs.db").display()
            )
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            base_dir: PathBuf::from("."),
            database_url: None,
            worker_pool_size: 2,
            scope_allowlist: Vec::new(),
            missing_tool_policy: MissingToolPolicy::Ignore,
            probe_timeout_secs: 3,
        }
    }
}
