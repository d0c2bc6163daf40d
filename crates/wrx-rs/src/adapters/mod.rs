pub mod process;

#[cfg(test)]
pub mod fake;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tracing::debug;

pub const SUBFINDER: &str = "subfinder";
pub const HTTPX: &str = "httpx";
pub const KATANA: &str = "katana";
pub const FFUF: &str = "ffuf";
pub const NUCLEI: &str = "nuclei";
pub const DOCKER: &str = "docker";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolProbe {
    pub tool: String,
    pub available: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub timeout: Duration,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub tool: String,
    pub exit_code: Option<i32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration: Duration,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
}

impl InvocationOutcome {
    pub fn succeeded(&self, ok_codes: &[i32]) -> bool {
        !self.timed_out
            && self.spawn_error.is_none()
            && self.exit_code.is_some_and(|c| ok_codes.contains(&c))
    }
}

/// Uniform contract around one external program.
#[async_trait::async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn probe(&self) -> ToolProbe;
    async fn invoke(&self, inv: Invocation) -> InvocationOutcome;
}

pub struct ExternalTool {
    name: &'static str,
    binary: &'static str,
    extra_locations: &'static [&'static str],
    /// Substrings of `-h` output, any of which identifies the right program.
    identity_markers: &'static [&'static str],
    probe_timeout: Duration,
    resolved: Mutex<Option<PathBuf>>,
}

impl ExternalTool {
    pub fn new(name: &'static str, probe_timeout: Duration) -> Self {
        Self {
            name,
            binary: name,
            extra_locations: &[],
            identity_markers: &[],
            probe_timeout,
            resolved: Mutex::new(None),
        }
    }

    /// ProjectDiscovery httpx; the Python httpx CLI often shadows it on PATH.
    pub fn httpx(probe_timeout: Duration) -> Self {
        Self {
            extra_locations: &["/opt/homebrew/bin/httpx", "/usr/local/bin/httpx"],
            identity_markers: &["-l, -list", "input file containing list of hosts to process"],
            ..Self::new(HTTPX, probe_timeout)
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(path) = which::which(self.binary) {
            out.push(path);
        }
        for alt in self.extra_locations {
            let alt = PathBuf::from(alt);
            if alt.exists() && !out.contains(&alt) {
                out.push(alt);
            }
        }
        out
    }

    async fn resolve(&self) -> Result<PathBuf, String> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(format!("{} not found on PATH", self.binary));
        }
        if self.identity_markers.is_empty() {
            return Ok(candidates[0].clone());
        }
        for candidate in &candidates {
            let Some(help) = process::capture_short(candidate, &["-h"], self.probe_timeout).await
            else {
                continue;
            };
            let help = help.to_lowercase();
            if self.identity_markers.iter().any(|m| help.contains(m)) {
                return Ok(candidate.clone());
            }
        }
        Err(format!(
            "{} found at {} but it is not the expected tool",
            self.binary,
            candidates[0].display()
        ))
    }

    async fn version_of(&self, path: &Path) -> Option<String> {
        for args in [["-version"], ["--version"], ["version"]] {
            let Some(out) = process::capture_short(path, &args, self.probe_timeout).await else {
                continue;
            };
            if let Some(line) = out.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Some(line.to_string());
            }
        }
        None
    }

    fn cached(&self) -> Option<PathBuf> {
        self.resolved.lock().ok().and_then(|g| g.clone())
    }

    fn remember(&self, path: &Path) {
        if let Ok(mut guard) = self.resolved.lock() {
            *guard = Some(path.to_path_buf());
        }
    }
}

#[async_trait::async_trait]
impl ToolAdapter for ExternalTool {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn probe(&self) -> ToolProbe {
        match self.resolve().await {
            Ok(path) => {
                self.remember(&path);
                let version = self
                    .version_of(&path)
                    .await
                    .or_else(|| Some("available".to_string()));
                debug!(tool = self.name, path = %path.display(), ?version, "probe ok");
                ToolProbe {
                    tool: self.name.to_string(),
                    available: true,
                    path: Some(path),
                    version,
                    detail: None,
                }
            }
            Err(detail) => ToolProbe {
                tool: self.name.to_string(),
                available: false,
                path: None,
                version: None,
                detail: Some(detail),
            },
        }
    }

    async fn invoke(&self, inv: Invocation) -> InvocationOutcome {
        let program = match self.cached() {
            Some(path) => path,
            None => self
                .resolve()
                .await
                .unwrap_or_else(|_| PathBuf::from(self.binary)),
        };
        process::run_bounded(self.name, &program, &inv).await
    }
}

/// Known adapters, keyed by tool name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn system(probe_timeout: Duration) -> Self {
        let mut registry = Self::default();
        for name in [SUBFINDER, KATANA, FFUF, NUCLEI, DOCKER] {
            registry = registry.with(Arc::new(ExternalTool::new(name, probe_timeout)));
        }
        registry.with(Arc::new(ExternalTool::httpx(probe_timeout)))
    }

    pub fn with(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.tools.insert(adapter.name(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.tools.get(name).cloned()
    }

    pub async fn probe_all(&self) -> Vec<ToolProbe> {
        let probes = self.tools.values().map(|t| t.probe());
        futures::future::join_all(probes).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub tools: Vec<ToolProbe>,
    pub base_dir: PathBuf,
    pub workspace_writable: bool,
    pub workspace_detail: Option<String>,
}

/// Availability of every known tool plus a write check on the workspace root.
pub async fn doctor(registry: &ToolRegistry, base_dir: &Path) -> DoctorReport {
    let tools = registry.probe_all().await;
    let probe_file = base_dir.join(format!(".wrx-doctor-{}.tmp", uuid::Uuid::new_v4()));
    let write = tokio::fs::create_dir_all(base_dir)
        .await
        .and(tokio::fs::write(&probe_file, b"wrx-doctor").await);
    let _ = tokio::fs::remove_file(&probe_file).await;

    DoctorReport {
        tools,
        base_dir: base_dir.to_path_buf(),
        workspace_writable: write.is_ok(),
        workspace_detail: write.err().map(|e| e.to_string()),
    }
}
