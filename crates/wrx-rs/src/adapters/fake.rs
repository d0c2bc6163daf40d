//! Scriptable stand-in for external tools in tests.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use super::{Invocation, InvocationOutcome, ToolAdapter, ToolProbe};

pub struct FakeTool {
    name: &'static str,
    available: bool,
    stdout: String,
    files: HashMap<&'static str, String>,
    exit_code: i32,
    times_out: bool,
    delay: Duration,
    pub calls: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeTool {
    pub fn available(name: &'static str, stdout: &str) -> Self {
        Self {
            name,
            available: true,
            stdout: stdout.to_string(),
            files: HashMap::new(),
            exit_code: 0,
            times_out: false,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn missing(name: &'static str) -> Self {
        Self {
            available: false,
            ..Self::available(name, "")
        }
    }

    /// Writes `content` to the path following `flag` in the invocation args.
    pub fn writes(mut self, flag: &'static str, content: &str) -> Self {
        self.files.insert(flag, content.to_string());
        self
    }

    pub fn exits(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn times_out(mut self) -> Self {
        self.times_out = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ToolAdapter for FakeTool {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn probe(&self) -> ToolProbe {
        ToolProbe {
            tool: self.name.to_string(),
            available: self.available,
            path: self.available.then(|| PathBuf::from(format!("/fake/{}", self.name))),
            version: self.available.then(|| format!("{} v0.0.0-test", self.name)),
            detail: (!self.available).then(|| format!("{} not found on PATH", self.name)),
        }
    }

    async fn invoke(&self, inv: Invocation) -> InvocationOutcome {
        self.calls.lock().unwrap().push(inv.args.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(parent) = inv.stdout_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&inv.stdout_path, &self.stdout).unwrap();
        fs::write(&inv.stderr_path, format!("$ {} {}\n", self.name, inv.args.join(" "))).unwrap();

        for (flag, content) in &self.files {
            if let Some(pos) = inv.args.iter().position(|a| a == flag) {
                if let Some(target) = inv.args.get(pos + 1) {
                    let path = inv.working_dir.join(target);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).unwrap();
                    }
                    fs::write(path, content).unwrap();
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        InvocationOutcome {
            tool: self.name.to_string(),
            exit_code: (!self.times_out).then_some(self.exit_code),
            stdout_path: inv.stdout_path,
            stderr_path: inv.stderr_path,
            duration: self.delay,
            timed_out: self.times_out,
            spawn_error: None,
        }
    }
}
