use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

use super::{Invocation, InvocationOutcome};

fn shell_quote(part: &str) -> String {
    if !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `program` with stdout/stderr streamed to the invocation's files.
///
/// Never returns an error: spawn failures, non-zero exits and timeouts are all
/// reported through the outcome. On timeout the whole process group is killed.
pub async fn run_bounded(tool: &str, program: &Path, inv: &Invocation) -> InvocationOutcome {
    let started = Instant::now();
    let mut outcome = InvocationOutcome {
        tool: tool.to_string(),
        exit_code: None,
        stdout_path: inv.stdout_path.clone(),
        stderr_path: inv.stderr_path.clone(),
        duration: Duration::ZERO,
        timed_out: false,
        spawn_error: None,
    };

    let files = open_outputs(inv);
    let (stdout_file, mut stderr_file) = match files {
        Ok(files) => files,
        Err(e) => {
            outcome.spawn_error = Some(format!("cannot open output files: {e}"));
            return outcome;
        }
    };

    let line = command_line(&program.display().to_string(), &inv.args);
    let _ = writeln!(stderr_file, "$ {line}");

    if inv.dry_run {
        info!(tool, command = %line, "dry-run: external tool not launched");
        let _ = writeln!(stderr_file, "[wrx] dry-run; command not executed");
        outcome.exit_code = Some(0);
        return outcome;
    }

    let stderr_for_child = match stderr_file.try_clone() {
        Ok(f) => f,
        Err(e) => {
            outcome.spawn_error = Some(format!("cannot clone stderr handle: {e}"));
            return outcome;
        }
    };

    let mut cmd = Command::new(program);
    cmd.args(&inv.args)
        .current_dir(&inv.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_for_child))
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    info!(tool, command = %line, timeout_secs = inv.timeout.as_secs(), "audit: launching external tool");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = writeln!(stderr_file, "[wrx] failed to start process: {e}");
            outcome.spawn_error = Some(e.to_string());
            outcome.duration = started.elapsed();
            return outcome;
        }
    };

    match timeout(inv.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            outcome.exit_code = status.code();
        }
        Ok(Err(e)) => {
            outcome.spawn_error = Some(format!("wait failed: {e}"));
        }
        Err(_) => {
            warn!(tool, timeout_secs = inv.timeout.as_secs(), "tool timed out; killing process group");
            terminate_tree(&mut child).await;
            let _ = writeln!(
                stderr_file,
                "\n[wrx] command timed out after {}s",
                inv.timeout.as_secs()
            );
            outcome.timed_out = true;
        }
    }

    outcome.duration = started.elapsed();
    outcome
}

fn open_outputs(inv: &Invocation) -> std::io::Result<(fs::File, fs::File)> {
    for path in [&inv.stdout_path, &inv.stderr_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    let stdout = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&inv.stdout_path)?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&inv.stderr_path)?;
    Ok((stdout, stderr))
}

async fn terminate_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{killpg, Signal},
            unistd::Pid,
        };
        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!(pid, error = %e, "killpg failed");
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Short-lived helper for probes: captures combined output in memory.
pub async fn capture_short(program: &Path, args: &[&str], limit: Duration) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = timeout(limit, cmd.output()).await.ok()?.ok()?;
    let mut text = String::from_utf8_lossy(&out.stdout).to_string();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    Some(text)
}
