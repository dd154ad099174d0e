use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use coord_core::rules::{RuleResult, RuleSpec};
use regex::Regex;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Grace period between SIGTERM and SIGKILL when a deadline is hit.
pub const TERM_GRACE_MS: u64 = 2_000;

/// Outcome of one shell command run under a deadline.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn passed(&self, expected_exit_code: i32) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(expected_exit_code)
    }
}

/// Run a shell command with an explicit deadline.
///
/// A deadline hit cancels the child with signal escalation: SIGTERM first,
/// then SIGKILL after [`TERM_GRACE_MS`]. `kill_on_drop` remains as a
/// backstop in case this future itself is dropped mid-call.
pub async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout_ms: u64,
    env: &[(String, String)],
) -> CommandOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                error: Some(format!("Failed to spawn command: {e}")),
            }
        }
    };

    // Drain both pipes off-task so a chatty child never blocks on a full pipe
    let stdout_task = drain_pipe(child.stdout.take());
    let stderr_task = drain_pipe(child.stderr.take());

    match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await {
        Ok(Ok(status)) => CommandOutcome {
            exit_code: status.code(),
            stdout: collect_pipe(stdout_task).await,
            stderr: collect_pipe(stderr_task).await,
            timed_out: false,
            error: None,
        },
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                error: Some(format!("Command failed: {e}")),
            }
        }
        Err(_) => {
            tracing::warn!(command, timeout_ms, "command exceeded its deadline, terminating");
            terminate_with_grace(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                error: Some(format!("Command timed out after {timeout_ms}ms")),
            }
        }
    }
}

/// Structured cancellation: SIGTERM, a grace period, then SIGKILL.
async fn terminate_with_grace(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we just spawned and a constant signal
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_millis(TERM_GRACE_MS), child.wait())
            .await
            .is_ok()
        {
            return;
        }
        tracing::warn!(pid, "child ignored SIGTERM, escalating to SIGKILL");
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn drain_pipe<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect_pipe(handle: JoinHandle<Vec<u8>>) -> String {
    String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned()
}

/// Content the content-predicate rules match against.
#[derive(Debug, Clone, Default)]
pub struct RuleInput {
    pub agent_output: String,
    pub task_notes: String,
    pub latest_work_product: Option<String>,
    pub project_root: PathBuf,
}

/// Execute one validation rule. Command rules shell out; content-predicate
/// rules match in-process. The engine only reports pass/fail, never
/// completion signals.
pub async fn run_rule(spec: &RuleSpec, input: &RuleInput) -> RuleResult {
    match spec {
        RuleSpec::Command {
            name,
            command,
            timeout_ms,
            working_directory,
            expected_exit_code,
        } => {
            let dir = working_directory
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| input.project_root.clone());
            let outcome = run_command(command, &dir, *timeout_ms, &[]).await;
            let passed = outcome.passed(*expected_exit_code);
            let message = if passed {
                format!("Command '{command}' exited with {expected_exit_code}")
            } else if outcome.timed_out {
                outcome.error.clone().unwrap_or_default()
            } else {
                format!(
                    "Command '{command}' exited with {:?}, expected {expected_exit_code}",
                    outcome.exit_code
                )
            };
            RuleResult {
                name: name.clone(),
                passed,
                message,
                details: Some(json!({
                    "exitCode": outcome.exit_code,
                    "stdout": outcome.stdout,
                    "stderr": outcome.stderr,
                    "timedOut": outcome.timed_out,
                })),
            }
        }
        RuleSpec::WorkProductMatches { name, pattern } => match_content(
            name,
            pattern,
            input.latest_work_product.as_deref().unwrap_or(""),
            "latest work product",
        ),
        RuleSpec::NotesMatch { name, pattern } => {
            match_content(name, pattern, &input.task_notes, "task notes")
        }
        RuleSpec::OutputMatches { name, pattern } => {
            match_content(name, pattern, &input.agent_output, "agent output")
        }
    }
}

fn match_content(name: &str, pattern: &str, haystack: &str, source: &str) -> RuleResult {
    match Regex::new(pattern) {
        Ok(re) => {
            let passed = re.is_match(haystack);
            RuleResult {
                name: name.to_string(),
                passed,
                message: if passed {
                    format!("Pattern '{pattern}' matched {source}")
                } else {
                    format!("Pattern '{pattern}' not found in {source}")
                },
                details: None,
            }
        }
        Err(e) => RuleResult {
            name: name.to_string(),
            passed: false,
            message: format!("Invalid pattern '{pattern}': {e}"),
            details: None,
        },
    }
}
