//! Claude Code runner adapter.
//!
//! Invokes `claude -p <prompt> --output-format json` headless, captures
//! combined output, and extracts the `result` field from the JSON frame
//! when present. The subprocess lifetime is tied to both the per-request
//! timeout and the global cancellation token; the process tree is always
//! reaped before returning.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentOutcome, AgentRequest, AgentRunner};

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Runner adapter for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    /// Path to the `claude` binary. Defaults to `"claude"` (via `$PATH`).
    binary_path: String,
}

impl ClaudeRunner {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_owned(),
        }
    }

    /// Use a custom binary path (tests, non-standard installs).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(&self, request: &AgentRequest, cancel: &CancellationToken) -> AgentOutcome {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--allowedTools")
            .arg(request.allowed_tools.join(","))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return AgentOutcome::failed(format!(
                    "ERROR: agent binary not found at '{}'",
                    self.binary_path
                ));
            }
            Err(e) => {
                return AgentOutcome::failed(format!("ERROR: failed to spawn agent: {e}"));
            }
        };

        // Take the pipes so they can be drained concurrently with wait();
        // a full pipe buffer would otherwise deadlock the child.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        // The waited future borrows `child`; keep it inside this block so
        // the borrow ends before any kill path below runs.
        let waited = {
            let work = async { tokio::join!(child.wait(), read_stdout, read_stderr) };
            tokio::select! {
                result = tokio::time::timeout(request.timeout, work) => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        match waited {
            Some(Ok((Ok(status), stdout, stderr))) => {
                let (mut text, session_id) = parse_result_frame(&stdout);
                let exit_ok = status.success();
                if !exit_ok && !stderr.trim().is_empty() {
                    text.push_str("\n\nSTDERR:\n");
                    text.push_str(&stderr);
                }
                debug!(exit_ok, bytes = text.len(), "agent invocation finished");
                AgentOutcome {
                    text,
                    session_id,
                    exit_ok,
                }
            }
            Some(Ok((Err(e), _, _))) => {
                AgentOutcome::failed(format!("ERROR: failed to wait on agent: {e}"))
            }
            Some(Err(_elapsed)) => {
                terminate(&mut child).await;
                AgentOutcome::failed(format!(
                    "TIMEOUT: agent execution exceeded {} seconds",
                    request.timeout.as_secs()
                ))
            }
            None => {
                terminate(&mut child).await;
                AgentOutcome::failed("ERROR: agent invocation cancelled".to_owned())
            }
        }
    }
}

/// Terminate a child process: SIGTERM first, SIGKILL after a grace period.
/// Always waits for the exit so no zombie is left behind.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "agent ignored SIGTERM, escalating to SIGKILL");
        }
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill agent process");
    }
    let _ = child.wait().await;
}

/// Extract the primary result and session id from a JSON output frame.
/// Falls back to the raw bytes when the output is not a JSON object.
fn parse_result_frame(stdout: &str) -> (String, Option<String>) {
    match serde_json::from_str::<serde_json::Value>(stdout) {
        Ok(value) => {
            let text = value
                .get("result")
                .and_then(|r| r.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| stdout.to_owned());
            let session_id = value
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(str::to_owned);
            (text, session_id)
        }
        Err(_) => (stdout.to_owned(), None),
    }
}
