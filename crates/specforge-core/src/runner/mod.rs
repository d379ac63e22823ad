//! The `AgentRunner` seam: one-shot invocation of an external AI process.
//!
//! The runner is handed a prompt, a working directory, an allowed-tool set
//! and a timeout, and comes back with text output plus an exit flag. All
//! failure classes (timeout, missing binary, nonzero exit) are reported in
//! band as `exit_ok = false` with a diagnostic text, never as `Err` -- a
//! ralph loop treats them as failed iterations, not hard errors.

pub mod claude;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeRunner;

/// A single agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Tool names the agent may use, joined for the CLI's allow-list flag.
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

/// What came back from an agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Primary result text (or the best available diagnostic on failure).
    pub text: String,
    pub session_id: Option<String>,
    /// False on nonzero exit, process-not-found, timeout, or cancellation.
    pub exit_ok: bool,
}

impl AgentOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            exit_ok: true,
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            exit_ok: false,
        }
    }
}

/// Adapter interface for one-shot agent invocations.
///
/// Object-safe so the pipeline, merge engine and tests can share
/// `Arc<dyn AgentRunner>` values.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the agent to completion (or timeout / cancellation).
    async fn run(&self, request: &AgentRequest, cancel: &CancellationToken) -> AgentOutcome;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};
