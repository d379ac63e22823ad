//! Shared helpers for the core integration tests: scripted agent runners
//! and config builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use specforge_core::config::SpecforgeConfig;
use specforge_core::runner::{AgentOutcome, AgentRequest, AgentRunner};

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct StubReply {
    pub text: String,
    pub exit_ok: bool,
}

impl StubReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            exit_ok: true,
        }
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            exit_ok: false,
        }
    }
}

/// An agent runner that replays a fixed script of replies. When the
/// script runs dry the last reply repeats. Tracks call counts and the
/// maximum number of concurrent invocations.
pub struct ScriptedRunner {
    script: Mutex<VecDeque<StubReply>>,
    last: Mutex<StubReply>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(replies: Vec<StubReply>) -> Self {
        let last = replies
            .last()
            .cloned()
            .unwrap_or_else(|| StubReply::ok(""));
        Self {
            script: Mutex::new(replies.into()),
            last: Mutex::new(last),
            delay: None,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// A runner that always gives the same reply.
    pub fn always(reply: StubReply) -> Self {
        Self::new(vec![reply])
    }

    /// Sleep this long inside every invocation (to exercise concurrency).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> StubReply {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(reply) => {
                *self.last.lock().unwrap() = reply.clone();
                reply
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, _request: &AgentRequest, _cancel: &CancellationToken) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        let reply = self.next_reply();
        AgentOutcome {
            text: reply.text,
            session_id: None,
            exit_ok: reply.exit_ok,
        }
    }
}

/// A runner that must never be invoked; used to prove a path needs no
/// agent (e.g. a tier-1 merge).
pub struct PanickingRunner;

#[async_trait]
impl AgentRunner for PanickingRunner {
    async fn run(&self, _request: &AgentRequest, _cancel: &CancellationToken) -> AgentOutcome {
        panic!("agent runner invoked where none was expected");
    }
}

/// Project config with a given ralph iteration cap and fast timeouts.
pub fn config_with_ralph_max(max_iterations: u32) -> SpecforgeConfig {
    let mut config = SpecforgeConfig::default();
    config.ralph.max_iterations = max_iterations;
    config.execution.timeout_minutes = 1;
    config
}
