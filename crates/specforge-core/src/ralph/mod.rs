//! The Ralph loop: iterative agent self-verification.
//!
//! One loop drives one pipeline stage. Each iteration the agent runs, its
//! output is scanned for a `<promise>...</promise>` declaration, and a
//! declared promise is checked by the [`Verifier`]. The loop continues
//! until verification passes or the iteration budget runs out.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use specforge_db::models::{AgentRole, CompletionCriteria, Task, VerificationMethod};

use crate::config::{RalphAgentDefaults, RalphSection};
use crate::verify::{Verifier, VerifyContext};

/// One verification attempt within a loop.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub iteration: u32,
    pub passed: bool,
    pub reason: String,
    pub duration_ms: i64,
}

/// Outcome of a finished loop.
#[derive(Debug, Clone)]
pub struct RalphOutcome {
    pub success: bool,
    pub iterations: u32,
    pub elapsed: Duration,
    pub history: Vec<VerificationRecord>,
}

/// The default promise an agent role declares on completion.
pub fn default_promise(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Architect => "DESIGN_COMPLETE",
        AgentRole::Coder => "IMPLEMENTATION_COMPLETE",
        AgentRole::Reviewer => "REVIEW_PASSED",
        AgentRole::Tester => "TESTS_PASSED",
        AgentRole::Qa => "QA_PASSED",
    }
}

/// The default verification method per agent role.
pub fn default_method(role: AgentRole) -> VerificationMethod {
    match role {
        AgentRole::Architect => VerificationMethod::StringMatch,
        AgentRole::Coder => VerificationMethod::External,
        AgentRole::Reviewer => VerificationMethod::Semantic,
        AgentRole::Tester => VerificationMethod::External,
        AgentRole::Qa => VerificationMethod::MultiStage,
    }
}

/// An active verification loop for one task/role pair.
#[derive(Debug)]
pub struct RalphLoop {
    task_id: String,
    role: AgentRole,
    iteration: u32,
    max_iterations: u32,
    criteria: CompletionCriteria,
    started_at: Instant,
    history: Vec<VerificationRecord>,
    verified: bool,
    verifier: Verifier,
}

impl RalphLoop {
    /// Start a loop for a task and role.
    ///
    /// Fails when the loop is disabled in configuration. When `criteria`
    /// is absent, the task's completion spec is consulted, and failing
    /// that, role defaults are synthesised (with the task's acceptance
    /// criteria injected for semantic / multi-stage methods).
    pub fn start(
        config: &RalphSection,
        task: &Task,
        role: AgentRole,
        criteria: Option<CompletionCriteria>,
    ) -> Result<Self> {
        if !config.enabled {
            bail!("ralph loop is disabled in configuration");
        }

        let criteria = criteria
            .or_else(|| {
                task.completion_spec
                    .as_ref()
                    .and_then(|spec| spec.criteria_for(role).cloned())
            })
            .unwrap_or_else(|| synthesise_criteria(config, task, role));

        let role_defaults = config.agent_defaults.get(&role);
        let max_iterations = criteria
            .max_iterations
            .or_else(|| role_defaults.and_then(|d| d.max_iterations))
            .unwrap_or(config.max_iterations)
            .max(1);

        Ok(Self {
            task_id: task.id.clone(),
            role,
            iteration: 0,
            max_iterations,
            criteria,
            started_at: Instant::now(),
            history: Vec::new(),
            verified: false,
            verifier: Verifier::new(),
        })
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn criteria(&self) -> &CompletionCriteria {
        &self.criteria
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Tighten the iteration budget to at most `cap`. The pipeline applies
    /// its per-stage cap this way so one budget governs the whole loop.
    pub fn clamp_max_iterations(&mut self, cap: u32) {
        self.max_iterations = self.max_iterations.min(cap.max(1));
    }

    /// Advance to the next iteration. Must be called before each agent
    /// invocation, including the first.
    pub fn increment(&mut self) {
        self.iteration += 1;
    }

    /// Decide whether the loop keeps going after an agent iteration.
    ///
    /// Returns `(continue, reason)`. Calling this before the first
    /// [`Self::increment`] is a programming error and returns `Err`.
    pub async fn should_continue(
        &mut self,
        output: &str,
        worktree: Option<&Path>,
    ) -> Result<(bool, String)> {
        if self.iteration == 0 {
            bail!("should_continue called before any iteration was started");
        }

        let at_budget = self.iteration >= self.max_iterations;

        let Some(promise) = Verifier::extract_promise(output) else {
            return Ok(if at_budget {
                (
                    false,
                    format!(
                        "max iterations ({}) reached without a completion promise",
                        self.max_iterations
                    ),
                )
            } else {
                (true, "no completion promise declared yet".to_owned())
            });
        };

        tracing::debug!(
            task_id = %self.task_id,
            role = %self.role,
            iteration = self.iteration,
            promise = %promise,
            "promise declared, verifying"
        );

        let context = VerifyContext {
            task_id: self.task_id.clone(),
            role: Some(self.role),
        };
        let result = self
            .verifier
            .verify(&self.criteria, output, worktree, &context)
            .await;

        self.history.push(VerificationRecord {
            iteration: self.iteration,
            passed: result.passed,
            reason: result.reason.clone(),
            duration_ms: result.duration_ms,
        });

        if result.passed {
            self.verified = true;
            return Ok((false, format!("completion verified: {}", result.reason)));
        }

        Ok(if at_budget {
            (
                false,
                format!(
                    "max iterations ({}) reached, last: {}",
                    self.max_iterations, result.reason
                ),
            )
        } else {
            (true, result.reason)
        })
    }

    /// Conclude the loop and report the outcome.
    pub fn finish(self) -> RalphOutcome {
        RalphOutcome {
            success: self.verified,
            iterations: self.iteration,
            elapsed: self.started_at.elapsed(),
            history: self.history,
        }
    }

    /// The markdown block appended to the agent prompt: iteration status,
    /// the exact promise to output, and recent verification failures.
    pub fn build_prompt_suffix(&self, task: &Task) -> String {
        let mut out = String::new();
        out.push_str("\n## Completion Requirements\n\n");
        out.push_str(&format!(
            "**Iteration:** {}/{}\n",
            self.iteration, self.max_iterations
        ));
        out.push_str(&format!("**Role:** {}\n", self.role));

        let outcome = task
            .completion_spec
            .as_ref()
            .map(|s| s.outcome.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.criteria.description);
        if !outcome.is_empty() {
            out.push_str(&format!("**Expected outcome:** {outcome}\n"));
        }

        if let Some(spec) = &task.completion_spec {
            if !spec.acceptance_criteria.is_empty() {
                out.push_str("\n**Acceptance criteria:**\n");
                for criterion in &spec.acceptance_criteria {
                    out.push_str(&format!("- [ ] {criterion}\n"));
                }
            }
        }

        out.push_str(&format!(
            "\nWhen the work is genuinely complete, output exactly:\n\
             `<promise>{}</promise>`\n\n\
             Your promise will be checked with the `{}` verification method. \
             Do not output the promise unless the work is actually done.\n",
            self.criteria.promise, self.criteria.method
        ));

        let recent: Vec<&VerificationRecord> = self
            .history
            .iter()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !recent.is_empty() {
            out.push_str("\n**Previous verification attempts:**\n");
            for (idx, record) in recent.iter().enumerate() {
                out.push_str(&format!(
                    "{}. iteration {}: {}\n",
                    idx + 1,
                    record.iteration,
                    record.reason
                ));
            }
        }

        out
    }
}

/// Build default criteria for a role from configuration and the task's
/// acceptance criteria.
fn synthesise_criteria(config: &RalphSection, task: &Task, role: AgentRole) -> CompletionCriteria {
    let defaults: Option<&RalphAgentDefaults> = config.agent_defaults.get(&role);

    let promise = defaults
        .and_then(|d| d.promise.clone())
        .unwrap_or_else(|| default_promise(role).to_owned());
    let method = defaults
        .and_then(|d| d.verification)
        .unwrap_or_else(|| default_method(role));

    let acceptance: &[String] = task
        .completion_spec
        .as_ref()
        .map(|s| s.acceptance_criteria.as_slice())
        .unwrap_or(&[]);

    let verification_config = if acceptance.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        match method {
            VerificationMethod::Semantic => serde_json::json!({ "check_for": acceptance }),
            VerificationMethod::MultiStage => serde_json::json!({
                "stages": [{
                    "name": "acceptance_check",
                    "method": "semantic",
                    "config": { "check_for": acceptance },
                    "required": true,
                }],
            }),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    };

    CompletionCriteria {
        promise,
        description: format!("Complete {role} stage for: {}", task.title),
        method,
        config: verification_config,
        max_iterations: defaults.and_then(|d| d.max_iterations),
    }
}

/// Build a ralph configuration with everything at defaults except the
/// iteration cap; used by tests and the pipeline's fallbacks.
pub fn section_with_max(max_iterations: u32) -> RalphSection {
    RalphSection {
        enabled: true,
        max_iterations,
        default_verification: VerificationMethod::StringMatch,
        agent_defaults: BTreeMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use specforge_db::models::CompletionSpec;

    fn task_with_spec(completion_spec: Option<CompletionSpec>) -> Task {
        let mut task = Task::new("task-1", "spec-1", "Add authentication");
        task.completion_spec = completion_spec;
        task
    }

    fn string_match_criteria(promise: &str) -> CompletionCriteria {
        CompletionCriteria::new(promise, VerificationMethod::StringMatch)
    }

    #[test]
    fn start_fails_when_disabled() {
        let mut config = section_with_max(3);
        config.enabled = false;
        let task = task_with_spec(None);
        let result = RalphLoop::start(&config, &task, AgentRole::Coder, None);
        assert!(result.is_err());
    }

    #[test]
    fn start_synthesises_role_defaults() {
        let config = section_with_max(3);
        let task = task_with_spec(None);

        let cases = [
            (AgentRole::Architect, "DESIGN_COMPLETE", VerificationMethod::StringMatch),
            (AgentRole::Coder, "IMPLEMENTATION_COMPLETE", VerificationMethod::External),
            (AgentRole::Reviewer, "REVIEW_PASSED", VerificationMethod::Semantic),
            (AgentRole::Tester, "TESTS_PASSED", VerificationMethod::External),
            (AgentRole::Qa, "QA_PASSED", VerificationMethod::MultiStage),
        ];
        for (role, promise, method) in cases {
            let ralph = RalphLoop::start(&config, &task, role, None).expect("start");
            assert_eq!(ralph.criteria().promise, promise);
            assert_eq!(ralph.criteria().method, method);
        }
    }

    #[test]
    fn acceptance_criteria_injected_for_semantic() {
        let config = section_with_max(3);
        let mut spec = CompletionSpec::default();
        spec.acceptance_criteria = vec!["login works".into(), "tokens refresh".into()];
        let task = task_with_spec(Some(spec));

        let ralph = RalphLoop::start(&config, &task, AgentRole::Reviewer, None).expect("start");
        let check_for = ralph.criteria().config.get("check_for").expect("check_for");
        assert_eq!(check_for.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn acceptance_criteria_injected_for_multi_stage() {
        let config = section_with_max(3);
        let mut spec = CompletionSpec::default();
        spec.acceptance_criteria = vec!["all criteria met".into()];
        let task = task_with_spec(Some(spec));

        let ralph = RalphLoop::start(&config, &task, AgentRole::Qa, None).expect("start");
        let stages = ralph
            .criteria()
            .config
            .get("stages")
            .and_then(|v| v.as_array())
            .expect("stages");
        assert_eq!(stages.len(), 1);
        assert_eq!(
            stages[0].get("method").and_then(|v| v.as_str()),
            Some("semantic")
        );
    }

    #[test]
    fn task_criteria_take_precedence_over_defaults() {
        let config = section_with_max(3);
        let mut spec = CompletionSpec::default();
        spec.criteria.insert(
            AgentRole::Coder,
            string_match_criteria("CUSTOM_PROMISE"),
        );
        let task = task_with_spec(Some(spec));

        let ralph = RalphLoop::start(&config, &task, AgentRole::Coder, None).expect("start");
        assert_eq!(ralph.criteria().promise, "CUSTOM_PROMISE");
        assert_eq!(ralph.criteria().method, VerificationMethod::StringMatch);
    }

    #[test]
    fn criteria_max_iterations_overrides_config() {
        let config = section_with_max(10);
        let mut criteria = string_match_criteria("DONE");
        criteria.max_iterations = Some(2);
        let task = task_with_spec(None);

        let ralph =
            RalphLoop::start(&config, &task, AgentRole::Coder, Some(criteria)).expect("start");
        assert_eq!(ralph.max_iterations(), 2);
    }

    #[tokio::test]
    async fn should_continue_before_increment_is_programming_error() {
        let config = section_with_max(3);
        let task = task_with_spec(None);
        let mut ralph = RalphLoop::start(
            &config,
            &task,
            AgentRole::Coder,
            Some(string_match_criteria("DONE")),
        )
        .expect("start");

        let result = ralph.should_continue("anything", None).await;
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("before any iteration")
        );
    }

    #[tokio::test]
    async fn no_promise_continues_until_budget() {
        let config = section_with_max(2);
        let task = task_with_spec(None);
        let mut ralph = RalphLoop::start(
            &config,
            &task,
            AgentRole::Coder,
            Some(string_match_criteria("DONE")),
        )
        .expect("start");

        ralph.increment();
        let (cont, reason) = ralph.should_continue("still working", None).await.expect("ok");
        assert!(cont);
        assert!(reason.contains("no completion promise"));

        ralph.increment();
        let (cont, reason) = ralph.should_continue("still working", None).await.expect("ok");
        assert!(!cont);
        assert!(reason.contains("max iterations"));

        let outcome = ralph.finish();
        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn verified_promise_stops_loop() {
        let config = section_with_max(3);
        let task = task_with_spec(None);
        let mut ralph = RalphLoop::start(
            &config,
            &task,
            AgentRole::Coder,
            Some(string_match_criteria("IMPLEMENTATION_COMPLETE")),
        )
        .expect("start");

        ralph.increment();
        let (cont, _) = ralph.should_continue("working...", None).await.expect("ok");
        assert!(cont);

        ralph.increment();
        let (cont, reason) = ralph
            .should_continue("done! <promise>IMPLEMENTATION_COMPLETE</promise>", None)
            .await
            .expect("ok");
        assert!(!cont);
        assert!(reason.contains("verified"));

        let outcome = ralph.finish();
        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.history.len(), 1);
        assert!(outcome.history[0].passed);
    }

    #[tokio::test]
    async fn max_one_iteration_with_failing_verifier_stops_after_one() {
        let config = section_with_max(1);
        let task = task_with_spec(None);
        // The promise is declared but never satisfied by verification.
        let mut criteria = string_match_criteria("NEVER_IN_OUTPUT");
        criteria.config = serde_json::json!({});
        let mut ralph =
            RalphLoop::start(&config, &task, AgentRole::Coder, Some(criteria)).expect("start");

        ralph.increment();
        let (cont, reason) = ralph
            .should_continue("<promise>SOMETHING_ELSE</promise>", None)
            .await
            .expect("ok");
        assert!(!cont);
        assert!(reason.contains("max iterations"));

        let outcome = ralph.finish();
        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn failed_verification_reason_feeds_next_iteration() {
        let config = section_with_max(3);
        let task = task_with_spec(None);
        let mut ralph = RalphLoop::start(
            &config,
            &task,
            AgentRole::Coder,
            Some(string_match_criteria("THE_REAL_PROMISE")),
        )
        .expect("start");

        ralph.increment();
        let (cont, reason) = ralph
            .should_continue("<promise>WRONG</promise>", None)
            .await
            .expect("ok");
        assert!(cont);
        assert!(reason.contains("not found"));

        let suffix = ralph.build_prompt_suffix(&task);
        assert!(suffix.contains("Previous verification attempts"));
        assert!(suffix.contains("not found"));
    }

    #[test]
    fn prompt_suffix_contains_contract() {
        let config = section_with_max(3);
        let mut spec = CompletionSpec::default();
        spec.outcome = "Authentication flow works end to end".into();
        spec.acceptance_criteria = vec!["login succeeds".into(), "logout clears session".into()];
        let task = task_with_spec(Some(spec));

        let mut ralph = RalphLoop::start(
            &config,
            &task,
            AgentRole::Coder,
            Some(string_match_criteria("IMPLEMENTATION_COMPLETE")),
        )
        .expect("start");
        ralph.increment();

        let suffix = ralph.build_prompt_suffix(&task);
        assert!(suffix.contains("1/3"));
        assert!(suffix.contains("coder"));
        assert!(suffix.contains("Authentication flow works end to end"));
        assert!(suffix.contains("- [ ] login succeeds"));
        assert!(suffix.contains("<promise>IMPLEMENTATION_COMPLETE</promise>"));
        assert!(suffix.contains("string_match"));
    }
}
