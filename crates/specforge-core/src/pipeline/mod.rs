//! The pipeline executor: drives one task through its ordered stages.
//!
//! Each stage registers an agent row, moves the task into the stage's
//! status, and runs its agent either under a ralph verification loop (when
//! enabled and the task carries a completion spec) or under the legacy
//! marker-scan loop. A failed stage resets the task to `todo` with failure
//! metadata; a fully successful pipeline marks it `done` and leaves the
//! branch in place for the merge engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use specforge_db::Store;
use specforge_db::models::{AgentRole, NewExecutionLog, Task, TaskStatus};

use crate::config::{AgentsSection, RalphSection, SpecforgeConfig};
use crate::memory::MemorySink;
use crate::prompt::{PromptContext, build_agent_prompt};
use crate::ralph::RalphLoop;
use crate::runner::{AgentRequest, AgentRunner};

/// Maximum stored length of a failure reason in task metadata.
const MAX_FAILURE_REASON: usize = 1000;

/// One step of the pipeline, run by one agent role.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub name: String,
    pub role: AgentRole,
    /// Per-stage iteration cap (ralph and legacy alike).
    pub max_iterations: u32,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, role: AgentRole, max_iterations: u32) -> Self {
        Self {
            name: name.into(),
            role,
            max_iterations,
        }
    }
}

/// The fixed default pipeline: Implementation, Code Review, Testing, QA.
pub fn default_pipeline() -> Vec<PipelineStage> {
    vec![
        PipelineStage::new("Implementation", AgentRole::Coder, 3),
        PipelineStage::new("Code Review", AgentRole::Reviewer, 2),
        PipelineStage::new("Testing", AgentRole::Tester, 2),
        PipelineStage::new("QA Validation", AgentRole::Qa, 10),
    ]
}

/// The task status a stage runs under. QA reuses the reviewing status.
pub fn stage_status(role: AgentRole) -> TaskStatus {
    match role {
        AgentRole::Coder | AgentRole::Architect => TaskStatus::Implementing,
        AgentRole::Reviewer | AgentRole::Qa => TaskStatus::Reviewing,
        AgentRole::Tester => TaskStatus::Testing,
    }
}

/// Concrete tools each role may use, in the runner's naming.
pub fn allowed_tools(role: AgentRole) -> Vec<String> {
    let tools: &[&str] = match role {
        AgentRole::Architect => &["Task", "Read", "Grep", "Glob", "WebSearch"],
        AgentRole::Coder => &["Task", "Read", "Write", "Edit", "Bash", "Grep", "Glob"],
        AgentRole::Reviewer => &["Task", "Read", "Grep", "Glob", "Bash"],
        AgentRole::Tester => &["Task", "Read", "Write", "Edit", "Bash", "Grep"],
        AgentRole::Qa => &["Task", "Read", "Bash", "Grep", "Glob"],
    };
    tools.iter().map(|s| (*s).to_owned()).collect()
}

/// Why a pipeline run ended.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: String,
    pub reason: String,
    pub ralph_iterations: u32,
}

/// Result of driving a task through the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    /// The run was aborted by the global cancellation signal; task status
    /// was left untouched.
    pub cancelled: bool,
    pub total_iterations: u32,
    pub failure: Option<StageFailure>,
}

/// Outcome of one stage, internal to the executor.
enum StageRun {
    Passed,
    Failed { reason: String, ralph_iterations: u32 },
    Cancelled,
}

/// Executes tasks through the staged agent pipeline.
pub struct PipelineExecutor {
    store: Store,
    runner: Arc<dyn AgentRunner>,
    memory: Arc<dyn MemorySink>,
    project_root: PathBuf,
    agents: AgentsSection,
    ralph: RalphSection,
    timeout: Duration,
    max_total_iterations: u32,
    stages: Vec<PipelineStage>,
}

impl PipelineExecutor {
    pub fn new(
        store: Store,
        runner: Arc<dyn AgentRunner>,
        memory: Arc<dyn MemorySink>,
        project_root: impl Into<PathBuf>,
        config: &SpecforgeConfig,
    ) -> Self {
        Self {
            store,
            runner,
            memory,
            project_root: project_root.into(),
            agents: config.agents.clone(),
            ralph: config.ralph.clone(),
            timeout: config.execution.timeout(),
            max_total_iterations: config.execution.max_iterations,
            stages: default_pipeline(),
        }
    }

    /// Replace the pipeline wholesale (stage order, roles, caps).
    pub fn with_stages(mut self, stages: Vec<PipelineStage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Run the task through every stage in order.
    ///
    /// Returns `Ok` with a failed outcome for ordinary stage failures;
    /// `Err` only for store-level faults.
    pub async fn execute_task(
        &self,
        task: &Task,
        worktree: &Path,
        slot_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut task = task.clone();
        // The counter keeps rising across re-runs until terminal success.
        let mut total_iterations = u32::try_from(task.iteration).unwrap_or(0);

        for stage in &self.stages {
            info!(
                task_id = %task.id,
                stage = %stage.name,
                role = %stage.role,
                "starting pipeline stage"
            );

            self.store
                .register_agent(
                    &task.id,
                    stage.role,
                    slot_id,
                    &worktree.to_string_lossy(),
                )
                .await
                .context("failed to register agent")?;

            task.status = stage_status(stage.role);
            task.updated_at = Utc::now();
            self.store
                .update_task(&task)
                .await
                .context("failed to update task status for stage")?;

            let stage_result = self
                .run_stage(&mut task, stage, worktree, &mut total_iterations, cancel)
                .await;

            // The agent row goes away on every stage exit, success or not.
            if let Err(e) = self.store.deregister_agent(&task.id).await {
                warn!(task_id = %task.id, error = %e, "failed to deregister agent");
            }

            match stage_result? {
                StageRun::Passed => {}
                StageRun::Cancelled => {
                    return Ok(PipelineOutcome {
                        success: false,
                        cancelled: true,
                        total_iterations,
                        failure: None,
                    });
                }
                StageRun::Failed {
                    reason,
                    ralph_iterations,
                } => {
                    task.status = TaskStatus::Todo;
                    task.metadata.insert(
                        "failure_stage".into(),
                        serde_json::json!(stage.name.clone()),
                    );
                    task.metadata.insert(
                        "failure_reason".into(),
                        serde_json::json!(truncate_chars(&reason, MAX_FAILURE_REASON)),
                    );
                    if ralph_iterations > 0 {
                        task.metadata
                            .insert("ralph_iterations".into(), serde_json::json!(ralph_iterations));
                    }
                    task.updated_at = Utc::now();
                    self.store
                        .update_task(&task)
                        .await
                        .context("failed to record stage failure")?;

                    return Ok(PipelineOutcome {
                        success: false,
                        cancelled: false,
                        total_iterations,
                        failure: Some(StageFailure {
                            stage: stage.name.clone(),
                            reason,
                            ralph_iterations,
                        }),
                    });
                }
            }
        }

        task.status = TaskStatus::Done;
        task.updated_at = Utc::now();
        self.store
            .update_task(&task)
            .await
            .context("failed to mark task done")?;

        Ok(PipelineOutcome {
            success: true,
            cancelled: false,
            total_iterations,
            failure: None,
        })
    }

    async fn run_stage(
        &self,
        task: &mut Task,
        stage: &PipelineStage,
        worktree: &Path,
        total_iterations: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<StageRun> {
        let use_ralph = self.ralph.enabled && task.completion_spec.is_some();
        if use_ralph {
            self.run_stage_ralph(task, stage, worktree, total_iterations, cancel)
                .await
        } else {
            self.run_stage_legacy(task, stage, worktree, total_iterations, cancel)
                .await
        }
    }

    /// Ralph path: iterate agent + promise verification until verified or
    /// the budget runs out.
    async fn run_stage_ralph(
        &self,
        task: &mut Task,
        stage: &PipelineStage,
        worktree: &Path,
        total_iterations: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<StageRun> {
        let mut criteria = None;
        // The stage's own cap binds the loop unless the criteria declare
        // a tighter one.
        if let Some(spec) = &task.completion_spec {
            criteria = spec.criteria_for(stage.role).cloned();
        }
        let mut ralph = match RalphLoop::start(&self.ralph, task, stage.role, criteria) {
            Ok(ralph) => ralph,
            Err(e) => {
                // Disabled under our feet; fall back to the legacy loop.
                warn!(task_id = %task.id, error = %e, "ralph loop unavailable, using legacy loop");
                return self
                    .run_stage_legacy(task, stage, worktree, total_iterations, cancel)
                    .await;
            }
        };
        ralph.clamp_max_iterations(stage.max_iterations);
        let stage_cap = ralph.max_iterations();

        loop {
            if *total_iterations >= self.max_total_iterations {
                let iterations = ralph.iteration();
                return Ok(StageRun::Failed {
                    reason: format!(
                        "global iteration cap ({}) exhausted during {}",
                        self.max_total_iterations, stage.name
                    ),
                    ralph_iterations: iterations,
                });
            }

            ralph.increment();
            *total_iterations += 1;
            task.iteration = i64::from(*total_iterations);
            task.updated_at = Utc::now();
            self.store
                .update_task(task)
                .await
                .context("failed to persist iteration count")?;

            let context = self.load_context(task).await;
            let mut prompt = build_agent_prompt(
                task,
                &stage.name,
                stage.role,
                ralph.iteration(),
                stage_cap,
                worktree,
                &context,
            );
            prompt.push_str(&ralph.build_prompt_suffix(task));

            let started = Instant::now();
            let outcome = self
                .runner
                .run(
                    &AgentRequest {
                        prompt,
                        working_dir: worktree.to_path_buf(),
                        allowed_tools: allowed_tools(stage.role),
                        model: Some(self.agents.model_for(stage.role)),
                        timeout: self.timeout,
                    },
                    cancel,
                )
                .await;
            let duration_ms = elapsed_ms(started);

            if cancel.is_cancelled() {
                self.log_stage(task, stage, ralph.iteration(), "cancelled by shutdown signal", false, duration_ms)
                    .await;
                return Ok(StageRun::Cancelled);
            }

            self.log_stage(
                task,
                stage,
                ralph.iteration(),
                &format!("{} (Ralph iter {})\n{}", stage.name, ralph.iteration(), outcome.text),
                outcome.exit_ok,
                duration_ms,
            )
            .await;

            self.memory
                .extract(
                    &outcome.text,
                    &format!("{}:{}", stage.role, task.id),
                    &task.spec_id,
                )
                .await;

            let (should_continue, reason) =
                ralph.should_continue(&outcome.text, Some(worktree)).await?;
            if should_continue {
                continue;
            }

            let iterations = ralph.iteration();
            let ralph_outcome = ralph.finish();
            return Ok(if ralph_outcome.success {
                StageRun::Passed
            } else {
                StageRun::Failed {
                    reason,
                    ralph_iterations: iterations,
                }
            });
        }
    }

    /// Legacy path: run the agent up to the stage cap, judging success by
    /// exit status and the plain-text completion markers.
    async fn run_stage_legacy(
        &self,
        task: &mut Task,
        stage: &PipelineStage,
        worktree: &Path,
        total_iterations: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<StageRun> {
        let mut iteration: u32 = 0;
        let mut last_output = String::from("No output");

        while iteration < stage.max_iterations && *total_iterations < self.max_total_iterations {
            iteration += 1;
            *total_iterations += 1;
            task.iteration = i64::from(*total_iterations);
            task.updated_at = Utc::now();
            self.store
                .update_task(task)
                .await
                .context("failed to persist iteration count")?;

            let context = self.load_context(task).await;
            let prompt = build_agent_prompt(
                task,
                &stage.name,
                stage.role,
                iteration,
                stage.max_iterations,
                worktree,
                &context,
            );

            let started = Instant::now();
            let outcome = self
                .runner
                .run(
                    &AgentRequest {
                        prompt,
                        working_dir: worktree.to_path_buf(),
                        allowed_tools: allowed_tools(stage.role),
                        model: Some(self.agents.model_for(stage.role)),
                        timeout: self.timeout,
                    },
                    cancel,
                )
                .await;
            let duration_ms = elapsed_ms(started);

            if cancel.is_cancelled() {
                self.log_stage(task, stage, iteration, "cancelled by shutdown signal", false, duration_ms)
                    .await;
                return Ok(StageRun::Cancelled);
            }

            let success = outcome.exit_ok || check_stage_success(&outcome.text);

            self.log_stage(task, stage, iteration, &outcome.text, success, duration_ms)
                .await;
            self.memory
                .extract(
                    &outcome.text,
                    &format!("{}:{}", stage.role, task.id),
                    &task.spec_id,
                )
                .await;

            if success {
                return Ok(StageRun::Passed);
            }
            last_output = outcome.text;
        }

        Ok(StageRun::Failed {
            reason: last_output,
            ralph_iterations: 0,
        })
    }

    async fn load_context(&self, task: &Task) -> PromptContext {
        let memory_context = self.memory.context_for_spec(&task.spec_id).await;
        PromptContext::load(&self.project_root, &task.spec_id, memory_context)
    }

    /// Best-effort execution log append; a log failure never fails the
    /// stage.
    async fn log_stage(
        &self,
        task: &Task,
        stage: &PipelineStage,
        iteration: u32,
        output: &str,
        passed: bool,
        duration_ms: i64,
    ) {
        let entry = NewExecutionLog {
            task_id: task.id.clone(),
            stage_name: stage.name.clone(),
            agent_role: stage.role,
            iteration: i64::from(iteration),
            output: output.to_owned(),
            passed,
            duration_ms,
        };
        if let Err(e) = self.store.log_execution(&entry).await {
            warn!(task_id = %task.id, error = %e, "failed to append execution log");
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Judge a legacy (non-ralph) stage by the plain-text markers in its
/// output. Explicit success markers win, then explicit failure markers,
/// then a substantial-output heuristic.
pub fn check_stage_success(output: &str) -> bool {
    let upper = output.to_uppercase();

    const SUCCESS: &[&str] = &[
        "IMPLEMENTATION COMPLETE",
        "DESIGN COMPLETE",
        "REVIEW PASSED",
        "TESTS PASSED",
        "QA PASSED",
        "STATUS: SUCCESS",
        "PASS",
    ];
    for marker in SUCCESS {
        if upper.contains(marker) {
            return true;
        }
    }

    const FAILURE: &[&str] = &[
        "BLOCKED:",
        "REVIEW FAILED",
        "TESTS FAILED",
        "QA FAILED",
        "ERROR:",
        "FAILED",
        "TIMEOUT:",
    ];
    for marker in FAILURE {
        if upper.contains(marker) {
            return false;
        }
    }

    output.len() > 100 && !output.to_lowercase().contains("error")
}

/// Truncate to at most `max` characters.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_stage_table() {
        let stages = default_pipeline();
        assert_eq!(stages.len(), 4);

        assert_eq!(stages[0].name, "Implementation");
        assert_eq!(stages[0].role, AgentRole::Coder);
        assert_eq!(stages[0].max_iterations, 3);

        assert_eq!(stages[1].name, "Code Review");
        assert_eq!(stages[1].role, AgentRole::Reviewer);
        assert_eq!(stages[1].max_iterations, 2);

        assert_eq!(stages[2].name, "Testing");
        assert_eq!(stages[2].role, AgentRole::Tester);
        assert_eq!(stages[2].max_iterations, 2);

        assert_eq!(stages[3].name, "QA Validation");
        assert_eq!(stages[3].role, AgentRole::Qa);
        assert_eq!(stages[3].max_iterations, 10);
    }

    #[test]
    fn stage_status_mapping() {
        assert_eq!(stage_status(AgentRole::Coder), TaskStatus::Implementing);
        assert_eq!(stage_status(AgentRole::Reviewer), TaskStatus::Reviewing);
        assert_eq!(stage_status(AgentRole::Tester), TaskStatus::Testing);
        // QA reuses the reviewing status.
        assert_eq!(stage_status(AgentRole::Qa), TaskStatus::Reviewing);
    }

    #[test]
    fn allowed_tools_per_role() {
        assert!(allowed_tools(AgentRole::Coder).contains(&"Write".to_owned()));
        assert!(allowed_tools(AgentRole::Qa).contains(&"Bash".to_owned()));
        assert!(!allowed_tools(AgentRole::Qa).contains(&"Write".to_owned()));
        assert!(!allowed_tools(AgentRole::Architect).contains(&"Bash".to_owned()));
    }

    #[test]
    fn legacy_markers_decide_success() {
        assert!(check_stage_success("All done. IMPLEMENTATION COMPLETE"));
        assert!(check_stage_success("status: success"));
        assert!(!check_stage_success("BLOCKED: cannot find the schema"));
        assert!(!check_stage_success("TESTS FAILED: 3 failures"));
        assert!(!check_stage_success("TIMEOUT: agent exceeded limit"));
    }

    #[test]
    fn legacy_heuristic_for_unmarked_output() {
        let long_clean = "a".repeat(200);
        assert!(check_stage_success(&long_clean));
        assert!(!check_stage_success("short"));
        let long_with_error = format!("{} error {}", "a".repeat(100), "b".repeat(100));
        assert!(!check_stage_success(&long_with_error));
    }

    #[test]
    fn truncate_chars_bounds_length() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
    }
}
