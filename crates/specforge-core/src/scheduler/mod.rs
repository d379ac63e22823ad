//! The scheduler: discovers ready tasks, claims them, pairs each with a
//! pool slot and a fresh worktree, runs pipelines in parallel workers, and
//! merges successful branches back into trunk.
//!
//! The scheduler itself is single-threaded and owns the [`AgentPool`];
//! workers communicate completion over an mpsc channel. A task that fails
//! its pipeline returns to `todo` with failure metadata and is *not*
//! retried within the same run; operators re-queue explicitly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use specforge_db::Store;
use specforge_db::models::{AgentRole, Task, TaskStatus};

use crate::merge::MergeEngine;
use crate::pipeline::{PipelineExecutor, PipelineOutcome};
use crate::pool::AgentPool;
use crate::vcs::{Vcs, task_branch};

/// How long a cancelled scheduler waits for in-flight workers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Trunk branch merged into on success.
    pub base_branch: String,
    /// Idle back-off between discovery cycles.
    pub poll_interval: Duration,
    /// Restrict scheduling to one spec, when set.
    pub spec_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_owned(),
            poll_interval: Duration::from_millis(50),
            spec_id: None,
        }
    }
}

/// What one scheduler run accomplished.
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    /// Tasks that finished their pipeline and merged cleanly.
    pub completed: Vec<String>,
    /// Tasks whose pipeline failed (reset to `todo` with metadata).
    pub failed: Vec<String>,
    /// Tasks that finished (`done`) but whose merge exhausted all tiers.
    pub merge_failed: Vec<String>,
    /// The run was stopped by the cancellation signal.
    pub interrupted: bool,
}

impl SchedulerReport {
    /// Batch exit-code convention: success only when nothing failed.
    pub fn all_succeeded(&self) -> bool {
        !self.interrupted && self.failed.is_empty() && self.merge_failed.is_empty()
    }
}

/// Message sent from a worker back to the scheduler loop.
struct WorkerDone {
    task_id: String,
    outcome: Result<PipelineOutcome>,
}

/// Drives ready tasks through pipelines and merges.
pub struct Scheduler {
    store: Store,
    vcs: Arc<dyn Vcs>,
    pipeline: Arc<PipelineExecutor>,
    merge: Arc<MergeEngine>,
    pool: AgentPool,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Store,
        vcs: Arc<dyn Vcs>,
        pipeline: Arc<PipelineExecutor>,
        merge: Arc<MergeEngine>,
        pool: AgentPool,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            vcs,
            pipeline,
            merge,
            pool,
            config,
        }
    }

    /// Observe pool events (for a TUI or logging consumer).
    pub fn subscribe_pool(&self) -> tokio::sync::broadcast::Receiver<crate::pool::PoolEvent> {
        self.pool.subscribe()
    }

    /// Run until every ready task has been attempted once and all workers
    /// have drained, or until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SchedulerReport> {
        self.reconcile_worktrees().await?;

        let capacity = self.pool.capacity().max(1);
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(capacity * 2);
        let mut in_flight: usize = 0;
        let mut attempted: HashSet<String> = HashSet::new();
        let mut report = SchedulerReport::default();

        loop {
            if cancel.is_cancelled() {
                info!("scheduler cancelled, draining in-flight workers");
                let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                while in_flight > 0 {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            self.handle_completion(done, &mut report, &cancel).await?;
                        }
                        _ => break,
                    }
                }
                if in_flight > 0 {
                    warn!(remaining = in_flight, "drain timeout expired with workers in flight");
                }
                report.interrupted = true;
                return Ok(report);
            }

            // Drain completed workers without blocking.
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                self.handle_completion(done, &mut report, &cancel).await?;
            }

            // Launch queued tasks into any freed slots.
            while self.pool.has_idle_slot() {
                let Some(task) = self.pool.dequeue() else { break };
                self.launch(task, &tx, &mut in_flight, &cancel).await?;
            }

            // Discover fresh ready tasks, priority order.
            let ready = self
                .store
                .get_ready_tasks(self.config.spec_id.as_deref())
                .await
                .context("failed to query ready tasks")?;
            let fresh: Vec<Task> = ready
                .into_iter()
                .filter(|t| !attempted.contains(&t.id))
                .collect();

            let queue_can_drain = self.pool.queued_len() > 0 && self.pool.capacity() > 0;
            if fresh.is_empty() && in_flight == 0 && !queue_can_drain {
                return Ok(report);
            }

            for task in fresh {
                attempted.insert(task.id.clone());

                // The atomic claim is what stops a concurrent scheduler
                // from double-assigning this task.
                if !self
                    .store
                    .try_claim_task(&task.id)
                    .await
                    .context("failed to claim task")?
                {
                    continue;
                }
                let mut task = match self.store.get_task(&task.id).await? {
                    Some(task) => task,
                    None => continue,
                };

                if self.pool.has_idle_slot() {
                    self.launch(task, &tx, &mut in_flight, &cancel).await?;
                } else {
                    info!(task_id = %task.id, "no idle slot, queueing task");
                    task.updated_at = Utc::now();
                    self.pool.queue(task);
                    break;
                }
            }

            // Wait for progress: a worker completing, or the idle backoff.
            if in_flight > 0 {
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight -= 1;
                            self.handle_completion(done, &mut report, &cancel).await?;
                        }
                    }
                    _ = cancel.cancelled() => continue,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancel.cancelled() => continue,
                }
            }
        }
    }

    /// Create the worktree, take a slot, and spawn the pipeline worker.
    async fn launch(
        &mut self,
        mut task: Task,
        tx: &mpsc::Sender<WorkerDone>,
        in_flight: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let worktree = match self
            .vcs
            .create_worktree(&task.id, &self.config.base_branch)
        {
            Ok(path) => path,
            Err(e) => {
                // Worktree creation fails the task start: back to todo
                // with the failure recorded for the operator.
                error!(task_id = %task.id, error = %e, "failed to create worktree");
                task.status = TaskStatus::Todo;
                task.metadata
                    .insert("failure_stage".into(), serde_json::json!("worktree"));
                task.metadata
                    .insert("failure_reason".into(), serde_json::json!(e.to_string()));
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
                return Ok(());
            }
        };

        task.worktree = Some(worktree.to_string_lossy().into_owned());
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;

        let Some(slot_id) = self
            .pool
            .assign(&task, AgentRole::Coder, &worktree.to_string_lossy())
        else {
            // All slots taken between the idle check and now; wait in line.
            self.pool.queue(task);
            return Ok(());
        };

        info!(task_id = %task.id, slot_id, "launching pipeline worker");
        *in_flight += 1;

        let pipeline = Arc::clone(&self.pipeline);
        let tx = tx.clone();
        let worker_cancel = cancel.clone();
        let task_id = task.id.clone();

        tokio::spawn(async move {
            let outcome = pipeline
                .execute_task(&task, &worktree, slot_id, &worker_cancel)
                .await;
            let _ = tx
                .send(WorkerDone {
                    task_id,
                    outcome,
                })
                .await;
        });

        Ok(())
    }

    /// Handle one finished worker: free the slot, then merge or record
    /// the failure.
    async fn handle_completion(
        &mut self,
        done: WorkerDone,
        report: &mut SchedulerReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.pool.release(&done.task_id);

        let outcome = match done.outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %done.task_id, error = %e, "pipeline worker failed");
                // Best effort: return the task to the operator's hands.
                if let Some(mut task) = self.store.get_task(&done.task_id).await? {
                    if task.status != TaskStatus::Done {
                        task.status = TaskStatus::Todo;
                        task.metadata
                            .insert("failure_stage".into(), serde_json::json!("pipeline"));
                        task.metadata
                            .insert("failure_reason".into(), serde_json::json!(e.to_string()));
                        task.updated_at = Utc::now();
                        let _ = self.store.update_task(&task).await;
                    }
                }
                report.failed.push(done.task_id);
                return Ok(());
            }
        };

        if outcome.cancelled {
            info!(task_id = %done.task_id, "worker exited on cancellation");
            return Ok(());
        }

        if !outcome.success {
            info!(task_id = %done.task_id, "pipeline failed, task returned to todo");
            report.failed.push(done.task_id);
            return Ok(());
        }

        // Pipeline succeeded: fold the branch into trunk.
        let merge_report = self
            .merge
            .merge_task(&done.task_id, &self.config.base_branch, cancel)
            .await
            .context("merge engine failed")?;

        if merge_report.success {
            info!(
                task_id = %done.task_id,
                tier = ?merge_report.tier,
                "task merged into {}",
                self.config.base_branch
            );
            if let Err(e) = self.vcs.remove_worktree(&done.task_id, true) {
                warn!(task_id = %done.task_id, error = %e, "failed to remove worktree");
            }
            if let Err(e) = self.vcs.delete_branch(&task_branch(&done.task_id)) {
                warn!(task_id = %done.task_id, error = %e, "failed to delete task branch");
            }
            if let Some(mut task) = self.store.get_task(&done.task_id).await? {
                task.worktree = None;
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
            }
            report.completed.push(done.task_id);
        } else {
            // The branch and worktree stay for a manual merge; the task
            // remains done.
            warn!(
                task_id = %done.task_id,
                message = %merge_report.message,
                "merge failed, branch preserved for manual merge"
            );
            if let Some(mut task) = self.store.get_task(&done.task_id).await? {
                task.metadata
                    .insert("merge_failed".into(), serde_json::json!(true));
                task.metadata.insert(
                    "merge_failure_reason".into(),
                    serde_json::json!(merge_report.message),
                );
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
            }
            report.merge_failed.push(done.task_id);
        }

        Ok(())
    }

    /// Startup reconciliation: the store is the source of truth, so any
    /// worktree whose task is not in an active status is an orphan left by
    /// a crash and gets removed. Task status is never reconstructed from
    /// the filesystem.
    async fn reconcile_worktrees(&self) -> Result<()> {
        let worktrees = match self.vcs.list_worktrees() {
            Ok(worktrees) => worktrees,
            Err(e) => {
                warn!(error = %e, "failed to list worktrees during reconciliation");
                return Ok(());
            }
        };

        for info in worktrees {
            let Some(task_id) = info
                .branch
                .as_deref()
                .and_then(|b| b.strip_prefix("task/"))
            else {
                continue;
            };

            let active = self
                .store
                .get_task(task_id)
                .await?
                .map(|t| t.status.is_active())
                .unwrap_or(false);

            if !active {
                info!(task_id, path = %info.path.display(), "removing orphan worktree");
                if let Err(e) = self.vcs.remove_worktree(task_id, true) {
                    warn!(task_id, error = %e, "failed to remove orphan worktree");
                }
            }
        }

        Ok(())
    }
}
