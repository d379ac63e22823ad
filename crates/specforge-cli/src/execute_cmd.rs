//! `specforge execute` and `specforge merge`: drive pipelines and merges.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use specforge_core::memory::MemorySink;
use specforge_core::merge::MergeEngine;
use specforge_core::pipeline::PipelineExecutor;
use specforge_core::pool::AgentPool;
use specforge_core::project::Project;
use specforge_core::runner::{AgentRunner, ClaudeRunner};
use specforge_core::scheduler::{Scheduler, SchedulerConfig};
use specforge_core::vcs::{GitVcs, Vcs, task_branch};
use specforge_db::Store;
use specforge_db::models::{Task, TaskStatus};

/// Timeout for merge-resolution agent invocations.
const MERGE_TIMEOUT: Duration = Duration::from_secs(300);

struct Runtime {
    vcs: Arc<GitVcs>,
    pipeline: Arc<PipelineExecutor>,
    merge: Arc<MergeEngine>,
}

fn build_runtime(project: &Project) -> Result<Runtime> {
    let vcs = Arc::new(
        GitVcs::new(&project.root, &project.config.execution.worktree_dir)
            .context("project root must be a git repository")?,
    );
    let runner: Arc<dyn AgentRunner> = Arc::new(ClaudeRunner::new());

    let pipeline = Arc::new(PipelineExecutor::new(
        project.store.clone(),
        Arc::clone(&runner),
        Arc::clone(&project.memory) as Arc<dyn MemorySink>,
        &project.root,
        &project.config,
    ));
    let merge = Arc::new(MergeEngine::new(
        Arc::clone(&vcs) as Arc<dyn Vcs>,
        runner,
        MERGE_TIMEOUT,
    ));

    Ok(Runtime {
        vcs,
        pipeline,
        merge,
    })
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling workers");
            trigger.cancel();
        }
    });
    cancel
}

pub async fn run(
    project: &Project,
    task_id: Option<String>,
    all: bool,
    spec: Option<String>,
    base_branch: String,
) -> Result<ExitCode> {
    let runtime = build_runtime(project)?;
    let cancel = cancel_on_ctrl_c();

    if all {
        return run_all(project, runtime, spec, base_branch, cancel).await;
    }

    let Some(task_id) = task_id else {
        bail!("provide a task id or --all");
    };
    run_single(project, runtime, &task_id, &base_branch, cancel).await
}

/// Batch mode: scheduler over every ready task. Exit code 0 only when all
/// executed tasks succeeded.
async fn run_all(
    project: &Project,
    runtime: Runtime,
    spec: Option<String>,
    base_branch: String,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let mut scheduler = Scheduler::new(
        project.store.clone(),
        runtime.vcs as Arc<dyn Vcs>,
        runtime.pipeline,
        runtime.merge,
        AgentPool::new(project.config.agents.max_parallel),
        SchedulerConfig {
            base_branch,
            poll_interval: Duration::from_millis(250),
            spec_id: spec,
        },
    );

    let report = scheduler.run(cancel).await?;

    println!("Completed:    {}", report.completed.len());
    for id in &report.completed {
        println!("  {id}");
    }
    if !report.merge_failed.is_empty() {
        println!("Merge failed: {}", report.merge_failed.len());
        for id in &report.merge_failed {
            println!("  {id} (branch preserved)");
        }
    }
    if !report.failed.is_empty() {
        println!("Failed:       {}", report.failed.len());
        for id in &report.failed {
            println!("  {id}");
        }
    }
    if report.interrupted {
        println!("Interrupted by shutdown signal.");
    }

    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Execute one task end to end: claim, worktree, pipeline, merge.
async fn run_single(
    project: &Project,
    runtime: Runtime,
    task_id: &str,
    base_branch: &str,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let Some(task) = project.store.get_task(task_id).await? else {
        bail!("task {task_id} not found");
    };

    // Re-running a finished task is a no-op, not an error.
    if task.status == TaskStatus::Done {
        println!("Task {task_id} is already done.");
        return Ok(ExitCode::SUCCESS);
    }

    // The claim below is a status-only compare-and-set; it does not look
    // at the owning spec or the dependency graph. Enforce readiness here
    // the same way the scheduler's ready query does.
    check_task_ready(&project.store, &task).await?;

    if !project.store.try_claim_task(task_id).await? {
        bail!("task {task_id} is no longer claimable (another scheduler may have taken it)");
    }
    let mut task = project
        .store
        .get_task(task_id)
        .await?
        .context("claimed task vanished")?;

    let worktree = runtime
        .vcs
        .create_worktree(task_id, base_branch)
        .context("failed to create worktree")?;
    task.worktree = Some(worktree.to_string_lossy().into_owned());
    task.updated_at = Utc::now();
    project.store.update_task(&task).await?;

    let outcome = runtime
        .pipeline
        .execute_task(&task, &worktree, 1, &cancel)
        .await?;

    if outcome.cancelled {
        println!("Execution cancelled; task left as-is for inspection.");
        return Ok(ExitCode::FAILURE);
    }
    if !outcome.success {
        let failure = outcome.failure.as_ref();
        println!(
            "Task {task_id} failed at {} ({} iteration(s)); reset to todo.",
            failure.map(|f| f.stage.as_str()).unwrap_or("unknown stage"),
            outcome.total_iterations,
        );
        return Ok(ExitCode::FAILURE);
    }

    println!(
        "Task {task_id} passed all stages in {} iteration(s); merging.",
        outcome.total_iterations
    );
    finish_merge(project, &runtime, task_id, base_branch, &cancel).await
}

/// Validate that a task is genuinely ready to execute: status `todo`,
/// owning spec approved or further, and every dependency `done`.
async fn check_task_ready(store: &Store, task: &Task) -> Result<()> {
    if task.status != TaskStatus::Todo {
        bail!(
            "task {} is not schedulable: status is {}, expected todo",
            task.id,
            task.status
        );
    }

    let spec = store
        .get_spec(&task.spec_id)
        .await?
        .with_context(|| format!("spec {} not found", task.spec_id))?;
    if !spec.status.is_approved() {
        bail!(
            "cannot execute task {}: spec {} has status {}, expected approved or further",
            task.id,
            spec.id,
            spec.status
        );
    }

    for dep_id in &task.dependencies {
        let dep = store
            .get_task(dep_id)
            .await?
            .with_context(|| format!("dependency task {dep_id} not found"))?;
        if dep.status != TaskStatus::Done {
            bail!(
                "cannot execute task {}: dependency {} has status {}, expected done",
                task.id,
                dep_id,
                dep.status
            );
        }
    }

    Ok(())
}

/// Merge a completed task's branch; used by both `execute` and `merge`.
async fn finish_merge(
    project: &Project,
    runtime: &Runtime,
    task_id: &str,
    base_branch: &str,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let report = runtime.merge.merge_task(task_id, base_branch, cancel).await?;

    let Some(mut task) = project.store.get_task(task_id).await? else {
        bail!("task {task_id} not found");
    };

    if report.success {
        if let Err(e) = runtime.vcs.remove_worktree(task_id, true) {
            tracing::warn!(task_id, error = %e, "failed to remove worktree");
        }
        if let Err(e) = runtime.vcs.delete_branch(&task_branch(task_id)) {
            tracing::warn!(task_id, error = %e, "failed to delete task branch");
        }
        task.worktree = None;
        task.updated_at = Utc::now();
        project.store.update_task(&task).await?;
        println!("Merged task {task_id} into {base_branch}: {}", report.message);
        Ok(ExitCode::SUCCESS)
    } else {
        task.metadata
            .insert("merge_failed".into(), serde_json::json!(true));
        task.metadata.insert(
            "merge_failure_reason".into(),
            serde_json::json!(report.message),
        );
        task.updated_at = Utc::now();
        project.store.update_task(&task).await?;
        println!(
            "Merge failed for task {task_id}: {}. Branch task/{task_id} preserved.",
            report.message
        );
        Ok(ExitCode::FAILURE)
    }
}

/// `specforge merge <task>`: manual merge of a completed task's branch.
pub async fn run_merge(project: &Project, task_id: &str, base_branch: &str) -> Result<ExitCode> {
    let runtime = build_runtime(project)?;
    let cancel = cancel_on_ctrl_c();

    let Some(task) = project.store.get_task(task_id).await? else {
        bail!("task {task_id} not found");
    };
    if task.status != TaskStatus::Done {
        bail!(
            "task {task_id} has status {}; only done tasks can be merged",
            task.status
        );
    }

    finish_merge(project, &runtime, task_id, base_branch, &cancel).await
}
