//! `specforge log <task>`: print a task's execution log.

use anyhow::{Result, bail};

use specforge_core::project::Project;

pub async fn run(project: &Project, task_id: &str) -> Result<()> {
    if project.store.get_task(task_id).await?.is_none() {
        bail!("task {task_id} not found");
    }

    let entries = project.store.list_executions(task_id).await?;
    if entries.is_empty() {
        println!("No execution log entries for task {task_id}.");
        return Ok(());
    }

    for entry in entries {
        let verdict = if entry.passed { "pass" } else { "fail" };
        println!(
            "[{}] {} iter {} ({}) {} {}ms",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.stage_name,
            entry.iteration,
            entry.agent_role,
            verdict,
            entry.duration_ms
        );
        for line in entry.output.lines().take(10) {
            println!("    {line}");
        }
        if entry.output.lines().count() > 10 {
            println!("    ...");
        }
    }

    Ok(())
}
