//! `specforge status`: a compact overview of specs, tasks and active
//! agents.

use anyhow::Result;

use specforge_core::project::Project;
use specforge_db::models::TaskStatus;

pub async fn run(project: &Project) -> Result<()> {
    println!("Project: {}", project.config.project.name);
    println!("Root:    {}", project.root.display());

    let specs = project.store.list_specs(None).await?;
    println!("\nSpecs ({}):", specs.len());
    for spec in &specs {
        println!("  {:<20} {:<12} {}", spec.id, spec.status.to_string(), spec.title);
    }

    let tasks = project.store.list_tasks(None, None).await?;
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.status.to_string()).or_default() += 1;
    }
    println!("\nTasks ({} total):", tasks.len());
    for (status, count) in &counts {
        println!("  {status:<12} {count}");
    }

    let ready = project.store.get_ready_tasks(None).await?;
    println!("  {:<12} {}", "ready", ready.len());

    let active: Vec<_> = tasks
        .iter()
        .filter(|t| matches!(
            t.status,
            TaskStatus::Implementing | TaskStatus::Reviewing | TaskStatus::Testing
        ))
        .collect();
    if !active.is_empty() {
        println!("\nIn flight:");
        for task in active {
            println!(
                "  {:<20} {:<12} iter {}",
                task.id,
                task.status.to_string(),
                task.iteration
            );
        }
    }

    let agents = project.store.list_agents().await?;
    if !agents.is_empty() {
        println!("\nActive agents:");
        for agent in agents {
            println!(
                "  slot {:<3} {:<10} {:<20} {}",
                agent.slot_id,
                agent.agent_role.to_string(),
                agent.task_id,
                agent.worktree_path
            );
        }
    }

    Ok(())
}
