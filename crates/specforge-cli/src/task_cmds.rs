//! `specforge tasks ...`: task listing, creation and tasks.md import.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use uuid::Uuid;

use specforge_core::project::Project;
use specforge_db::models::Task;

use crate::TaskCommands;

pub async fn run(project: &Project, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::List { spec, json } => {
            let tasks = project.store.list_tasks(spec.as_deref(), None).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            println!(
                "{:<20} {:<20} {:<12} {:>4} {:>4}  TITLE",
                "ID", "SPEC", "STATUS", "PRIO", "ITER"
            );
            for task in tasks {
                println!(
                    "{:<20} {:<20} {:<12} {:>4} {:>4}  {}",
                    task.id,
                    task.spec_id,
                    task.status.to_string(),
                    task.priority,
                    task.iteration,
                    task.title
                );
            }
        }
        TaskCommands::Add {
            id,
            spec,
            title,
            description,
            priority,
            deps,
            parent,
        } => {
            if project.store.get_spec(&spec).await?.is_none() {
                bail!("spec {spec} does not exist");
            }

            let id = id.unwrap_or_else(|| format!("TASK-{}", short_id()));
            let mut task = Task::new(&id, &spec, &title);
            task.description = description;
            task.priority = priority;
            if let Some(deps) = deps {
                task.dependencies = deps
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            if let Some(parent) = parent {
                task.metadata
                    .insert("parent".into(), serde_json::json!(parent));
            }
            task.updated_at = Utc::now();

            project
                .store
                .create_task(&task)
                .await
                .with_context(|| format!("failed to create task {id}"))?;
            println!("Created task {id}");
        }
        TaskCommands::Import { spec } => {
            if project.store.get_spec(&spec).await?.is_none() {
                bail!("spec {spec} does not exist");
            }
            let imported = project.import_tasks_from_md(&spec).await?;
            println!("Imported {imported} task(s) from specs/{spec}/tasks.md");
        }
    }
    Ok(())
}

/// Short random suffix for generated task ids.
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_owned()
}
