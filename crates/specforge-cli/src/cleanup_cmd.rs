//! `specforge cleanup`: remove worktrees whose tasks are no longer
//! active.

use anyhow::{Context, Result};

use specforge_core::project::Project;
use specforge_core::vcs::{GitVcs, Vcs};

pub async fn run(project: &Project, force: bool) -> Result<()> {
    let vcs = GitVcs::new(&project.root, &project.config.execution.worktree_dir)
        .context("project root must be a git repository")?;

    let mut removed = 0usize;
    let mut kept = 0usize;

    for info in vcs.list_worktrees()? {
        let Some(task_id) = info.branch.as_deref().and_then(|b| b.strip_prefix("task/")) else {
            continue;
        };

        let active = project
            .store
            .get_task(task_id)
            .await?
            .map(|t| t.status.is_active())
            .unwrap_or(false);
        if active {
            kept += 1;
            continue;
        }

        match vcs.remove_worktree(task_id, force) {
            Ok(()) => {
                println!("Removed worktree for task {task_id}");
                removed += 1;
            }
            Err(e) => {
                println!("Kept worktree for task {task_id}: {e}");
                kept += 1;
            }
        }
    }

    println!("Removed {removed} worktree(s), kept {kept}.");
    Ok(())
}
