//! `specforge specs ...`: operator-facing spec management.

use anyhow::{Context, Result};

use specforge_core::project::Project;
use specforge_db::models::{Spec, SpecStatus};

use crate::SpecCommands;

pub async fn run(project: &Project, command: SpecCommands) -> Result<()> {
    match command {
        SpecCommands::List => {
            let specs = project.store.list_specs(None).await?;
            if specs.is_empty() {
                println!("No specs.");
                return Ok(());
            }
            println!("{:<20} {:<12} {:<8} TITLE", "ID", "STATUS", "SOURCE");
            for spec in specs {
                println!(
                    "{:<20} {:<12} {:<8} {}",
                    spec.id,
                    spec.status.to_string(),
                    spec.source.to_string(),
                    spec.title
                );
            }
        }
        SpecCommands::Add { id, title } => {
            let spec = Spec::new(&id, &title);
            project
                .store
                .create_spec(&spec)
                .await
                .with_context(|| format!("failed to create spec {id}"))?;
            project.ensure_spec_dir(&id)?;
            println!("Created spec {id} (draft)");
        }
        SpecCommands::Approve { id } => {
            project
                .store
                .update_spec_status(&id, SpecStatus::Approved)
                .await
                .with_context(|| format!("failed to approve spec {id}"))?;
            println!("Approved spec {id}");
        }
    }
    Ok(())
}
