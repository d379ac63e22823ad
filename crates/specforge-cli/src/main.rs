mod cleanup_cmd;
mod execute_cmd;
mod log_cmd;
mod spec_cmds;
mod status_cmd;
mod task_cmds;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use specforge_core::project::Project;

#[derive(Parser)]
#[command(name = "specforge", about = "Spec-driven development orchestrator for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialise a specforge project in a directory
    Init {
        /// Project directory (default: current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show project status: specs, tasks, and active agents
    Status,
    /// Spec management
    Specs {
        #[command(subcommand)]
        command: SpecCommands,
    },
    /// Task management
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Execute one ready task, or all of them
    Execute {
        /// Task ID to execute
        task_id: Option<String>,
        /// Execute every ready task until none remain
        #[arg(long)]
        all: bool,
        /// Restrict to one spec
        #[arg(long)]
        spec: Option<String>,
        /// Trunk branch to merge into
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Merge a completed task's branch into trunk
    Merge {
        /// Task ID whose branch should be merged
        task_id: String,
        /// Trunk branch to merge into
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Show the execution log for a task
    Log {
        /// Task ID to show log entries for
        task_id: String,
    },
    /// Remove worktrees whose tasks are no longer active
    Cleanup {
        /// Remove worktrees even when they have uncommitted changes
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum SpecCommands {
    /// List specs
    List,
    /// Create a spec (starts in draft)
    Add {
        /// Spec ID
        id: String,
        /// Spec title
        title: String,
    },
    /// Approve a spec, authorising its tasks to execute
    Approve {
        /// Spec ID to approve
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// List tasks
    List {
        /// Restrict to one spec
        #[arg(long)]
        spec: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Create a task
    Add {
        /// Task ID (generated when omitted)
        id: Option<String>,
        /// Owning spec ID
        #[arg(long)]
        spec: String,
        /// Task title
        #[arg(long)]
        title: String,
        /// Detailed description
        #[arg(long, default_value = "")]
        description: String,
        /// Priority (higher runs first)
        #[arg(long, default_value_t = 1)]
        priority: i64,
        /// Comma-separated dependency task IDs
        #[arg(long)]
        deps: Option<String>,
        /// Parent task that spawned this follow-up
        #[arg(long)]
        parent: Option<String>,
    },
    /// Import tasks from specs/<spec>/tasks.md (renames it to .legacy)
    Import {
        /// Spec whose tasks.md should be imported
        spec: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            let path = match path {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let project = Project::init(&path).await?;
            println!("Initialised specforge project at {}", project.root.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let project = Project::load(None).await?;
            status_cmd::run(&project).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Specs { command } => {
            let project = Project::load(None).await?;
            spec_cmds::run(&project, command).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tasks { command } => {
            let project = Project::load(None).await?;
            task_cmds::run(&project, command).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Execute {
            task_id,
            all,
            spec,
            base_branch,
        } => {
            let project = Project::load(None).await?;
            execute_cmd::run(&project, task_id, all, spec, base_branch).await
        }
        Commands::Merge {
            task_id,
            base_branch,
        } => {
            let project = Project::load(None).await?;
            execute_cmd::run_merge(&project, &task_id, &base_branch).await
        }
        Commands::Log { task_id } => {
            let project = Project::load(None).await?;
            log_cmd::run(&project, &task_id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup { force } => {
            let project = Project::load(None).await?;
            cleanup_cmd::run(&project, force).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
