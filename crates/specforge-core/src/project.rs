//! Project lifecycle: scaffolding, loading, and spec-directory helpers.
//!
//! A project is a directory carrying a `.specforge/` state dir (config,
//! constitution, database, JSONL mirror), a `specs/` tree, and a worktree
//! root. Everything the pipeline and scheduler need is wired up here and
//! passed down explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::info;

use specforge_db::Store;
use specforge_db::models::{Task, TaskStatus};
use specforge_db::sync::JsonlMirror;

use crate::config::{
    APP_DIR, CONFIG_FILE, CONSTITUTION_FILE, SYNC_FILE, SpecforgeConfig, find_project_root,
};
use crate::memory::EntityMemory;

const CONSTITUTION_TEMPLATE: &str = "\
# Project Constitution

Principles every agent must follow when working on {project_name}:

1. Prefer small, reviewable changes.
2. Keep the test suite green; add tests with every behaviour change.
3. Follow the existing code conventions of the repository.
4. Record significant decisions in your output as `Decision: ...` lines.
";

/// An opened project: root directory, configuration, store, and memory.
pub struct Project {
    pub root: PathBuf,
    pub config: SpecforgeConfig,
    pub store: Store,
    pub memory: Arc<EntityMemory>,
}

impl Project {
    /// Scaffold a new project at `path` and open it.
    ///
    /// Creates `.specforge/` (config, constitution, database, memory),
    /// `specs/`, and the worktree root with its self-ignoring
    /// `.gitignore`. Existing files are left untouched.
    pub async fn init(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        let app_dir = root.join(APP_DIR);

        for dir in [
            app_dir.clone(),
            app_dir.join("memory"),
            root.join("specs"),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let config_path = app_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let mut config = SpecforgeConfig::default();
            config.project.name = root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed-project")
                .to_owned();
            config
                .save(&config_path)
                .context("failed to write default config")?;
        }
        let config = SpecforgeConfig::load(&config_path)?;

        let worktree_dir = root.join(&config.execution.worktree_dir);
        std::fs::create_dir_all(&worktree_dir)
            .with_context(|| format!("failed to create {}", worktree_dir.display()))?;
        let gitignore = worktree_dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n!.gitignore\n")
                .context("failed to write worktree .gitignore")?;
        }

        let constitution = app_dir.join(CONSTITUTION_FILE);
        if !constitution.exists() {
            std::fs::write(
                &constitution,
                CONSTITUTION_TEMPLATE.replace("{project_name}", &config.project.name),
            )
            .context("failed to write constitution template")?;
        }

        let project = Self::open(root, config).await?;
        info!(root = %project.root.display(), "project initialised");
        Ok(project)
    }

    /// Load an existing project, searching upwards from `start` (or the
    /// current directory) for the `.specforge/` marker.
    pub async fn load(start: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let start = start.unwrap_or(&cwd);
        let Some(root) = find_project_root(start) else {
            bail!(
                "not a specforge project (no {APP_DIR} directory found from {})",
                start.display()
            );
        };

        let config = SpecforgeConfig::load(&root.join(APP_DIR).join(CONFIG_FILE))?;
        let project = Self::open(root, config).await?;

        // Pick up records synced from other machines through the mirror.
        if project.config.database.sync_jsonl {
            let jsonl = project.sync_path();
            if jsonl.exists() {
                let imported = project.store.import_jsonl(&jsonl).await?;
                if imported > 0 {
                    info!(imported, "replayed JSONL mirror records");
                }
            }
        }

        Ok(project)
    }

    async fn open(root: PathBuf, config: SpecforgeConfig) -> Result<Self> {
        let db_path = root.join(&config.database.path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut store = Store::open(&db_path)
            .await
            .context("failed to open project database")?;
        if config.database.sync_jsonl {
            store = store.with_mirror(JsonlMirror::new(root.join(APP_DIR).join(SYNC_FILE)));
        }

        let memory = Arc::new(EntityMemory::open(root.join(APP_DIR).join("memory")));

        Ok(Self {
            root,
            config,
            store,
            memory,
        })
    }

    pub fn sync_path(&self) -> PathBuf {
        self.root.join(APP_DIR).join(SYNC_FILE)
    }

    /// Directory holding a spec's documents.
    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.root.join("specs").join(spec_id)
    }

    /// Create a spec's directory skeleton and return its path.
    pub fn ensure_spec_dir(&self, spec_id: &str) -> Result<PathBuf> {
        let dir = self.spec_dir(spec_id);
        for sub in ["implementation", "qa"] {
            std::fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("failed to create {}", dir.join(sub).display()))?;
        }
        Ok(dir)
    }

    /// Import tasks from `specs/<spec_id>/tasks.md`, then rename the file
    /// to `tasks.md.legacy` so the import happens exactly once.
    ///
    /// Recognised line format:
    ///
    /// ```text
    /// - [ ] TASK-ID: Title | deps: A,B | priority: 5
    /// - [x] DONE-ID: Already finished
    /// ```
    pub async fn import_tasks_from_md(&self, spec_id: &str) -> Result<usize> {
        let tasks_file = self.spec_dir(spec_id).join("tasks.md");
        if !tasks_file.exists() {
            return Ok(0);
        }

        let content = std::fs::read_to_string(&tasks_file)
            .with_context(|| format!("failed to read {}", tasks_file.display()))?;

        let mut imported = 0usize;
        for line in content.lines() {
            let Some(parsed) = parse_task_line(line, spec_id) else {
                continue;
            };
            if self.store.get_task(&parsed.id).await?.is_some() {
                continue;
            }
            self.store.create_task(&parsed).await?;
            imported += 1;
        }

        let legacy = tasks_file.with_extension("md.legacy");
        std::fs::rename(&tasks_file, &legacy)
            .with_context(|| format!("failed to rename {}", tasks_file.display()))?;

        info!(spec_id, imported, "imported tasks from tasks.md");
        Ok(imported)
    }
}

/// Parse one `- [ ] ID: Title | deps: ... | priority: N` checklist line.
fn parse_task_line(line: &str, spec_id: &str) -> Option<Task> {
    let trimmed = line.trim();
    let (done, rest) = if let Some(rest) = trimmed.strip_prefix("- [ ] ") {
        (false, rest)
    } else if let Some(rest) = trimmed.strip_prefix("- [x] ") {
        (true, rest)
    } else {
        return None;
    };

    let mut fields = rest.split('|').map(str::trim);
    let head = fields.next()?;
    let (id, title) = head.split_once(':')?;
    let id = id.trim();
    let title = title.trim();
    if id.is_empty() || title.is_empty() {
        return None;
    }

    let mut task = Task::new(id, spec_id, title);
    task.status = if done { TaskStatus::Done } else { TaskStatus::Todo };
    task.updated_at = Utc::now();

    for field in fields {
        if let Some(deps) = field.strip_prefix("deps:") {
            task.dependencies = deps
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        } else if let Some(priority) = field.strip_prefix("priority:") {
            if let Ok(value) = priority.trim().parse::<i64>() {
                task.priority = value;
            }
        }
    }

    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specforge_db::models::{Spec, SpecStatus};

    #[tokio::test]
    async fn init_scaffolds_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = Project::init(dir.path()).await.expect("init");

        assert!(dir.path().join(APP_DIR).join(CONFIG_FILE).exists());
        assert!(dir.path().join(APP_DIR).join(CONSTITUTION_FILE).exists());
        assert!(dir.path().join("specs").exists());
        let gitignore = dir.path().join(".worktrees").join(".gitignore");
        assert_eq!(
            std::fs::read_to_string(gitignore).expect("read"),
            "*\n!.gitignore\n"
        );
        assert_eq!(
            project.config.project.name,
            dir.path().file_name().unwrap().to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        Project::init(dir.path()).await.expect("first init");

        // Customise the config, re-init, and confirm it survives.
        let config_path = dir.path().join(APP_DIR).join(CONFIG_FILE);
        let mut config = SpecforgeConfig::load(&config_path).expect("load");
        config.agents.max_parallel = 2;
        config.save(&config_path).expect("save");

        let project = Project::init(dir.path()).await.expect("second init");
        assert_eq!(project.config.agents.max_parallel, 2);
    }

    #[tokio::test]
    async fn load_finds_root_from_nested_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        Project::init(dir.path()).await.expect("init");
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let project = Project::load(Some(&nested)).await.expect("load");
        assert_eq!(
            project.root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn load_outside_project_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Project::load(Some(dir.path())).await.is_err());
    }

    #[tokio::test]
    async fn tasks_md_import_renames_and_creates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = Project::init(dir.path()).await.expect("init");

        let mut spec = Spec::new("spec-1", "A spec");
        spec.status = SpecStatus::Approved;
        project.store.create_spec(&spec).await.expect("spec");

        let spec_dir = project.ensure_spec_dir("spec-1").expect("spec dir");
        std::fs::write(
            spec_dir.join("tasks.md"),
            "# Tasks\n\
             - [ ] AUTH-001: Add login | priority: 5\n\
             - [ ] AUTH-002: Add logout | deps: AUTH-001 | priority: 3\n\
             - [x] SETUP-001: Scaffold project\n\
             not a task line\n",
        )
        .expect("write tasks.md");

        let imported = project.import_tasks_from_md("spec-1").await.expect("import");
        assert_eq!(imported, 3);
        assert!(!spec_dir.join("tasks.md").exists());
        assert!(spec_dir.join("tasks.md.legacy").exists());

        let login = project
            .store
            .get_task("AUTH-001")
            .await
            .unwrap()
            .expect("task");
        assert_eq!(login.priority, 5);
        assert_eq!(login.status, TaskStatus::Todo);

        let logout = project
            .store
            .get_task("AUTH-002")
            .await
            .unwrap()
            .expect("task");
        assert_eq!(logout.dependencies, vec!["AUTH-001".to_owned()]);

        let setup = project
            .store
            .get_task("SETUP-001")
            .await
            .unwrap()
            .expect("task");
        assert_eq!(setup.status, TaskStatus::Done);

        // A second import is a no-op: the file is gone.
        let again = project.import_tasks_from_md("spec-1").await.expect("import");
        assert_eq!(again, 0);
    }

    #[test]
    fn parse_task_line_variants() {
        assert!(parse_task_line("random prose", "s").is_none());
        assert!(parse_task_line("- [ ] no-colon-title", "s").is_none());

        let task = parse_task_line("- [ ] T-1: Do it | deps: A, B | priority: 9", "s").unwrap();
        assert_eq!(task.id, "T-1");
        assert_eq!(task.title, "Do it");
        assert_eq!(task.dependencies, vec!["A".to_owned(), "B".to_owned()]);
        assert_eq!(task.priority, 9);
    }
}
