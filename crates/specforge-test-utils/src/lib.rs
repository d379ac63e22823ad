//! Shared fixtures for specforge tests: throwaway SQLite stores and
//! scratch git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use specforge_db::models::{CompletionCriteria, CompletionSpec, Spec, SpecStatus, Task};
use specforge_db::models::{AgentRole, VerificationMethod};
use specforge_db::Store;

/// Create a store backed by a file in a fresh temp directory.
///
/// A file-backed store (rather than `:memory:`) lets concurrent workers in
/// scheduler tests share the database through the pool. The `TempDir` must
/// be kept alive for the duration of the test.
pub async fn temp_store() -> (Store, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = Store::open(&dir.path().join("specforge.db"))
        .await
        .expect("failed to open temp store");
    (store, dir)
}

/// Create an in-memory store for single-connection tests.
pub async fn memory_store() -> Store {
    Store::in_memory().await.expect("failed to open memory store")
}

/// Insert an approved spec with the given id.
pub async fn approved_spec(store: &Store, id: &str) -> Spec {
    let mut spec = Spec::new(id, format!("Spec {id}"));
    spec.status = SpecStatus::Approved;
    store.create_spec(&spec).await.expect("failed to create spec");
    spec
}

/// Insert a `todo` task with the given priority and dependencies.
pub async fn todo_task(
    store: &Store,
    spec_id: &str,
    id: &str,
    priority: i64,
    dependencies: &[&str],
) -> Task {
    let mut task = Task::new(id, spec_id, format!("Task {id}"));
    task.priority = priority;
    task.dependencies = dependencies.iter().map(|s| (*s).to_owned()).collect();
    store.create_task(&task).await.expect("failed to create task");
    task
}

/// A completion spec whose coder stage verifies by string match against the
/// given promise. Convenient for pipeline tests with scripted runners.
pub fn string_match_completion(promise: &str) -> CompletionSpec {
    let mut spec = CompletionSpec::default();
    spec.outcome = "Task is complete".to_owned();
    spec.criteria.insert(
        AgentRole::Coder,
        CompletionCriteria::new(promise, VerificationMethod::StringMatch),
    );
    spec
}

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

/// A scratch git repository with an initial commit on `main`.
///
/// Dropping the fixture deletes the repository.
pub struct TempGitRepo {
    dir: TempDir,
    path: PathBuf,
}

impl TempGitRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        git(&path, &["init", "--initial-branch=main"]);
        git(&path, &["config", "user.email", "test@specforge.dev"]);
        git(&path, &["config", "user.name", "Specforge Test"]);
        std::fs::write(path.join("README.md"), "# Test repo\n").expect("failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file and commit it on the currently checked-out branch.
    pub fn commit_file(&self, relative: &str, contents: &str, message: &str) {
        let full = self.path.join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::write(&full, contents).expect("failed to write file");
        git(&self.path, &["add", relative]);
        git(&self.path, &["commit", "-m", message]);
    }

    /// Write and commit a file inside an arbitrary working directory that
    /// belongs to this repository (e.g. a worktree).
    pub fn commit_file_in(&self, workdir: &Path, relative: &str, contents: &str, message: &str) {
        let full = workdir.join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::write(&full, contents).expect("failed to write file");
        git(workdir, &["add", relative]);
        git(workdir, &["commit", "-m", message]);
    }

    pub fn checkout(&self, branch: &str) {
        git(&self.path, &["checkout", branch]);
    }

    /// Current contents of a file in the main working directory.
    pub fn read_file(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path.join(relative)).expect("failed to read file")
    }

    /// Keep the underlying TempDir alive explicitly (silences drop-order
    /// footguns in tests that move the path out).
    pub fn into_parts(self) -> (TempDir, PathBuf) {
        (self.dir, self.path)
    }
}

impl Default for TempGitRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a git command in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}
