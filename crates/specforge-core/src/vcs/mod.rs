//! Git worktree and branch management for task isolation.
//!
//! Each task runs in its own worktree on a dedicated `task/<task_id>`
//! branch, giving filesystem isolation without full clones. Worktrees share
//! the object store of the main repository but have independent working
//! directories and index files.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), so all
//! mutating operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during VCS operations.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The project root does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The base branch a worktree should be created from does not exist.
    #[error("base branch does not exist: {0}")]
    MissingBaseBranch(String),

    /// A worktree has uncommitted changes and removal was not forced.
    #[error("worktree for task {0} has uncommitted changes")]
    DirtyWorktree(String),

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Outcome of a merge attempt. `Conflicted` leaves the working copy in the
/// conflicted mid-merge state for a resolution tier to pick up; `Error`
/// guarantees any in-progress merge was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Success,
    Conflicted(Vec<String>),
    Error(String),
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head: String,
}

/// Author identity for commits made on a task branch.
#[derive(Debug, Clone)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "specforge".to_owned(),
            email: "specforge@localhost".to_owned(),
        }
    }
}

/// The branch name for a task's worktree.
pub fn task_branch(task_id: &str) -> String {
    format!("task/{task_id}")
}

/// Working-copy and branch operations needed by the pipeline, scheduler
/// and merge engine. Object-safe so tests and the merge engine can run
/// against fixtures.
pub trait Vcs: Send + Sync {
    /// Project root (the trunk checkout).
    fn root(&self) -> &Path;

    /// The path a task's worktree lives at (whether or not it exists).
    fn worktree_path(&self, task_id: &str) -> PathBuf;

    /// Create a fresh worktree for a task on branch `task/<task_id>`
    /// rooted at `base_branch`.
    ///
    /// Idempotent by destruction: an existing worktree or branch for the
    /// task is removed first, so the returned tree never carries state
    /// from a previous run. Fails if `base_branch` does not exist.
    fn create_worktree(&self, task_id: &str, base_branch: &str) -> Result<PathBuf, VcsError>;

    /// Remove a task's worktree. Fails when dirty unless `force` is set.
    /// A missing worktree is a no-op.
    fn remove_worktree(&self, task_id: &str, force: bool) -> Result<(), VcsError>;

    /// Whether the task's worktree has uncommitted changes (including
    /// untracked files). A missing worktree reports `false`.
    fn has_uncommitted_changes(&self, task_id: &str) -> Result<bool, VcsError>;

    /// Stage everything in the task's worktree and commit. Returns the new
    /// commit id.
    fn commit_all(
        &self,
        task_id: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, VcsError>;

    /// List all worktrees registered with the repository.
    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, VcsError>;

    fn branch_exists(&self, name: &str) -> Result<bool, VcsError>;

    /// Force-delete a branch. Deleting a missing branch is a no-op.
    fn delete_branch(&self, name: &str) -> Result<(), VcsError>;

    /// Contents of a file as committed on a branch, or `None` when the
    /// file does not exist there.
    fn show_file_at(&self, branch: &str, relative_path: &str) -> Result<Option<String>, VcsError>;

    /// Attempt a non-fast-forward merge of `source` into `target` in the
    /// main working directory. See [`MergeAttempt`] for the contract.
    fn merge(&self, source: &str, target: &str) -> Result<MergeAttempt, VcsError>;

    /// Abort an in-progress merge. No-op when no merge is in progress.
    fn abort_merge(&self) -> Result<(), VcsError>;

    /// Stage the given paths in the main working directory.
    fn stage(&self, paths: &[String]) -> Result<(), VcsError>;

    /// Conclude an in-progress merge with a commit.
    fn commit_merge(&self, message: &str) -> Result<(), VcsError>;
}

// ---------------------------------------------------------------------------
// GitVcs
// ---------------------------------------------------------------------------

/// [`Vcs`] implementation that shells out to the `git` binary.
#[derive(Debug)]
pub struct GitVcs {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    /// Serialises mutating git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for GitVcs {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl GitVcs {
    /// Create a `GitVcs` rooted at `repo_path`, placing worktrees under
    /// `repo_path/<worktree_dir>`.
    ///
    /// Returns [`VcsError::NotAGitRepo`] if `repo_path` is not a git
    /// repository.
    pub fn new(repo_path: impl Into<PathBuf>, worktree_dir: &str) -> Result<Self, VcsError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| VcsError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(VcsError::NotAGitRepo(repo_path));
        }

        let worktree_base = repo_path.join(worktree_dir);

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Base directory worktrees are created under.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    fn run_git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output, VcsError> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| VcsError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    /// Run git in the main repo, mapping non-zero exits to `GitExit`.
    fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output, VcsError> {
        let output = self.run_git(cwd, args)?;
        if !output.status.success() {
            return Err(VcsError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output)
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.run_git(&self.repo_path, &["worktree", "prune"]);
    }

    fn dirty(&self, workdir: &Path) -> Result<bool, VcsError> {
        let output = self.git_ok(workdir, &["status", "--porcelain"])?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    /// Paths currently in the unmerged (conflicted) state.
    fn conflicted_paths(&self) -> Result<Vec<String>, VcsError> {
        let output = self.git_ok(
            &self.repo_path,
            &["diff", "--name-only", "--diff-filter=U"],
        )?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

impl Vcs for GitVcs {
    fn root(&self) -> &Path {
        &self.repo_path
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktree_base.join(task_id)
    }

    fn create_worktree(&self, task_id: &str, base_branch: &str) -> Result<PathBuf, VcsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let worktree_path = self.worktree_path(task_id);
        let branch = task_branch(task_id);

        if !branch_exists_inner(self, base_branch)? {
            return Err(VcsError::MissingBaseBranch(base_branch.to_owned()));
        }

        // Destroy-and-recreate idempotency: a leftover worktree or branch
        // from an earlier attempt must not leak state into this run.
        if worktree_path.exists() {
            remove_worktree_inner(self, &worktree_path, true)?;
        } else {
            let _ = self.run_git(&self.repo_path, &["worktree", "prune"]);
        }
        if branch_exists_inner(self, &branch)? {
            let _ = self.run_git(&self.repo_path, &["branch", "-D", &branch]);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| VcsError::GitCommand {
                message: format!(
                    "failed to create worktree base directory {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let path_str = worktree_path.to_string_lossy().into_owned();
        let output = self.run_git(
            &self.repo_path,
            &["worktree", "add", &path_str, "-b", &branch, base_branch],
        )?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(VcsError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(worktree_path)
    }

    fn remove_worktree(&self, task_id: &str, force: bool) -> Result<(), VcsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.worktree_path(task_id);
        if !path.exists() {
            let _ = self.run_git(&self.repo_path, &["worktree", "prune"]);
            return Ok(());
        }

        if !force && self.dirty(&path)? {
            return Err(VcsError::DirtyWorktree(task_id.to_owned()));
        }

        remove_worktree_inner(self, &path, force)
    }

    fn has_uncommitted_changes(&self, task_id: &str) -> Result<bool, VcsError> {
        let path = self.worktree_path(task_id);
        if !path.exists() {
            return Ok(false);
        }
        self.dirty(&path)
    }

    fn commit_all(
        &self,
        task_id: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, VcsError> {
        let path = self.worktree_path(task_id);
        self.git_ok(&path, &["add", "-A"])?;

        let author_arg = format!("{} <{}>", author.name, author.email);
        self.git_ok(
            &path,
            &[
                "-c",
                &format!("user.name={}", author.name),
                "-c",
                &format!("user.email={}", author.email),
                "commit",
                "--author",
                &author_arg,
                "-m",
                message,
            ],
        )?;

        let output = self.git_ok(&path, &["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, VcsError> {
        let output = self.git_ok(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        branch_exists_inner(self, name)
    }

    fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = self.run_git(&self.repo_path, &["branch", "-D", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(VcsError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    fn show_file_at(&self, branch: &str, relative_path: &str) -> Result<Option<String>, VcsError> {
        let spec = format!("{branch}:{relative_path}");
        let output = self.run_git(&self.repo_path, &["show", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }

    fn merge(&self, source: &str, target: &str) -> Result<MergeAttempt, VcsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let checkout = self.run_git(&self.repo_path, &["checkout", target])?;
        if !checkout.status.success() {
            return Ok(MergeAttempt::Error(format!(
                "failed to checkout {target}: {}",
                String::from_utf8_lossy(&checkout.stderr).trim()
            )));
        }

        let message = format!("Merge {source} into {target}");
        let output = self.run_git(
            &self.repo_path,
            &["merge", "--no-ff", "-m", &message, source],
        )?;

        if output.status.success() {
            return Ok(MergeAttempt::Success);
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if stdout.contains("CONFLICT")
            || stderr.contains("CONFLICT")
            || stdout.contains("Automatic merge failed")
        {
            let paths = self.conflicted_paths()?;
            return Ok(MergeAttempt::Conflicted(paths));
        }

        // Non-conflict failure: make sure no half-started merge lingers.
        let _ = self.run_git(&self.repo_path, &["merge", "--abort"]);
        Ok(MergeAttempt::Error(
            format!("{stdout}\n{stderr}").trim().to_owned(),
        ))
    }

    fn abort_merge(&self) -> Result<(), VcsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = self.run_git(&self.repo_path, &["merge", "--abort"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // No merge in progress: idempotent no-op.
            if stderr.contains("MERGE_HEAD") {
                return Ok(());
            }
            return Err(VcsError::GitExit {
                command: "merge --abort".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        let mut args: Vec<&str> = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git_ok(&self.repo_path, &args)?;
        Ok(())
    }

    fn commit_merge(&self, message: &str) -> Result<(), VcsError> {
        self.git_ok(
            &self.repo_path,
            &[
                "-c",
                "user.name=specforge",
                "-c",
                "user.email=specforge@localhost",
                "commit",
                "--no-edit",
                "-m",
                message,
            ],
        )?;
        Ok(())
    }
}

/// `branch_exists` without taking the git lock (callers already hold it
/// where required; the operation is read-only).
fn branch_exists_inner(vcs: &GitVcs, name: &str) -> Result<bool, VcsError> {
    let spec = format!("refs/heads/{name}");
    let output = vcs.run_git(&vcs.repo_path, &["rev-parse", "--verify", &spec])?;
    Ok(output.status.success())
}

/// Remove a worktree directory and its registration. Assumes the caller
/// holds the git lock.
fn remove_worktree_inner(vcs: &GitVcs, path: &Path, force: bool) -> Result<(), VcsError> {
    let path_str = path.to_string_lossy().into_owned();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path_str);

    let output = vcs.run_git(&vcs.repo_path, &args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("is not a working tree") {
            // Directory exists but git does not know it; clean up manually.
            if force && path.exists() {
                let _ = std::fs::remove_dir_all(path);
            }
            let _ = vcs.run_git(&vcs.repo_path, &["worktree", "prune"]);
            return Ok(());
        }
        return Err(VcsError::GitExit {
            command: "worktree remove".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    let _ = vcs.run_git(&vcs.repo_path, &["worktree", "prune"]);
    Ok(())
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// Detached worktrees show `detached` instead of `branch`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, VcsError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_owned();
            current_branch = Some(branch);
        }
        // `bare`, `detached`, `prunable` etc. are ignored.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head,
        });
    }

    Ok(worktrees)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use specforge_test_utils::TempGitRepo;

    fn vcs_for(repo: &TempGitRepo) -> GitVcs {
        GitVcs::new(repo.path(), ".worktrees").expect("GitVcs::new failed")
    }

    #[test]
    fn new_rejects_non_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = GitVcs::new(dir.path(), ".worktrees");
        assert!(matches!(result, Err(VcsError::NotAGitRepo(_))));
    }

    #[test]
    fn task_branch_format() {
        assert_eq!(task_branch("AUTH-001"), "task/AUTH-001");
    }

    #[test]
    fn create_worktree_and_branch() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("create");
        assert!(path.exists());
        assert_eq!(path, repo.path().join(".worktrees").join("t1"));
        assert!(vcs.branch_exists("task/t1").expect("branch_exists"));

        // Worktree content matches trunk.
        assert!(path.join("README.md").exists());
    }

    #[test]
    fn create_worktree_missing_base_fails() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let result = vcs.create_worktree("t1", "no-such-branch");
        assert!(matches!(result, Err(VcsError::MissingBaseBranch(_))));
    }

    #[test]
    fn recreate_yields_fresh_tree() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("first create");
        std::fs::write(path.join("stale.txt"), "leftover\n").expect("write");

        let path2 = vcs.create_worktree("t1", "main").expect("second create");
        assert_eq!(path, path2);
        assert!(
            !path2.join("stale.txt").exists(),
            "recreated worktree must not carry files from the first instance"
        );
    }

    #[test]
    fn remove_worktree_idempotent() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        vcs.create_worktree("t1", "main").expect("create");
        vcs.remove_worktree("t1", false).expect("first remove");
        vcs.remove_worktree("t1", false).expect("second remove");
        assert!(!vcs.worktree_path("t1").exists());
    }

    #[test]
    fn remove_dirty_worktree_requires_force() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("create");
        std::fs::write(path.join("scratch.txt"), "wip\n").expect("write");

        assert!(vcs.has_uncommitted_changes("t1").expect("dirty check"));
        let result = vcs.remove_worktree("t1", false);
        assert!(matches!(result, Err(VcsError::DirtyWorktree(_))));

        vcs.remove_worktree("t1", true).expect("forced remove");
        assert!(!path.exists());
    }

    #[test]
    fn commit_all_returns_commit_id() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("create");
        std::fs::write(path.join("feature.txt"), "new feature\n").expect("write");

        let commit = vcs
            .commit_all("t1", "Add feature", &CommitAuthor::default())
            .expect("commit");
        assert_eq!(commit.len(), 40, "expected a full SHA, got {commit:?}");
        assert!(!vcs.has_uncommitted_changes("t1").expect("dirty check"));
    }

    #[test]
    fn list_worktrees_includes_main_and_task() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);
        vcs.create_worktree("t1", "main").expect("create");

        let worktrees = vcs.list_worktrees().expect("list");
        assert!(worktrees.len() >= 2);
        assert!(
            worktrees
                .iter()
                .any(|wt| wt.branch.as_deref() == Some("task/t1"))
        );
    }

    #[test]
    fn delete_branch_idempotent() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        vcs.create_worktree("t1", "main").expect("create");
        vcs.remove_worktree("t1", true).expect("remove");
        assert!(vcs.branch_exists("task/t1").expect("exists"));

        vcs.delete_branch("task/t1").expect("delete");
        assert!(!vcs.branch_exists("task/t1").expect("exists"));
        vcs.delete_branch("task/t1").expect("delete again");
    }

    #[test]
    fn show_file_at_reads_branch_content() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("create");
        repo.commit_file_in(&path, "only-on-branch.txt", "branch content\n", "Add file");

        let content = vcs
            .show_file_at("task/t1", "only-on-branch.txt")
            .expect("show");
        assert_eq!(content.as_deref(), Some("branch content\n"));

        let missing = vcs.show_file_at("main", "only-on-branch.txt").expect("show");
        assert!(missing.is_none());
    }

    #[test]
    fn merge_clean_branch_succeeds() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        let path = vcs.create_worktree("t1", "main").expect("create");
        repo.commit_file_in(&path, "feature.txt", "feature\n", "Add feature");
        vcs.remove_worktree("t1", true).expect("remove");

        let result = vcs.merge("task/t1", "main").expect("merge");
        assert_eq!(result, MergeAttempt::Success);
        assert_eq!(repo.read_file("feature.txt"), "feature\n");
    }

    #[test]
    fn merge_ancestor_branch_is_noop_success() {
        // A task branch with no commits of its own is an ancestor of trunk.
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);

        vcs.create_worktree("t1", "main").expect("create");
        vcs.remove_worktree("t1", true).expect("remove");

        let result = vcs.merge("task/t1", "main").expect("merge");
        assert_eq!(result, MergeAttempt::Success);
    }

    #[test]
    fn merge_conflict_reports_paths_and_leaves_state() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);
        repo.commit_file("f.txt", "base\n", "Add f");

        let path = vcs.create_worktree("t1", "main").expect("create");
        repo.commit_file_in(&path, "f.txt", "B\n", "Branch change");
        repo.commit_file("f.txt", "A\n", "Trunk change");
        vcs.remove_worktree("t1", true).expect("remove");

        let result = vcs.merge("task/t1", "main").expect("merge");
        match result {
            MergeAttempt::Conflicted(paths) => assert_eq!(paths, vec!["f.txt".to_owned()]),
            other => panic!("expected conflict, got {other:?}"),
        }

        // The conflicted file carries markers until the merge is aborted.
        assert!(repo.read_file("f.txt").contains("<<<<<<<"));
        vcs.abort_merge().expect("abort");
        assert_eq!(repo.read_file("f.txt"), "A\n");
    }

    #[test]
    fn abort_merge_without_merge_is_noop() {
        let repo = TempGitRepo::new();
        let vcs = vcs_for(&repo);
        vcs.abort_merge().expect("abort without merge");
    }

    #[test]
    fn parse_porcelain_output_blocks() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/project/.worktrees/t1
HEAD 789abc012def
branch refs/heads/task/t1

worktree /home/user/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch.as_deref(), Some("task/t1"));
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn parse_porcelain_output_no_trailing_newline() {
        let input = "worktree /p\nHEAD abc\nbranch refs/heads/main";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }
}
