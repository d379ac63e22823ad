//! Integration tests for the three-tier merge engine against real git
//! repositories.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use specforge_core::merge::{MergeEngine, MergeTier};
use specforge_core::runner::AgentRunner;
use specforge_core::vcs::{GitVcs, Vcs};
use specforge_test_utils::TempGitRepo;

use common::{PanickingRunner, ScriptedRunner, StubReply};

fn engine(vcs: Arc<GitVcs>, runner: Arc<dyn AgentRunner>) -> MergeEngine {
    MergeEngine::new(vcs as Arc<dyn Vcs>, runner, Duration::from_secs(30))
}

/// Build a repo where trunk and the task branch both modified `f.txt`.
fn conflicting_repo() -> (TempGitRepo, Arc<GitVcs>) {
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));

    repo.commit_file("f.txt", "base\n", "Add f.txt");
    let worktree = vcs.create_worktree("t1", "main").expect("worktree");
    repo.commit_file_in(&worktree, "f.txt", "B\n", "Branch edit");
    repo.commit_file("f.txt", "A\n", "Trunk edit");
    vcs.remove_worktree("t1", true).expect("remove worktree");

    (repo, vcs)
}

#[tokio::test]
async fn missing_source_branch_fails_cleanly() {
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));
    let engine = engine(vcs, Arc::new(PanickingRunner));

    let report = engine
        .merge_task("ghost", "main", &CancellationToken::new())
        .await
        .expect("merge");
    assert!(!report.success);
    assert!(report.message.contains("source branch not found"));
}

#[tokio::test]
async fn ancestor_branch_merges_natively_without_agents() {
    // A branch with no commits of its own is an ancestor of trunk: tier 1
    // succeeds and tiers 2/3 (and their agent) are never consulted.
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));
    vcs.create_worktree("t1", "main").expect("worktree");
    vcs.remove_worktree("t1", true).expect("remove worktree");

    let engine = engine(vcs.clone(), Arc::new(PanickingRunner));
    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(report.success, "message: {}", report.message);
    assert_eq!(report.tier, Some(MergeTier::Native));
    vcs.delete_branch("task/t1").expect("branch deletable");
}

#[tokio::test]
async fn clean_branch_commit_merges_natively() {
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));
    let worktree = vcs.create_worktree("t1", "main").expect("worktree");
    repo.commit_file_in(&worktree, "feature.txt", "feature\n", "Add feature");
    vcs.remove_worktree("t1", true).expect("remove worktree");

    let engine = engine(vcs, Arc::new(PanickingRunner));
    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(report.success);
    assert_eq!(report.tier, Some(MergeTier::Native));
    assert_eq!(repo.read_file("feature.txt"), "feature\n");
}

#[tokio::test]
async fn conflicted_merge_resolves_via_tier_two() {
    // Trunk says "A", the branch says "B"; the resolution agent combines
    // them into "AB".
    let (repo, vcs) = conflicting_repo();
    let runner = Arc::new(ScriptedRunner::always(StubReply::ok("AB\n")));
    let engine = engine(vcs.clone(), runner.clone());

    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(report.success, "message: {}", report.message);
    assert_eq!(report.tier, Some(MergeTier::ConflictHunks));
    assert_eq!(repo.read_file("f.txt"), "AB\n");
    assert_eq!(runner.calls(), 1);

    // The task branch is fully merged and deletable.
    vcs.delete_branch("task/t1").expect("branch deletable");
}

#[tokio::test]
async fn marker_laden_resolution_falls_through_to_tier_three() {
    // Tier 2's agent output still contains markers, so it is rejected;
    // tier 3 regenerates the whole file from both versions.
    let (repo, vcs) = conflicting_repo();
    let runner = Arc::new(ScriptedRunner::new(vec![
        StubReply::ok("<<<<<<< HEAD\nstill conflicted\n=======\nnope\n>>>>>>> task/t1\n"),
        StubReply::ok("merged by regeneration\n"),
    ]));
    let engine = engine(vcs.clone(), runner.clone());

    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(report.success, "message: {}", report.message);
    assert_eq!(report.tier, Some(MergeTier::FullFile));
    assert_eq!(repo.read_file("f.txt"), "merged by regeneration\n");
    assert_eq!(runner.calls(), 2);
}

#[tokio::test]
async fn all_tiers_failing_preserves_branch_and_clean_trunk() {
    let (repo, vcs) = conflicting_repo();
    let runner = Arc::new(ScriptedRunner::always(StubReply::fail(
        "ERROR: agent binary not found",
    )));
    let engine = engine(vcs.clone(), runner);

    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(!report.success);
    assert!(report.message.contains("all merge strategies failed"));

    // The branch survives for manual merging and trunk is back to its
    // pre-merge state with no merge in progress.
    assert!(vcs.branch_exists("task/t1").unwrap());
    assert_eq!(repo.read_file("f.txt"), "A\n");
    assert!(!repo.path().join(".git").join("MERGE_HEAD").exists());
}

#[tokio::test]
async fn modify_delete_conflict_keeps_surviving_side() {
    // Trunk deleted the file, the branch modified it. The conflicted
    // working copy carries the branch version without markers, so tier 2
    // stages it as-is and no agent is needed.
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));

    repo.commit_file("f.txt", "base\n", "Add f.txt");
    let worktree = vcs.create_worktree("t1", "main").expect("worktree");
    repo.commit_file_in(&worktree, "f.txt", "branch version\n", "Branch edit");
    specforge_test_utils::git(repo.path(), &["rm", "f.txt"]);
    specforge_test_utils::git(repo.path(), &["commit", "-m", "Delete f.txt"]);
    vcs.remove_worktree("t1", true).expect("remove worktree");

    let engine = engine(vcs, Arc::new(PanickingRunner));
    let report = engine
        .merge_task("t1", "main", &CancellationToken::new())
        .await
        .expect("merge");

    assert!(report.success, "message: {}", report.message);
    assert_eq!(report.tier, Some(MergeTier::ConflictHunks));
    assert_eq!(repo.read_file("f.txt"), "branch version\n");
}

#[tokio::test]
async fn concurrent_merges_are_serialised() {
    // Two tasks, both clean merges. Running them through one engine
    // concurrently must serialise on the merge lock and both succeed.
    let repo = TempGitRepo::new();
    let vcs = Arc::new(GitVcs::new(repo.path(), ".worktrees").expect("GitVcs"));

    for id in ["t1", "t2"] {
        let worktree = vcs.create_worktree(id, "main").expect("worktree");
        repo.commit_file_in(
            &worktree,
            &format!("{id}.txt"),
            "content\n",
            &format!("Add {id}.txt"),
        );
        vcs.remove_worktree(id, true).expect("remove worktree");
    }

    let engine = Arc::new(engine(vcs, Arc::new(PanickingRunner)));
    let cancel = CancellationToken::new();

    let (r1, r2) = tokio::join!(
        engine.merge_task("t1", "main", &cancel),
        engine.merge_task("t2", "main", &cancel),
    );

    assert!(r1.expect("merge t1").success);
    assert!(r2.expect("merge t2").success);
    assert_eq!(repo.read_file("t1.txt"), "content\n");
    assert_eq!(repo.read_file("t2.txt"), "content\n");
}
