//! Three-tier merge engine: fold a task branch into trunk.
//!
//! Tier 1 is a native git merge. Tier 2 re-runs the merge and asks the
//! agent runner to resolve each conflicted file from its marker-annotated
//! content. Tier 3 regenerates each conflicted file from the two full
//! branch versions. Every tier is all-or-nothing: on failure the working
//! copy is restored (merge aborted) before the next tier runs.
//!
//! Only one merge may run at a time across the whole system; the engine
//! serialises callers through an internal mutex because every tier
//! operates on the trunk checkout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::{AgentRequest, AgentRunner};
use crate::vcs::{MergeAttempt, Vcs, task_branch};

/// The closed set of merge strategies, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTier {
    Native,
    ConflictHunks,
    FullFile,
}

impl fmt::Display for MergeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Native => "native",
            Self::ConflictHunks => "conflict_hunks",
            Self::FullFile => "full_file",
        };
        f.write_str(s)
    }
}

/// Result of a merge across all tiers.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub success: bool,
    /// The tier that completed the merge, when successful.
    pub tier: Option<MergeTier>,
    pub message: String,
}

/// Outcome of a single tier attempt.
enum TierOutcome {
    Merged(String),
    Failed(String),
    /// A hard VCS failure: stop without trying further tiers.
    Fatal(String),
}

/// Merges task branches into the trunk branch.
pub struct MergeEngine {
    vcs: Arc<dyn Vcs>,
    runner: Arc<dyn AgentRunner>,
    timeout: Duration,
    /// Trunk is shared state; one merge at a time system-wide.
    lock: Mutex<()>,
}

impl MergeEngine {
    pub fn new(vcs: Arc<dyn Vcs>, runner: Arc<dyn AgentRunner>, timeout: Duration) -> Self {
        Self {
            vcs,
            runner,
            timeout,
            lock: Mutex::new(()),
        }
    }

    /// Merge `task/<task_id>` into `target_branch` using the three tiers
    /// in order.
    pub async fn merge_task(
        &self,
        task_id: &str,
        target_branch: &str,
        cancel: &CancellationToken,
    ) -> Result<MergeReport> {
        let source = task_branch(task_id);

        if !self
            .vcs
            .branch_exists(&source)
            .context("failed to check source branch")?
        {
            return Ok(MergeReport {
                success: false,
                tier: None,
                message: format!("source branch not found: {source}"),
            });
        }

        let _guard = self.lock.lock().await;

        let tiers = [
            MergeTier::Native,
            MergeTier::ConflictHunks,
            MergeTier::FullFile,
        ];
        let mut last_message = String::new();

        for tier in tiers {
            let outcome = match tier {
                MergeTier::Native => self.attempt_native(&source, target_branch),
                MergeTier::ConflictHunks => {
                    self.attempt_conflict_hunks(&source, target_branch, cancel)
                        .await
                }
                MergeTier::FullFile => {
                    self.attempt_full_file(&source, target_branch, cancel).await
                }
            };

            match outcome? {
                TierOutcome::Merged(message) => {
                    info!(task_id, %tier, "merge completed");
                    return Ok(MergeReport {
                        success: true,
                        tier: Some(tier),
                        message,
                    });
                }
                TierOutcome::Failed(message) => {
                    warn!(task_id, %tier, message = %message, "merge tier failed");
                    last_message = message;
                }
                TierOutcome::Fatal(message) => {
                    warn!(task_id, %tier, message = %message, "merge failed hard");
                    return Ok(MergeReport {
                        success: false,
                        tier: None,
                        message,
                    });
                }
            }
        }

        Ok(MergeReport {
            success: false,
            tier: None,
            message: format!("all merge strategies failed; last: {last_message}"),
        })
    }

    /// Tier 1: plain git merge. Conflicts are aborted and handed to the
    /// next tier; hard VCS errors stop the whole merge.
    fn attempt_native(&self, source: &str, target: &str) -> Result<TierOutcome> {
        match self.vcs.merge(source, target).context("native merge")? {
            MergeAttempt::Success => Ok(TierOutcome::Merged(format!(
                "merged {source} into {target}"
            ))),
            MergeAttempt::Conflicted(paths) => {
                self.vcs.abort_merge().context("abort conflicted merge")?;
                Ok(TierOutcome::Failed(format!(
                    "conflicts in {} file(s)",
                    paths.len()
                )))
            }
            MergeAttempt::Error(message) => Ok(TierOutcome::Fatal(message)),
        }
    }

    /// Tier 2: re-initiate the merge and resolve each conflicted file from
    /// its marker-annotated contents.
    async fn attempt_conflict_hunks(
        &self,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<TierOutcome> {
        let paths = match self.vcs.merge(source, target).context("re-initiate merge")? {
            MergeAttempt::Success => {
                return Ok(TierOutcome::Merged(format!(
                    "merged {source} into {target} (no conflicts on retry)"
                )));
            }
            MergeAttempt::Error(message) => return Ok(TierOutcome::Failed(message)),
            MergeAttempt::Conflicted(paths) => paths,
        };

        let mut failures: Vec<String> = Vec::new();
        let mut resolved = 0usize;

        for path in &paths {
            match self.resolve_conflicted_file(path, source, target, cancel).await {
                Ok(()) => {
                    if let Err(e) = self.vcs.stage(std::slice::from_ref(path)) {
                        failures.push(format!("{path}: failed to stage: {e}"));
                    } else {
                        resolved += 1;
                    }
                }
                Err(reason) => failures.push(format!("{path}: {reason}")),
            }
        }

        if !failures.is_empty() {
            self.vcs.abort_merge().context("abort after failed resolution")?;
            return Ok(TierOutcome::Failed(format!(
                "conflict resolution failed for {} file(s): {}",
                failures.len(),
                failures
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }

        self.vcs
            .commit_merge(&format!(
                "Merge {source} into {target} (AI-resolved conflicts)"
            ))
            .context("commit resolved merge")?;
        Ok(TierOutcome::Merged(format!(
            "resolved conflicts in {resolved} file(s)"
        )))
    }

    /// Resolve a single conflicted file in the trunk working copy.
    async fn resolve_conflicted_file(
        &self,
        path: &str,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), String> {
        let full_path = self.vcs.root().join(path);
        let conflicted = std::fs::read_to_string(&full_path)
            .map_err(|e| format!("failed to read file: {e}"))?;

        if !conflicted.contains("<<<<<<<") {
            // Nothing to resolve; staging it as-is completes the file.
            return Ok(());
        }

        let prompt = hunk_resolution_prompt(path, source, target, &conflicted);
        let outcome = self
            .runner
            .run(
                &AgentRequest {
                    prompt,
                    working_dir: self.vcs.root().to_path_buf(),
                    allowed_tools: Vec::new(),
                    model: None,
                    timeout: self.timeout,
                },
                cancel,
            )
            .await;

        if !outcome.exit_ok {
            return Err(format!("resolution agent failed: {}", outcome.text));
        }

        let resolved = strip_code_fences(&outcome.text);
        if contains_conflict_markers(&resolved) {
            return Err("resolved output still contains conflict markers".to_owned());
        }

        std::fs::write(&full_path, resolved.as_bytes())
            .map_err(|e| format!("failed to write resolved file: {e}"))
    }

    /// Tier 3: re-initiate the merge and regenerate each conflicted file
    /// from the full contents on both branches.
    async fn attempt_full_file(
        &self,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<TierOutcome> {
        let paths = match self.vcs.merge(source, target).context("re-initiate merge")? {
            MergeAttempt::Success => {
                return Ok(TierOutcome::Merged(format!(
                    "merged {source} into {target} (no conflicts on retry)"
                )));
            }
            MergeAttempt::Error(message) => return Ok(TierOutcome::Failed(message)),
            MergeAttempt::Conflicted(paths) => paths,
        };

        let mut failures: Vec<String> = Vec::new();
        let mut regenerated = 0usize;

        for path in &paths {
            match self.regenerate_file(path, source, target, cancel).await {
                Ok(()) => {
                    if let Err(e) = self.vcs.stage(std::slice::from_ref(path)) {
                        failures.push(format!("{path}: failed to stage: {e}"));
                    } else {
                        regenerated += 1;
                    }
                }
                Err(reason) => failures.push(format!("{path}: {reason}")),
            }
        }

        if !failures.is_empty() {
            self.vcs.abort_merge().context("abort after failed regeneration")?;
            return Ok(TierOutcome::Failed(format!(
                "file regeneration failed for {} file(s): {}",
                failures.len(),
                failures
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }

        self.vcs
            .commit_merge(&format!(
                "Merge {source} into {target} (AI-regenerated files)"
            ))
            .context("commit regenerated merge")?;
        Ok(TierOutcome::Merged(format!(
            "regenerated {regenerated} conflicted file(s)"
        )))
    }

    /// Regenerate one conflicted file from its two branch versions.
    async fn regenerate_file(
        &self,
        path: &str,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), String> {
        let source_content = self
            .vcs
            .show_file_at(source, path)
            .map_err(|e| format!("failed to read {source}:{path}: {e}"))?;
        let target_content = self
            .vcs
            .show_file_at(target, path)
            .map_err(|e| format!("failed to read {target}:{path}: {e}"))?;

        let full_path = self.vcs.root().join(path);

        let (source_content, target_content) = match (source_content, target_content) {
            (None, None) => {
                return Err("file missing on both branches".to_owned());
            }
            // One-sided files need no regeneration; take the existing side.
            (Some(content), None) | (None, Some(content)) => {
                return std::fs::write(&full_path, content.as_bytes())
                    .map_err(|e| format!("failed to write file: {e}"));
            }
            (Some(s), Some(t)) => (s, t),
        };

        let prompt =
            full_file_merge_prompt(path, source, target, &source_content, &target_content);
        let outcome = self
            .runner
            .run(
                &AgentRequest {
                    prompt,
                    working_dir: self.vcs.root().to_path_buf(),
                    allowed_tools: Vec::new(),
                    model: None,
                    timeout: self.timeout,
                },
                cancel,
            )
            .await;

        if !outcome.exit_ok {
            return Err(format!("regeneration agent failed: {}", outcome.text));
        }

        let merged = strip_code_fences(&outcome.text);
        if merged.trim().is_empty() {
            return Err("regeneration agent returned empty output".to_owned());
        }

        std::fs::write(&full_path, merged.as_bytes())
            .map_err(|e| format!("failed to write merged file: {e}"))
    }
}

/// Prompt for tier-2 conflicted-hunk resolution.
fn hunk_resolution_prompt(path: &str, source: &str, target: &str, conflicted: &str) -> String {
    format!(
        "You are resolving a git merge conflict. The file below contains conflict markers.\n\n\
         FILE: {path}\n\
         SOURCE BRANCH: {source} (the incoming changes)\n\
         TARGET BRANCH: {target} (HEAD, the current branch)\n\n\
         CONFLICT MARKERS EXPLAINED:\n\
         - `<<<<<<< HEAD` marks the start of the TARGET branch version\n\
         - `=======` separates the two versions\n\
         - `>>>>>>> {source}` marks the end of the SOURCE branch version\n\n\
         YOUR TASK:\n\
         1. Analyze each conflict section\n\
         2. Decide how to merge the changes (keep one side, combine both, or create a new version)\n\
         3. Output ONLY the fully resolved file content with NO conflict markers\n\
         4. Do NOT include any explanation - output ONLY the resolved file content\n\n\
         CONFLICTED FILE CONTENT:\n\
         ```\n\
         {conflicted}\n\
         ```\n\n\
         OUTPUT the resolved file content below (no markdown code blocks, no explanations):"
    )
}

/// Prompt for tier-3 whole-file regeneration.
fn full_file_merge_prompt(
    path: &str,
    source: &str,
    target: &str,
    source_content: &str,
    target_content: &str,
) -> String {
    format!(
        "You are merging two versions of a file. Your task is to intelligently combine both \
         versions into a single coherent file.\n\n\
         FILE: {path}\n\n\
         SOURCE BRANCH ({source}) - The incoming changes:\n\
         ```\n\
         {source_content}\n\
         ```\n\n\
         TARGET BRANCH ({target}) - The current version:\n\
         ```\n\
         {target_content}\n\
         ```\n\n\
         YOUR TASK:\n\
         1. Analyze both versions carefully\n\
         2. Identify what each version adds, removes, or changes\n\
         3. Create a merged version that incorporates changes from BOTH branches where \
         possible, resolves contradictions, and preserves the intent of both sets of changes\n\
         4. Output ONLY the merged file content\n\
         5. Do NOT include any explanation - output ONLY the final merged file content\n\n\
         OUTPUT the merged file content below (no markdown code blocks, no explanations):"
    )
}

/// True when any line is a standard git conflict marker.
fn contains_conflict_markers(text: &str) -> bool {
    text.lines().any(|line| {
        line.starts_with("<<<<<<<") || line.starts_with("=======") || line.starts_with(">>>>>>>")
    })
}

/// Strip a surrounding markdown code fence, if present.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() > 2 {
            return lines[1..lines.len() - 1].join("\n") + "\n";
        }
    }
    trimmed.to_owned() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_marker_detection() {
        assert!(contains_conflict_markers("<<<<<<< HEAD\nfoo\n=======\nbar\n>>>>>>> task/t1\n"));
        assert!(!contains_conflict_markers("plain file\nwith == in it\n"));
        // An equals separator must start the line to count.
        assert!(!contains_conflict_markers("let a = b ======= c;"));
    }

    #[test]
    fn strip_fences_removes_wrapping_block() {
        let fenced = "```rust\nfn main() {}\n```";
        assert_eq!(strip_code_fences(fenced), "fn main() {}\n");
    }

    #[test]
    fn strip_fences_keeps_plain_text() {
        assert_eq!(strip_code_fences("AB"), "AB\n");
        assert_eq!(strip_code_fences("AB\n"), "AB\n");
    }

    #[test]
    fn prompts_name_both_branches() {
        let p = hunk_resolution_prompt("f.txt", "task/t1", "main", "<<<<<<< HEAD");
        assert!(p.contains("task/t1"));
        assert!(p.contains("main"));
        assert!(p.contains("f.txt"));

        let p = full_file_merge_prompt("f.txt", "task/t1", "main", "A", "B");
        assert!(p.contains("task/t1"));
        assert!(p.contains("main"));
        assert!(!contains_conflict_markers(&p));
    }
}
