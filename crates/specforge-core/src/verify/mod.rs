//! Promise verification: decides whether an agent's declared completion
//! promise is genuine.
//!
//! Verification methods form a closed set ([`VerificationMethod`]) and are
//! dispatched by match, not by an open trait hierarchy. The semantic method
//! is a deterministic token-coverage approximation; a richer analysis may
//! replace it without changing the contract.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use specforge_db::models::{AgentRole, CompletionCriteria, VerificationMethod};

/// Fraction of a criterion's tokens that must appear in the output for the
/// criterion to count as evident.
const SEMANTIC_TOKEN_THRESHOLD: f64 = 0.30;

/// Default timeout for external verification commands.
const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of one verification attempt.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub passed: bool,
    pub reason: String,
    pub method: VerificationMethod,
    pub duration_ms: i64,
}

/// Caller context carried into verification for logging.
#[derive(Debug, Clone, Default)]
pub struct VerifyContext {
    pub task_id: String,
    pub role: Option<AgentRole>,
}

/// Verifies completion promises using the configured method.
#[derive(Debug, Clone, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify a completion promise against the criteria.
    pub async fn verify(
        &self,
        criteria: &CompletionCriteria,
        output: &str,
        worktree: Option<&Path>,
        context: &VerifyContext,
    ) -> VerificationResult {
        let start = Instant::now();
        debug!(
            task_id = %context.task_id,
            method = %criteria.method,
            "verifying completion promise"
        );

        let (passed, reason) = match criteria.method {
            VerificationMethod::StringMatch => verify_string_match(&criteria.promise, output),
            VerificationMethod::Semantic => verify_semantic(output, &criteria.config),
            VerificationMethod::External => verify_external(&criteria.config, worktree).await,
            VerificationMethod::MultiStage => {
                verify_multi_stage(output, &criteria.config, worktree).await
            }
        };

        VerificationResult {
            passed,
            reason,
            method: criteria.method,
            duration_ms: i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Extract the completion promise from agent output.
    ///
    /// Scans for `<promise>TEXT</promise>` (case-insensitive markers, text
    /// may span lines) and returns the trimmed interior.
    pub fn extract_promise(output: &str) -> Option<String> {
        const OPEN: &str = "<promise>";
        const CLOSE: &str = "</promise>";

        let start = find_ignore_ascii_case(output, OPEN, 0)?;
        let interior_start = start + OPEN.len();
        let end = find_ignore_ascii_case(output, CLOSE, interior_start)?;
        let interior = output[interior_start..end].trim();
        if interior.is_empty() {
            None
        } else {
            Some(interior.to_owned())
        }
    }
}

/// Byte-wise case-insensitive substring search. The needles used here are
/// ASCII, so indices map straight back into the original string.
fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() || from > h.len() - n.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    find_ignore_ascii_case(haystack, needle, 0).is_some()
}

// ---------------------------------------------------------------------------
// string_match
// ---------------------------------------------------------------------------

fn verify_string_match(promise: &str, output: &str) -> (bool, String) {
    if promise.is_empty() {
        return (false, "No promise text specified".to_owned());
    }
    if output.is_empty() {
        return (false, "No output to verify".to_owned());
    }
    if contains_ignore_case(output, promise) {
        (true, format!("Promise '{promise}' found in output"))
    } else {
        (false, format!("Promise '{promise}' not found in output"))
    }
}

// ---------------------------------------------------------------------------
// semantic
// ---------------------------------------------------------------------------

/// Deterministic semantic approximation: reject on any negative pattern,
/// then require 30% token coverage for each expected criterion.
fn verify_semantic(output: &str, config: &serde_json::Value) -> (bool, String) {
    let check_for = string_list(config, "check_for");
    let negative_patterns = string_list(config, "negative_patterns");

    if output.is_empty() {
        return (false, "No output to verify".to_owned());
    }

    for pattern in &negative_patterns {
        if contains_ignore_case(output, pattern) {
            return (false, format!("Found negative pattern: '{pattern}'"));
        }
    }

    if check_for.is_empty() {
        return (true, "No specific criteria to verify".to_owned());
    }

    let output_lower = output.to_lowercase();
    let mut missing = Vec::new();
    for criterion in &check_for {
        let words: Vec<String> = criterion
            .to_lowercase()
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if words.is_empty() {
            continue;
        }
        let found = words.iter().filter(|w| output_lower.contains(*w)).count();
        if (found as f64) < (words.len() as f64) * SEMANTIC_TOKEN_THRESHOLD {
            missing.push(criterion.clone());
        }
    }

    if missing.is_empty() {
        (true, "All criteria appear to be met".to_owned())
    } else if missing.len() == 1 {
        (false, format!("Criterion not evident: {}", missing[0]))
    } else {
        (
            false,
            format!(
                "Criteria not evident: {}",
                missing
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    }
}

// ---------------------------------------------------------------------------
// external
// ---------------------------------------------------------------------------

/// Run a shell command and judge the result by exit code and output
/// contents.
async fn verify_external(config: &serde_json::Value, worktree: Option<&Path>) -> (bool, String) {
    let Some(command) = config.get("command").and_then(|v| v.as_str()) else {
        return (
            false,
            "No command specified for external verification".to_owned(),
        );
    };

    let expected_exit = config
        .get("success_exit_code")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output_contains = config.get("output_contains").and_then(|v| v.as_str());
    let output_not_contains = config.get("output_not_contains").and_then(|v| v.as_str());
    let timeout = config
        .get("timeout")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_EXTERNAL_TIMEOUT);
    let working_dir = config
        .get("working_dir")
        .and_then(|v| v.as_str())
        .unwrap_or(".");

    let cwd: Option<PathBuf> = worktree.map(|root| {
        if working_dir == "." {
            root.to_path_buf()
        } else {
            root.join(working_dir)
        }
    });
    if let Some(dir) = &cwd {
        if !dir.exists() {
            return (
                false,
                format!("Working directory does not exist: {}", dir.display()),
            );
        }
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cwd {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (false, format!("Command failed to start: {e}")),
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let waited = tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), read_stdout, read_stderr)
    })
    .await;

    let (status, combined) = match waited {
        Ok((Ok(status), stdout, stderr)) => (status, format!("{stdout}{stderr}")),
        Ok((Err(e), _, _)) => return (false, format!("Command failed: {e}")),
        Err(_elapsed) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return (
                false,
                format!("Command timed out after {}s", timeout.as_secs()),
            );
        }
    };

    let exit_code = status.code().map(i64::from).unwrap_or(-1);
    if exit_code != expected_exit {
        let preview: String = combined.chars().take(500).collect();
        let preview = if preview.is_empty() {
            "No output".to_owned()
        } else {
            preview
        };
        return (
            false,
            format!(
                "Command exited with {exit_code}, expected {expected_exit}. Output: {preview}"
            ),
        );
    }

    if let Some(needle) = output_contains {
        if !combined.contains(needle) {
            return (
                false,
                format!("Output doesn't contain required: '{needle}'"),
            );
        }
    }

    if let Some(needle) = output_not_contains {
        if combined.contains(needle) {
            return (false, format!("Output contains forbidden: '{needle}'"));
        }
    }

    (true, "External verification passed".to_owned())
}

// ---------------------------------------------------------------------------
// multi_stage
// ---------------------------------------------------------------------------

/// Run configured stages in order. A required stage failing under
/// `require_all` short-circuits. Multi-stage may not nest.
async fn verify_multi_stage(
    output: &str,
    config: &serde_json::Value,
    worktree: Option<&Path>,
) -> (bool, String) {
    let stages = match config.get("stages").and_then(|v| v.as_array()) {
        Some(stages) if !stages.is_empty() => stages,
        _ => return (true, "No verification stages defined".to_owned()),
    };
    let require_all = config
        .get("require_all")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    struct StageOutcome {
        name: String,
        passed: bool,
        reason: String,
        required: bool,
    }

    let mut results: Vec<StageOutcome> = Vec::with_capacity(stages.len());

    for stage in stages {
        let name = stage
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed")
            .to_owned();
        let method_str = stage
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("string_match");
        let empty = serde_json::Value::Object(serde_json::Map::new());
        let stage_config = stage.get("config").unwrap_or(&empty);
        let required = stage
            .get("required")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let (passed, reason) = match method_str.parse::<VerificationMethod>() {
            Ok(VerificationMethod::StringMatch) => {
                let promise = stage_config
                    .get("promise")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                verify_string_match(promise, output)
            }
            Ok(VerificationMethod::Semantic) => verify_semantic(output, stage_config),
            Ok(VerificationMethod::External) => verify_external(stage_config, worktree).await,
            Ok(VerificationMethod::MultiStage) => {
                (false, "multi_stage stages may not nest".to_owned())
            }
            Err(_) => (false, format!("Unknown method: {method_str}")),
        };

        let failed_required = !passed && required;
        results.push(StageOutcome {
            name: name.clone(),
            passed,
            reason: reason.clone(),
            required,
        });

        if failed_required && require_all {
            return (false, format!("Stage '{name}' failed: {reason}"));
        }
    }

    let failed_required: Vec<&StageOutcome> =
        results.iter().filter(|r| r.required && !r.passed).collect();
    if !failed_required.is_empty() {
        let reasons: Vec<String> = failed_required
            .iter()
            .map(|r| format!("{}: {}", r.name, r.reason))
            .collect();
        return (false, format!("Failed stages: {}", reasons.join("; ")));
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    (
        true,
        format!(
            "All {passed_count}/{} verification stages passed",
            results.len()
        ),
    )
}

/// Read a list of strings from a JSON config object, tolerating absence.
fn string_list(config: &serde_json::Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use specforge_db::models::CompletionCriteria;

    fn criteria(
        promise: &str,
        method: VerificationMethod,
        config: serde_json::Value,
    ) -> CompletionCriteria {
        CompletionCriteria {
            promise: promise.to_owned(),
            description: String::new(),
            method,
            config,
            max_iterations: None,
        }
    }

    async fn verify(c: &CompletionCriteria, output: &str) -> VerificationResult {
        Verifier::new()
            .verify(c, output, Some(Path::new(".")), &VerifyContext::default())
            .await
    }

    // -- extract_promise ---------------------------------------------------

    #[test]
    fn extract_promise_found() {
        let output = "Some text <promise>TASK_COMPLETE</promise> more text";
        assert_eq!(
            Verifier::extract_promise(output).as_deref(),
            Some("TASK_COMPLETE")
        );
    }

    #[test]
    fn extract_promise_case_insensitive_markers() {
        assert_eq!(
            Verifier::extract_promise("<PROMISE>Done</PROMISE>").as_deref(),
            Some("Done")
        );
    }

    #[test]
    fn extract_promise_multiline() {
        let output = "\n<promise>\nIMPLEMENTATION_COMPLETE\n</promise>\n";
        assert_eq!(
            Verifier::extract_promise(output).as_deref(),
            Some("IMPLEMENTATION_COMPLETE")
        );
    }

    #[test]
    fn extract_promise_absent() {
        assert!(Verifier::extract_promise("No promise tags here").is_none());
        assert!(Verifier::extract_promise("").is_none());
    }

    #[test]
    fn extract_promise_roundtrip() {
        for p in ["DONE", "QA_PASSED", "multi word promise"] {
            let serialised = format!("<promise>{p}</promise>");
            assert_eq!(Verifier::extract_promise(&serialised).as_deref(), Some(p));
        }
    }

    // -- string_match ------------------------------------------------------

    #[tokio::test]
    async fn string_match_found() {
        let c = criteria("FEATURE_DONE", VerificationMethod::StringMatch, json!({}));
        let result = verify(&c, "Code complete. <promise>FEATURE_DONE</promise>").await;
        assert!(result.passed);
        assert!(result.reason.contains("found in output"));
    }

    #[tokio::test]
    async fn string_match_case_insensitive() {
        let c = criteria("DONE", VerificationMethod::StringMatch, json!({}));
        assert!(verify(&c, "Task is done!").await.passed);
    }

    #[tokio::test]
    async fn string_match_not_found() {
        let c = criteria("SPECIFIC_PROMISE", VerificationMethod::StringMatch, json!({}));
        let result = verify(&c, "Something else entirely").await;
        assert!(!result.passed);
        assert!(result.reason.contains("not found"));
    }

    #[tokio::test]
    async fn string_match_empty_promise() {
        let c = criteria("", VerificationMethod::StringMatch, json!({}));
        let result = verify(&c, "Some output").await;
        assert!(!result.passed);
        assert!(result.reason.contains("No promise text"));
    }

    #[tokio::test]
    async fn string_match_empty_output() {
        let c = criteria("DONE", VerificationMethod::StringMatch, json!({}));
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("No output"));
    }

    // -- semantic ----------------------------------------------------------

    #[tokio::test]
    async fn semantic_no_criteria_passes() {
        let c = criteria("DONE", VerificationMethod::Semantic, json!({}));
        let result = verify(&c, "Some output here").await;
        assert!(result.passed);
        assert!(result.reason.contains("No specific criteria"));
    }

    #[tokio::test]
    async fn semantic_negative_pattern_rejects() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"check_for": ["feature implemented"], "negative_patterns": ["TODO", "FIXME"]}),
        );
        let result = verify(&c, "Feature done but TODO: add tests").await;
        assert!(!result.passed);
        assert!(result.reason.to_lowercase().contains("negative pattern"));
        assert!(result.reason.contains("TODO"));
    }

    #[tokio::test]
    async fn semantic_negative_pattern_case_insensitive() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"negative_patterns": ["ERROR"]}),
        );
        let result = verify(&c, "There was an error somewhere").await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn semantic_criteria_met() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"check_for": ["tests pass", "code complete"]}),
        );
        let output = "All tests pass successfully. The code is complete and working.";
        assert!(verify(&c, output).await.passed);
    }

    #[tokio::test]
    async fn semantic_criteria_not_met() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"check_for": ["authentication implemented", "jwt tokens working"]}),
        );
        let result = verify(&c, "Started working on the feature, still in progress.").await;
        assert!(!result.passed);
        assert!(result.reason.to_lowercase().contains("not evident"));
    }

    #[tokio::test]
    async fn semantic_lists_at_most_three_missing() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"check_for": ["alpha missing", "bravo missing", "charlie missing", "delta missing"]}),
        );
        let result = verify(&c, "completely unrelated output").await;
        assert!(!result.passed);
        // Only the first three are listed.
        assert!(!result.reason.contains("delta"));
    }

    #[tokio::test]
    async fn semantic_empty_output_fails() {
        let c = criteria(
            "DONE",
            VerificationMethod::Semantic,
            json!({"check_for": ["something"]}),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("No output"));
    }

    // -- external ----------------------------------------------------------

    #[tokio::test]
    async fn external_success() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "echo 'success'", "success_exit_code": 0}),
        );
        let result = verify(&c, "").await;
        assert!(result.passed, "reason: {}", result.reason);
    }

    #[tokio::test]
    async fn external_exit_code_mismatch() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "exit 1"}),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("exited with 1"));
    }

    #[tokio::test]
    async fn external_expected_nonzero_exit() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "exit 3", "success_exit_code": 3}),
        );
        assert!(verify(&c, "").await.passed);
    }

    #[tokio::test]
    async fn external_output_contains() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "echo 'all tests passed'", "output_contains": "passed"}),
        );
        assert!(verify(&c, "").await.passed);
    }

    #[tokio::test]
    async fn external_output_contains_missing() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "echo 'hello'", "output_contains": "goodbye"}),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("doesn't contain"));
    }

    #[tokio::test]
    async fn external_output_not_contains_found() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "echo 'FAILED test'", "output_not_contains": "FAILED"}),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.to_lowercase().contains("forbidden"));
    }

    #[tokio::test]
    async fn external_no_command() {
        let c = criteria("DONE", VerificationMethod::External, json!({}));
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("No command"));
    }

    #[tokio::test]
    async fn external_timeout() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "sleep 10", "timeout": 1}),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.to_lowercase().contains("timed out"));
    }

    #[tokio::test]
    async fn external_missing_working_dir() {
        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "true", "working_dir": "no/such/dir"}),
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Verifier::new()
            .verify(&c, "", Some(dir.path()), &VerifyContext::default())
            .await;
        assert!(!result.passed);
        assert!(result.reason.contains("does not exist"));
    }

    #[tokio::test]
    async fn external_runs_in_worktree() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("test.txt"), "hello").expect("write");

        let c = criteria(
            "DONE",
            VerificationMethod::External,
            json!({"command": "test -f test.txt"}),
        );
        let result = Verifier::new()
            .verify(&c, "", Some(dir.path()), &VerifyContext::default())
            .await;
        assert!(result.passed, "reason: {}", result.reason);
    }

    // -- multi_stage -------------------------------------------------------

    #[tokio::test]
    async fn multi_stage_all_pass() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "require_all": true,
                "stages": [
                    {"name": "echo_test", "method": "external",
                     "config": {"command": "echo 'ok'"}, "required": true},
                    {"name": "string_check", "method": "string_match",
                     "config": {"promise": "DONE"}, "required": true},
                ],
            }),
        );
        let result = verify(&c, "Task DONE").await;
        assert!(result.passed, "reason: {}", result.reason);
        assert!(result.reason.contains("2/2"));
    }

    #[tokio::test]
    async fn multi_stage_required_failure_short_circuits() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "require_all": true,
                "stages": [
                    {"name": "will_fail", "method": "external",
                     "config": {"command": "exit 1"}, "required": true},
                    {"name": "never_runs", "method": "string_match",
                     "config": {"promise": "DONE"}, "required": true},
                ],
            }),
        );
        let result = verify(&c, "DONE").await;
        assert!(!result.passed);
        assert!(result.reason.contains("will_fail"));
    }

    #[tokio::test]
    async fn multi_stage_optional_failure_passes() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "require_all": true,
                "stages": [
                    {"name": "required_pass", "method": "external",
                     "config": {"command": "echo 'ok'"}, "required": true},
                    {"name": "optional_fail", "method": "external",
                     "config": {"command": "exit 1"}, "required": false},
                ],
            }),
        );
        let result = verify(&c, "").await;
        assert!(result.passed, "reason: {}", result.reason);
        assert!(result.reason.contains("1/2"));
    }

    #[tokio::test]
    async fn multi_stage_no_stages_passes_vacuously() {
        let c = criteria("DONE", VerificationMethod::MultiStage, json!({"stages": []}));
        let result = verify(&c, "").await;
        assert!(result.passed);
        assert!(result.reason.contains("No verification stages"));
    }

    #[tokio::test]
    async fn multi_stage_semantic_stage() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "stages": [
                    {"name": "semantic_check", "method": "semantic",
                     "config": {"check_for": ["tests pass"], "negative_patterns": ["FAILED"]},
                     "required": true},
                ],
            }),
        );
        assert!(verify(&c, "All tests pass successfully").await.passed);
    }

    #[tokio::test]
    async fn multi_stage_unknown_method_fails_stage() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "stages": [
                    {"name": "unknown", "method": "unknown_method", "config": {}, "required": true},
                ],
            }),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("Unknown method"));
    }

    #[tokio::test]
    async fn multi_stage_may_not_nest() {
        let c = criteria(
            "DONE",
            VerificationMethod::MultiStage,
            json!({
                "stages": [
                    {"name": "nested", "method": "multi_stage",
                     "config": {"stages": []}, "required": true},
                ],
            }),
        );
        let result = verify(&c, "").await;
        assert!(!result.passed);
        assert!(result.reason.contains("may not nest"));
    }

    // -- duration ----------------------------------------------------------

    #[tokio::test]
    async fn duration_is_recorded() {
        let c = criteria("DONE", VerificationMethod::StringMatch, json!({}));
        let result = verify(&c, "DONE").await;
        assert!(result.duration_ms >= 0);
        assert_eq!(result.method, VerificationMethod::StringMatch);
    }
}
