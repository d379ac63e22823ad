//! Prompt construction for pipeline stages.
//!
//! Prompts are built by pure functions over a [`PromptContext`] snapshot;
//! the only I/O is the explicit [`PromptContext::load`] step that reads the
//! spec, plan and constitution files. This keeps every template trivially
//! testable.

use std::path::Path;

use specforge_db::models::{AgentRole, Task};

/// External text folded into an agent prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Contents of `specs/<spec_id>/spec.md`.
    pub spec_text: Option<String>,
    /// Contents of `specs/<spec_id>/plan.md`.
    pub plan_text: Option<String>,
    /// Contents of `.specforge/constitution.md`.
    pub constitution_text: Option<String>,
    /// Rendered memory context for the spec.
    pub memory_context: String,
}

impl PromptContext {
    /// Read the spec, plan and constitution files for a spec from disk.
    /// Missing files simply leave their slot empty.
    pub fn load(project_root: &Path, spec_id: &str, memory_context: String) -> Self {
        let spec_dir = project_root.join("specs").join(spec_id);
        Self {
            spec_text: read_optional(&spec_dir.join("spec.md")),
            plan_text: read_optional(&spec_dir.join("plan.md")),
            constitution_text: read_optional(
                &project_root
                    .join(crate::config::APP_DIR)
                    .join(crate::config::CONSTITUTION_FILE),
            ),
            memory_context,
        }
    }
}

fn read_optional(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Build the base prompt for a pipeline stage. The ralph suffix, when
/// enabled, is appended separately by the pipeline.
pub fn build_agent_prompt(
    task: &Task,
    stage_name: &str,
    role: AgentRole,
    iteration: u32,
    max_iterations: u32,
    worktree_path: &Path,
    ctx: &PromptContext,
) -> String {
    let mut prompt = format!(
        "You are the specforge-{role} agent working on task {id}.\n\n\
         ## Task Information\n\
         - **Task ID**: {id}\n\
         - **Title**: {title}\n\
         - **Description**: {description}\n\
         - **Priority**: {priority}\n\
         - **Iteration**: {iteration}/{max_iterations}\n\
         - **Stage**: {stage_name}\n\n\
         ## Working Directory\n\
         You are working in: {worktree}\n\n",
        id = task.id,
        title = task.title,
        description = task.description,
        priority = task.priority,
        worktree = worktree_path.display(),
    );

    prompt.push_str("## Specification\n");
    prompt.push_str(ctx.spec_text.as_deref().unwrap_or("No specification found."));
    prompt.push_str("\n\n## Implementation Plan\n");
    prompt.push_str(
        ctx.plan_text
            .as_deref()
            .unwrap_or("No implementation plan found."),
    );
    prompt.push_str("\n\n");

    if let Some(constitution) = &ctx.constitution_text {
        prompt.push_str("## Project Constitution\n");
        prompt.push_str(constitution);
        prompt.push_str("\n\n");
    }

    if !ctx.memory_context.is_empty() {
        prompt.push_str(&ctx.memory_context);
        prompt.push('\n');
    }

    prompt.push_str(&followup_instructions(task));
    prompt.push_str("\n## Your Task\n");
    prompt.push_str(role_instructions(role));
    prompt
}

/// Instructions for creating follow-up tasks instead of leaving TODOs.
pub fn followup_instructions(task: &Task) -> String {
    format!(
        "## Creating Follow-up Tasks\n\n\
         When you encounter work that should be done but is outside your current task scope,\n\
         you may create a follow-up task. But FIRST check if a similar task already exists:\n\n\
         ```bash\n\
         # Step 1: ALWAYS check existing tasks first\n\
         specforge tasks list --spec {spec_id} --json\n\n\
         # Step 2: Only if no similar task exists, create a new one\n\
         specforge tasks add <CATEGORY>-<NUMBER> \"{spec_id}\" \"Task title\" \\\n\
             --parent {task_id} \\\n\
             --priority <2|3> \\\n\
             --description \"Detailed description of what needs to be done\"\n\
         ```\n\n\
         **Categories for follow-up tasks:**\n\
         - `PLACEHOLDER-xxx`: Code you left stubbed or unimplemented\n\
         - `TECH-DEBT-xxx`: Technical debt you noticed\n\
         - `REFACTOR-xxx`: Code that should be refactored\n\
         - `TEST-GAP-xxx`: Missing test coverage\n\
         - `EDGE-CASE-xxx`: Edge cases that need handling\n\
         - `DOC-xxx`: Documentation gaps\n\n\
         **IMPORTANT:**\n\
         - Before creating a task, review the existing task list to avoid duplicates.\n\
         - If a similar task exists, skip creation or note it in your output.\n\
         - Always create tasks rather than leaving undocumented TODOs in code.\n\
         - Use priority 2 for important issues, priority 3 for nice-to-have improvements.\n",
        spec_id = task.spec_id,
        task_id = task.id,
    )
}

/// Role-specific closing instructions, including the legacy plain-text
/// completion markers used when the ralph loop is disabled.
pub fn role_instructions(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Architect => {
            "\nDesign the solution for this task.\n\n\
             1. Read the specification and the existing code structure\n\
             2. Decide the module boundaries and interfaces\n\
             3. Record the design decisions and their trade-offs\n\
             4. Do not modify source files\n\n\
             When complete, output: DESIGN COMPLETE\n\n\
             If you encounter blockers, output: BLOCKED: <reason>\n"
        }
        AgentRole::Coder => {
            "\nImplement the task requirements. Follow the specification and plan exactly.\n\n\
             1. Read the relevant files to understand the codebase\n\
             2. Implement the required changes\n\
             3. Ensure code follows project conventions\n\
             4. Commit your changes with a descriptive message\n\n\
             When complete, output: IMPLEMENTATION COMPLETE\n\n\
             If you encounter blockers, output: BLOCKED: <reason>\n"
        }
        AgentRole::Reviewer => {
            "\nReview the code changes made for this task.\n\n\
             1. Check that implementation matches the specification\n\
             2. Look for bugs, security issues, and code quality problems\n\
             3. Verify coding standards are followed\n\
             4. Check for edge cases and error handling\n\n\
             Output one of:\n\
             - REVIEW PASSED - if code is ready for testing\n\
             - REVIEW FAILED: <issues> - if there are problems to fix\n"
        }
        AgentRole::Tester => {
            "\nWrite and run tests for this task.\n\n\
             1. Create unit tests for new functionality\n\
             2. Create integration tests where appropriate\n\
             3. Run the test suite\n\
             4. Ensure adequate coverage\n\n\
             Output one of:\n\
             - TESTS PASSED - if all tests pass\n\
             - TESTS FAILED: <details> - if tests fail\n"
        }
        AgentRole::Qa => {
            "\nPerform final QA validation.\n\n\
             1. Verify all acceptance criteria are met\n\
             2. Check that the implementation matches the spec\n\
             3. Ensure no regressions in existing functionality\n\
             4. Validate edge cases\n\n\
             Output one of:\n\
             - QA PASSED - if ready for merge\n\
             - QA FAILED: <issues> - if there are problems\n"
        }
    }
}
