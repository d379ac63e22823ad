use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a spec. The variants are ordered by lifecycle progression;
/// everything from [`SpecStatus::Approved`] onwards authorises execution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Draft,
    Clarifying,
    Specified,
    Approved,
    Planning,
    Planned,
    Implementing,
    Completed,
    Archived,
}

impl SpecStatus {
    /// Whether tasks under this spec are authorised to execute.
    pub fn is_approved(self) -> bool {
        self >= Self::Approved
    }
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Clarifying => "clarifying",
            Self::Specified => "specified",
            Self::Approved => "approved",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Implementing => "implementing",
            Self::Completed => "completed",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for SpecStatus {
    type Err = SpecStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "clarifying" => Ok(Self::Clarifying),
            "specified" => Ok(Self::Specified),
            "approved" => Ok(Self::Approved),
            "planning" => Ok(Self::Planning),
            "planned" => Ok(Self::Planned),
            "implementing" => Ok(Self::Implementing),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(SpecStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SpecStatus`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid spec status: {0:?}")]
pub struct SpecStatusParseError(pub String);

// ---------------------------------------------------------------------------

/// Where a spec originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Brd,
    Prd,
    None,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Brd => "brd",
            Self::Prd => "prd",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for SourceKind {
    type Err = SourceKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brd" => Ok(Self::Brd),
            "prd" => Ok(Self::Prd),
            "none" => Ok(Self::None),
            other => Err(SourceKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SourceKind`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid source kind: {0:?}")]
pub struct SourceKindParseError(pub String);

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `todo` is the only schedulable status. `implementing`, `reviewing` and
/// `testing` mean a pipeline stage currently owns the task's worktree.
/// `blocked` and `archived` are operator-set and never scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Implementing,
    Reviewing,
    Testing,
    Done,
    Blocked,
    Archived,
}

impl TaskStatus {
    /// Whether a worktree is expected to exist for a task in this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Implementing | Self::Reviewing | Self::Testing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::Testing => "testing",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "testing" => Ok(Self::Testing),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "archived" => Ok(Self::Archived),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid task status: {0:?}")]
pub struct TaskStatusParseError(pub String);

// ---------------------------------------------------------------------------

/// Role of the agent driving a pipeline stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Coder,
    Reviewer,
    Tester,
    Qa,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Qa => "qa",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = AgentRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architect" => Ok(Self::Architect),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "tester" => Ok(Self::Tester),
            "qa" => Ok(Self::Qa),
            other => Err(AgentRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRole`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid agent role: {0:?}")]
pub struct AgentRoleParseError(pub String);

// ---------------------------------------------------------------------------

/// How a completion promise is verified. A closed enumeration: new methods
/// are added here, not via an open trait hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    StringMatch,
    Semantic,
    External,
    MultiStage,
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StringMatch => "string_match",
            Self::Semantic => "semantic",
            Self::External => "external",
            Self::MultiStage => "multi_stage",
        };
        f.write_str(s)
    }
}

impl FromStr for VerificationMethod {
    type Err = VerificationMethodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string_match" => Ok(Self::StringMatch),
            "semantic" => Ok(Self::Semantic),
            "external" => Ok(Self::External),
            "multi_stage" => Ok(Self::MultiStage),
            other => Err(VerificationMethodParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`VerificationMethod`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid verification method: {0:?}")]
pub struct VerificationMethodParseError(pub String);

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A free-form metadata map attached to specs and tasks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// An approved unit of work that authorises tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub title: String,
    pub status: SpecStatus,
    pub source: SourceKind,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Spec {
    /// Build a new draft spec with the given id and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: SpecStatus::Draft,
            source: SourceKind::None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of execution within a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub spec_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    /// Ids of tasks (on the same spec) that must be `done` first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Total pipeline iterations consumed so far.
    #[serde(default)]
    pub iteration: i64,
    /// Path of the task's worktree while a pipeline owns it.
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub completion_spec: Option<CompletionSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a new `todo` task.
    pub fn new(
        id: impl Into<String>,
        spec_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            spec_id: spec_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: 1,
            dependencies: Vec::new(),
            iteration: 0,
            worktree: None,
            assignee: None,
            metadata: Metadata::new(),
            completion_spec: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-task completion contract: an overall outcome, acceptance criteria,
/// and per-role verification criteria.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionSpec {
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub criteria: BTreeMap<AgentRole, CompletionCriteria>,
}

impl CompletionSpec {
    /// Criteria for a specific agent role, if declared.
    pub fn criteria_for(&self, role: AgentRole) -> Option<&CompletionCriteria> {
        self.criteria.get(&role)
    }
}

/// The rule deciding whether a declared promise is genuine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCriteria {
    pub promise: String,
    #[serde(default)]
    pub description: String,
    pub method: VerificationMethod,
    /// Method-specific configuration (see the verifier for per-method keys).
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl CompletionCriteria {
    pub fn new(promise: impl Into<String>, method: VerificationMethod) -> Self {
        Self {
            promise: promise.into(),
            description: String::new(),
            method,
            config: serde_json::Value::Object(serde_json::Map::new()),
            max_iterations: None,
        }
    }
}

/// One appended record of a pipeline stage iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub task_id: String,
    pub stage_name: String,
    pub agent_role: AgentRole,
    pub iteration: i64,
    pub output: String,
    pub passed: bool,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Fields for appending a new execution log entry.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub task_id: String,
    pub stage_name: String,
    pub agent_role: AgentRole,
    pub iteration: i64,
    pub output: String,
    pub passed: bool,
    pub duration_ms: i64,
}

/// A short-lived registry row describing an agent currently occupying a
/// pool slot. Deleted when the stage exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub task_id: String,
    pub slot_id: i64,
    pub agent_role: AgentRole,
    pub worktree_path: String,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
