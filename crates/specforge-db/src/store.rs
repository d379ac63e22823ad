//! The `Store`: transactional persistence for specs, tasks, execution logs
//! and the active-agent registry, backed by SQLite.
//!
//! All mutations go through single statements or explicit transactions so a
//! failed operation never commits partial state. The optional JSONL mirror
//! is notified after a mutation commits.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::models::{
    AgentRegistration, AgentRole, CompletionSpec, ExecutionLogEntry, Metadata, NewExecutionLog,
    Spec, SpecStatus, Task, TaskStatus,
};
use crate::pool::{open_memory_pool, open_pool};
use crate::sync::JsonlMirror;

/// Maximum stored length of one execution-log output, in bytes.
const MAX_LOG_OUTPUT: usize = 10_000;

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("spec {0} not found")]
    SpecNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {task} depends on unknown task {dependency}")]
    InvalidDependency { task: String, dependency: String },

    #[error("corrupt {entity} row {id}: {reason}")]
    Decode {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("mirror error: {0}")]
    Mirror(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

// SQLite has no native array or JSON column type, so list/map fields live
// in TEXT columns and are decoded on the way out.

#[derive(sqlx::FromRow)]
struct SpecRow {
    id: String,
    title: String,
    status: SpecStatus,
    source: crate::models::SourceKind,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SpecRow {
    fn into_spec(self) -> Result<Spec> {
        let metadata: Metadata =
            serde_json::from_str(&self.metadata).map_err(|e| StoreError::Decode {
                entity: "spec",
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Spec {
            id: self.id,
            title: self.title,
            status: self.status,
            source: self.source,
            metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    spec_id: String,
    title: String,
    description: String,
    status: TaskStatus,
    priority: i64,
    dependencies: String,
    iteration: i64,
    worktree: Option<String>,
    assignee: Option<String>,
    metadata: String,
    completion_spec: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let decode = |reason: String| StoreError::Decode {
            entity: "task",
            id: self.id.clone(),
            reason,
        };
        let dependencies: Vec<String> =
            serde_json::from_str(&self.dependencies).map_err(|e| decode(e.to_string()))?;
        let metadata: Metadata =
            serde_json::from_str(&self.metadata).map_err(|e| decode(e.to_string()))?;
        let completion_spec: Option<CompletionSpec> = match &self.completion_spec {
            Some(text) => Some(serde_json::from_str(text).map_err(|e| decode(e.to_string()))?),
            None => None,
        };
        Ok(Task {
            id: self.id,
            spec_id: self.spec_id,
            title: self.title,
            description: self.description,
            status: self.status,
            priority: self.priority,
            dependencies,
            iteration: self.iteration,
            worktree: self.worktree,
            assignee: self.assignee,
            metadata,
            completion_spec,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionLogRow {
    id: i64,
    task_id: String,
    stage_name: String,
    agent_role: AgentRole,
    iteration: i64,
    output: String,
    passed: bool,
    duration_ms: i64,
    timestamp: DateTime<Utc>,
}

impl From<ExecutionLogRow> for ExecutionLogEntry {
    fn from(r: ExecutionLogRow) -> Self {
        ExecutionLogEntry {
            id: r.id,
            task_id: r.task_id,
            stage_name: r.stage_name,
            agent_role: r.agent_role,
            iteration: r.iteration,
            output: r.output,
            passed: r.passed,
            duration_ms: r.duration_ms,
            timestamp: r.timestamp,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    task_id: String,
    slot_id: i64,
    agent_role: AgentRole,
    worktree_path: String,
    started_at: DateTime<Utc>,
}

impl From<AgentRow> for AgentRegistration {
    fn from(r: AgentRow) -> Self {
        AgentRegistration {
            task_id: r.task_id,
            slot_id: r.slot_id,
            agent_role: r.agent_role,
            worktree_path: r.worktree_path,
            started_at: r.started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the backing database, cheap to clone and share across workers.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    mirror: Option<JsonlMirror>,
}

impl Store {
    /// Open (creating if needed) a store at the given file path.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        Ok(Self { pool, mirror: None })
    }

    /// Open an in-memory store (for tests).
    pub async fn in_memory() -> Result<Self> {
        let pool = open_memory_pool().await?;
        Ok(Self { pool, mirror: None })
    }

    /// Attach a JSONL mirror; every committed mutation appends a record.
    pub fn with_mirror(mut self, mirror: JsonlMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- specs --------------------------------------------------------------

    pub async fn create_spec(&self, spec: &Spec) -> Result<()> {
        let metadata = serde_json::to_string(&spec.metadata).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            "INSERT INTO specs (id, title, status, source, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&spec.id)
        .bind(&spec.title)
        .bind(spec.status)
        .bind(spec.source)
        .bind(&metadata)
        .bind(spec.created_at)
        .bind(spec.updated_at)
        .execute(&self.pool)
        .await?;

        self.mirror_spec(spec)?;
        Ok(())
    }

    pub async fn get_spec(&self, id: &str) -> Result<Option<Spec>> {
        let row: Option<SpecRow> = sqlx::query_as("SELECT * FROM specs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SpecRow::into_spec).transpose()
    }

    pub async fn list_specs(&self, status: Option<SpecStatus>) -> Result<Vec<Spec>> {
        let rows: Vec<SpecRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM specs WHERE status = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM specs ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(SpecRow::into_spec).collect()
    }

    pub async fn update_spec_status(&self, id: &str, status: SpecStatus) -> Result<()> {
        let result = sqlx::query("UPDATE specs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SpecNotFound(id.to_owned()));
        }

        if let Some(spec) = self.get_spec(id).await? {
            self.mirror_spec(&spec)?;
        }
        Ok(())
    }

    // -- tasks --------------------------------------------------------------

    /// Insert a new task. Every dependency must reference an existing task
    /// on the same spec.
    pub async fn create_task(&self, task: &Task) -> Result<()> {
        for dep_id in &task.dependencies {
            match self.get_task(dep_id).await? {
                Some(dep) if dep.spec_id == task.spec_id => {}
                _ => {
                    return Err(StoreError::InvalidDependency {
                        task: task.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
            }
        }

        self.insert_task_row(task).await?;
        self.mirror_task(task)?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    pub async fn list_tasks(
        &self,
        spec_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = match (spec_id, status) {
            (Some(spec), Some(status)) => {
                sqlx::query_as(
                    "SELECT * FROM tasks WHERE spec_id = ? AND status = ? \
                     ORDER BY created_at ASC, id ASC",
                )
                .bind(spec)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(spec), None) => {
                sqlx::query_as(
                    "SELECT * FROM tasks WHERE spec_id = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(spec)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(status)) => {
                sqlx::query_as(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query_as("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Overwrite a task row with exactly the given value.
    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let dependencies =
            serde_json::to_string(&task.dependencies).unwrap_or_else(|_| "[]".into());
        let metadata = serde_json::to_string(&task.metadata).unwrap_or_else(|_| "{}".into());
        let completion_spec = task
            .completion_spec
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".into()));

        let result = sqlx::query(
            "UPDATE tasks SET spec_id = ?, title = ?, description = ?, status = ?, \
             priority = ?, dependencies = ?, iteration = ?, worktree = ?, assignee = ?, \
             metadata = ?, completion_spec = ?, created_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&task.spec_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status)
        .bind(task.priority)
        .bind(&dependencies)
        .bind(task.iteration)
        .bind(&task.worktree)
        .bind(&task.assignee)
        .bind(&metadata)
        .bind(&completion_spec)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id.clone()));
        }

        self.mirror_task(task)?;
        Ok(())
    }

    /// Tasks that are ready to execute: status `todo`, owning spec approved
    /// or further, and every dependency `done`. Ordered by priority
    /// descending, then creation time, then id.
    pub async fn get_ready_tasks(&self, spec_id: Option<&str>) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = match spec_id {
            Some(spec) => {
                sqlx::query_as(
                    "SELECT t.* FROM tasks t JOIN specs s ON s.id = t.spec_id \
                     WHERE t.status = 'todo' AND t.spec_id = ? \
                     ORDER BY t.priority DESC, t.created_at ASC, t.id ASC",
                )
                .bind(spec)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT t.* FROM tasks t JOIN specs s ON s.id = t.spec_id \
                     WHERE t.status = 'todo' \
                     ORDER BY t.priority DESC, t.created_at ASC, t.id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut spec_approved: HashMap<String, bool> = HashMap::new();
        let mut dep_status: HashMap<String, Option<TaskStatus>> = HashMap::new();
        let mut ready = Vec::new();

        'candidates: for row in rows {
            let task = row.into_task()?;

            let approved = match spec_approved.get(&task.spec_id) {
                Some(v) => *v,
                None => {
                    let v = self
                        .get_spec(&task.spec_id)
                        .await?
                        .map(|s| s.status.is_approved())
                        .unwrap_or(false);
                    spec_approved.insert(task.spec_id.clone(), v);
                    v
                }
            };
            if !approved {
                continue;
            }

            for dep_id in &task.dependencies {
                let status = match dep_status.get(dep_id) {
                    Some(v) => *v,
                    None => {
                        let v = self.get_task(dep_id).await?.map(|t| t.status);
                        dep_status.insert(dep_id.clone(), v);
                        v
                    }
                };
                if status != Some(TaskStatus::Done) {
                    continue 'candidates;
                }
            }

            ready.push(task);
        }

        Ok(ready)
    }

    /// Atomically claim a ready task for execution: `todo -> implementing`.
    ///
    /// Returns `true` when this call performed the transition, `false` when
    /// the task was not in `todo` (already claimed, missing, or terminal).
    /// This single conditional UPDATE is what prevents two scheduler cycles
    /// from double-assigning a task.
    pub async fn try_claim_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'implementing', updated_at = ? \
             WHERE id = ? AND status = 'todo'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if claimed {
            if let Some(task) = self.get_task(id).await? {
                self.mirror_task(&task)?;
            }
        }
        Ok(claimed)
    }

    // -- execution log ------------------------------------------------------

    /// Append an execution log entry. Output is truncated to a bounded
    /// length at a UTF-8 boundary. Entries are never deleted.
    pub async fn log_execution(&self, entry: &NewExecutionLog) -> Result<i64> {
        let output = truncate_output(&entry.output, MAX_LOG_OUTPUT);
        let result = sqlx::query(
            "INSERT INTO execution_log \
             (task_id, stage_name, agent_role, iteration, output, passed, duration_ms, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.task_id)
        .bind(&entry.stage_name)
        .bind(entry.agent_role)
        .bind(entry.iteration)
        .bind(output)
        .bind(entry.passed)
        .bind(entry.duration_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All log entries for a task in append order.
    pub async fn list_executions(&self, task_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        let rows: Vec<ExecutionLogRow> =
            sqlx::query_as("SELECT * FROM execution_log WHERE task_id = ? ORDER BY id ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // -- agent registry -----------------------------------------------------

    /// Record that an agent occupies a slot for a task. Replaces any stale
    /// row for the same task.
    pub async fn register_agent(
        &self,
        task_id: &str,
        role: AgentRole,
        slot_id: i64,
        worktree_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO agent_registrations \
             (task_id, slot_id, agent_role, worktree_path, started_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(slot_id)
        .bind(role)
        .bind(worktree_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove the registry row for a task. No-op when absent.
    pub async fn deregister_agent(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_registrations WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRegistration>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agent_registrations ORDER BY started_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // -- JSONL import -------------------------------------------------------

    /// Replay a JSONL mirror file into this store (upsert by id, last
    /// record wins). Used on project load to pick up changes synced from
    /// another machine. Records written here are not re-mirrored.
    pub async fn import_jsonl(&self, path: &Path) -> Result<usize> {
        let records = crate::sync::read_records(path)?;
        let count = records.len();
        for record in records {
            match record {
                crate::sync::MirrorRecord::Spec { payload, .. } => {
                    self.upsert_spec_row(&payload).await?;
                }
                crate::sync::MirrorRecord::Task { payload, .. } => {
                    self.upsert_task_row(&payload).await?;
                }
            }
        }
        Ok(count)
    }

    // -- internals ----------------------------------------------------------

    async fn insert_task_row(&self, task: &Task) -> Result<()> {
        let dependencies =
            serde_json::to_string(&task.dependencies).unwrap_or_else(|_| "[]".into());
        let metadata = serde_json::to_string(&task.metadata).unwrap_or_else(|_| "{}".into());
        let completion_spec = task
            .completion_spec
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".into()));

        sqlx::query(
            "INSERT INTO tasks \
             (id, spec_id, title, description, status, priority, dependencies, iteration, \
              worktree, assignee, metadata, completion_spec, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.spec_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status)
        .bind(task.priority)
        .bind(&dependencies)
        .bind(task.iteration)
        .bind(&task.worktree)
        .bind(&task.assignee)
        .bind(&metadata)
        .bind(&completion_spec)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_spec_row(&self, spec: &Spec) -> Result<()> {
        let metadata = serde_json::to_string(&spec.metadata).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            "INSERT OR REPLACE INTO specs \
             (id, title, status, source, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&spec.id)
        .bind(&spec.title)
        .bind(spec.status)
        .bind(spec.source)
        .bind(&metadata)
        .bind(spec.created_at)
        .bind(spec.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_task_row(&self, task: &Task) -> Result<()> {
        if self.get_task(&task.id).await?.is_some() {
            // update_task mirrors; bypass by issuing the raw update here.
            let dependencies =
                serde_json::to_string(&task.dependencies).unwrap_or_else(|_| "[]".into());
            let metadata = serde_json::to_string(&task.metadata).unwrap_or_else(|_| "{}".into());
            let completion_spec = task
                .completion_spec
                .as_ref()
                .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".into()));
            sqlx::query(
                "UPDATE tasks SET spec_id = ?, title = ?, description = ?, status = ?, \
                 priority = ?, dependencies = ?, iteration = ?, worktree = ?, assignee = ?, \
                 metadata = ?, completion_spec = ?, created_at = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&task.spec_id)
            .bind(&task.title)
            .bind(&task.description)
            .bind(task.status)
            .bind(task.priority)
            .bind(&dependencies)
            .bind(task.iteration)
            .bind(&task.worktree)
            .bind(&task.assignee)
            .bind(&metadata)
            .bind(&completion_spec)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
        } else {
            self.insert_task_row(task).await?;
        }
        Ok(())
    }

    fn mirror_spec(&self, spec: &Spec) -> Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.append_spec(spec)?;
        }
        Ok(())
    }

    fn mirror_task(&self, task: &Task) -> Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.append_task(task)?;
        }
        Ok(())
    }
}

/// Truncate a string to at most `max_bytes` bytes at a UTF-8 boundary,
/// appending "..." when truncated.
fn truncate_output(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}
