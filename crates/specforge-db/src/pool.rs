use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::store::StoreError;

/// The schema, applied idempotently every time a store is opened. SQLite
/// has no separate migration directory here; the statements are embedded
/// so installed binaries need no source tree on disk.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS specs (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'draft',
    source      TEXT NOT NULL DEFAULT 'none',
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    spec_id         TEXT NOT NULL REFERENCES specs(id),
    title           TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL DEFAULT 'todo',
    priority        INTEGER NOT NULL DEFAULT 1,
    dependencies    TEXT NOT NULL DEFAULT '[]',
    iteration       INTEGER NOT NULL DEFAULT 0,
    worktree        TEXT,
    assignee        TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    completion_spec TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_spec ON tasks(spec_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS execution_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL,
    stage_name  TEXT NOT NULL,
    agent_role  TEXT NOT NULL,
    iteration   INTEGER NOT NULL,
    output      TEXT NOT NULL,
    passed      INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    timestamp   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_execution_log_task ON execution_log(task_id);

CREATE TABLE IF NOT EXISTS agent_registrations (
    task_id       TEXT PRIMARY KEY,
    slot_id       INTEGER NOT NULL,
    agent_role    TEXT NOT NULL,
    worktree_path TEXT NOT NULL,
    started_at    TEXT NOT NULL
);
"#;

/// Open (creating if missing) the database file and apply the schema.
///
/// WAL mode and a busy timeout are set so concurrent pipeline workers can
/// write their execution logs without tripping over each other.
pub async fn open_pool(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    info!(path = %path.display(), "database opened");
    Ok(pool)
}

/// Open an in-memory database for tests. A single connection keeps the
/// memory database alive and shared.
pub async fn open_memory_pool() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply the embedded schema (idempotent).
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
