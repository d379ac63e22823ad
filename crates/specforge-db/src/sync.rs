//! JSONL mirror: an append-only sidecar file of spec/task mutations.
//!
//! The mirror exists for cross-machine sync through version control: the
//! file is committed alongside the project, and on load the store replays
//! it (`Store::import_jsonl`) to pick up records written elsewhere. Each
//! committed mutation appends exactly one record; the file is never
//! rewritten in place.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Spec, Task};

/// One mirrored mutation. The payload carries the full entity so replay is
/// a plain upsert and ordering conflicts resolve as last-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorRecord {
    Spec {
        at: DateTime<Utc>,
        payload: Spec,
    },
    Task {
        at: DateTime<Utc>,
        payload: Task,
    },
}

/// Appends mirror records to a JSONL file. Clones share one append lock so
/// concurrent workers never interleave partial lines.
#[derive(Debug, Clone)]
pub struct JsonlMirror {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonlMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_spec(&self, spec: &Spec) -> std::io::Result<()> {
        self.append(&MirrorRecord::Spec {
            at: Utc::now(),
            payload: spec.clone(),
        })
    }

    pub fn append_task(&self, task: &Task) -> std::io::Result<()> {
        self.append(&MirrorRecord::Task {
            at: Utc::now(),
            payload: task.clone(),
        })
    }

    fn append(&self, record: &MirrorRecord) -> std::io::Result<()> {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize mirror record, skipping");
                return Ok(());
            }
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Read all records from a JSONL mirror file in order. Unparseable lines
/// are skipped with a warning so one bad merge does not poison the import.
pub fn read_records(path: &Path) -> std::io::Result<Vec<MirrorRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MirrorRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "skipping malformed mirror record");
            }
        }
    }
    Ok(records)
}
