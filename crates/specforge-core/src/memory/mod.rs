//! Memory sink: entity extraction from agent outputs.
//!
//! After every pipeline iteration the agent's output is fed into a
//! [`MemorySink`]. The default [`EntityMemory`] keeps a small JSON-backed
//! store of file references and recorded decisions and renders them back
//! into later prompts. The sink is best-effort; extraction failures never
//! fail a stage.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// File extensions that count as file references when mentioned in output.
const FILE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "md", "json", "yaml", "yml", "toml", "sql",
];

/// Pluggable sink receiving agent output after every iteration.
#[async_trait]
pub trait MemorySink: Send + Sync {
    /// Extract whatever is worth remembering from `text`. `source` is
    /// `"<role>:<task_id>"`.
    async fn extract(&self, text: &str, source: &str, spec_id: &str);

    /// Render remembered context for a spec as a markdown block (empty
    /// string when nothing is known).
    async fn context_for_spec(&self, spec_id: &str) -> String;
}

/// A sink that remembers nothing. Used in tests and when memory is
/// disabled.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

#[async_trait]
impl MemorySink for NullSink {
    async fn extract(&self, _text: &str, _source: &str, _spec_id: &str) {}

    async fn context_for_spec(&self, _spec_id: &str) -> String {
        String::new()
    }
}

/// An extracted entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// "file" or "decision".
    pub kind: String,
    pub name: String,
    pub description: String,
    pub source: String,
    pub spec_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub relevance: f64,
}

/// JSON-file-backed entity store.
#[derive(Debug, Clone)]
pub struct EntityMemory {
    path: PathBuf,
    entities: Arc<Mutex<BTreeMap<String, Entity>>>,
}

impl EntityMemory {
    /// Open (or create) the store at `<memory_dir>/entities.json`.
    pub fn open(memory_dir: impl Into<PathBuf>) -> Self {
        let dir: PathBuf = memory_dir.into();
        let path = dir.join("entities.json");
        let entities = load_entities(&path);
        Self {
            path,
            entities: Arc::new(Mutex::new(entities)),
        }
    }

    fn save(&self, entities: &BTreeMap<String, Entity>) {
        let list: Vec<&Entity> = entities.values().collect();
        let payload = match serde_json::to_string_pretty(&list) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize memory entities");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, payload) {
            warn!(path = %self.path.display(), error = %e, "failed to persist memory entities");
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn load_entities(path: &std::path::Path) -> BTreeMap<String, Entity> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<Vec<Entity>>(&contents) {
        Ok(list) => list.into_iter().map(|e| (e.id.clone(), e)).collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable memory store, starting fresh");
            BTreeMap::new()
        }
    }
}

#[async_trait]
impl MemorySink for EntityMemory {
    async fn extract(&self, text: &str, source: &str, spec_id: &str) {
        let now = Utc::now();
        let mut fresh: Vec<Entity> = Vec::new();

        for token in text.split_whitespace() {
            if let Some(file) = file_reference(token) {
                fresh.push(Entity {
                    id: format!("file:{file}"),
                    kind: "file".into(),
                    name: file.to_owned(),
                    description: format!("File referenced in {source}"),
                    source: source.to_owned(),
                    spec_id: spec_id.to_owned(),
                    created_at: now,
                    updated_at: now,
                    relevance: 1.0,
                });
            }
        }

        for line in text.lines() {
            if let Some(decision) = decision_line(line) {
                let mut hasher = DefaultHasher::new();
                decision.hash(&mut hasher);
                fresh.push(Entity {
                    id: format!("decision:{:x}", hasher.finish()),
                    kind: "decision".into(),
                    name: decision.chars().take(50).collect(),
                    description: decision.to_owned(),
                    source: source.to_owned(),
                    spec_id: spec_id.to_owned(),
                    created_at: now,
                    updated_at: now,
                    relevance: 0.9,
                });
            }
        }

        if fresh.is_empty() {
            return;
        }

        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for entity in fresh {
            if !entities.contains_key(&entity.id) {
                entities.insert(entity.id.clone(), entity);
                changed = true;
            }
        }
        if changed {
            self.save(&entities);
        }
    }

    async fn context_for_spec(&self, spec_id: &str) -> String {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());

        let mut by_kind: BTreeMap<&str, Vec<&Entity>> = BTreeMap::new();
        for entity in entities.values() {
            if entity.spec_id == spec_id {
                by_kind.entry(entity.kind.as_str()).or_default().push(entity);
            }
        }
        if by_kind.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Relevant Context from Memory\n\n");
        for (kind, mut group) in by_kind {
            group.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            out.push_str(&format!("### {kind}s\n\n"));
            for entity in group.into_iter().take(5) {
                out.push_str(&format!("- **{}**: {}\n", entity.name, entity.description));
            }
            out.push('\n');
        }
        out
    }
}

/// Treat a whitespace token as a file reference when it ends with a known
/// source extension.
fn file_reference(token: &str) -> Option<&str> {
    let trimmed = token.trim_matches(|c: char| {
        matches!(c, '(' | ')' | '[' | ']' | '`' | '"' | '\'' | ',' | ';' | ':')
    });
    let (stem, ext) = trimmed.rsplit_once('.')?;
    if stem.is_empty() || !FILE_EXTENSIONS.contains(&ext) {
        return None;
    }
    let plausible = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'));
    plausible.then_some(trimmed)
}

/// Extract the decision text from a line such as "Decision: use sqlite".
fn decision_line(line: &str) -> Option<&str> {
    let lower = line.to_lowercase();
    for marker in ["decision:", "we decided:", "chosen approach:"] {
        if let Some(pos) = lower.find(marker) {
            let rest = line[pos + marker.len()..].trim();
            if !rest.is_empty() {
                return Some(rest);
            }
        }
    }
    None
}
