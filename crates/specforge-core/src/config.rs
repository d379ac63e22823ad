//! Typed project configuration, loaded from `.specforge/config.yaml`.
//!
//! Unknown keys are ignored; missing keys fall back to defaults. Invalid
//! YAML or invalid enum values are fatal at load time: the process must not
//! start with a half-understood configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use specforge_db::models::{AgentRole, VerificationMethod};

/// Name of the per-project state directory.
pub const APP_DIR: &str = ".specforge";
/// Config file name inside [`APP_DIR`].
pub const CONFIG_FILE: &str = "config.yaml";
/// Constitution file name inside [`APP_DIR`].
pub const CONSTITUTION_FILE: &str = "constitution.md";
/// JSONL mirror file name inside [`APP_DIR`].
pub const SYNC_FILE: &str = "specs.jsonl";

/// Errors raised while loading configuration. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    Missing(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Walk upwards from `start` looking for a directory containing
/// [`APP_DIR`]. Returns the project root if found.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(APP_DIR).is_dir() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecforgeConfig {
    pub project: ProjectSection,
    pub agents: AgentsSection,
    pub execution: ExecutionSection,
    pub database: DatabaseSection,
    pub ralph: RalphSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: "unnamed-project".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// AgentPool capacity.
    pub max_parallel: usize,
    /// Model used when no per-role override is present.
    pub default_model: String,
    pub architect: RoleAgentSection,
    pub coder: RoleAgentSection,
    pub reviewer: RoleAgentSection,
    pub tester: RoleAgentSection,
    pub qa: RoleAgentSection,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            max_parallel: 6,
            default_model: "sonnet".to_owned(),
            architect: RoleAgentSection::default(),
            coder: RoleAgentSection::default(),
            reviewer: RoleAgentSection::default(),
            tester: RoleAgentSection::default(),
            qa: RoleAgentSection::default(),
        }
    }
}

impl AgentsSection {
    /// The model for a role: per-role override, else the default.
    pub fn model_for(&self, role: AgentRole) -> String {
        let section = match role {
            AgentRole::Architect => &self.architect,
            AgentRole::Coder => &self.coder,
            AgentRole::Reviewer => &self.reviewer,
            AgentRole::Tester => &self.tester,
            AgentRole::Qa => &self.qa,
        };
        section
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleAgentSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Global cap on the sum of iterations across all stages of one task.
    pub max_iterations: u32,
    /// Per-invocation agent timeout.
    pub timeout_minutes: u64,
    /// Worktree root, relative to the project root.
    pub worktree_dir: String,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeout_minutes: 10,
            worktree_dir: ".worktrees".to_owned(),
        }
    }
}

impl ExecutionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Store file, relative to the project root.
    pub path: String,
    /// Mirror mutations to `.specforge/specs.jsonl` and replay on load.
    pub sync_jsonl: bool,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: format!("{APP_DIR}/specforge.db"),
            sync_jsonl: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphSection {
    /// Master switch for the Ralph verification loop.
    pub enabled: bool,
    /// Default per-loop iteration cap.
    pub max_iterations: u32,
    /// Fallback verification method when a role declares none.
    pub default_verification: VerificationMethod,
    /// Per-role overrides.
    pub agent_defaults: BTreeMap<AgentRole, RalphAgentDefaults>,
}

impl Default for RalphSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 10,
            default_verification: VerificationMethod::StringMatch,
            agent_defaults: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphAgentDefaults {
    pub max_iterations: Option<u32>,
    pub promise: Option<String>,
    pub verification: Option<VerificationMethod>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl SpecforgeConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from YAML text.
    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Serialize and write to the given path, creating parent directories.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_yaml::to_string(self)
            .map_err(|e| std::io::Error::other(format!("serialize config: {e}")))?;
        std::fs::write(path, contents)
    }
}
