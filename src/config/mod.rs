//! Configuration resolution.
//!
//! The engine never mutates configuration: everything here is resolved once
//! at process start into a plain [`EngineConfig`] value and passed by
//! parameter into every component (no lazily-initialized singleton).
//!
//! # Layout
//!
//! Memtrail keeps one store per project under a `.memtrail/` directory:
//! - `memtrail.db`: the SQLite store
//! - `CONTEXT.md`: the canonical rendered state document
//! - `archive/`: rotated state documents
//! - `config.json`: optional overrides (unknown keys preserved)
//!
//! Resolution strategy for the project directory:
//! 1. Check the **git root** first. If it has `.memtrail/`, use it; this
//!    prevents subdirectory dirs from shadowing the real project root.
//! 2. Fall back to walking up from CWD (for non-git projects).
//! 3. Fall back to `~/.memtrail/` so hook invocations outside any project
//!    still have somewhere durable to write.

use crate::error::{Error, Result};
use crate::model::TriggerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fixed begin marker for the injected context block.
pub const CONTEXT_BEGIN: &str = "<!-- memtrail:context:begin -->";
/// Fixed end marker for the injected context block.
pub const CONTEXT_END: &str = "<!-- memtrail:context:end -->";

/// Default decision phrases scanned in assistant-authored text.
const DEFAULT_DECISION_PHRASES: &[&str] = &[
    "decided to",
    "decision:",
    "going with",
    "we'll use",
    "opting for",
    "settled on",
    "chose to",
];

/// Default knowledge-source path fragments that make a file read worth
/// keeping as a discovery.
const DEFAULT_KNOWLEDGE_PATHS: &[&str] = &[
    "README",
    "CLAUDE.md",
    "AGENTS.md",
    "docs/",
    "ARCHITECTURE",
    ".memtrail/",
];

/// Sync settings, read-only input from the resolution collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Remote endpoint; sync is a no-op success when unset.
    pub endpoint: Option<String>,
    /// Bearer token for the remote.
    pub token: Option<String>,
    /// Include the memory category (observations + summaries).
    pub memory: bool,
    /// Include the analytics category.
    pub analytics: bool,
    /// Include the audit category.
    pub audit: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            memory: true,
            analytics: true,
            audit: true,
        }
    }
}

impl SyncSettings {
    /// Sync is enabled only when an endpoint is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// On-disk config file shape. Unknown keys land in the explicit `extra`
/// side bag instead of being silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    db: Option<PathBuf>,
    context_doc: Option<PathBuf>,
    archive_dir: Option<PathBuf>,
    budgets: BTreeMap<String, usize>,
    decision_phrases: Option<Vec<String>>,
    knowledge_paths: Option<Vec<String>>,
    sync: SyncSettings,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the SQLite store.
    pub db_path: PathBuf,
    /// Canonical rendered state document.
    pub context_doc: PathBuf,
    /// Directory for rotated state documents.
    pub archive_dir: PathBuf,
    /// Token budget per trigger kind.
    budgets: BTreeMap<String, usize>,
    /// Phrases that mark assistant text as a decision.
    pub decision_phrases: Vec<String>,
    /// Path fragments whose reads count as discoveries.
    pub knowledge_paths: Vec<String>,
    /// Sync endpoint configuration.
    pub sync: SyncSettings,
}

impl EngineConfig {
    /// Resolve configuration for the current process.
    ///
    /// Priority per field: CLI flag (`explicit_db`) > environment > config
    /// file > defaults. Missing or unreadable config files fall back to
    /// defaults; a present-but-invalid file is a hard error (a half-applied
    /// config is worse than none).
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file cannot be parsed.
    pub fn resolve(explicit_db: Option<&Path>) -> Result<Self> {
        let base_dir = discover_project_dir().unwrap_or_else(global_dir);
        let file = load_config_file(&base_dir.join("config.json"))?;

        let db_path = explicit_db
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("MEMTRAIL_DB").map(PathBuf::from))
            .or(file.db)
            .unwrap_or_else(|| base_dir.join("memtrail.db"));

        let context_doc = file
            .context_doc
            .unwrap_or_else(|| base_dir.join("CONTEXT.md"));
        let archive_dir = file.archive_dir.unwrap_or_else(|| base_dir.join("archive"));

        let mut sync = file.sync;
        if let Ok(url) = std::env::var("MEMTRAIL_SYNC_URL") {
            if !url.is_empty() {
                sync.endpoint = Some(url);
            }
        }
        if let Ok(token) = std::env::var("MEMTRAIL_SYNC_TOKEN") {
            if !token.is_empty() {
                sync.token = Some(token);
            }
        }

        Ok(Self {
            db_path,
            context_doc,
            archive_dir,
            budgets: file.budgets,
            decision_phrases: file.decision_phrases.unwrap_or_else(|| {
                DEFAULT_DECISION_PHRASES
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
            knowledge_paths: file.knowledge_paths.unwrap_or_else(|| {
                DEFAULT_KNOWLEDGE_PATHS
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
            sync,
        })
    }

    /// A config suitable for tests: everything under one temp directory,
    /// sync disabled.
    #[must_use]
    pub fn for_tests(dir: &Path) -> Self {
        Self {
            db_path: dir.join("memtrail.db"),
            context_doc: dir.join("CONTEXT.md"),
            archive_dir: dir.join("archive"),
            budgets: BTreeMap::new(),
            decision_phrases: DEFAULT_DECISION_PHRASES
                .iter()
                .map(ToString::to_string)
                .collect(),
            knowledge_paths: DEFAULT_KNOWLEDGE_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
            sync: SyncSettings::default(),
        }
    }

    /// Token budget for a context rebuild, by trigger kind.
    #[must_use]
    pub fn token_budget(&self, trigger: TriggerKind) -> usize {
        if let Some(&b) = self.budgets.get(trigger.as_str()) {
            return b;
        }
        match trigger {
            TriggerKind::Startup | TriggerKind::Clear => 2500,
            TriggerKind::Resume => 2000,
            TriggerKind::Compact => 1500,
        }
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid {}: {e}", path.display())))
}

/// Discover the project-level `.memtrail/` directory.
#[must_use]
pub fn discover_project_dir() -> Option<PathBuf> {
    // Strategy 1: git root as the anchor (handles monorepos/subdirectories)
    if let Some(git_root) = git_toplevel() {
        let candidate = git_root.join(".memtrail");
        if candidate.is_dir() {
            return Some(candidate);
        }
    }

    // Strategy 2: walk up from CWD (non-git projects)
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        loop {
            let candidate = dir.join(".memtrail");
            if candidate.is_dir() {
                return Some(candidate);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
    None
}

/// Where `mt init` creates a new store: `.memtrail/` at the git root when
/// inside a repository, else under the current directory.
#[must_use]
pub fn init_target_dir() -> PathBuf {
    git_toplevel()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memtrail")
}

/// The fallback global location, `~/.memtrail/` (or CWD-relative when no
/// home directory can be determined).
#[must_use]
pub fn global_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().join(".memtrail"))
        .unwrap_or_else(|| PathBuf::from(".memtrail"))
}

/// Get the git repository root directory.
fn git_toplevel() -> Option<PathBuf> {
    std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// Get the current git branch, if inside a repository.
#[must_use]
pub fn current_git_branch() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets_by_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        assert_eq!(config.token_budget(TriggerKind::Startup), 2500);
        assert_eq!(config.token_budget(TriggerKind::Resume), 2000);
        assert_eq!(config.token_budget(TriggerKind::Compact), 1500);
        assert_eq!(config.token_budget(TriggerKind::Clear), 2500);
    }

    #[test]
    fn test_budget_override_from_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(dir.path());
        config.budgets.insert("compact".to_string(), 900);
        assert_eq!(config.token_budget(TriggerKind::Compact), 900);
        assert_eq!(config.token_budget(TriggerKind::Resume), 2000);
    }

    #[test]
    fn test_config_file_preserves_unknown_keys() {
        let raw = r#"{"db": "x.db", "future_flag": {"nested": true}}"#;
        let parsed: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.db.as_deref(), Some(Path::new("x.db")));
        assert!(parsed.extra.contains_key("future_flag"));

        // Round-trips through serialization.
        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["future_flag"]["nested"], true);
    }

    #[test]
    fn test_sync_disabled_without_endpoint() {
        let settings = SyncSettings::default();
        assert!(!settings.is_enabled());
        let enabled = SyncSettings {
            endpoint: Some("https://example.test/ingest".to_string()),
            ..SyncSettings::default()
        };
        assert!(enabled.is_enabled());
    }
}
