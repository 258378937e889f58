//! Data types for the session memory engine.
//!
//! Everything here is a plain serde-friendly value; persistence lives in
//! [`crate::storage`]. Timestamps are Unix milliseconds (INTEGER columns).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    /// String form used in the `sessions.status` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parse a stored status string, defaulting unknown values to `Active`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "abandoned" => Self::Abandoned,
            _ => Self::Active,
        }
    }
}

/// One continuous interaction episode, identified by the host runtime's
/// session id. Created idempotently on the first event that references it;
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub status: SessionStatus,
    /// Path of a plan document mentioned in a prompt, if one was detected.
    pub plan_file: Option<String>,
    /// Task id backfilled from the plan-file reference.
    pub task_id: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Kind of knowledge captured by an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    Refactor,
    Discovery,
    CrViolation,
    VrCheck,
    PatternCompliance,
    FailedAttempt,
    FileChange,
    IncidentNearMiss,
}

impl ObservationType {
    /// String form used in the `observations.obs_type` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Discovery => "discovery",
            Self::CrViolation => "cr_violation",
            Self::VrCheck => "vr_check",
            Self::PatternCompliance => "pattern_compliance",
            Self::FailedAttempt => "failed_attempt",
            Self::FileChange => "file_change",
            Self::IncidentNearMiss => "incident_near_miss",
        }
    }

    /// Parse a stored type string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "decision" => Self::Decision,
            "bugfix" => Self::Bugfix,
            "feature" => Self::Feature,
            "refactor" => Self::Refactor,
            "discovery" => Self::Discovery,
            "cr_violation" => Self::CrViolation,
            "vr_check" => Self::VrCheck,
            "pattern_compliance" => Self::PatternCompliance,
            "failed_attempt" => Self::FailedAttempt,
            "file_change" => Self::FileChange,
            "incident_near_miss" => Self::IncidentNearMiss,
            _ => return None,
        })
    }

    /// Whether this type counts as completed work for the summarizer
    /// (`completed` section vs `next_steps` fallback).
    #[must_use]
    pub const fn is_completed_work(&self) -> bool {
        matches!(self, Self::Feature | Self::Bugfix | Self::Refactor)
    }
}

/// One structured knowledge unit derived from a single agent action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// Logical FK only: the parent session row may not exist yet.
    pub session_id: String,
    pub obs_type: ObservationType,
    pub title: String,
    pub detail: Option<String>,
    /// Files involved, in the order they were seen.
    pub files: Vec<String>,
    /// Cross-reference to a compliance rule (e.g. `CR-12`).
    pub rule_id: Option<String>,
    /// Cross-reference to a verification type (e.g. `VR-TEST`).
    pub verification_type: Option<String>,
    /// Cross-reference to a plan item (e.g. `P-3.2`).
    pub plan_item: Option<String>,
    /// Always the importance scorer's output unless the caller overrode it.
    pub importance: u8,
    pub recurrence_count: i64,
    pub created_at: i64,
}

/// End-of-session (or mid-session checkpoint) condensation of the
/// observation log. A session can hold several of these, one per checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub session_id: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub decisions: Option<String>,
    pub completed: Option<String>,
    pub failed_attempts: Option<String>,
    pub next_steps: Option<String>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    /// Verification type -> "PASS" / "FAIL".
    pub verification_results: BTreeMap<String, String>,
    /// Plan item -> progress status. Merged across checkpoints, never replaced.
    pub plan_progress: BTreeMap<String, String>,
    pub created_at: i64,
}

/// A raw user prompt, ordered by a per-session sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub prompt_text: String,
    pub created_at: i64,
}

/// An opaque serialized payload awaiting remote delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSyncItem {
    pub id: i64,
    /// Full original payload, verbatim.
    pub payload: String,
    pub content_hash: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Why context is being rebuilt at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fresh session.
    Startup,
    /// Resuming an earlier session.
    Resume,
    /// Context was just compacted; re-inject the essentials.
    Compact,
    /// The user cleared context.
    Clear,
}

impl TriggerKind {
    /// String form used in logs and config keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Resume => "resume",
            Self::Compact => "compact",
            Self::Clear => "clear",
        }
    }

    /// Parse a trigger tag from a hook payload, defaulting to `Startup`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "resume" => Self::Resume,
            "compact" => Self::Compact,
            "clear" => Self::Clear,
            _ => Self::Startup,
        }
    }
}

/// Generate a prefixed short id, e.g. `obs_1f9c2a7d4e0b`.
#[must_use]
pub fn short_id(prefix: &str) -> String {
    format!("{}_{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_type_round_trip() {
        for t in [
            ObservationType::Decision,
            ObservationType::Bugfix,
            ObservationType::Feature,
            ObservationType::Refactor,
            ObservationType::Discovery,
            ObservationType::CrViolation,
            ObservationType::VrCheck,
            ObservationType::PatternCompliance,
            ObservationType::FailedAttempt,
            ObservationType::FileChange,
            ObservationType::IncidentNearMiss,
        ] {
            assert_eq!(ObservationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ObservationType::parse("nonsense"), None);
    }

    #[test]
    fn test_completed_work_partition() {
        assert!(ObservationType::Feature.is_completed_work());
        assert!(ObservationType::Bugfix.is_completed_work());
        assert!(ObservationType::Refactor.is_completed_work());
        assert!(!ObservationType::FileChange.is_completed_work());
        assert!(!ObservationType::Decision.is_completed_work());
    }

    #[test]
    fn test_session_status_parse_is_lenient() {
        assert_eq!(SessionStatus::parse("completed"), SessionStatus::Completed);
        assert_eq!(SessionStatus::parse("garbage"), SessionStatus::Active);
    }

    #[test]
    fn test_short_id_shape() {
        let id = short_id("obs");
        assert!(id.starts_with("obs_"));
        assert_eq!(id.len(), 4 + 12);
    }
}
