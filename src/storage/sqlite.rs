//! SQLite storage implementation.
//!
//! This is the single persistent resource shared across hook invocations.
//! Each invocation opens the store, does its work, and drops it; concurrent
//! access relies on SQLite's own locking (plus a busy timeout), and the
//! engine adds no locking of its own.

use crate::error::{Error, Result};
use crate::model::{
    short_id, Observation, ObservationType, PendingSyncItem, Session, SessionStatus,
    SessionSummary, UserPrompt,
};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    fts_enabled: bool,
}

/// A not-yet-persisted observation produced by the classifier.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub obs_type: ObservationType,
    pub title: String,
    pub detail: Option<String>,
    pub files: Vec<String>,
    pub rule_id: Option<String>,
    pub verification_type: Option<String>,
    pub plan_item: Option<String>,
    pub importance: u8,
}

impl NewObservation {
    /// Minimal draft with importance left to the scorer's caller.
    #[must_use]
    pub fn new(obs_type: ObservationType, title: impl Into<String>, importance: u8) -> Self {
        Self {
            obs_type,
            title: title.into(),
            detail: None,
            files: Vec::new(),
            rule_id: None,
            verification_type: None,
            plan_item: None,
            importance,
        }
    }
}

/// Row counts for the status command.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub sessions: u64,
    pub observations: u64,
    pub summaries: u64,
    pub prompts: u64,
    pub outbox_pending: u64,
}

fn parse_json_column<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        project: row.get(1)?,
        branch: row.get(2)?,
        status: SessionStatus::parse(&status),
        plan_file: row.get(4)?,
        task_id: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const SESSION_COLS: &str =
    "id, project, branch, status, plan_file, task_id, started_at, ended_at, created_at, updated_at";

fn map_observation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Observation> {
    let obs_type: String = row.get(2)?;
    let files: String = row.get(5)?;
    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        obs_type: ObservationType::parse(&obs_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown observation type: {obs_type}").into(),
            )
        })?,
        title: row.get(3)?,
        detail: row.get(4)?,
        files: parse_json_column(&files)?,
        rule_id: row.get(6)?,
        verification_type: row.get(7)?,
        plan_item: row.get(8)?,
        importance: row.get::<_, i64>(9)?.clamp(1, 5) as u8,
        recurrence_count: row.get(10)?,
        created_at: row.get(11)?,
    })
}

const OBSERVATION_COLS: &str = "id, session_id, obs_type, title, detail, files, rule_id, \
     verification_type, plan_item, importance, recurrence_count, created_at";

fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    let files_created: String = row.get(8)?;
    let files_modified: String = row.get(9)?;
    let verification_results: String = row.get(10)?;
    let plan_progress: String = row.get(11)?;
    Ok(SessionSummary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        request: row.get(2)?,
        investigated: row.get(3)?,
        decisions: row.get(4)?,
        completed: row.get(5)?,
        failed_attempts: row.get(6)?,
        next_steps: row.get(7)?,
        files_created: parse_json_column(&files_created)?,
        files_modified: parse_json_column(&files_modified)?,
        verification_results: parse_json_column(&verification_results)?,
        plan_progress: parse_json_column(&plan_progress)?,
        created_at: row.get(12)?,
    })
}

const SUMMARY_COLS: &str = "id, session_id, request, investigated, decisions, completed, \
     failed_attempts, next_steps, files_created, files_modified, verification_results, \
     plan_progress, created_at";

// Same columns as `SUMMARY_COLS`, qualified with the `ss` table alias for
// queries that JOIN `session_summaries` against `sessions` (both tables have
// `id` and `created_at`, which are otherwise ambiguous).
const SUMMARY_COLS_SS: &str = "ss.id, ss.session_id, ss.request, ss.investigated, ss.decisions, \
     ss.completed, ss.failed_attempts, ss.next_steps, ss.files_created, ss.files_modified, \
     ss.verification_results, ss.plan_progress, ss.created_at";

fn map_prompt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserPrompt> {
    Ok(UserPrompt {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        prompt_text: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingSyncItem> {
    Ok(PendingSyncItem {
        id: row.get(0)?,
        payload: row.get(1)?,
        content_hash: row.get(2)?,
        retry_count: row.get(3)?,
        last_error: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Escape LIKE wildcards for the substring-scan fallback.
fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Tokenize a query into exact-phrase FTS tokens: `"word" AND "other"`.
///
/// Empty/whitespace input yields `None`, which callers treat as "no results".
fn fts_phrase_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

impl SqliteStorage {
    /// Open a store at the given path, creating it and its schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the base
    /// schema fails to apply. FTS being unavailable is NOT an error; the
    /// store falls back to substring search.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a store with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        super::schema::apply_schema(&conn)?;
        let fts_enabled = super::schema::apply_fts_schema(&conn);
        Ok(Self { conn, fts_enabled })
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::apply_schema(&conn)?;
        let fts_enabled = super::schema::apply_fts_schema(&conn);
        Ok(Self { conn, fts_enabled })
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Whether full-text indexing is active for this store.
    #[must_use]
    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    // ==================
    // Session Operations
    // ==================

    /// Create a session row if it does not exist yet (insert-or-ignore),
    /// refreshing `updated_at` and backfilling project/branch when the row
    /// already exists but lacks them.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_session(
        &self,
        id: &str,
        project: Option<&str>,
        branch: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();

        self.conn.execute(
            "INSERT INTO sessions (id, project, branch, status, started_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
               project = COALESCE(sessions.project, excluded.project),
               branch = COALESCE(sessions.branch, excluded.branch),
               updated_at = excluded.updated_at",
            rusqlite::params![id, project, branch, now],
        )?;
        Ok(())
    }

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"))?;
        let session = stmt.query_row([id], map_session_row).optional()?;
        Ok(session)
    }

    /// The most recently touched session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_session(&self) -> Result<Option<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY updated_at DESC, rowid DESC LIMIT 1"
        ))?;
        let session = stmt.query_row([], map_session_row).optional()?;
        Ok(session)
    }

    /// Backfill a plan-file reference and its task id onto a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn link_session_plan(&self, id: &str, plan_file: &str, task_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE sessions SET plan_file = ?1, task_id = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![plan_file, task_id, now, id],
        )?;
        Ok(())
    }

    /// Mark a session ended with the given terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn end_session(&self, id: &str, status: SessionStatus) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), now, id],
        )?;
        Ok(())
    }

    // ======================
    // Observation Operations
    // ======================

    /// Insert an observation and return its id.
    ///
    /// The caller is responsible for having run the importance scorer (or
    /// for deliberately overriding it); the store persists what it is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_observation(&self, session_id: &str, new: &NewObservation) -> Result<String> {
        let id = short_id("obs");
        let now = chrono::Utc::now().timestamp_millis();
        let files = serde_json::to_string(&new.files)?;

        self.conn.execute(
            "INSERT INTO observations (id, session_id, obs_type, title, detail, files, rule_id,
                 verification_type, plan_item, importance, recurrence_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)",
            rusqlite::params![
                id,
                session_id,
                new.obs_type.as_str(),
                new.title,
                new.detail,
                files,
                new.rule_id,
                new.verification_type,
                new.plan_item,
                i64::from(new.importance.clamp(1, 5)),
                now
            ],
        )?;
        Ok(id)
    }

    /// Record a failed attempt, deduplicating by exact title across ALL
    /// sessions (deliberately not session-scoped).
    ///
    /// On a match: bump `recurrence_count`, replace detail only when the new
    /// detail is non-null, and leave `created_at` and importance untouched.
    /// Otherwise insert a fresh row with importance forced to 5.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_failed_attempt(
        &mut self,
        session_id: &str,
        title: &str,
        detail: Option<&str>,
    ) -> Result<String> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM observations
                 WHERE obs_type = 'failed_attempt' AND title = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [title],
                |row| row.get(0),
            )
            .optional()?;

        let id = if let Some(id) = existing {
            if let Some(d) = detail {
                tx.execute(
                    "UPDATE observations SET recurrence_count = recurrence_count + 1, detail = ?1
                     WHERE id = ?2",
                    rusqlite::params![d, id],
                )?;
            } else {
                tx.execute(
                    "UPDATE observations SET recurrence_count = recurrence_count + 1 WHERE id = ?1",
                    [&id],
                )?;
            }
            id
        } else {
            let id = short_id("obs");
            let now = chrono::Utc::now().timestamp_millis();
            tx.execute(
                "INSERT INTO observations (id, session_id, obs_type, title, detail, importance,
                     recurrence_count, created_at)
                 VALUES (?1, ?2, 'failed_attempt', ?3, ?4, 5, 1, ?5)",
                rusqlite::params![id, session_id, title, detail, now],
            )?;
            id
        };

        tx.commit()?;
        Ok(id)
    }

    /// All observations for a session, chronological.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn session_observations(&self, session_id: &str) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLS} FROM observations
             WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([session_id], map_observation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Most recent observations across all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent_observations(&self, limit: u32) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLS} FROM observations
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], map_observation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Cross-session failed attempts, most recurrent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn failed_attempts(&self, limit: u32) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OBSERVATION_COLS} FROM observations
             WHERE obs_type = 'failed_attempt'
             ORDER BY recurrence_count DESC, created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], map_observation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // ==================
    // Summary Operations
    // ==================

    /// Insert a session summary checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_summary(&self, summary: &SessionSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session_summaries (id, session_id, request, investigated, decisions,
                 completed, failed_attempts, next_steps, files_created, files_modified,
                 verification_results, plan_progress, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                summary.id,
                summary.session_id,
                summary.request,
                summary.investigated,
                summary.decisions,
                summary.completed,
                summary.failed_attempts,
                summary.next_steps,
                serde_json::to_string(&summary.files_created)?,
                serde_json::to_string(&summary.files_modified)?,
                serde_json::to_string(&summary.verification_results)?,
                serde_json::to_string(&summary.plan_progress)?,
                summary.created_at,
            ],
        )?;
        Ok(())
    }

    /// The most recent summary checkpoint for a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLS} FROM session_summaries
             WHERE session_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))?;
        let summary = stmt.query_row([session_id], map_summary_row).optional()?;
        Ok(summary)
    }

    /// Most recent summaries across sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent_summaries(&self, limit: u32) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLS} FROM session_summaries
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], map_summary_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Summaries of every session linked to a task, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn summaries_for_task(&self, task_id: &str, limit: u32) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLS_SS} FROM session_summaries ss
             JOIN sessions s ON s.id = ss.session_id
             WHERE s.task_id = ?1
             ORDER BY ss.created_at DESC, ss.rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![task_id, limit], map_summary_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Merge one plan-progress entry into the session's latest summary,
    /// creating an otherwise-empty summary when none exists. Unrelated keys
    /// in the progress map are preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn merge_plan_progress(&mut self, session_id: &str, item: &str, status: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let latest: Option<(String, String)> = tx
            .query_row(
                "SELECT id, plan_progress FROM session_summaries
                 WHERE session_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((summary_id, progress_json)) = latest {
            let mut progress: BTreeMap<String, String> =
                serde_json::from_str(&progress_json).unwrap_or_default();
            progress.insert(item.to_string(), status.to_string());
            tx.execute(
                "UPDATE session_summaries SET plan_progress = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&progress)?, summary_id],
            )?;
        } else {
            let mut progress = BTreeMap::new();
            progress.insert(item.to_string(), status.to_string());
            let now = chrono::Utc::now().timestamp_millis();
            tx.execute(
                "INSERT INTO session_summaries (id, session_id, plan_progress, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    short_id("sum"),
                    session_id,
                    serde_json::to_string(&progress)?,
                    now
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // =================
    // Prompt Operations
    // =================

    /// Store a user prompt, allocating the next per-session sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_prompt(&mut self, session_id: &str, prompt_text: &str) -> Result<i64> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM user_prompts WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;

        let now = chrono::Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO user_prompts (id, session_id, seq, prompt_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![short_id("prm"), session_id, seq, prompt_text, now],
        )?;

        tx.commit()?;
        Ok(seq)
    }

    /// The first prompt of a session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn first_prompt(&self, session_id: &str) -> Result<Option<UserPrompt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, seq, prompt_text, created_at
             FROM user_prompts WHERE session_id = ?1 ORDER BY seq ASC LIMIT 1",
        )?;
        let prompt = stmt.query_row([session_id], map_prompt_row).optional()?;
        Ok(prompt)
    }

    /// All prompts of a session in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn session_prompts(&self, session_id: &str) -> Result<Vec<UserPrompt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, seq, prompt_text, created_at
             FROM user_prompts WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([session_id], map_prompt_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // =================
    // Full-text Search
    // =================

    /// Search observations over (title, detail).
    ///
    /// Uses the FTS5 mirror when available, otherwise an escaped LIKE scan.
    /// An empty or whitespace-only query yields no results.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn search_observations(&self, query: &str, limit: u32) -> Result<Vec<Observation>> {
        let Some(fts_query) = fts_phrase_query(query) else {
            return Ok(Vec::new());
        };

        if self.fts_enabled {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM observations_fts f
                 JOIN observations o ON o.rowid = f.rowid
                 WHERE observations_fts MATCH ?1
                 ORDER BY bm25(observations_fts)
                 LIMIT ?2",
                OBSERVATION_COLS
                    .split(", ")
                    .map(|c| format!("o.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))?;
            let rows = stmt.query_map(rusqlite::params![fts_query, limit], map_observation_row)?;
            return rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from);
        }

        // Substring fallback: every token must appear in title or detail.
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| format!("%{}%", escape_like_pattern(t)))
            .collect();
        let conditions = (0..tokens.len())
            .map(|i| {
                format!(
                    "(title LIKE ?{n} ESCAPE '\\' OR detail LIKE ?{n} ESCAPE '\\')",
                    n = i + 1
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {OBSERVATION_COLS} FROM observations WHERE {conditions}
             ORDER BY created_at DESC LIMIT ?{}",
            tokens.len() + 1
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = tokens
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn rusqlite::ToSql>)
            .collect();
        params.push(Box::new(limit));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), map_observation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Search user prompts by text.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn search_prompts(&self, query: &str, limit: u32) -> Result<Vec<UserPrompt>> {
        let Some(fts_query) = fts_phrase_query(query) else {
            return Ok(Vec::new());
        };

        if self.fts_enabled {
            let mut stmt = self.conn.prepare(
                "SELECT p.id, p.session_id, p.seq, p.prompt_text, p.created_at
                 FROM prompts_fts f
                 JOIN user_prompts p ON p.rowid = f.rowid
                 WHERE prompts_fts MATCH ?1
                 ORDER BY bm25(prompts_fts)
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![fts_query, limit], map_prompt_row)?;
            return rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from);
        }

        let pattern = format!("%{}%", escape_like_pattern(query.trim()));
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, seq, prompt_text, created_at
             FROM user_prompts WHERE prompt_text LIKE ?1 ESCAPE '\\'
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![pattern, limit], map_prompt_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // =================
    // Outbox Operations
    // =================

    /// Enqueue a payload for later delivery. Returns the row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn enqueue_sync(&self, payload: &str, content_hash: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO sync_outbox (payload, content_hash, retry_count, created_at)
             VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![payload, content_hash, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest pending items, up to `batch` of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn oldest_sync_items(&self, batch: u32) -> Result<Vec<PendingSyncItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, content_hash, retry_count, last_error, created_at
             FROM sync_outbox ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([batch], map_outbox_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Remove a delivered item.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn ack_sync(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_outbox WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Record a failed replay: bump the retry count and keep the last error.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn fail_sync(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_outbox SET retry_count = retry_count + 1, last_error = ?1 WHERE id = ?2",
            rusqlite::params![error, id],
        )?;
        Ok(())
    }

    /// Evict poison items whose retry count has reached the ceiling.
    /// Returns the number of items dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn evict_poisoned(&self, ceiling: i64) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM sync_outbox WHERE retry_count >= ?1",
            [ceiling],
        )?;
        Ok(affected)
    }

    /// Number of items waiting in the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn outbox_len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ==========
    // Statistics
    // ==========

    /// Row counts for the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if any count query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            observations: count("SELECT COUNT(*) FROM observations")?,
            summaries: count("SELECT COUNT(*) FROM session_summaries")?,
            prompts: count("SELECT COUNT(*) FROM user_prompts")?,
            outbox_pending: count("SELECT COUNT(*) FROM sync_outbox")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStorage {
        SqliteStorage::open_memory().unwrap()
    }

    #[test]
    fn test_upsert_session_is_idempotent() {
        let s = store();
        s.upsert_session("sess-1", Some("proj"), Some("main")).unwrap();
        s.upsert_session("sess-1", None, None).unwrap();

        let session = s.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.project.as_deref(), Some("proj"));
        assert_eq!(session.branch.as_deref(), Some("main"));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_upsert_backfills_missing_project() {
        let s = store();
        s.upsert_session("sess-1", None, None).unwrap();
        s.upsert_session("sess-1", Some("proj"), None).unwrap();
        let session = s.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.project.as_deref(), Some("proj"));
    }

    #[test]
    fn test_end_session_sets_status_and_timestamp() {
        let s = store();
        s.upsert_session("sess-1", None, None).unwrap();
        s.end_session("sess-1", SessionStatus::Completed).unwrap();
        let session = s.get_session("sess-1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_observation_before_session_row() {
        // Children may be created before the parent session materializes.
        let s = store();
        let id = s
            .insert_observation(
                "ghost-session",
                &NewObservation::new(ObservationType::FileChange, "Edited: a.rs", 1),
            )
            .unwrap();
        assert!(id.starts_with("obs_"));
        assert!(s.get_session("ghost-session").unwrap().is_none());
    }

    #[test]
    fn test_failed_attempt_dedup_across_sessions() {
        let mut s = store();
        let id1 = s
            .record_failed_attempt("sess-a", "retry X", Some("first detail"))
            .unwrap();
        let id2 = s.record_failed_attempt("sess-b", "retry X", None).unwrap();
        assert_eq!(id1, id2);

        let attempts = s.failed_attempts(10).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].recurrence_count, 2);
        // Null detail does not clobber the previous one.
        assert_eq!(attempts[0].detail.as_deref(), Some("first detail"));
        assert_eq!(attempts[0].importance, 5);
    }

    #[test]
    fn test_failed_attempt_detail_replaced_when_non_null() {
        let mut s = store();
        s.record_failed_attempt("s", "retry X", Some("old")).unwrap();
        s.record_failed_attempt("s", "retry X", Some("new")).unwrap();
        s.record_failed_attempt("s", "retry X", None).unwrap();

        let attempts = s.failed_attempts(10).unwrap();
        assert_eq!(attempts[0].recurrence_count, 3);
        assert_eq!(attempts[0].detail.as_deref(), Some("new"));
    }

    #[test]
    fn test_prompt_sequence_allocation() {
        let mut s = store();
        assert_eq!(s.insert_prompt("sess-1", "first").unwrap(), 1);
        assert_eq!(s.insert_prompt("sess-1", "second").unwrap(), 2);
        assert_eq!(s.insert_prompt("sess-2", "other session").unwrap(), 1);

        let first = s.first_prompt("sess-1").unwrap().unwrap();
        assert_eq!(first.prompt_text, "first");
    }

    #[test]
    fn test_search_empty_query_yields_nothing() {
        let s = store();
        s.insert_observation(
            "sess-1",
            &NewObservation::new(ObservationType::Discovery, "found the cache layer", 1),
        )
        .unwrap();
        assert!(s.search_observations("", 10).unwrap().is_empty());
        assert!(s.search_observations("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_search_observations_finds_by_title() {
        let s = store();
        s.insert_observation(
            "sess-1",
            &NewObservation::new(ObservationType::Discovery, "found the cache layer", 1),
        )
        .unwrap();
        s.insert_observation(
            "sess-1",
            &NewObservation::new(ObservationType::FileChange, "Edited: src/db.rs", 1),
        )
        .unwrap();

        let hits = s.search_observations("cache layer", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "found the cache layer");
    }

    #[test]
    fn test_search_prompts() {
        let mut s = store();
        s.insert_prompt("sess-1", "please refactor the scheduler").unwrap();
        s.insert_prompt("sess-1", "unrelated request").unwrap();

        let hits = s.search_prompts("scheduler", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].prompt_text, "please refactor the scheduler");
    }

    #[test]
    fn test_merge_plan_progress_preserves_keys() {
        let mut s = store();
        s.merge_plan_progress("sess-1", "P-1", "in_progress").unwrap();
        s.merge_plan_progress("sess-1", "P-2", "in_progress").unwrap();
        s.merge_plan_progress("sess-1", "P-1", "complete").unwrap();

        let summary = s.latest_summary("sess-1").unwrap().unwrap();
        assert_eq!(summary.plan_progress.get("P-1").unwrap(), "complete");
        assert_eq!(summary.plan_progress.get("P-2").unwrap(), "in_progress");
    }

    #[test]
    fn test_merge_plan_progress_updates_latest_summary() {
        let mut s = store();
        let mut summary = SessionSummary {
            id: short_id("sum"),
            session_id: "sess-1".to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            ..SessionSummary::default()
        };
        summary.plan_progress.insert("P-9".to_string(), "in_progress".to_string());
        s.insert_summary(&summary).unwrap();

        s.merge_plan_progress("sess-1", "P-9", "complete").unwrap();

        // Merged into the existing row, not a new one.
        let count: i64 = s
            .conn()
            .query_row("SELECT COUNT(*) FROM session_summaries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let latest = s.latest_summary("sess-1").unwrap().unwrap();
        assert_eq!(latest.plan_progress.get("P-9").unwrap(), "complete");
    }

    #[test]
    fn test_summaries_for_task_joins_sessions() {
        let mut s = store();
        s.upsert_session("sess-1", None, None).unwrap();
        s.link_session_plan("sess-1", "plans/t42.md", "T-42").unwrap();
        s.upsert_session("sess-2", None, None).unwrap();

        s.merge_plan_progress("sess-1", "P-1", "in_progress").unwrap();
        s.merge_plan_progress("sess-2", "P-1", "in_progress").unwrap();

        let linked = s.summaries_for_task("T-42", 10).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].session_id, "sess-1");
    }

    #[test]
    fn test_outbox_fifo_and_retry() {
        let s = store();
        s.enqueue_sync("{\"a\":1}", "h1").unwrap();
        s.enqueue_sync("{\"b\":2}", "h2").unwrap();

        let items = s.oldest_sync_items(10).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payload, "{\"a\":1}");
        assert_eq!(items[0].retry_count, 0);

        s.fail_sync(items[0].id, "HTTP 500").unwrap();
        let items = s.oldest_sync_items(10).unwrap();
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("HTTP 500"));

        s.ack_sync(items[1].id).unwrap();
        assert_eq!(s.outbox_len().unwrap(), 1);
    }

    #[test]
    fn test_evict_poisoned_at_ceiling() {
        let s = store();
        let id = s.enqueue_sync("{}", "h").unwrap();
        for _ in 0..5 {
            s.fail_sync(id, "boom").unwrap();
        }
        let dropped = s.evict_poisoned(5).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(s.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_fts_fallback_like_search_escapes_wildcards() {
        let s = store();
        s.insert_observation(
            "sess-1",
            &NewObservation::new(ObservationType::Discovery, "100% literal percent", 1),
        )
        .unwrap();
        // Regardless of FTS availability, a literal token still matches.
        let hits = s.search_observations("literal", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
