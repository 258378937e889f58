//! Database schema definitions.
//!
//! This module contains the complete SQLite schema for the session memory
//! store. Schema creation is idempotent: every table and index uses
//! `CREATE ... IF NOT EXISTS`, so opening an existing store is a no-op.
//!
//! Note: Timestamps are stored as INTEGER (Unix milliseconds).

use rusqlite::Connection;

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the Memtrail database.
pub const SCHEMA_SQL: &str = r#"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Core Tables
-- ====================

-- Sessions: one row per host-runtime session, created insert-or-ignore
-- on the first event that references it. Never deleted.
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project TEXT,
    branch TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    plan_file TEXT,
    task_id TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id);

-- Observations: structured knowledge units derived from agent actions.
-- session_id is a logical FK only: observation rows may be written before
-- the parent session row materializes, so no FOREIGN KEY constraint here.
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    obs_type TEXT NOT NULL,
    title TEXT NOT NULL,
    detail TEXT,
    files TEXT NOT NULL DEFAULT '[]',
    rule_id TEXT,
    verification_type TEXT,
    plan_item TEXT,
    importance INTEGER NOT NULL DEFAULT 3,
    recurrence_count INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    CHECK (importance >= 1 AND importance <= 5),
    CHECK (recurrence_count >= 1)
);

CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(obs_type);
CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_observations_type_title ON observations(obs_type, title);

-- Session Summaries: one per checkpoint (mid-session snapshot, session end).
-- The plan_progress map is merged across checkpoints, never replaced.
CREATE TABLE IF NOT EXISTS session_summaries (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    request TEXT,
    investigated TEXT,
    decisions TEXT,
    completed TEXT,
    failed_attempts TEXT,
    next_steps TEXT,
    files_created TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    verification_results TEXT NOT NULL DEFAULT '{}',
    plan_progress TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_session ON session_summaries(session_id);
CREATE INDEX IF NOT EXISTS idx_summaries_created ON session_summaries(created_at DESC);

-- User Prompts: raw prompt text, ordered by a per-session sequence number.
CREATE TABLE IF NOT EXISTS user_prompts (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(session_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_prompts_session ON user_prompts(session_id, seq);

-- Sync Outbox: durable queue of payloads awaiting remote delivery.
-- Drained oldest-first; items past the retry ceiling are evicted.
CREATE TABLE IF NOT EXISTS sync_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_created ON sync_outbox(created_at ASC);
"#;

/// Full-text mirror tables and the triggers that keep them consistent.
///
/// Applied separately from the base schema because FTS5 may be missing from
/// the linked SQLite; in that case the store degrades to substring scans
/// instead of failing initialization.
pub const FTS_SQL: &str = r"
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, detail,
    content='observations', content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS observations_fts_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, detail)
    VALUES (new.rowid, new.title, new.detail);
END;

CREATE TRIGGER IF NOT EXISTS observations_fts_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, detail)
    VALUES ('delete', old.rowid, old.title, old.detail);
END;

CREATE TRIGGER IF NOT EXISTS observations_fts_au AFTER UPDATE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, detail)
    VALUES ('delete', old.rowid, old.title, old.detail);
    INSERT INTO observations_fts(rowid, title, detail)
    VALUES (new.rowid, new.title, new.detail);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS prompts_fts USING fts5(
    prompt_text,
    content='user_prompts', content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS prompts_fts_ai AFTER INSERT ON user_prompts BEGIN
    INSERT INTO prompts_fts(rowid, prompt_text)
    VALUES (new.rowid, new.prompt_text);
END;

CREATE TRIGGER IF NOT EXISTS prompts_fts_ad AFTER DELETE ON user_prompts BEGIN
    INSERT INTO prompts_fts(prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.rowid, old.prompt_text);
END;

CREATE TRIGGER IF NOT EXISTS prompts_fts_au AFTER UPDATE ON user_prompts BEGIN
    INSERT INTO prompts_fts(prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.rowid, old.prompt_text);
    INSERT INTO prompts_fts(rowid, prompt_text)
    VALUES (new.rowid, new.prompt_text);
END;
";

/// Apply the base schema to a connection. Idempotent.
///
/// # Errors
///
/// Returns an error if schema execution fails.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            CURRENT_SCHEMA_VERSION.to_string(),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

/// Attempt to create the FTS5 mirrors.
///
/// Returns `true` when full-text indexing is available, `false` when the
/// substrate lacks FTS5 (the caller falls back to substring scans).
pub fn apply_fts_schema(conn: &Connection) -> bool {
    match conn.execute_batch(FTS_SQL) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "FTS5 unavailable, falling back to substring search");
            false
        }
    }
}
