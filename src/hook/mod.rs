//! Hook event ingestion and orchestration.
//!
//! The host agent runtime invokes `mt event` once per event with a single
//! JSON object on stdin. Parsing happens before any store access, so a
//! malformed invocation exits cleanly with no side effects. Within one
//! invocation the primary classify-and-persist path is the only step whose
//! failure propagates; every enrichment step returns a `Result` that the
//! orchestrator explicitly discards, keeping the "never block the agent"
//! contract visible in the code rather than buried in catch-alls.

use crate::classify::{self, InvocationContext, ToolCall};
use crate::config::EngineConfig;
use crate::context::build_context;
use crate::error::{Error, Result};
use crate::model::{SessionStatus, TriggerKind};
use crate::storage::SqliteStorage;
use crate::summary::build_summary;
use crate::sync::{build_payload, drain_sync_queue, sync_to_cloud, SyncTransport};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

/// Wall-clock ceiling for the blocking stdin read. Past it the invocation
/// proceeds with whatever arrived; the engine must never hang the agent.
pub const STDIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One hook invocation envelope.
///
/// Unknown keys are preserved in an explicit side bag rather than silently
/// dropped, so payloads from newer runtimes still round-trip.
#[derive(Debug, Deserialize)]
pub struct HookEnvelope {
    pub session_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub event: HookEvent,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Event-specific payload, tagged by `kind`.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookEvent {
    ToolCall {
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
        #[serde(default)]
        tool_output: String,
        #[serde(default)]
        is_error: bool,
    },
    Prompt {
        text: String,
    },
    AssistantText {
        text: String,
    },
    AttemptFailed {
        title: String,
        #[serde(default)]
        detail: Option<String>,
    },
    SessionStart {
        #[serde(default)]
        trigger: String,
    },
    SessionEnd,
}

/// Read one event from stdin, bounded by [`STDIN_TIMEOUT`].
///
/// Returns `None` when nothing (or nothing parseable as text) arrived in
/// time. The reader thread is left to finish on its own; process exit
/// abandons it.
#[must_use]
pub fn read_stdin_event() -> Option<String> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = std::io::stdin().read_to_string(&mut buf);
        let _ = tx.send(buf);
    });

    match rx.recv_timeout(STDIN_TIMEOUT) {
        Ok(raw) if !raw.trim().is_empty() => Some(raw),
        Ok(_) => None,
        Err(_) => {
            tracing::warn!("stdin read timed out, proceeding without input");
            None
        }
    }
}

/// Parse an envelope, mapping serde failures onto [`Error::MalformedEvent`].
///
/// # Errors
///
/// Returns an error for anything that is not a single valid envelope object.
pub fn parse_envelope(raw: &str) -> Result<HookEnvelope> {
    let envelope: HookEnvelope =
        serde_json::from_str(raw).map_err(|e| Error::MalformedEvent(e.to_string()))?;
    if envelope.session_id.trim().is_empty() {
        return Err(Error::MalformedEvent("empty session_id".to_string()));
    }
    Ok(envelope)
}

/// Discard a non-essential step's failure, keeping a trace of it.
fn discard_non_essential<T>(step: &str, result: Result<T>) {
    if let Err(e) = result {
        tracing::warn!(step, error = %e, "non-essential step failed, continuing");
    }
}

/// Handle one parsed hook event end to end.
///
/// Returns the context block to write to stdout, when the event produces
/// one (only `session_start` does, and only when something fit the budget).
///
/// # Errors
///
/// Returns an error when the primary persist path fails; the `event`
/// command converts that into a silent exit.
pub fn handle_event(
    config: &EngineConfig,
    transport: &dyn SyncTransport,
    envelope: &HookEnvelope,
) -> Result<Option<String>> {
    let mut store = SqliteStorage::open(&config.db_path)?;

    store.upsert_session(
        &envelope.session_id,
        envelope.project.as_deref(),
        envelope.branch.as_deref(),
    )?;

    match &envelope.event {
        HookEvent::ToolCall {
            tool_name,
            tool_input,
            tool_output,
            is_error,
        } => {
            let call = ToolCall {
                tool_name: tool_name.clone(),
                input: tool_input.clone(),
                output: tool_output.clone(),
                is_error: *is_error,
            };

            // Enrichment: plan-progress scan over the tool output.
            discard_non_essential(
                "plan_progress_scan",
                apply_plan_progress(&mut store, &envelope.session_id, tool_output),
            );

            // Primary path: classify and persist.
            let mut ctx = InvocationContext::new(&envelope.session_id);
            if let Some(draft) = classify::classify_tool_call(config, &mut ctx, &call) {
                store.insert_observation(&envelope.session_id, &draft)?;
            }
            Ok(None)
        }

        HookEvent::Prompt { text } => {
            store.insert_prompt(&envelope.session_id, text)?;

            // Enrichment: plan-file reference detection and task backfill.
            discard_non_essential(
                "plan_reference",
                link_plan_reference(&store, &envelope.session_id, text),
            );
            Ok(None)
        }

        HookEvent::AssistantText { text } => {
            if let Some(draft) = classify::detect_decision(config, text) {
                store.insert_observation(&envelope.session_id, &draft)?;
            }
            Ok(None)
        }

        HookEvent::AttemptFailed { title, detail } => {
            store.record_failed_attempt(&envelope.session_id, title, detail.as_deref())?;
            Ok(None)
        }

        HookEvent::SessionStart { trigger } => {
            let trigger = TriggerKind::parse(trigger);
            let budget = config.token_budget(trigger);
            let task_id = store
                .get_session(&envelope.session_id)?
                .and_then(|s| s.task_id);

            let block = build_context(
                &store,
                &envelope.session_id,
                trigger,
                budget,
                task_id.as_deref(),
            )?;
            Ok(if block.is_empty() { None } else { Some(block) })
        }

        HookEvent::SessionEnd => {
            // Primary path: summarize and persist the checkpoint.
            let observations = store.session_observations(&envelope.session_id)?;
            let prompts = store.session_prompts(&envelope.session_id)?;
            let summary = build_summary(&envelope.session_id, &observations, &prompts);
            store.insert_summary(&summary)?;
            store.end_session(&envelope.session_id, SessionStatus::Completed)?;

            // Enrichment steps, each fenced on its own.
            discard_non_essential("archive", crate::archive::archive_and_regenerate(&store, config));
            discard_non_essential(
                "sync_push",
                build_payload(&store, &envelope.session_id)
                    .and_then(|payload| sync_to_cloud(&store, transport, config, &payload))
                    .map(|_| ()),
            );
            discard_non_essential(
                "sync_drain",
                drain_sync_queue(&store, transport, config).map(|_| ()),
            );
            Ok(None)
        }
    }
}

/// Merge any completed plan items found in tool output into the session's
/// latest summary.
fn apply_plan_progress(
    store: &mut SqliteStorage,
    session_id: &str,
    output: &str,
) -> Result<()> {
    for item in classify::scan_plan_progress(output) {
        store.merge_plan_progress(session_id, &item, "complete")?;
    }
    Ok(())
}

/// Detect a plan-file reference in a prompt and backfill the session's
/// task linkage: `plans/T-42.md` links task `T-42`.
fn link_plan_reference(store: &SqliteStorage, session_id: &str, text: &str) -> Result<()> {
    let Some((plan_file, task_id)) = detect_plan_reference(text) else {
        return Ok(());
    };
    store.link_session_plan(session_id, &plan_file, &task_id)?;
    tracing::debug!(plan_file = %plan_file, task_id = %task_id, "linked session to plan");
    Ok(())
}

/// Find the first plan-document path mentioned in free text.
fn detect_plan_reference(text: &str) -> Option<(String, String)> {
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '-' && c != '_');
        let is_plan = (token.contains("plans/") && token.ends_with(".md"))
            || token.ends_with(".plan.md");
        if !is_plan {
            continue;
        }
        let stem = std::path::Path::new(token)
            .file_name()?
            .to_str()?
            .trim_end_matches(".md")
            .trim_end_matches(".plan");
        if stem.is_empty() {
            continue;
        }
        return Some((token.to_string(), stem.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PushResult;

    /// Transport that accepts everything; hook tests never hit the network.
    struct AcceptAll;
    impl SyncTransport for AcceptAll {
        fn push(
            &self,
            _endpoint: &str,
            _token: Option<&str>,
            _body: &serde_json::Value,
        ) -> PushResult {
            PushResult::Accepted
        }
    }

    fn setup() -> (tempfile::TempDir, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        (dir, config)
    }

    fn envelope(session: &str, event: serde_json::Value) -> HookEnvelope {
        let raw = serde_json::json!({"session_id": session, "event": event});
        parse_envelope(&raw.to_string()).unwrap()
    }

    #[test]
    fn test_parse_envelope_preserves_unknown_keys() {
        let raw = r#"{"session_id": "s1", "hook_version": 3,
                      "event": {"kind": "session_end"}}"#;
        let env = parse_envelope(raw).unwrap();
        assert_eq!(env.session_id, "s1");
        assert_eq!(env.extra.get("hook_version").unwrap(), 3);
    }

    #[test]
    fn test_parse_envelope_rejects_malformed() {
        assert!(matches!(
            parse_envelope("not json"),
            Err(Error::MalformedEvent(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"session_id": "", "event": {"kind": "session_end"}}"#),
            Err(Error::MalformedEvent(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"event": {"kind": "session_end"}}"#),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_end_to_end_write_then_failing_tests() {
        let (_dir, config) = setup();

        // Write a.ts
        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "tool_call",
                "tool_name": "Write",
                "tool_input": {"file_path": "a.ts"},
                "tool_output": "File created successfully",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        // npm test with FAIL in the output
        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "tool_call",
                "tool_name": "Bash",
                "tool_input": {"command": "npm test"},
                "tool_output": "Suite: 2 passed, 1 FAIL",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let observations = store.session_observations("s1").unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].title, "Created/wrote: a.ts");
        assert_eq!(observations[1].title, "Tests: FAIL");
        assert_eq!(observations[1].importance, 4);
        drop(store);

        // Session end: completed empty, next_steps populated.
        let env = envelope("s1", serde_json::json!({"kind": "session_end"}));
        handle_event(&config, &AcceptAll, &env).unwrap();

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let summary = store.latest_summary("s1").unwrap().unwrap();
        assert!(summary.completed.is_none());
        assert!(summary.next_steps.is_some());

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_duplicate_failed_attempt_signals_collapse() {
        let (_dir, config) = setup();

        for _ in 0..2 {
            let env = envelope(
                "s1",
                serde_json::json!({
                    "kind": "attempt_failed",
                    "title": "retry X",
                }),
            );
            handle_event(&config, &AcceptAll, &env).unwrap();
        }

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let attempts = store.failed_attempts(10).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].recurrence_count, 2);
    }

    #[test]
    fn test_session_start_emits_context_block() {
        let (_dir, config) = setup();

        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "attempt_failed",
                "title": "patching vendored code",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        let env = envelope(
            "s2",
            serde_json::json!({"kind": "session_start", "trigger": "startup"}),
        );
        let block = handle_event(&config, &AcceptAll, &env).unwrap().unwrap();
        assert!(block.contains("patching vendored code"));
        assert!(block.starts_with(crate::config::CONTEXT_BEGIN));
    }

    #[test]
    fn test_session_start_with_empty_store_emits_nothing() {
        let (_dir, config) = setup();
        let env = envelope(
            "s1",
            serde_json::json!({"kind": "session_start", "trigger": "startup"}),
        );
        assert!(handle_event(&config, &AcceptAll, &env).unwrap().is_none());
    }

    #[test]
    fn test_prompt_links_plan_reference() {
        let (_dir, config) = setup();
        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "prompt",
                "text": "continue working through plans/T-42.md please",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.plan_file.as_deref(), Some("plans/T-42.md"));
        assert_eq!(session.task_id.as_deref(), Some("T-42"));
    }

    #[test]
    fn test_tool_output_plan_completion_merges_progress() {
        let (_dir, config) = setup();
        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "tool_call",
                "tool_name": "Bash",
                "tool_input": {"command": "./scripts/update-plan"},
                "tool_output": "P-7 marked complete",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let summary = store.latest_summary("s1").unwrap().unwrap();
        assert_eq!(summary.plan_progress.get("P-7").unwrap(), "complete");
    }

    #[test]
    fn test_detect_plan_reference_shapes() {
        assert_eq!(
            detect_plan_reference("see plans/T-9.md for details"),
            Some(("plans/T-9.md".to_string(), "T-9".to_string()))
        );
        assert_eq!(
            detect_plan_reference("open migration.plan.md now"),
            Some(("migration.plan.md".to_string(), "migration".to_string()))
        );
        assert_eq!(detect_plan_reference("no references here"), None);
    }

    #[test]
    fn test_decision_text_persists_observation() {
        let (_dir, config) = setup();
        let env = envelope(
            "s1",
            serde_json::json!({
                "kind": "assistant_text",
                "text": "I've decided to use a worker pool here.\nReasons follow.",
            }),
        );
        handle_event(&config, &AcceptAll, &env).unwrap();

        let store = SqliteStorage::open(&config.db_path).unwrap();
        let observations = store.session_observations("s1").unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].importance, 5);
    }
}
