//! Context command implementation.
//!
//! Builds the same block `mt event` emits on session start, for manual
//! inspection or direct injection. Read-only.

use super::resolve_session;
use crate::config::EngineConfig;
use crate::context::{build_context, estimate_tokens};
use crate::error::Result;
use crate::model::TriggerKind;
use crate::storage::SqliteStorage;

/// Execute the context command.
pub fn execute(
    config: &EngineConfig,
    session_id: Option<&str>,
    trigger: TriggerKind,
    budget: Option<usize>,
    json: bool,
) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;
    let session = resolve_session(&store, session_id)?;
    let budget = budget.unwrap_or_else(|| config.token_budget(trigger));

    let block = build_context(
        &store,
        &session.id,
        trigger,
        budget,
        session.task_id.as_deref(),
    )?;

    if json {
        let output = serde_json::json!({
            "session_id": session.id,
            "trigger": trigger.as_str(),
            "budget": budget,
            "estimated_tokens": estimate_tokens(&block),
            "context": block,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !block.is_empty() {
        println!("{block}");
    }

    Ok(())
}
