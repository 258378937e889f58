//! Summarize command implementation.
//!
//! Writes a mid-session summary checkpoint without ending the session.
//! Session end does the same thing implicitly via the hook path.

use super::resolve_session;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;
use crate::summary::build_summary;

/// Execute the summarize command.
pub fn execute(config: &EngineConfig, session_id: Option<&str>, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;
    let session = resolve_session(&store, session_id)?;

    let observations = store.session_observations(&session.id)?;
    let prompts = store.session_prompts(&session.id)?;
    let summary = build_summary(&session.id, &observations, &prompts);
    store.insert_summary(&summary)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Summarized session {} ({} observations)", session.id, observations.len());
        if let Some(completed) = &summary.completed {
            println!("Completed:\n{completed}");
        }
        if let Some(next) = &summary.next_steps {
            println!("Next steps:\n{next}");
        }
    }

    Ok(())
}
