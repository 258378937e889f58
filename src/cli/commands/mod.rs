//! Command implementations.

pub mod archive;
pub mod completions;
pub mod context;
pub mod event;
pub mod init;
pub mod search;
pub mod status;
pub mod summarize;
pub mod sync;
pub mod version;

use crate::error::{Error, Result};
use crate::model::Session;
use crate::storage::SqliteStorage;

/// Resolve a session id: an explicit one wins, otherwise the most recent
/// session in the store.
pub(crate) fn resolve_session(
    store: &SqliteStorage,
    explicit: Option<&str>,
) -> Result<Session> {
    if let Some(id) = explicit {
        return store
            .get_session(id)?
            .ok_or_else(|| Error::SessionNotFound { id: id.to_string() });
    }
    store
        .latest_session()?
        .ok_or_else(|| Error::SessionNotFound {
            id: "(latest)".to_string(),
        })
}
