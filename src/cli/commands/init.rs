//! Init command implementation.
//!
//! Creates the `.memtrail/` directory and store for the current project
//! (at the git root when inside a repository). Subsequent invocations
//! discover the store by walking up from the working directory.

use crate::config::init_target_dir;
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use std::path::{Path, PathBuf};

/// Execute the init command.
///
/// An explicit `--db` path wins over the project-local default.
pub fn execute(explicit_db: Option<&Path>, force: bool, json: bool) -> Result<()> {
    let db_path: PathBuf = explicit_db
        .map(Path::to_path_buf)
        .unwrap_or_else(|| init_target_dir().join("memtrail.db"));

    if db_path.exists() {
        if !force {
            return Err(Error::AlreadyInitialized { path: db_path });
        }
        std::fs::remove_file(&db_path)?;
    }

    // Opening applies the schema.
    let store = SqliteStorage::open(&db_path)?;
    let fts = store.fts_enabled();

    if json {
        let output = serde_json::json!({
            "db": db_path,
            "fts_enabled": fts,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Initialized Memtrail store at {}", db_path.display());
        if !fts {
            println!("Note: FTS5 unavailable, search will use substring scans.");
        }
    }
    Ok(())
}
