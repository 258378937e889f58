//! Archive command implementation.

use crate::archive::archive_and_regenerate;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;

/// Execute the archive command.
pub fn execute(config: &EngineConfig, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;
    archive_and_regenerate(&store, config)?;

    if json {
        let output = serde_json::json!({
            "context_doc": config.context_doc,
            "archive_dir": config.archive_dir,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Regenerated {}", config.context_doc.display());
    }
    Ok(())
}
