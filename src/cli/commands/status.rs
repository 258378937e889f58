//! Status command implementation.

use crate::config::{current_git_branch, EngineConfig};
use crate::error::Result;
use crate::storage::SqliteStorage;
use colored::Colorize;

/// Execute the status command.
pub fn execute(config: &EngineConfig, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;
    let stats = store.stats()?;
    let latest = store.latest_session()?;
    let branch = current_git_branch();

    if json {
        let output = serde_json::json!({
            "db": config.db_path,
            "fts_enabled": store.fts_enabled(),
            "branch": branch,
            "stats": stats,
            "latest_session": latest,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Memtrail".magenta().bold());
    println!("  Store:    {}", config.db_path.display());
    println!(
        "  Search:   {}",
        if store.fts_enabled() { "full-text (FTS5)" } else { "substring scan" }
    );
    if let Some(branch) = &branch {
        println!("  Branch:   {branch}");
    }
    println!();
    println!("{}", "Counts".cyan().bold());
    println!("  Sessions:      {}", stats.sessions);
    println!("  Observations:  {}", stats.observations);
    println!("  Summaries:     {}", stats.summaries);
    println!("  Prompts:       {}", stats.prompts);
    println!("  Outbox:        {}", stats.outbox_pending);

    if let Some(session) = latest {
        println!();
        println!("{}", "Latest session".cyan().bold());
        println!("  ID:      {}", session.id);
        println!("  Status:  {}", session.status.as_str());
        if let Some(project) = &session.project {
            println!("  Project: {project}");
        }
        if let Some(task) = &session.task_id {
            println!("  Task:    {task}");
        }
    }

    Ok(())
}
