//! Search command implementation.
//!
//! Full-text search over observations or user prompts. Read-only.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;
use colored::Colorize;

/// Execute the search command.
pub fn execute(
    config: &EngineConfig,
    query: &str,
    prompts: bool,
    limit: u32,
    json: bool,
) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;

    if prompts {
        let hits = store.search_prompts(query, limit)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        } else if hits.is_empty() {
            println!("No prompts matched.");
        } else {
            for p in &hits {
                println!(
                    "{} {} {}",
                    p.session_id.cyan(),
                    format!("#{}", p.seq).dimmed(),
                    first_line(&p.prompt_text)
                );
            }
        }
        return Ok(());
    }

    let hits = store.search_observations(query, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("No observations matched.");
    } else {
        for o in &hits {
            let tag = format!("[{}]", o.obs_type.as_str());
            println!("{} {} {}", tag.yellow(), o.title.bold(), o.session_id.dimmed());
            if let Some(detail) = &o.detail {
                println!("    {}", first_line(detail).dimmed());
            }
        }
    }

    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}
