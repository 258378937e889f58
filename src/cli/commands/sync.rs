//! Sync command implementations.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;
use crate::sync::{drain_sync_queue, HttpTransport, RETRY_CEILING};
use colored::Colorize;

/// Execute `mt sync drain`.
pub fn drain(config: &EngineConfig, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;

    if !config.sync.is_enabled() {
        if json {
            println!("{}", serde_json::json!({"enabled": false}));
        } else {
            println!("Sync is not configured (set MEMTRAIL_SYNC_URL).");
        }
        return Ok(());
    }

    let transport = HttpTransport::new();
    let stats = drain_sync_queue(&store, &transport, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Drained outbox: {} delivered, {} failed, {} evicted",
            stats.delivered, stats.failed, stats.evicted
        );
    }
    Ok(())
}

/// Execute `mt sync status`.
pub fn status(config: &EngineConfig, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.db_path)?;
    let items = store.oldest_sync_items(50)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    println!("{} pending item(s):", items.len());
    for item in &items {
        let age = item.retry_count >= RETRY_CEILING - 1;
        let retries = format!("retries: {}", item.retry_count);
        println!(
            "  #{} {} {}",
            item.id,
            if age { retries.red() } else { retries.dimmed() },
            item.last_error.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}
