//! CLI definitions using clap.

use crate::model::TriggerKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// Memtrail CLI - Session memory engine for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "mt", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: <project>/.memtrail/memtrail.db)
    #[arg(long, global = true, env = "MEMTRAIL_DB")]
    pub db: Option<PathBuf>,

    /// Output as JSON (for agent integration)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a Memtrail store for this project
    Init {
        /// Overwrite an existing store
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Ingest one hook event from stdin (silent by contract)
    Event,

    /// Build and print the context block for a session start
    Context {
        /// Session ID (defaults to the most recent session)
        #[arg(long)]
        session: Option<String>,

        /// Why context is being rebuilt
        #[arg(long, value_enum, default_value = "startup")]
        trigger: TriggerKind,

        /// Token budget override
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Summarize a session into a checkpoint without ending it
    Summarize {
        /// Session ID (defaults to the most recent session)
        #[arg(long)]
        session: Option<String>,
    },

    /// Rotate and regenerate the canonical state document
    Archive,

    /// Full-text search over observations (or prompts)
    Search {
        /// Query text
        query: String,

        /// Search user prompts instead of observations
        #[arg(long)]
        prompts: bool,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show store statistics and the latest session
    Status,

    /// Sync outbox operations
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Replay queued payloads against the remote
    Drain,

    /// Show pending outbox items
    Status,
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}
