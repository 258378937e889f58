//! Memtrail CLI entry point.

use clap::Parser;
use mt::cli::{commands, Cli, Commands, SyncCommands};
use mt::config::EngineConfig;
use mt::error::Result;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing based on verbosity. Diagnostics go to stderr only;
    // stdout is reserved for command output and injected context.
    init_tracing(cli.verbose, cli.quiet);

    // Effective JSON mode: --json or piped stdout on read-style commands.
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let config = match EngineConfig::resolve(cli.db.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {e}");
            }
            return ExitCode::from(e.exit_code());
        }
    };

    // The hook endpoint never fails the host runtime.
    if matches!(cli.command, Commands::Event) {
        commands::event::execute(&config);
        return ExitCode::SUCCESS;
    }

    match run(&cli, &config, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli, config: &EngineConfig, json: bool) -> Result<()> {
    match &cli.command {
        Commands::Event => unreachable!("handled in main"),
        Commands::Init { force } => commands::init::execute(cli.db.as_deref(), *force, json),
        Commands::Version => {
            commands::version::execute(json);
            Ok(())
        }
        Commands::Context {
            session,
            trigger,
            budget,
        } => commands::context::execute(config, session.as_deref(), *trigger, *budget, json),
        Commands::Summarize { session } => {
            commands::summarize::execute(config, session.as_deref(), json)
        }
        Commands::Archive => commands::archive::execute(config, json),
        Commands::Search {
            query,
            prompts,
            limit,
        } => commands::search::execute(config, query, *prompts, *limit, json),
        Commands::Status => commands::status::execute(config, json),
        Commands::Sync { command } => match command {
            SyncCommands::Drain => commands::sync::drain(config, json),
            SyncCommands::Status => commands::sync::status(config, json),
        },
        Commands::Completions { shell } => {
            commands::completions::execute(shell);
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}
