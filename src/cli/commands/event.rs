//! Event command implementation: the hook endpoint.
//!
//! Reads one JSON envelope from stdin and runs the classify-and-persist
//! pipeline. This command is SILENT BY CONTRACT: the only thing it ever
//! writes to stdout is a context block for the agent, and every internal
//! error is logged and swallowed so the host runtime is never blocked.

use crate::config::EngineConfig;
use crate::hook::{handle_event, parse_envelope, read_stdin_event};
use crate::sync::HttpTransport;

/// Execute the event command. Infallible by design.
pub fn execute(config: &EngineConfig) {
    let Some(raw) = read_stdin_event() else {
        tracing::debug!("no input arrived, exiting cleanly");
        return;
    };

    let envelope = match parse_envelope(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "malformed event, exiting cleanly");
            return;
        }
    };

    let transport = HttpTransport::new();
    match handle_event(config, &transport, &envelope) {
        Ok(Some(block)) => println!("{block}"),
        Ok(None) => {}
        Err(e) => {
            // Degrade silently: the agent must never see this fail.
            tracing::warn!(error = %e, "event handling failed");
        }
    }
}
