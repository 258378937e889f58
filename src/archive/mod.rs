//! State-document archiving and regeneration.
//!
//! The canonical "current state" document is regenerated after every
//! summarized session. Before regeneration, a non-trivial previous document
//! is rotated into the archive directory under a date + slug name, the slug
//! derived from the document's own embedded task line. Archiving failures
//! are logged and never block regeneration.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::SqliteStorage;
use std::fs;
use std::path::PathBuf;

/// Documents at or below this size are not worth archiving.
const ARCHIVE_MIN_BYTES: u64 = 120;

/// Maximum slug length.
const SLUG_MAX: usize = 48;

/// Rotate the previous state document (if non-trivial), then regenerate
/// the canonical document from the latest store contents.
///
/// # Errors
///
/// Returns an error only if REGENERATION fails; archive failures are
/// swallowed after a warning.
pub fn archive_and_regenerate(store: &SqliteStorage, config: &EngineConfig) -> Result<()> {
    if let Err(e) = archive_previous(config) {
        tracing::warn!(error = %e, "state document archive failed, regenerating anyway");
    }

    let doc = render_state_doc(store)?;
    if let Some(parent) = config.context_doc.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config.context_doc, doc)?;
    Ok(())
}

/// Move the existing document into the archive directory.
fn archive_previous(config: &EngineConfig) -> Result<()> {
    let doc = &config.context_doc;
    let Ok(meta) = fs::metadata(doc) else {
        return Ok(()); // nothing to archive
    };
    if meta.len() <= ARCHIVE_MIN_BYTES {
        return Ok(());
    }

    let content = fs::read_to_string(doc)?;
    let slug = slug_from_document(&content);
    let date = chrono::Utc::now().format("%Y-%m-%d");

    fs::create_dir_all(&config.archive_dir)?;
    let target = distinct_path(&config.archive_dir, &format!("{date}-{slug}"));

    // Rename is atomic on the same filesystem; fall back to copy+rewrite
    // when the archive dir lives elsewhere.
    if fs::rename(doc, &target).is_err() {
        fs::write(&target, &content)?;
        let _ = fs::remove_file(doc);
    }

    tracing::debug!(target = %target.display(), "archived previous state document");
    Ok(())
}

/// First non-colliding `<stem>.md` / `<stem>-N.md` path in `dir`.
fn distinct_path(dir: &std::path::Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.md"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 2;
    loop {
        let candidate = dir.join(format!("{stem}-{n}.md"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Derive an archive slug from the document's embedded task/status line.
fn slug_from_document(content: &str) -> String {
    let line = content
        .lines()
        .find_map(|l| {
            l.strip_prefix("Task:")
                .or_else(|| l.strip_prefix("Status:"))
        })
        .unwrap_or("state");
    slugify(line)
}

/// Lowercase, collapse non-alphanumeric runs to `-`, trim, length-cap.
fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
        if out.len() >= SLUG_MAX {
            break;
        }
    }
    if out.is_empty() {
        "state".to_string()
    } else {
        out
    }
}

/// Render the canonical state document from the latest store contents.
fn render_state_doc(store: &SqliteStorage) -> Result<String> {
    let session = store.latest_session()?;
    let summary = session
        .as_ref()
        .map(|s| store.latest_summary(&s.id))
        .transpose()?
        .flatten();
    let failed = store.failed_attempts(5)?;

    let task_line = summary
        .as_ref()
        .and_then(|s| s.request.as_deref())
        .map_or_else(
            || "no recorded task".to_string(),
            |r| r.lines().next().unwrap_or(r).to_string(),
        );

    let mut out = String::from("# Memtrail state\n");
    out.push_str(&format!("Task: {task_line}\n"));
    if let Some(session) = &session {
        out.push_str(&format!(
            "Status: session {} ({})\n",
            session.id,
            session.status.as_str()
        ));
    }
    out.push_str(&format!(
        "Updated: {}\n\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    if let Some(summary) = &summary {
        if let Some(completed) = &summary.completed {
            out.push_str(&format!("## Completed\n{completed}\n\n"));
        }
        if let Some(next) = &summary.next_steps {
            out.push_str(&format!("## Next steps\n{next}\n\n"));
        }
        if let Some(decisions) = &summary.decisions {
            out.push_str(&format!("## Decisions\n{decisions}\n\n"));
        }
        if !summary.plan_progress.is_empty() {
            out.push_str("## Plan progress\n");
            for (item, status) in &summary.plan_progress {
                out.push_str(&format!("- {item}: {status}\n"));
            }
            out.push('\n');
        }
    }

    if !failed.is_empty() {
        out.push_str("## Failed approaches\n");
        for attempt in &failed {
            out.push_str(&format!(
                "- {} (seen {}x)\n",
                attempt.title, attempt.recurrence_count
            ));
        }
    }

    Ok(out)
}
