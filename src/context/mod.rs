//! Token-budgeted context assembly.
//!
//! Builds the text block injected at session start: candidate sections are
//! gathered with fixed priority weights, sorted by weight (stable on ties),
//! and packed greedily first-fit against the token budget. A section that
//! would overflow is skipped, not truncated, and iteration continues, so a
//! smaller low-priority section can still land after a larger high-priority
//! one was dropped.

use crate::config::{CONTEXT_BEGIN, CONTEXT_END};
use crate::error::Result;
use crate::model::{Observation, SessionSummary, TriggerKind};
use crate::storage::SqliteStorage;

/// Fixed section weights.
const WEIGHT_FAILED_ATTEMPTS: u8 = 10;
const WEIGHT_CURRENT_SESSION: u8 = 9;
const WEIGHT_TASK_PROGRESS: u8 = 8;
const WEIGHT_RECENT_SUMMARIES: u8 = 7;
const WEIGHT_RECENT_OBSERVATIONS: u8 = 5;

const FAILED_ATTEMPT_LIMIT: u32 = 5;
const CURRENT_SESSION_LIMIT: usize = 15;
const RECENT_OBSERVATION_LIMIT: u32 = 10;
const TASK_SUMMARY_LIMIT: u32 = 5;

/// One candidate context section.
#[derive(Debug, Clone)]
pub struct Section {
    pub weight: u8,
    pub body: String,
}

/// Estimated token count: ceil(character_length / 4).
///
/// Deliberately an approximation; the engine never depends on a real
/// tokenizer.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Build the injectable context block for a session start.
///
/// Returns an empty string when nothing fits the budget (including the
/// fixed marker overhead); the caller injects nothing in that case.
///
/// # Errors
///
/// Returns an error if a store query fails.
pub fn build_context(
    store: &SqliteStorage,
    session_id: &str,
    trigger: TriggerKind,
    budget: usize,
    task_id: Option<&str>,
) -> Result<String> {
    let sections = gather_sections(store, session_id, trigger, task_id)?;
    Ok(assemble(sections, budget))
}

/// Gather candidate sections in priority order.
fn gather_sections(
    store: &SqliteStorage,
    session_id: &str,
    trigger: TriggerKind,
    task_id: Option<&str>,
) -> Result<Vec<Section>> {
    let mut sections = Vec::new();

    // Cross-session failed attempts: always first when non-empty.
    let attempts = store.failed_attempts(FAILED_ATTEMPT_LIMIT)?;
    if !attempts.is_empty() {
        sections.push(Section {
            weight: WEIGHT_FAILED_ATTEMPTS,
            body: render_failed_attempts(&attempts),
        });
    }

    // After a compaction the agent just lost its own recent history; the
    // current session's observations outrank everything but failures.
    if trigger == TriggerKind::Compact {
        let mut own = store.session_observations(session_id)?;
        if own.len() > CURRENT_SESSION_LIMIT {
            own.drain(..own.len() - CURRENT_SESSION_LIMIT);
        }
        if !own.is_empty() {
            sections.push(Section {
                weight: WEIGHT_CURRENT_SESSION,
                body: render_observation_list("## This session so far", &own),
            });
        }
    }

    if let Some(task) = task_id {
        let task_summaries = store.summaries_for_task(task, TASK_SUMMARY_LIMIT)?;
        if !task_summaries.is_empty() {
            sections.push(Section {
                weight: WEIGHT_TASK_PROGRESS,
                body: render_task_progress(task, &task_summaries),
            });
        }
    }

    let summaries = store.recent_summaries(summary_count(trigger))?;
    if !summaries.is_empty() {
        sections.push(Section {
            weight: WEIGHT_RECENT_SUMMARIES,
            body: render_summaries(&summaries),
        });
    }

    let mut recent = store.recent_observations(RECENT_OBSERVATION_LIMIT)?;
    // Re-sort by importance; stable, so recency breaks ties.
    recent.sort_by(|a, b| b.importance.cmp(&a.importance));
    if !recent.is_empty() {
        sections.push(Section {
            weight: WEIGHT_RECENT_OBSERVATIONS,
            body: render_observation_list("## Highlights from recent work", &recent),
        });
    }

    Ok(sections)
}

/// How many cross-session summaries each trigger kind wants.
const fn summary_count(trigger: TriggerKind) -> u32 {
    match trigger {
        TriggerKind::Resume => 5,
        TriggerKind::Compact => 2,
        TriggerKind::Startup | TriggerKind::Clear => 3,
    }
}

/// Sort by weight and pack sections greedily into the budget.
///
/// Marker overhead is charged up front; a budget below the overhead (or a
/// pack where nothing fits) yields an empty string.
#[must_use]
pub fn assemble(mut sections: Vec<Section>, budget: usize) -> String {
    let header = format!("{CONTEXT_BEGIN}\n# Session memory\n");
    let footer = format!("{CONTEXT_END}\n");
    let overhead = estimate_tokens(&header) + estimate_tokens(&footer);

    if budget < overhead {
        return String::new();
    }

    // Stable sort: ties keep gather order.
    sections.sort_by_key(|s| std::cmp::Reverse(s.weight));

    let mut used = overhead;
    let mut accepted: Vec<String> = Vec::new();
    for section in sections {
        let cost = estimate_tokens(&section.body);
        if used + cost <= budget {
            used += cost;
            accepted.push(section.body);
        }
        // Skip-and-continue: later, smaller sections may still fit.
    }

    if accepted.is_empty() {
        return String::new();
    }

    let mut out = header;
    for body in accepted {
        out.push_str(&body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(&footer);
    out
}

// ── Renderers ─────────────────────────────────────────────────

fn render_failed_attempts(attempts: &[Observation]) -> String {
    let mut out = String::from("## Approaches that already failed\n");
    for a in attempts {
        if a.recurrence_count > 1 {
            out.push_str(&format!("- {} (seen {}x)", a.title, a.recurrence_count));
        } else {
            out.push_str(&format!("- {}", a.title));
        }
        if let Some(detail) = &a.detail {
            out.push_str(&format!(": {}", first_line(detail)));
        }
        out.push('\n');
    }
    out
}

fn render_observation_list(heading: &str, observations: &[Observation]) -> String {
    let mut out = format!("{heading}\n");
    for o in observations {
        out.push_str(&format!("- [{}] {}\n", o.obs_type.as_str(), o.title));
    }
    out
}

fn render_task_progress(task_id: &str, summaries: &[SessionSummary]) -> String {
    let mut out = format!("## Task progress ({task_id})\n");
    for s in summaries {
        for (item, status) in &s.plan_progress {
            out.push_str(&format!("- {item}: {status}\n"));
        }
        if let Some(completed) = &s.completed {
            for line in completed.lines() {
                out.push_str(&format!("- done: {}\n", line.trim_start_matches("- ")));
            }
        }
    }
    out
}

fn render_summaries(summaries: &[SessionSummary]) -> String {
    let mut out = String::from("## Recent sessions\n");
    for s in summaries {
        if let Some(request) = &s.request {
            out.push_str(&format!("### {}\n", first_line(request)));
        } else {
            out.push_str("### (no recorded request)\n");
        }
        if let Some(completed) = &s.completed {
            out.push_str(&format!("Completed:\n{completed}\n"));
        }
        if let Some(next) = &s.next_steps {
            out.push_str(&format!("Next steps:\n{next}\n"));
        }
    }
    out
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObservationType;
    use crate::storage::NewObservation;

    fn section(weight: u8, chars: usize) -> Section {
        Section {
            weight,
            body: "x".repeat(chars),
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_budget_below_overhead_yields_empty() {
        let out = assemble(vec![section(10, 40)], 5);
        assert!(out.is_empty());
    }

    #[test]
    fn test_no_sections_yields_empty() {
        assert!(assemble(Vec::new(), 10_000).is_empty());
    }

    #[test]
    fn test_output_never_exceeds_budget() {
        for budget in [30, 50, 80, 200, 1000] {
            let sections = vec![section(10, 120), section(7, 300), section(5, 60)];
            let out = assemble(sections, budget);
            if !out.is_empty() {
                assert!(
                    estimate_tokens(&out) <= budget + 4,
                    "budget {budget} exceeded: {}",
                    estimate_tokens(&out)
                );
            }
        }
    }

    #[test]
    fn test_skip_and_continue_not_abort_on_first_miss() {
        // The weight-10 section alone exceeds the budget; the weight-5
        // section fits alone. First-fit must skip and keep going.
        let big = Section {
            weight: 10,
            body: "B".repeat(4000),
        };
        let small = Section {
            weight: 5,
            body: "small section body".to_string(),
        };
        let out = assemble(vec![big, small], 60);
        assert!(!out.is_empty());
        assert!(out.contains("small section body"));
        assert!(!out.contains("BBBB"));
    }

    #[test]
    fn test_weight_ordering_is_stable_on_ties() {
        let a = Section {
            weight: 7,
            body: "first-seven\n".to_string(),
        };
        let b = Section {
            weight: 7,
            body: "second-seven\n".to_string(),
        };
        let out = assemble(vec![a, b], 10_000);
        let first = out.find("first-seven").unwrap();
        let second = out.find("second-seven").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_markers_wrap_output() {
        let out = assemble(vec![section(5, 40)], 10_000);
        assert!(out.starts_with(CONTEXT_BEGIN));
        assert!(out.trim_end().ends_with(CONTEXT_END));
    }

    #[test]
    fn test_build_context_orders_failed_attempts_first() {
        let mut store = SqliteStorage::open_memory().unwrap();

        store
            .record_failed_attempt("s1", "raw SQL migration", Some("locks the table"))
            .unwrap();
        store
            .insert_observation(
                "s1",
                &NewObservation::new(ObservationType::Feature, "Commit: add retries", 3),
            )
            .unwrap();

        let out = build_context(&store, "s1", TriggerKind::Startup, 5000, None).unwrap();
        let failed_pos = out.find("Approaches that already failed").unwrap();
        let recent_pos = out.find("Highlights from recent work").unwrap();
        assert!(failed_pos < recent_pos);
        assert!(out.contains("raw SQL migration"));
    }

    #[test]
    fn test_compact_trigger_includes_current_session() {
        let store = SqliteStorage::open_memory().unwrap();
        store
            .insert_observation(
                "s1",
                &NewObservation::new(ObservationType::FileChange, "Edited: a.rs", 1),
            )
            .unwrap();

        let compact = build_context(&store, "s1", TriggerKind::Compact, 5000, None).unwrap();
        assert!(compact.contains("This session so far"));

        let startup = build_context(&store, "s1", TriggerKind::Startup, 5000, None).unwrap();
        assert!(!startup.contains("This session so far"));
    }

    #[test]
    fn test_task_progress_section_when_linked() {
        let mut store = SqliteStorage::open_memory().unwrap();
        store.upsert_session("s1", None, None).unwrap();
        store.link_session_plan("s1", "plans/t1.md", "T-1").unwrap();
        store.merge_plan_progress("s1", "P-2", "complete").unwrap();

        let out = build_context(&store, "s2", TriggerKind::Startup, 5000, Some("T-1")).unwrap();
        assert!(out.contains("Task progress (T-1)"));
        assert!(out.contains("P-2: complete"));
    }
}
