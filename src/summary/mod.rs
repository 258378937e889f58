//! End-of-session summarization.
//!
//! Derives a [`SessionSummary`] from the observation log and prompt history.
//! The summary is a pure function of its inputs; persistence and the
//! continuous plan-progress merge live in the store.

use crate::model::{short_id, Observation, ObservationType, SessionSummary, UserPrompt};
use std::collections::BTreeMap;

/// Maximum length of the `request` field.
const REQUEST_MAX: usize = 200;

/// Build a summary checkpoint from a session's observations and prompts.
///
/// `next_steps` is populated only when the session produced no completed
/// work (no feature/bugfix/refactor observation); it then lists the
/// chronologically last 10% of observations, rounded up, so any non-empty
/// session yields at least one entry. No other minimum is imposed.
#[must_use]
pub fn build_summary(
    session_id: &str,
    observations: &[Observation],
    prompts: &[UserPrompt],
) -> SessionSummary {
    let request = prompts
        .first()
        .map(|p| truncate(p.prompt_text.trim(), REQUEST_MAX));

    let investigated = join_titles(observations, ObservationType::Discovery);
    let decisions = bullet_titles(observations, &[ObservationType::Decision]);
    let completed = bullet_titles(
        observations,
        &[
            ObservationType::Feature,
            ObservationType::Bugfix,
            ObservationType::Refactor,
        ],
    );
    let failed_attempts = bullet_titles(observations, &[ObservationType::FailedAttempt]);

    let next_steps = if completed.is_none() {
        trailing_slice(observations)
    } else {
        None
    };

    let (files_created, files_modified) = partition_files(observations);

    let mut verification_results = BTreeMap::new();
    for obs in observations {
        if let Some(vt) = &obs.verification_type {
            let outcome = if obs.title.contains("PASS") { "PASS" } else { "FAIL" };
            verification_results.insert(vt.clone(), outcome.to_string());
        }
    }

    let mut plan_progress = BTreeMap::new();
    for obs in observations {
        if let Some(item) = &obs.plan_item {
            plan_progress
                .entry(item.clone())
                .or_insert_with(|| "in_progress".to_string());
        }
    }

    SessionSummary {
        id: short_id("sum"),
        session_id: session_id.to_string(),
        request,
        investigated,
        decisions,
        completed,
        failed_attempts,
        next_steps,
        files_created,
        files_modified,
        verification_results,
        plan_progress,
        created_at: chrono::Utc::now().timestamp_millis(),
    }
}

/// The trailing ceil(10%) of observations, as a bulleted list.
fn trailing_slice(observations: &[Observation]) -> Option<String> {
    if observations.is_empty() {
        return None;
    }
    let count = observations.len().div_ceil(10);
    let tail = &observations[observations.len() - count..];
    Some(
        tail.iter()
            .map(|o| format!("- {}", o.title))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Titles of matching observations as a `; `-joined line.
fn join_titles(observations: &[Observation], obs_type: ObservationType) -> Option<String> {
    let titles: Vec<&str> = observations
        .iter()
        .filter(|o| o.obs_type == obs_type)
        .map(|o| o.title.as_str())
        .collect();
    if titles.is_empty() {
        None
    } else {
        Some(titles.join("; "))
    }
}

/// Titles of matching observations as a bulleted block.
fn bullet_titles(observations: &[Observation], types: &[ObservationType]) -> Option<String> {
    let titles: Vec<String> = observations
        .iter()
        .filter(|o| types.contains(&o.obs_type))
        .map(|o| format!("- {}", o.title))
        .collect();
    if titles.is_empty() {
        None
    } else {
        Some(titles.join("\n"))
    }
}

/// Partition involved files by the file-change title-prefix convention,
/// deduplicating by value while preserving first-seen order.
fn partition_files(observations: &[Observation]) -> (Vec<String>, Vec<String>) {
    let mut created = Vec::new();
    let mut modified = Vec::new();
    for obs in observations {
        let bucket: &mut Vec<String> = if obs.title.starts_with("Created/wrote:") {
            &mut created
        } else if obs.title.starts_with("Edited:") {
            &mut modified
        } else {
            continue;
        };
        for file in &obs.files {
            if !bucket.contains(file) {
                bucket.push(file.clone());
            }
        }
    }
    (created, modified)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(obs_type: ObservationType, title: &str) -> Observation {
        Observation {
            id: short_id("obs"),
            session_id: "s1".to_string(),
            obs_type,
            title: title.to_string(),
            detail: None,
            files: Vec::new(),
            rule_id: None,
            verification_type: None,
            plan_item: None,
            importance: 3,
            recurrence_count: 1,
            created_at: 0,
        }
    }

    fn prompt(text: &str) -> UserPrompt {
        UserPrompt {
            id: short_id("prm"),
            session_id: "s1".to_string(),
            seq: 1,
            prompt_text: text.to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn test_completed_work_unsets_next_steps() {
        let observations = vec![obs(ObservationType::Feature, "Commit: add parser")];
        let summary = build_summary("s1", &observations, &[]);
        assert_eq!(summary.completed.as_deref(), Some("- Commit: add parser"));
        assert!(summary.next_steps.is_none());
    }

    #[test]
    fn test_no_completed_work_populates_next_steps() {
        let observations = vec![
            obs(ObservationType::FileChange, "Created/wrote: a.ts"),
            obs(ObservationType::VrCheck, "Tests: FAIL"),
        ];
        let summary = build_summary("s1", &observations, &[]);
        assert!(summary.completed.is_none());
        // ceil(2/10) = 1: the chronologically last observation.
        assert_eq!(summary.next_steps.as_deref(), Some("- Tests: FAIL"));
    }

    #[test]
    fn test_next_steps_empty_for_empty_session() {
        let summary = build_summary("s1", &[], &[]);
        assert!(summary.next_steps.is_none());
        assert!(summary.completed.is_none());
    }

    #[test]
    fn test_trailing_slice_is_ten_percent_rounded_up() {
        let observations: Vec<Observation> = (0..25)
            .map(|i| obs(ObservationType::FileChange, &format!("Edited: f{i}.rs")))
            .collect();
        let summary = build_summary("s1", &observations, &[]);
        // ceil(25/10) = 3 trailing entries.
        let steps = summary.next_steps.unwrap();
        assert_eq!(steps.lines().count(), 3);
        assert!(steps.contains("f24.rs"));
        assert!(steps.contains("f22.rs"));
        assert!(!steps.contains("f21.rs"));
    }

    #[test]
    fn test_request_is_first_prompt_truncated() {
        let long = "y".repeat(500);
        let prompts = vec![prompt(&long), prompt("second")];
        let summary = build_summary("s1", &[], &prompts);
        let request = summary.request.unwrap();
        assert!(request.chars().count() <= REQUEST_MAX);
        assert!(request.ends_with("..."));
    }

    #[test]
    fn test_investigated_joins_discovery_titles() {
        let observations = vec![
            obs(ObservationType::Discovery, "Read: docs/a.md"),
            obs(ObservationType::Discovery, "Read: docs/b.md"),
            obs(ObservationType::FileChange, "Edited: x.rs"),
        ];
        let summary = build_summary("s1", &observations, &[]);
        assert_eq!(
            summary.investigated.as_deref(),
            Some("Read: docs/a.md; Read: docs/b.md")
        );
    }

    #[test]
    fn test_file_partition_by_title_prefix_dedups() {
        let mut created = obs(ObservationType::FileChange, "Created/wrote: a.ts");
        created.files = vec!["a.ts".to_string()];
        let mut created_again = obs(ObservationType::FileChange, "Created/wrote: a.ts");
        created_again.files = vec!["a.ts".to_string()];
        let mut edited = obs(ObservationType::FileChange, "Edited: b.ts");
        edited.files = vec!["b.ts".to_string()];

        let summary = build_summary("s1", &[created, created_again, edited], &[]);
        assert_eq!(summary.files_created, vec!["a.ts".to_string()]);
        assert_eq!(summary.files_modified, vec!["b.ts".to_string()]);
    }

    #[test]
    fn test_verification_results_keyed_by_type() {
        let mut pass = obs(ObservationType::VrCheck, "Typecheck: PASS");
        pass.verification_type = Some("VR-TYPE".to_string());
        let mut fail = obs(ObservationType::VrCheck, "Tests: FAIL");
        fail.verification_type = Some("VR-TEST".to_string());

        let summary = build_summary("s1", &[pass, fail], &[]);
        assert_eq!(summary.verification_results.get("VR-TYPE").unwrap(), "PASS");
        assert_eq!(summary.verification_results.get("VR-TEST").unwrap(), "FAIL");
    }

    #[test]
    fn test_plan_progress_one_entry_per_distinct_item() {
        let mut a = obs(ObservationType::FileChange, "Edited: x.rs");
        a.plan_item = Some("P-1".to_string());
        let mut b = obs(ObservationType::FileChange, "Edited: y.rs");
        b.plan_item = Some("P-1".to_string());
        let mut c = obs(ObservationType::FileChange, "Edited: z.rs");
        c.plan_item = Some("P-2".to_string());

        let summary = build_summary("s1", &[a, b, c], &[]);
        assert_eq!(summary.plan_progress.len(), 2);
        assert_eq!(summary.plan_progress.get("P-1").unwrap(), "in_progress");
        assert_eq!(summary.plan_progress.get("P-2").unwrap(), "in_progress");
    }

    #[test]
    fn test_failed_attempts_bulleted() {
        let observations = vec![
            obs(ObservationType::FailedAttempt, "retry X"),
            obs(ObservationType::Decision, "decided to split the module"),
        ];
        let summary = build_summary("s1", &observations, &[]);
        assert_eq!(summary.failed_attempts.as_deref(), Some("- retry X"));
        assert_eq!(
            summary.decisions.as_deref(),
            Some("- decided to split the module")
        );
    }
}
