//! Real-time event classification.
//!
//! Maps one raw tool event into zero-or-one observation draft. The noise
//! filter runs first and short-circuits everything else; decision detection
//! runs over assistant-authored text, not tool output.
//!
//! All state lives in an explicit per-invocation [`InvocationContext`];
//! each hook invocation is an independent process, so the seen-paths set
//! has no meaning across invocations.

pub mod importance;

use crate::config::EngineConfig;
use crate::model::ObservationType;
use crate::storage::NewObservation;
use importance::importance;
use std::collections::HashSet;

/// One raw tool event as reported by the host runtime.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: String,
    pub is_error: bool,
}

/// Per-invocation classifier state.
///
/// Tracks which paths were already read during this invocation so repeat
/// reads collapse to noise. Reset when the observed session id changes.
#[derive(Debug, Default)]
pub struct InvocationContext {
    session_id: String,
    seen_paths: HashSet<String>,
}

impl InvocationContext {
    /// Create a context for the given session.
    #[must_use]
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            seen_paths: HashSet::new(),
        }
    }

    /// Clear the seen set when the session id changes.
    pub fn observe_session(&mut self, session_id: &str) {
        if self.session_id != session_id {
            self.session_id = session_id.to_string();
            self.seen_paths.clear();
        }
    }

    /// Record a path read; returns `true` if it was already seen.
    fn mark_seen(&mut self, path: &str) -> bool {
        !self.seen_paths.insert(path.to_string())
    }
}

/// Introspection-only tools whose calls are always noise.
const INTROSPECTION_TOOLS: &[&str] = &[
    "grep", "glob", "ls", "list", "search", "websearch", "webfetch", "todoread",
];

/// Path prefixes/fragments that mark a read as vendored or dependency code.
const VENDORED_FRAGMENTS: &[&str] = &[
    "node_modules/",
    "vendor/",
    "target/",
    "dist/",
    "build/",
    ".git/",
    "__pycache__/",
    ".venv/",
];

/// Trivial read-only shell prefixes that never carry signal.
const TRIVIAL_COMMAND_PREFIXES: &[&str] = &[
    "ls", "pwd", "echo", "cat", "which", "head", "tail", "wc", "env", "git status", "git diff",
    "git log", "git branch",
];

/// Named compliance scanners recognized in shell commands.
const COMPLIANCE_SCANNERS: &[&str] = &["pattern-check", "compliance-scan"];

/// Test-runner invocations recognized in shell commands.
const TEST_RUNNERS: &[&str] = &[
    "npm test", "yarn test", "pnpm test", "npx jest", "jest", "vitest", "pytest", "cargo test",
    "go test", "make test",
];

/// Typecheck invocations (a subset of build commands, matched first).
const TYPECHECK_COMMANDS: &[&str] = &["tsc", "npx tsc", "mypy", "cargo check"];

/// Build invocations.
const BUILD_COMMANDS: &[&str] = &[
    "npm run build", "yarn build", "pnpm build", "cargo build", "go build", "make",
];

/// Maximum title length before truncation.
const TITLE_MAX: usize = 100;

/// Classify one tool call into at most one observation draft.
///
/// Returns `None` for noise, unclassifiable commands, and reads outside the
/// knowledge-source allow-list.
#[must_use]
pub fn classify_tool_call(
    config: &EngineConfig,
    ctx: &mut InvocationContext,
    call: &ToolCall,
) -> Option<NewObservation> {
    if is_noise(ctx, call) {
        return None;
    }

    let tool = call.tool_name.to_ascii_lowercase();
    match tool.as_str() {
        "write" => classify_file_change(call, true),
        "edit" | "multiedit" => classify_file_change(call, false),
        "read" => classify_read(config, call),
        "bash" | "shell" | "run" => classify_shell(call),
        _ => None,
    }
}

/// Noise filter, applied before any classification.
fn is_noise(ctx: &mut InvocationContext, call: &ToolCall) -> bool {
    // Blank output carries no signal regardless of tool.
    if call.output.trim().is_empty() {
        return true;
    }

    let tool = call.tool_name.to_ascii_lowercase();
    if INTROSPECTION_TOOLS.contains(&tool.as_str()) {
        return true;
    }

    if tool == "read" {
        if let Some(path) = input_path(&call.input) {
            // Repeat read this invocation, or first read of vendored code.
            if ctx.mark_seen(&path) {
                return true;
            }
            if VENDORED_FRAGMENTS.iter().any(|f| path.contains(f)) {
                return true;
            }
        }
    }

    if matches!(tool.as_str(), "bash" | "shell" | "run") {
        if let Some(command) = input_command(&call.input) {
            let trimmed = command.trim();
            if TRIVIAL_COMMAND_PREFIXES.iter().any(|p| {
                trimmed == *p
                    || trimmed.starts_with(&format!("{p} "))
            }) {
                return true;
            }
        }
    }

    false
}

/// Detect a decision in assistant-authored free text.
///
/// Title is the first line, truncated; importance is fixed at 5.
#[must_use]
pub fn detect_decision(config: &EngineConfig, text: &str) -> Option<NewObservation> {
    let lower = text.to_lowercase();
    if !config
        .decision_phrases
        .iter()
        .any(|p| lower.contains(p.as_str()))
    {
        return None;
    }

    let title = truncate(text.lines().next().unwrap_or(text).trim(), TITLE_MAX);
    if title.is_empty() {
        return None;
    }

    let mut draft = NewObservation::new(
        ObservationType::Decision,
        title,
        importance(ObservationType::Decision, None),
    );
    draft.detail = Some(truncate(text.trim(), 1000));
    Some(draft)
}

/// Scan tool output for plan-item completions.
///
/// Returns the plan items that a line links to a completion keyword, e.g.
/// `P-3.2 done` or `marking P-7 as complete`.
#[must_use]
pub fn scan_plan_progress(output: &str) -> Vec<String> {
    const COMPLETION_KEYWORDS: &[&str] = &["complete", "completed", "done", "finished"];

    let mut items = Vec::new();
    for line in output.lines() {
        let lower = line.to_lowercase();
        if !COMPLETION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            continue;
        }
        if let Some(item) = find_plan_item(line) {
            if !items.contains(&item) {
                items.push(item);
            }
        }
    }
    items
}

fn classify_file_change(call: &ToolCall, created: bool) -> Option<NewObservation> {
    let path = input_path(&call.input)?;
    let title = if created {
        format!("Created/wrote: {path}")
    } else {
        format!("Edited: {path}")
    };

    let mut draft = NewObservation::new(
        ObservationType::FileChange,
        truncate(&title, TITLE_MAX),
        importance(ObservationType::FileChange, None),
    );
    draft.files = vec![path.clone()];

    // Cross-references can appear in the tool output or the path itself.
    let haystack = format!("{} {path}", call.output);
    draft.rule_id = find_rule_id(&haystack);
    draft.verification_type = find_verification_type(&haystack);
    draft.plan_item = find_plan_item(&haystack);

    Some(draft)
}

fn classify_read(config: &EngineConfig, call: &ToolCall) -> Option<NewObservation> {
    let path = input_path(&call.input)?;
    if !config.knowledge_paths.iter().any(|k| path.contains(k.as_str())) {
        return None;
    }

    let mut draft = NewObservation::new(
        ObservationType::Discovery,
        truncate(&format!("Read: {path}"), TITLE_MAX),
        importance(ObservationType::Discovery, None),
    );
    draft.files = vec![path];
    Some(draft)
}

/// Shell commands are matched against four mutually exclusive categories;
/// first match wins, anything else produces nothing.
fn classify_shell(call: &ToolCall) -> Option<NewObservation> {
    let command = input_command(&call.input)?;
    let command = command.trim();

    // 1. Commit
    if command.contains("git commit") {
        let message = commit_message(command);
        let is_fix = message
            .as_deref()
            .is_some_and(|m| m.to_lowercase().contains("fix"));
        let obs_type = if is_fix {
            ObservationType::Bugfix
        } else {
            ObservationType::Feature
        };
        let title = match &message {
            Some(m) => format!("Commit: {}", m.lines().next().unwrap_or(m)),
            None => "Commit".to_string(),
        };
        let mut draft =
            NewObservation::new(obs_type, truncate(&title, TITLE_MAX), importance(obs_type, None));
        draft.detail = Some(truncate(command, 500));
        return Some(draft);
    }

    // 2. Compliance scanner
    if COMPLIANCE_SCANNERS.iter().any(|s| command.contains(s)) {
        let passed = !call.output.contains("FAIL") && !call.output.contains("BLOCKED");
        let mut draft = NewObservation::new(
            ObservationType::PatternCompliance,
            format!("Pattern check: {}", pass_fail(passed)),
            importance(ObservationType::PatternCompliance, Some(passed)),
        );
        draft.detail = Some(truncate(&call.output, 500));
        return Some(draft);
    }

    // 3. Test runner
    if TEST_RUNNERS.iter().any(|r| command_matches(command, r)) {
        let passed = !call.is_error && !call.output.contains("FAIL");
        let mut draft = NewObservation::new(
            ObservationType::VrCheck,
            format!("Tests: {}", pass_fail(passed)),
            importance(ObservationType::VrCheck, Some(passed)),
        );
        draft.verification_type = Some("VR-TEST".to_string());
        draft.detail = Some(truncate(&call.output, 500));
        return Some(draft);
    }

    // 4. Build / typecheck
    let is_typecheck = TYPECHECK_COMMANDS.iter().any(|c| command_matches(command, c));
    let is_build = BUILD_COMMANDS.iter().any(|c| command_matches(command, c));
    if is_typecheck || is_build {
        let passed = !call.is_error && !call.output.contains("error");
        let (label, vr_type) = if is_typecheck {
            ("Typecheck", "VR-TYPE")
        } else {
            ("Build", "VR-BUILD")
        };
        let mut draft = NewObservation::new(
            ObservationType::VrCheck,
            format!("{label}: {}", pass_fail(passed)),
            importance(ObservationType::VrCheck, Some(passed)),
        );
        draft.verification_type = Some(vr_type.to_string());
        draft.detail = Some(truncate(&call.output, 500));
        return Some(draft);
    }

    None
}

// ── Input extraction ──────────────────────────────────────────

fn input_path(input: &serde_json::Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(serde_json::Value::as_str)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
}

fn input_command(input: &serde_json::Value) -> Option<String> {
    input
        .get("command")
        .and_then(serde_json::Value::as_str)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
}

/// A command "matches" a runner when it starts with it or contains it as a
/// pipeline/&&-separated step, so `cd app && npm test` still classifies.
fn command_matches(command: &str, needle: &str) -> bool {
    if command.starts_with(needle) {
        return true;
    }
    command
        .split(['|', ';'])
        .flat_map(|part| part.split("&&"))
        .any(|part| part.trim().starts_with(needle))
}

/// Extract the `-m` message from a git commit command line.
fn commit_message(command: &str) -> Option<String> {
    let idx = command.find("-m")?;
    let rest = command[idx + 2..].trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        // Unquoted message: take the next word.
        return rest.split_whitespace().next().map(ToString::to_string);
    }
    let inner = &rest[1..];
    inner.find(quote).map(|end| inner[..end].to_string())
}

const fn pass_fail(passed: bool) -> &'static str {
    if passed {
        "PASS"
    } else {
        "FAIL"
    }
}

// ── Cross-reference extraction ────────────────────────────────
//
// Fixed token shapes: CR-<digits>, VR-<UPPER>, P-<digits>[.<digits>].
// Scanned by hand; the shapes are too small to justify a regex engine.

fn find_rule_id(text: &str) -> Option<String> {
    find_token(text, "CR-", |rest| take_while(rest, |c| c.is_ascii_digit()))
}

fn find_verification_type(text: &str) -> Option<String> {
    find_token(text, "VR-", |rest| {
        take_while(rest, |c| c.is_ascii_uppercase())
    })
}

fn find_plan_item(text: &str) -> Option<String> {
    find_token(text, "P-", |rest| {
        let digits = take_while(rest, |c| c.is_ascii_digit());
        if digits.is_empty() {
            return String::new();
        }
        let after = &rest[digits.len()..];
        if let Some(stripped) = after.strip_prefix('.') {
            let minor = take_while(stripped, |c| c.is_ascii_digit());
            if !minor.is_empty() {
                return format!("{digits}.{minor}");
            }
        }
        digits
    })
}

fn find_token(
    text: &str,
    prefix: &str,
    suffix: impl Fn(&str) -> String,
) -> Option<String> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(prefix) {
        let start = search_from + pos;
        // Must be token-initial: preceded by start-of-text or a non-word char.
        let ok_start = start == 0
            || text[..start]
                .chars()
                .next_back()
                .is_some_and(|c| !c.is_alphanumeric());
        if ok_start {
            let rest = &text[start + prefix.len()..];
            let body = suffix(rest);
            if !body.is_empty() {
                return Some(format!("{prefix}{body}"));
            }
        }
        search_from = start + prefix.len();
    }
    None
}

fn take_while(s: &str, pred: impl Fn(char) -> bool) -> String {
    s.chars().take_while(|&c| pred(c)).collect()
}

/// Truncate to a maximum length with an ellipsis, on a char boundary.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
