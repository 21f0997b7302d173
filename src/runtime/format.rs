// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Human-readable task texts: drafts, merge prompts, summaries and logs.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::{EventRecord, Task};
use crate::workspace::FileChange;

/// First line of every status message.
pub const STATUS_HEADER: &str = "**Task Status**";

/// Longest text sent in one channel message.
pub const MESSAGE_LIMIT: usize = 1900;

/// Longest error kept on a task row.
pub const ERROR_LIMIT: usize = 2000;

/// Longest error shown in a notification.
pub const NOTICE_ERROR_LIMIT: usize = 400;

static TEST_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d+\s+(passed|failed|errors?|skipped|ignored)\b").expect("static regex")
});

static EXCEPTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:]*(Error|Exception|Failure):").expect("static regex")
});

static CARGO_FAILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^test \S+ \.\.\. FAILED$").expect("static regex"));

/// At most `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// The last `max` characters of the trimmed text.
pub fn tail_text(text: &str, max: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Pull the summary line and failure lines out of test runner output.
///
/// Understands pytest and cargo style output. Returns an empty string when
/// nothing recognizable is found.
pub fn summarize_test_output(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let summary = lines.iter().rev().find_map(|line| {
        let cleaned = line.trim_matches('=').trim();
        (TEST_COUNT_RE.is_match(cleaned) && cleaned.contains(" in ")).then_some(cleaned)
    });

    let mut failures: Vec<&str> = Vec::new();
    for line in &lines {
        let failing = line.starts_with("FAILED ")
            || line.starts_with("ERROR ")
            || CARGO_FAILED_RE.is_match(line)
            || EXCEPTION_RE.is_match(line);
        if failing && !failures.contains(line) {
            failures.push(line);
        }
    }

    match (summary, failures.is_empty()) {
        (Some(summary), true) => summary.to_string(),
        (summary, _) => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(summary) = summary {
                parts.push(format!("Summary: {}", summary));
            }
            parts.extend(failures.iter().take(4).map(|l| l.to_string()));
            parts.join("\n")
        }
    }
}

/// Test output for display: the summary when one exists, else the tail.
pub fn format_test_output(text: &str, max: usize) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let summary = summarize_test_output(text);
    if summary.is_empty() {
        tail_text(text, max)
    } else {
        truncate_chars(&summary, max)
    }
}

/// One-line goal for commit messages.
pub fn goal_short(goal: &str) -> String {
    let one_line = goal.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.is_empty() {
        "task".to_string()
    } else {
        truncate_chars(&one_line, 72)
    }
}

/// Render a commit message template.
pub fn commit_message(template: &str, task: &Task) -> String {
    template
        .replace("{task_id}", &task.id)
        .replace("{goal_short}", &goal_short(&task.goal))
}

pub fn status_message(text: &str) -> String {
    truncate_chars(&format!("{}\n{}", STATUS_HEADER, text), MESSAGE_LIMIT)
}

/// Draft approval prompt.
pub fn draft_text(task: &Task, agent: &str, reasons: &[String]) -> String {
    let reason_text = if reasons.is_empty() {
        "requires explicit approval".to_string()
    } else {
        reasons.join(", ")
    };
    format!(
        "### Task Draft `{}`\n\
         Goal: {}\n\
         Agent: `{}`\n\
         Budget: {} steps / {} min\n\
         Test command: `{}`\n\
         Reason: {}\n\
         Use Approve / Reject / Suggest.",
        task.id, task.goal, agent, task.max_steps, task.max_minutes, task.test_command, reason_text
    )
}

/// Prompt shown after a suggestion is recorded on a draft.
pub fn suggestion_text(task: &Task, suggestion: &str) -> String {
    format!(
        "### Task `{}`: Suggestion Recorded\n> {}\n\nApprove to run with this guidance, or reject to discard.",
        task.id,
        if suggestion.is_empty() { "(none)" } else { suggestion }
    )
}

/// Merge decision prompt.
pub fn merge_gate_text(
    task: &Task,
    agent: &str,
    changes: &[FileChange],
    test_tail: Option<&str>,
) -> String {
    let mut lines = vec![
        format!("### Task `{}` Ready to Merge", task.id),
        format!("Goal: {}", truncate_chars(&task.goal, 220)),
        format!("Agent: `{}`", agent),
        format!("Completed step: {}/{}", task.step_no, task.max_steps),
        format!("Test command: `{}`", task.test_command),
    ];

    if !changes.is_empty() {
        lines.push(String::new());
        lines.push("Changed files:".to_string());
        lines.extend(
            changes
                .iter()
                .take(8)
                .map(|c| format!("- `{}\t{}`", c.status, c.path)),
        );
        if changes.len() > 8 {
            lines.push(format!("- ... and {} more", changes.len() - 8));
        }
    }

    if let Some(tail) = test_tail.filter(|t| !t.is_empty()) {
        lines.push(String::new());
        lines.push("Latest test result:".to_string());
        lines.push(format!("```text\n{}\n```", truncate_chars(tail, 500)));
    }

    lines.extend([
        String::new(),
        "Choose one action:".to_string(),
        "- Merge: apply patch to current branch and auto commit".to_string(),
        "- Discard: keep audit metadata, drop this task result".to_string(),
        "- Request Changes: send task back to BLOCKED for another iteration".to_string(),
    ]);
    truncate_chars(&lines.join("\n"), MESSAGE_LIMIT)
}

/// Figures for the completion summary.
#[derive(Debug, Clone, Default)]
pub struct CompletionStats<'a> {
    pub goal: &'a str,
    pub steps: u32,
    pub changed_files: &'a [String],
    pub test_output: &'a str,
    pub agent_time: Duration,
    pub test_time: Duration,
    pub total_time: Duration,
    pub waiting_merge: bool,
}

pub fn completion_summary(stats: &CompletionStats<'_>) -> String {
    let goal = stats.goal.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut parts = vec![
        format!("Goal: {}", truncate_chars(&goal, 120)),
        format!("Completed in {} step(s)", stats.steps),
    ];

    if !stats.changed_files.is_empty() {
        let shown: Vec<String> = stats
            .changed_files
            .iter()
            .take(10)
            .map(|f| format!("`{}`", f))
            .collect();
        let mut line = format!(
            "Changed files ({}): {}",
            stats.changed_files.len(),
            shown.join(", ")
        );
        if stats.changed_files.len() > 10 {
            line.push_str(&format!(" and {} more", stats.changed_files.len() - 10));
        }
        parts.push(line);
    }

    let tests_line = stats.test_output.lines().rev().find_map(|line| {
        let cleaned = line.trim().trim_matches('=').trim();
        (TEST_COUNT_RE.is_match(cleaned) && cleaned.contains(" in ")).then_some(cleaned)
    });
    if let Some(line) = tests_line {
        parts.push(format!("Tests: {}", line));
    }

    parts.push(format!(
        "Timing: agent {:.1}s | tests {:.1}s | total {:.1}s",
        stats.agent_time.as_secs_f64(),
        stats.test_time.as_secs_f64(),
        stats.total_time.as_secs_f64()
    ));
    if stats.waiting_merge {
        parts.push("Waiting merge confirmation.".to_string());
    }
    parts.join(" | ")
}

/// Short `key=value` digest of an event payload.
pub fn summarize_event(record: &EventRecord) -> String {
    const KEYS: [&str; 12] = [
        "step",
        "agent",
        "state",
        "elapsed_secs",
        "exit_code",
        "status",
        "reason",
        "actor",
        "action",
        "commit_hash",
        "workspace",
        "error",
    ];
    let Some(payload) = record.payload.as_object() else {
        return String::new();
    };
    let parts: Vec<String> = KEYS
        .iter()
        .filter_map(|key| {
            let value = payload.get(*key)?;
            let text = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) if s.is_empty() => return None,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(format!("{}={}", key, text))
        })
        .collect();
    truncate_chars(&parts.join(", "), 220)
}

/// Listing for `task changes`.
pub fn changes_text(task_id: &str, changes: &[FileChange]) -> String {
    if changes.is_empty() {
        return format!("Task `{}` has no detectable file changes.", task_id);
    }
    let mut lines = vec![format!("Task `{}` changes ({}):", task_id, changes.len())];
    lines.extend(
        changes
            .iter()
            .take(80)
            .map(|c| format!("- `{}\t{}`", c.status, c.path)),
    );
    if changes.len() > 80 {
        lines.push(format!("- ... and {} more", changes.len() - 80));
    }
    lines.join("\n")
}
