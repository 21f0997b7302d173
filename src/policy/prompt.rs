// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Step prompt construction and agent state-marker parsing.
//!
//! Every agent turn ends with one marker line:
//!
//! ```text
//! TASK_STATE: CONTINUE|DONE|BLOCKED
//! BLOCK_REASON: <reason>        (only with BLOCKED)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static STATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*TASK_STATE:\s*(DONE|BLOCKED|CONTINUE)\s*$").expect("static regex")
});

static REASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*BLOCK_REASON:\s*(.+?)\s*$").expect("static regex"));

/// Reason recorded when an agent blocks without saying why.
pub const DEFAULT_BLOCK_REASON: &str = "Agent marked task blocked.";

/// State declared by the agent at the end of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Continue,
    Done,
    Blocked,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs for one step prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub goal: &'a str,
    pub original_request: Option<&'a str>,
    pub step_no: u32,
    pub max_steps: u32,
    pub prior_failure: Option<&'a str>,
    pub resume_instruction: Option<&'a str>,
}

/// Build the deterministic step prompt.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut lines = vec![
        "You are executing an autonomous coding task loop.".to_string(),
        format!("Goal: {}", ctx.goal),
    ];
    if let Some(original) = non_empty(ctx.original_request) {
        if original != ctx.goal.trim() {
            lines.push(format!("Original request: {}", original));
        }
    }
    lines.push(format!("Current step: {}/{}", ctx.step_no, ctx.max_steps));
    lines.extend(
        [
            "",
            "Rules:",
            "- Make concrete repository changes toward the goal.",
            "- Do not wait for further user input; decide and act.",
            "- Run or update tests as needed.",
            "- If blocked by missing dependency/permission/context, emit TASK_STATE: BLOCKED.",
            "- When the goal is complete and tests pass, emit TASK_STATE: DONE.",
            "- Otherwise emit TASK_STATE: CONTINUE.",
            "- Always include exactly one marker line at the end:",
            "  TASK_STATE: CONTINUE|DONE|BLOCKED",
            "- If blocked, also include: BLOCK_REASON: <reason>",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if let Some(failure) = non_empty(ctx.prior_failure) {
        lines.push(String::new());
        lines.push("Previous test failure summary:".to_string());
        lines.push(failure.to_string());
    }
    if let Some(instruction) = non_empty(ctx.resume_instruction) {
        lines.push(String::new());
        lines.push("Resume instruction from user:".to_string());
        lines.push(instruction.to_string());
    }
    lines.join("\n")
}

/// Parse the declared state. The last marker wins; no marker means
/// CONTINUE. A BLOCKED state always carries a reason.
pub fn parse_state(text: &str) -> (AgentState, Option<String>) {
    let Some(caps) = STATE_RE.captures_iter(text).last() else {
        return (AgentState::Continue, None);
    };
    let state = match caps.get(1).map(|m| m.as_str()) {
        Some("DONE") => AgentState::Done,
        Some("BLOCKED") => AgentState::Blocked,
        _ => AgentState::Continue,
    };
    if state != AgentState::Blocked {
        return (state, None);
    }

    let marker_at = caps.get(0).map(|m| m.start()).unwrap_or(0);
    let reasons: Vec<(usize, String)> = REASON_RE
        .captures_iter(text)
        .filter_map(|c| Some((c.get(0)?.start(), c.get(1)?.as_str().trim().to_string())))
        .collect();
    let reason = reasons
        .iter()
        .find(|(pos, _)| *pos > marker_at)
        .or_else(|| reasons.iter().rev().find(|(pos, _)| *pos < marker_at))
        .map(|(_, r)| r.clone())
        .unwrap_or_else(|| DEFAULT_BLOCK_REASON.to_string());
    (AgentState::Blocked, Some(reason))
}

/// SHA-256 hex digest of a prompt, stored in checkpoints instead of the text.
pub fn prompt_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_first_step() {
        let prompt = build_prompt(&PromptContext {
            goal: "fix the flaky parser test",
            original_request: Some("fix the flaky parser test"),
            step_no: 1,
            max_steps: 8,
            ..Default::default()
        });
        insta::assert_snapshot!(prompt, @r###"
You are executing an autonomous coding task loop.
Goal: fix the flaky parser test
Current step: 1/8

Rules:
- Make concrete repository changes toward the goal.
- Do not wait for further user input; decide and act.
- Run or update tests as needed.
- If blocked by missing dependency/permission/context, emit TASK_STATE: BLOCKED.
- When the goal is complete and tests pass, emit TASK_STATE: DONE.
- Otherwise emit TASK_STATE: CONTINUE.
- Always include exactly one marker line at the end:
  TASK_STATE: CONTINUE|DONE|BLOCKED
- If blocked, also include: BLOCK_REASON: <reason>
"###);
    }

    #[test]
    fn test_prompt_carries_context() {
        let prompt = build_prompt(&PromptContext {
            goal: "fix parser",
            original_request: Some("hey can you fix parser, it breaks on tabs"),
            step_no: 3,
            max_steps: 5,
            prior_failure: Some("1 failed: test_tabs"),
            resume_instruction: Some("use the lexer from v2"),
        });
        assert!(prompt.contains("Original request: hey can you fix parser, it breaks on tabs"));
        assert!(prompt.contains("Current step: 3/5"));
        assert!(prompt.ends_with("Resume instruction from user:\nuse the lexer from v2"));
        let failure_at = prompt.find("Previous test failure summary:\n1 failed: test_tabs").unwrap();
        let resume_at = prompt.find("Resume instruction from user:").unwrap();
        assert!(failure_at < resume_at);
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let ctx = PromptContext {
            goal: "x",
            step_no: 1,
            max_steps: 1,
            ..Default::default()
        };
        assert_eq!(prompt_digest(&build_prompt(&ctx)), prompt_digest(&build_prompt(&ctx)));
        assert_eq!(prompt_digest("abc").len(), 64);
    }

    #[test]
    fn test_parse_state_defaults_to_continue() {
        assert_eq!(parse_state("did some work"), (AgentState::Continue, None));
        // Marker must be on its own line.
        assert_eq!(
            parse_state("I will print TASK_STATE: DONE later"),
            (AgentState::Continue, None)
        );
    }

    #[test]
    fn test_parse_state_last_marker_wins() {
        let text = "TASK_STATE: BLOCKED\nBLOCK_REASON: early\nretrying...\nTASK_STATE: DONE\n";
        assert_eq!(parse_state(text), (AgentState::Done, None));

        let text = "TASK_STATE: DONE\nwait, tests fail\n  TASK_STATE: CONTINUE  \n";
        assert_eq!(parse_state(text), (AgentState::Continue, None));
    }

    #[test]
    fn test_parse_blocked_reason() {
        let text = "Need creds.\nTASK_STATE: BLOCKED\nBLOCK_REASON: missing API key for staging\n";
        assert_eq!(
            parse_state(text),
            (AgentState::Blocked, Some("missing API key for staging".to_string()))
        );

        let before = "BLOCK_REASON: no network\nTASK_STATE: BLOCKED";
        assert_eq!(parse_state(before).1.as_deref(), Some("no network"));
    }

    #[test]
    fn test_parse_blocked_prefers_reason_after_marker() {
        let text = "BLOCK_REASON: stale\nTASK_STATE: BLOCKED\nBLOCK_REASON: fresh\nBLOCK_REASON: extra";
        assert_eq!(parse_state(text).1.as_deref(), Some("fresh"));
    }

    #[test]
    fn test_parse_blocked_without_reason() {
        assert_eq!(
            parse_state("TASK_STATE: BLOCKED"),
            (AgentState::Blocked, Some(DEFAULT_BLOCK_REASON.to_string()))
        );
    }
}
