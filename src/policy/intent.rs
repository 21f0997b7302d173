// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message classification: does a chat message start a task, or control one?

const LONG_TASK_HINTS: &[&str] = &[
    "fix",
    "implement",
    "refactor",
    "write code",
    "run test",
    "run tests",
    "repair",
    "bug",
    "回归",
    "修复",
    "实现",
    "重构",
    "测试",
];

/// Heuristic: should this free text become a task instead of a one-off reply?
pub fn is_long_task_intent(text: &str) -> bool {
    let lowered = text.to_lowercase();
    LONG_TASK_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// A plain-text command aimed at the thread's active task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlIntent {
    Stop,
    Pause,
    /// Resume with an instruction (may be empty).
    Resume(String),
}

/// Recognize `stop`, `cancel`, `pause`, `resume <instruction>` and
/// `continue <instruction>`. Only whole-message commands count; "please stop
/// using unwrap" is not a stop request.
pub fn parse_control_intent(text: &str) -> Option<ControlIntent> {
    let stripped = text.trim();
    let lower = stripped.to_lowercase();
    match lower.as_str() {
        "stop" | "stop the task" | "cancel" => return Some(ControlIntent::Stop),
        "pause" | "pause the task" => return Some(ControlIntent::Pause),
        "resume" | "continue" => return Some(ControlIntent::Resume(String::new())),
        _ => {}
    }
    for prefix in ["resume ", "continue "] {
        if lower.starts_with(prefix) {
            let instruction = stripped.get(prefix.len()..).unwrap_or("").trim();
            return Some(ControlIntent::Resume(instruction.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_task_intent() {
        assert!(is_long_task_intent("Please FIX the login bug"));
        assert!(is_long_task_intent("implement retries for the client"));
        assert!(is_long_task_intent("帮我修复这个问题"));
        assert!(!is_long_task_intent("what time is it?"));
        assert!(!is_long_task_intent(""));
    }

    #[test]
    fn test_control_intents() {
        assert_eq!(parse_control_intent("stop"), Some(ControlIntent::Stop));
        assert_eq!(parse_control_intent("  Cancel "), Some(ControlIntent::Stop));
        assert_eq!(parse_control_intent("pause the task"), Some(ControlIntent::Pause));
        assert_eq!(
            parse_control_intent(" Resume "),
            Some(ControlIntent::Resume(String::new()))
        );
        assert_eq!(
            parse_control_intent("continue"),
            Some(ControlIntent::Resume(String::new()))
        );
        assert_eq!(parse_control_intent("resumed"), None);
        assert_eq!(
            parse_control_intent("Resume use the v2 API"),
            Some(ControlIntent::Resume("use the v2 API".to_string()))
        );
        assert_eq!(
            parse_control_intent("continue  with tests first"),
            Some(ControlIntent::Resume("with tests first".to_string()))
        );
    }

    #[test]
    fn test_non_control_text() {
        assert_eq!(parse_control_intent("please stop using unwrap"), None);
        assert_eq!(parse_control_intent("resume"), None);
        assert_eq!(parse_control_intent("fix the bug"), None);
    }
}
