// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Risk scoring for new tasks.

use serde::{Deserialize, Serialize};

/// Step budget above which approval is required.
pub const MAX_UNREVIEWED_STEPS: u32 = 8;

/// Minute budget above which approval is required.
pub const MAX_UNREVIEWED_MINUTES: u32 = 20;

const SENSITIVE_HINTS: &[&str] = &[
    "pip install",
    "npm install",
    "cargo install",
    "apt ",
    "brew ",
    "network",
    "internet",
    ".env",
    "config.yaml",
    "deploy",
    "migration",
    "database",
    "production",
    "secret",
];

const LARGE_CHANGE_HINTS: &[&str] = &["across the repo", "all files", "large refactor"];

/// Why a task needs approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    StepsOver8,
    MinutesOver20,
    ContainsSensitiveKeywords,
    PossibleLargeChange,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepsOver8 => "steps_over_8",
            Self::MinutesOver20 => "minutes_over_20",
            Self::ContainsSensitiveKeywords => "contains_sensitive_keywords",
            Self::PossibleLargeChange => "possible_large_change",
        }
    }
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`evaluate_risk`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RiskDecision {
    pub require_approval: bool,
    /// Every check that fired, in a fixed order.
    pub reasons: Vec<RiskReason>,
}

impl RiskDecision {
    /// Reasons joined for display, e.g. `steps_over_8, possible_large_change`.
    pub fn reason_text(&self) -> String {
        self.reasons
            .iter()
            .map(RiskReason::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Score a task. Any fired check requires approval.
pub fn evaluate_risk(text: &str, max_steps: u32, max_minutes: u32) -> RiskDecision {
    let lowered = text.to_lowercase();
    let mut reasons = Vec::new();

    if max_steps > MAX_UNREVIEWED_STEPS {
        reasons.push(RiskReason::StepsOver8);
    }
    if max_minutes > MAX_UNREVIEWED_MINUTES {
        reasons.push(RiskReason::MinutesOver20);
    }
    if SENSITIVE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        reasons.push(RiskReason::ContainsSensitiveKeywords);
    }
    if LARGE_CHANGE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        reasons.push(RiskReason::PossibleLargeChange);
    }

    RiskDecision {
        require_approval: !reasons.is_empty(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_goal_needs_no_approval() {
        let decision = evaluate_risk("fix bug", 8, 20);
        assert!(!decision.require_approval);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn test_budget_limits() {
        let decision = evaluate_risk("fix bug", 9, 21);
        assert!(decision.require_approval);
        assert_eq!(
            decision.reasons,
            vec![RiskReason::StepsOver8, RiskReason::MinutesOver20]
        );
    }

    #[test]
    fn test_sensitive_keyword() {
        let decision = evaluate_risk("run pip install requests then fix", 8, 20);
        assert_eq!(decision.reasons, vec![RiskReason::ContainsSensitiveKeywords]);
        assert_eq!(decision.reason_text(), "contains_sensitive_keywords");
    }

    #[test]
    fn test_all_reasons_reported() {
        let decision = evaluate_risk("Large refactor of the DATABASE layer", 12, 60);
        assert_eq!(decision.reasons.len(), 4);
        assert_eq!(
            decision.reason_text(),
            "steps_over_8, minutes_over_20, contains_sensitive_keywords, possible_large_change"
        );
    }
}
