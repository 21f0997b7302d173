// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Human decisions on tasks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::TaskStatus;

/// An action a person can take on a task's decision surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
    Suggest,
    Merge,
    Discard,
    RequestChanges,
}

impl DecisionAction {
    /// Actions offered on a draft.
    pub const APPROVAL: [DecisionAction; 3] = [Self::Approve, Self::Reject, Self::Suggest];

    /// Actions offered once a task finished in its sandbox.
    pub const MERGE: [DecisionAction; 3] = [Self::Merge, Self::Discard, Self::RequestChanges];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Suggest => "suggest",
            Self::Merge => "merge",
            Self::Discard => "discard",
            Self::RequestChanges => "request_changes",
        }
    }

    /// Button label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve => "Approve",
            Self::Reject => "Reject",
            Self::Suggest => "Suggest",
            Self::Merge => "Merge",
            Self::Discard => "Discard",
            Self::RequestChanges => "Request Changes",
        }
    }

    /// Statuses from which this action is accepted.
    pub fn accepted_from(&self) -> &'static [TaskStatus] {
        match self {
            Self::Approve | Self::Reject | Self::Suggest => {
                &[TaskStatus::Draft, TaskStatus::Blocked]
            }
            Self::Merge | Self::Discard => &[
                TaskStatus::WaitingMerge,
                TaskStatus::Applied,
                TaskStatus::MergeFailed,
            ],
            Self::RequestChanges => &[TaskStatus::WaitingMerge, TaskStatus::Applied],
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "suggest" => Ok(Self::Suggest),
            "merge" => Ok(Self::Merge),
            "discard" => Ok(Self::Discard),
            "request_changes" => Ok(Self::RequestChanges),
            other => Err(format!("unknown decision action: {}", other)),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// A button on a decision surface.
    #[default]
    Button,
    /// A slash command or CLI invocation.
    Command,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Command => "command",
        }
    }
}

/// A decision bound to a nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecision {
    pub task_id: String,
    pub nonce: String,
    pub action: DecisionAction,
    pub actor: String,
    pub source: DecisionSource,
    /// Thread to answer in. Defaults to the task's own thread.
    pub thread_id: Option<String>,
    /// Free text for `suggest` and `request_changes`.
    pub suggestion: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!("approve".parse::<DecisionAction>(), Ok(DecisionAction::Approve));
        assert_eq!(
            "request-changes".parse::<DecisionAction>(),
            Ok(DecisionAction::RequestChanges)
        );
        assert_eq!(" MERGE ".parse::<DecisionAction>(), Ok(DecisionAction::Merge));
        assert!("ship-it".parse::<DecisionAction>().is_err());
    }

    #[test]
    fn test_accepted_from() {
        assert!(DecisionAction::Merge
            .accepted_from()
            .contains(&TaskStatus::MergeFailed));
        assert!(!DecisionAction::RequestChanges
            .accepted_from()
            .contains(&TaskStatus::MergeFailed));
        assert!(!DecisionAction::Approve
            .accepted_from()
            .contains(&TaskStatus::Running));
    }
}
