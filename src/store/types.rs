// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task store record types.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Get current Unix timestamp in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a short random task id.
pub fn generate_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Generate a decision nonce.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Task lifecycle status. Stored as the upper-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Draft,
    Pending,
    Running,
    Validating,
    WaitingMerge,
    Applied,
    Merged,
    MergeFailed,
    Discarded,
    Blocked,
    Paused,
    Failed,
    Timeout,
    Stopped,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 15] = [
        Self::Draft,
        Self::Pending,
        Self::Running,
        Self::Validating,
        Self::WaitingMerge,
        Self::Applied,
        Self::Merged,
        Self::MergeFailed,
        Self::Discarded,
        Self::Blocked,
        Self::Paused,
        Self::Failed,
        Self::Timeout,
        Self::Stopped,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Validating => "VALIDATING",
            Self::WaitingMerge => "WAITING_MERGE",
            Self::Applied => "APPLIED",
            Self::Merged => "MERGED",
            Self::MergeFailed => "MERGE_FAILED",
            Self::Discarded => "DISCARDED",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Stopped => "STOPPED",
            Self::Rejected => "REJECTED",
        }
    }

    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Merged
                | Self::Discarded
                | Self::Failed
                | Self::Timeout
                | Self::Stopped
                | Self::Rejected
        )
    }

    /// The sandbox is no longer needed, so the janitor may remove it.
    pub fn is_cleanable(&self) -> bool {
        self.is_terminal() || matches!(self, Self::Applied | Self::MergeFailed)
    }

    /// A task in this state still belongs to its thread's conversation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Validating | Self::Blocked | Self::Paused
        )
    }

    /// A worker is (or was, before a crash) executing a step.
    pub fn is_inflight(&self) -> bool {
        matches!(self, Self::Running | Self::Validating)
    }

    pub fn cleanable() -> Vec<TaskStatus> {
        Self::ALL.iter().copied().filter(Self::is_cleanable).collect()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// What created a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// A chat message that looked like a task request.
    Message,
    /// An explicit command (slash command or CLI).
    #[default]
    Command,
    /// A scheduled job.
    Scheduler,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Command => "command",
            Self::Scheduler => "scheduler",
        }
    }
}

impl FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "command" => Ok(Self::Command),
            "scheduler" => Ok(Self::Scheduler),
            other => Err(format!("unknown task source: {}", other)),
        }
    }
}

impl ToSql for TaskSource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskSource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub platform: String,
    pub channel_id: String,
    pub thread_id: String,
    pub created_by: String,
    pub source: TaskSource,
    pub goal: String,
    /// Verbatim user text the goal was derived from.
    pub original_request: Option<String>,
    pub preferred_agent: Option<String>,
    pub status: TaskStatus,
    pub step_no: u32,
    pub max_steps: u32,
    pub max_minutes: u32,
    pub test_command: String,
    pub workspace_path: Option<String>,
    pub decision_message_id: Option<String>,
    pub status_message_id: Option<String>,
    pub blocked_reason: Option<String>,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub resume_instruction: Option<String>,
    pub merge_commit_hash: Option<String>,
    pub merge_error: Option<String>,
    pub workspace_cleaned_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub ended_at: Option<i64>,
}

impl Task {
    /// Seconds between start (or creation) and end (or now).
    pub fn elapsed_secs(&self) -> i64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.ended_at.unwrap_or_else(now);
        (end - start).max(0)
    }
}

/// Values for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Generated when `None`.
    pub id: Option<String>,
    pub platform: String,
    pub channel_id: String,
    pub thread_id: String,
    pub created_by: String,
    pub source: TaskSource,
    pub goal: String,
    pub original_request: Option<String>,
    pub preferred_agent: Option<String>,
    pub status: TaskStatus,
    pub max_steps: u32,
    pub max_minutes: u32,
    pub test_command: String,
    pub blocked_reason: Option<String>,
}

/// A typed partial update.
///
/// Outer `None` leaves a column alone; `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub step_no: Option<u32>,
    pub workspace_path: Option<Option<String>>,
    pub decision_message_id: Option<Option<String>>,
    pub status_message_id: Option<Option<String>>,
    pub blocked_reason: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub summary: Option<Option<String>>,
    pub resume_instruction: Option<Option<String>>,
    pub merge_commit_hash: Option<Option<String>>,
    pub merge_error: Option<Option<String>>,
    pub workspace_cleaned_at: Option<Option<i64>>,
    pub started_at: Option<Option<i64>>,
    pub ended_at: Option<Option<i64>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update that only changes status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn step_no(mut self, step_no: u32) -> Self {
        self.step_no = Some(step_no);
        self
    }

    pub fn workspace_path(mut self, path: Option<String>) -> Self {
        self.workspace_path = Some(path);
        self
    }

    pub fn decision_message_id(mut self, id: Option<String>) -> Self {
        self.decision_message_id = Some(id);
        self
    }

    pub fn status_message_id(mut self, id: Option<String>) -> Self {
        self.status_message_id = Some(id);
        self
    }

    pub fn blocked_reason(mut self, reason: Option<String>) -> Self {
        self.blocked_reason = Some(reason);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn resume_instruction(mut self, instruction: Option<String>) -> Self {
        self.resume_instruction = Some(instruction);
        self
    }

    pub fn merge_commit_hash(mut self, hash: Option<String>) -> Self {
        self.merge_commit_hash = Some(hash);
        self
    }

    pub fn merge_error(mut self, error: Option<String>) -> Self {
        self.merge_error = Some(error);
        self
    }

    pub fn workspace_cleaned_at(mut self, at: Option<i64>) -> Self {
        self.workspace_cleaned_at = Some(at);
        self
    }

    pub fn started_at(mut self, at: Option<i64>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn ended_at(mut self, at: Option<i64>) -> Self {
        self.ended_at = Some(at);
        self
    }

    /// Stamp `ended_at` with the current time.
    pub fn ended_now(self) -> Self {
        self.ended_at(Some(now()))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub task_id: String,
    pub step_no: u32,
    pub status: TaskStatus,
    pub prompt_digest: String,
    pub agent_result: String,
    pub test_result: String,
    pub files_changed: Vec<String>,
    pub created_at: i64,
}

/// Values for a new checkpoint.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub task_id: String,
    pub step_no: u32,
    pub status: TaskStatus,
    pub prompt_digest: String,
    pub agent_result: String,
    pub test_result: String,
    pub files_changed: Vec<String>,
}

/// A decision token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNonce {
    pub task_id: String,
    pub nonce: String,
    pub created_at: i64,
    pub ttl_minutes: u32,
    pub consumed_at: Option<i64>,
    pub superseded_at: Option<i64>,
    pub action: Option<String>,
    pub actor: Option<String>,
    pub source: Option<String>,
}

impl DecisionNonce {
    pub fn expires_at(&self) -> i64 {
        self.created_at + i64::from(self.ttl_minutes) * 60
    }

    /// Unconsumed, not superseded and not expired at `at`.
    pub fn is_active_at(&self, at: i64) -> bool {
        self.consumed_at.is_none() && self.superseded_at.is_none() && self.expires_at() > at
    }
}
