// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task runtime: worker pool, state machine, merge gate and janitor.
//!
//! # Architecture
//!
//! ```text
//! create_task ─▶ risk ─▶ DRAFT ──approve──▶ PENDING
//!                  └───────────────────────▶ PENDING
//!                                              │ claim (atomic)
//!                                              ▼
//!                     ┌──────────────── RUNNING ◀──────────┐
//!                     │  agent turn        │               │ CONTINUE / tests failed
//!                     │  path guard        ▼               │
//!                     │  test command  VALIDATING ─────────┘
//!                     │                    │
//!                     ▼                    ├─ BLOCKED ──resume──▶ PENDING
//!                  FAILED                  ├─ TIMEOUT
//!                                          └─ DONE + tests pass
//!                                               ├─ WAITING_MERGE ─merge─▶ MERGED | MERGE_FAILED
//!                                               └─ APPLIED
//! ```
//!
//! Workers share one [`SharedStorage`](crate::store::SharedStorage). A task
//! is owned by whichever worker claimed it, never by two at once. Decisions
//! (approve, merge, ...) consume a single-use nonce before they change
//! anything.

mod agent;
mod channel;
mod decision;
mod executor;
pub mod format;
mod merge;
mod service;

pub use agent::{
    Agent, AgentCall, AgentCapabilities, AgentRegistry, AgentRequest, AgentResponse, AgentUsage,
    CommandAgent,
};
pub use channel::{
    Channel, ChannelError, ChannelSession, ConsoleChannel, DecisionSurface, SessionRegistry,
    StatusMarker,
};
pub use decision::{DecisionAction, DecisionSource, TaskDecision};
pub use service::{IncomingMessage, RuntimeService, TaskLogs, TaskRequest};

use crate::error::StoreError;
use crate::policy::PathViolation;
use crate::store::TaskStatus;
use crate::workspace::WorkspaceError;

/// Error from a runtime operation.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Invalid path policy: {0}")]
    PathPolicy(#[from] PathViolation),

    #[error("Task `{0}` not found.")]
    NotFound(String),

    #[error("Only configured owners can {0}.")]
    Unauthorized(&'static str),

    #[error("Task `{task_id}` cannot {action} (current status: {status}).")]
    InvalidStatus {
        task_id: String,
        action: String,
        status: TaskStatus,
    },

    #[error("Decision token is invalid or expired.")]
    InvalidNonce,

    #[error("Merge gate is disabled.")]
    MergeGateDisabled,

    #[error("Only target_branch_mode=current is supported, got `{0}`.")]
    UnsupportedTargetBranchMode(String),

    #[error("Task runtime is disabled.")]
    Disabled,
}

impl RuntimeError {
    pub(crate) fn invalid_status(task_id: &str, action: impl Into<String>, status: TaskStatus) -> Self {
        Self::InvalidStatus {
            task_id: task_id.to_string(),
            action: action.into(),
            status,
        }
    }
}
