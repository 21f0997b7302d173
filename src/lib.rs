// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman - autonomous coding tasks with a human at the gate.
//!
//! A task is a natural-language goal executed step by step by an agent in a
//! disposable git worktree, validated by a test command after every step,
//! and merged into the main repository only after an explicit decision.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration loading and validation
//! - [`telemetry`] - Tracing, metrics, and observability infrastructure
//! - [`policy`] - Risk scoring, path guard, prompt template and agent output parsing
//! - [`store`] - Durable SQLite task store: tasks, events, checkpoints, decision nonces
//! - [`workspace`] - Git worktree sandboxes, patches and shell commands
//! - [`runtime`] - Worker pool, task state machine, merge gate and janitor
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::config::{load_config, CliOverrides};
//! use foreman::runtime::{RuntimeService, TaskRequest};
//! use foreman::store::{shared, TaskStorage};
//! use foreman::workspace::WorktreeManager;
//!
//! let config = load_config(repo, CliOverrides::default())?;
//! let storage = shared(TaskStorage::open_at(&db_path)?);
//! let worktrees = WorktreeManager::new(repo, config.resolved_worktree_root(repo));
//! let runtime = RuntimeService::new(config, storage, worktrees)?;
//! runtime.start().await?;
//! runtime
//!     .create_task(TaskRequest::new("cli", "local", "main", "me", "fix the flaky test"))
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod policy;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod workspace;

// Re-export commonly used types at crate root
pub use error::{AgentError, ConfigError, Result, StoreError};
pub use runtime::{RuntimeError, RuntimeService, TaskRequest};
pub use store::{Task, TaskStatus};

/// Foreman version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        assert_eq!(TaskStatus::WaitingMerge.to_string(), "WAITING_MERGE");
        let _request = TaskRequest::new("cli", "local", "t", "me", "goal");
    }
}
