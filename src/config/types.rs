// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Keys are snake_case in both YAML and JSON. Every field has a default, so
//! a config file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::policy::{PathPolicy, PathPolicyMode};

/// When a new task must wait for human approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    /// Risky tasks start as drafts.
    #[default]
    Strict,
    /// Tasks always start pending unless the caller forces a draft.
    #[serde(other)]
    Off,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub enabled: bool,
    pub worker_concurrency: usize,
    pub default_agent: String,
    pub default_test_command: String,
    pub default_max_steps: u32,
    pub default_max_minutes: u32,
    pub risk_profile: RiskProfile,
    pub path_policy_mode: PathPolicyMode,
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub decision_ttl_minutes: u32,
    pub agent_heartbeat_seconds: u64,
    pub test_heartbeat_seconds: u64,
    pub test_timeout_seconds: u64,
    pub progress_notice_seconds: u64,
    pub progress_persist_seconds: u64,
    /// Events shown by `task logs`.
    pub log_event_limit: usize,
    /// Characters of agent/test output shown by `task logs`.
    pub log_tail_chars: usize,
    /// Parent directory for task worktrees. Relative paths resolve
    /// against the repository root. Defaults to `~/.foreman/worktrees`.
    pub worktree_root: Option<PathBuf>,
    /// SQLite database path. Defaults to `~/.foreman/runtime.db`.
    pub database_path: Option<PathBuf>,
    pub branch_prefix: String,
    /// Actor ids allowed to decide on tasks. Empty means everyone.
    pub owners: Vec<String>,
    /// Command-line agents registered by the binary.
    pub agents: Vec<AgentCommandConfig>,
    pub cleanup: CleanupConfig,
    pub merge_gate: MergeGateConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_concurrency: 3,
            default_agent: "claude".to_string(),
            default_test_command: "cargo test".to_string(),
            default_max_steps: 8,
            default_max_minutes: 20,
            risk_profile: RiskProfile::Strict,
            path_policy_mode: PathPolicyMode::AllowAllWithDenylist,
            allowed_paths: ["src/**", "tests/**", "docs/**", "benches/**", "Cargo.toml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            denied_paths: [".env", "config.yaml", ".workspace/**", ".git/**"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            decision_ttl_minutes: 1440,
            agent_heartbeat_seconds: 20,
            test_heartbeat_seconds: 15,
            test_timeout_seconds: 600,
            progress_notice_seconds: 30,
            progress_persist_seconds: 60,
            log_event_limit: 12,
            log_tail_chars: 1200,
            worktree_root: None,
            database_path: None,
            branch_prefix: "foreman/task-".to_string(),
            owners: Vec::new(),
            agents: Vec::new(),
            cleanup: CleanupConfig::default(),
            merge_gate: MergeGateConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::invalid("worker_concurrency", "must be at least 1"));
        }
        if self.default_max_steps == 0 {
            return Err(ConfigError::invalid("default_max_steps", "must be at least 1"));
        }
        if self.default_max_minutes == 0 {
            return Err(ConfigError::invalid("default_max_minutes", "must be at least 1"));
        }
        if self.test_timeout_seconds == 0 {
            return Err(ConfigError::invalid("test_timeout_seconds", "must be at least 1"));
        }
        if self.default_test_command.trim().is_empty() {
            return Err(ConfigError::invalid("default_test_command", "must not be empty"));
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("branch_prefix", "must not be empty"));
        }
        if self.cleanup.enabled && self.cleanup.interval_minutes == 0 {
            return Err(ConfigError::invalid("cleanup.interval_minutes", "must be at least 1"));
        }
        for agent in &self.agents {
            if agent.command.is_empty() {
                return Err(ConfigError::invalid(
                    format!("agents.{}.command", agent.name),
                    "must name a program",
                ));
            }
        }
        self.path_policy()
            .map_err(|e| ConfigError::invalid("allowed_paths/denied_paths", e.to_string()))?;
        Ok(())
    }

    /// Compile the configured globs.
    pub fn path_policy(&self) -> Result<PathPolicy, crate::policy::PathViolation> {
        PathPolicy::new(&self.allowed_paths, &self.denied_paths, self.path_policy_mode)
    }

    /// Database location, falling back to the global config directory.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| super::get_global_config_dir().map(|d| d.join("runtime.db")))
    }

    /// Worktree root for a repository.
    pub fn resolved_worktree_root(&self, repo_root: &std::path::Path) -> PathBuf {
        match &self.worktree_root {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => repo_root.join(p),
            None => super::get_global_config_dir()
                .map(|d| d.join("worktrees"))
                .unwrap_or_else(|| std::env::temp_dir().join("foreman-worktrees")),
        }
    }
}

/// Janitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub retention_hours: u64,
    pub prune_worktrees: bool,
    /// Remove the worktree right after a successful merge.
    pub merged_immediate: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            retention_hours: 72,
            prune_worktrees: true,
            merged_immediate: true,
        }
    }
}

/// Merge gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeGateConfig {
    pub enabled: bool,
    pub auto_commit: bool,
    pub require_clean_repo: bool,
    pub preflight_check: bool,
    /// Only `current` is supported.
    pub target_branch_mode: String,
    /// Placeholders: `{task_id}`, `{goal_short}`.
    pub commit_message_template: String,
}

impl Default for MergeGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_commit: true,
            require_clean_repo: true,
            preflight_check: true,
            target_branch_mode: "current".to_string(),
            commit_message_template: "runtime(task:{task_id}): {goal_short}".to_string(),
        }
    }
}

/// A command-line agent: the prompt is written to stdin, the reply is read
/// from stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}
