// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task sandboxes built on git worktrees, plus the shell runner used for
//! test commands.

mod shell;
mod worktree;

pub use shell::{run_shell, HeartbeatSink, ShellOutput};
pub use worktree::{FileChange, WorktreeManager, DEFAULT_BRANCH_PREFIX};

/// Error from a workspace operation.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// A git invocation exited non-zero.
    #[error("`{command}` failed: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),
}

impl WorkspaceError {
    pub(crate) fn command(args: &[&str], code: Option<i32>, stderr: &str) -> Self {
        Self::Command {
            command: format!("git {}", args.join(" ")),
            code,
            stderr: stderr.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = WorkspaceError::command(&["apply", "--check", "-"], Some(1), "error: patch failed\n");
        assert_eq!(err.to_string(), "`git apply --check -` failed: error: patch failed");
        assert!(matches!(err, WorkspaceError::Command { code: Some(1), .. }));
    }
}
