// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge gate and workspace cleanup.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::store::{now, Task, TaskEvent, TaskStatus, TaskUpdate};
use crate::workspace::WorkspaceError;

use super::decision::{DecisionAction, DecisionSource};
use super::format;
use super::service::RuntimeInner;
use super::RuntimeError;

/// Tasks examined per janitor query.
const CLEANUP_BATCH: usize = 200;

/// Why a patch could not be merged. Every variant leaves the task in
/// MERGE_FAILED, from where it can be merged again or discarded.
#[derive(Debug, thiserror::Error)]
enum MergeError {
    #[error("Workspace path is missing; cannot build patch.")]
    MissingWorkspace,

    #[error("Main repository is not clean. Commit or stash changes before merging.")]
    DirtyRepo,

    #[error("No patch produced from task workspace.")]
    EmptyPatch,

    #[error("Patch does not apply to the current branch: {0}")]
    Preflight(WorkspaceError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl RuntimeInner {
    /// Apply a task's sandbox diff to the main repository.
    ///
    /// Merges are serialized; the task is re-read under the lock so a
    /// concurrent discard or second merge cannot slip in between.
    pub(super) async fn execute_merge(
        &self,
        task_id: &str,
        actor: &str,
        source: DecisionSource,
    ) -> Result<Task, RuntimeError> {
        let _guard = self.merge_lock.lock().await;
        let task = self.require(task_id).await?;
        let expected = DecisionAction::Merge.accepted_from();
        if !expected.contains(&task.status) {
            return Err(RuntimeError::invalid_status(&task.id, "merge", task.status));
        }

        self.record(
            &task.id,
            TaskEvent::MergeStarted {
                actor: actor.to_string(),
            },
        )
        .await?;
        info!(task_id = %task.id, actor, source = source.as_str(), "merge started");

        let commit_hash = match self.apply_task_patch(&task).await {
            Ok(hash) => hash,
            Err(e) => return self.mark_merge_failed(&task, e.to_string()).await,
        };

        let task = self
            .transition_or_err(
                &task,
                "merge",
                expected,
                TaskUpdate::status(TaskStatus::Merged)
                    .merge_commit_hash(commit_hash.clone())
                    .merge_error(None)
                    .summary(Some("Merged into current branch.".to_string()))
                    .ended_now(),
            )
            .await?;
        self.record(
            &task.id,
            TaskEvent::Merged {
                commit_hash: commit_hash.clone(),
            },
        )
        .await?;
        info!(task_id = %task.id, commit = ?commit_hash, "task merged");

        if self.config.cleanup.merged_immediate && self.cleanup_workspace(&task).await? {
            self.prune_if_configured().await;
        }

        let text = match &commit_hash {
            Some(hash) => format!("Task `{}` merged successfully. commit `{}`", task.id, hash),
            None => format!(
                "Task `{}` merged successfully. Changes are staged in the working tree.",
                task.id
            ),
        };
        self.notify(&task, &text).await;
        self.signal_status(&task, TaskStatus::Merged).await;
        self.require(&task.id).await
    }

    async fn apply_task_patch(&self, task: &Task) -> Result<Option<String>, MergeError> {
        let gate = &self.config.merge_gate;
        let workspace = task
            .workspace_path
            .as_deref()
            .map(Path::new)
            .filter(|p| p.exists())
            .ok_or(MergeError::MissingWorkspace)?;

        if gate.require_clean_repo && !self.worktrees.repo_is_clean().await? {
            return Err(MergeError::DirtyRepo);
        }

        let patch = self.worktrees.create_patch(workspace).await?;
        if patch.trim_ascii().is_empty() {
            return Err(MergeError::EmptyPatch);
        }
        if gate.preflight_check {
            self.worktrees
                .apply_patch_check(&patch)
                .await
                .map_err(MergeError::Preflight)?;
        }
        self.worktrees.apply_patch(&patch).await?;

        if !gate.auto_commit {
            return Ok(None);
        }
        let message = format::commit_message(&gate.commit_message_template, task);
        Ok(Some(self.worktrees.commit_repo_changes(&message).await?))
    }

    async fn mark_merge_failed(&self, task: &Task, error: String) -> Result<Task, RuntimeError> {
        let task = self
            .transition_or_err(
                task,
                "merge",
                DecisionAction::Merge.accepted_from(),
                TaskUpdate::status(TaskStatus::MergeFailed)
                    .merge_error(Some(format::truncate_chars(&error, format::ERROR_LIMIT))),
            )
            .await?;
        self.record(
            &task.id,
            TaskEvent::MergeFailed {
                error: error.clone(),
            },
        )
        .await?;
        warn!(task_id = %task.id, error = %error, "merge failed");

        let notice = format!(
            "Task `{}` merge failed: {}",
            task.id,
            format::truncate_chars(&error, format::NOTICE_ERROR_LIMIT)
        );
        self.notify(&task, &notice).await;
        let retry = format!("{}\nRetry the merge or discard the result.", notice);
        self.present_decision(
            &task,
            &task.thread_id,
            &retry,
            &[DecisionAction::Merge, DecisionAction::Discard],
        )
        .await?;
        self.signal_status(&task, TaskStatus::MergeFailed).await;
        self.require(&task.id).await
    }

    /// Remove a task's worktree. False when it had none or removal failed;
    /// a failure is recorded as an event and retried on a later pass.
    pub(super) async fn cleanup_workspace(&self, task: &Task) -> Result<bool, RuntimeError> {
        let Some(workspace) = task.workspace_path.clone() else {
            return Ok(false);
        };
        if let Err(e) = self.worktrees.remove(Path::new(&workspace)).await {
            warn!(task_id = %task.id, error = %e, "workspace cleanup failed");
            self.record(
                &task.id,
                TaskEvent::CleanupFailed {
                    error: e.to_string(),
                },
            )
            .await?;
            return Ok(false);
        }

        self.update(
            &task.id,
            TaskUpdate::new()
                .workspace_path(None)
                .workspace_cleaned_at(Some(now())),
        )
        .await?;
        self.record(&task.id, TaskEvent::Cleaned { workspace }).await?;
        info!(task_id = %task.id, "workspace cleaned");
        Ok(true)
    }

    /// One janitor pass over tasks past the retention window. Merged tasks
    /// are due at once when `merged_immediate` is set.
    pub(super) async fn cleanup_expired(&self) -> Result<usize, RuntimeError> {
        let cleanup = &self.config.cleanup;
        let mut statuses = TaskStatus::cleanable();
        if cleanup.merged_immediate {
            statuses.retain(|s| *s != TaskStatus::Merged);
        }

        let mut candidates = {
            let storage = self.storage.lock().await;
            let mut found =
                storage.list_cleanup_candidates(&statuses, cleanup.retention_hours, CLEANUP_BATCH)?;
            if cleanup.merged_immediate {
                found.extend(storage.list_cleanup_candidates(
                    &[TaskStatus::Merged],
                    0,
                    CLEANUP_BATCH,
                )?);
            }
            found
        };
        let mut seen = HashSet::new();
        candidates.retain(|t| seen.insert(t.id.clone()));

        let mut cleaned = 0;
        for task in &candidates {
            if self.cleanup_workspace(task).await? {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            self.prune_if_configured().await;
        }
        Ok(cleaned)
    }

    pub(super) async fn prune_if_configured(&self) {
        if !self.config.cleanup.prune_worktrees {
            return;
        }
        if let Err(e) = self.worktrees.prune().await {
            warn!(error = %e, "worktree prune failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_error_messages() {
        assert_eq!(
            MergeError::DirtyRepo.to_string(),
            "Main repository is not clean. Commit or stash changes before merging."
        );
        assert_eq!(
            MergeError::EmptyPatch.to_string(),
            "No patch produced from task workspace."
        );
        let preflight = MergeError::Preflight(crate::workspace::WorkspaceError::InvalidWorkspace(
            "x".into(),
        ));
        assert!(preflight.to_string().starts_with("Patch does not apply"));
    }
}
