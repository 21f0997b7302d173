// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-task git worktrees.
//!
//! Each task gets a worktree on its own branch, created from the main
//! repository's HEAD at the time of the first claim. The starting commit is
//! pinned under `refs/foreman/base/<task_id>` so diffs and patches stay
//! relative to it even if the agent commits inside the worktree.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                       # Main repository (merge target)
//! ~/.foreman/worktrees/
//! ├── 3f9c0a1b2c4d/               # Worktree for task 3f9c0a1b2c4d
//! │   ├── .git                    # Worktree link file
//! │   └── src/
//! └── ...
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::shell::{run_shell, HeartbeatSink, ShellOutput};
use super::WorkspaceError;

/// Default branch prefix for task worktrees.
pub const DEFAULT_BRANCH_PREFIX: &str = "foreman/task-";

/// Namespace for pinned base revisions.
const BASE_REF_PREFIX: &str = "refs/foreman/base/";

/// One entry of [`WorktreeManager::list_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Git status letter: `A`, `M`, `D`, `R`...
    pub status: String,
    pub path: String,
}

/// Creates, inspects and removes task worktrees of one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    branch_prefix: String,
}

impl WorktreeManager {
    pub fn new(repo_root: impl AsRef<Path>, worktree_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            worktree_root: worktree_root.as_ref().to_path_buf(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    /// Find the top level of the repository containing `start`.
    pub async fn discover_repo_root(start: &Path) -> Result<PathBuf, WorkspaceError> {
        let top = git_output(start, &["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(top.trim()))
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Where the worktree for a task lives.
    pub fn workspace_path(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(sanitize(task_id))
    }

    pub fn branch_name(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, sanitize(task_id))
    }

    fn base_ref(task_id: &str) -> String {
        format!("{}{}", BASE_REF_PREFIX, sanitize(task_id))
    }

    fn task_id_of(workspace: &Path) -> Result<String, WorkspaceError> {
        workspace
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                WorkspaceError::InvalidWorkspace(format!("no task id in {}", workspace.display()))
            })
    }

    /// Create the task's worktree from HEAD, or return it if it exists.
    pub async fn ensure(&self, task_id: &str) -> Result<PathBuf, WorkspaceError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let path = self.workspace_path(task_id);
        if path.join(".git").exists() {
            debug!(task_id, path = %path.display(), "reusing worktree");
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.worktree_root).await?;
        if path.exists() {
            warn!(task_id, path = %path.display(), "removing stale worktree directory");
            tokio::fs::remove_dir_all(&path).await?;
            self.prune().await?;
        }

        let head = git_output(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        let head = head.trim();
        let branch = self.branch_name(task_id);
        let path_str = path.to_string_lossy().to_string();

        info!(task_id, branch = %branch, path = %path.display(), "creating worktree");
        git_output(
            &self.repo_root,
            &["worktree", "add", "-B", &branch, &path_str, head],
        )
        .await?;
        git_output(&self.repo_root, &["update-ref", &Self::base_ref(task_id), head]).await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workspace.ensure", start.elapsed());

        Ok(path)
    }

    /// Revision the worktree was created from.
    async fn base_revision(&self, workspace: &Path) -> Result<String, WorkspaceError> {
        let task_id = Self::task_id_of(workspace)?;
        match git_output(workspace, &["rev-parse", "--verify", &Self::base_ref(&task_id)]).await {
            Ok(rev) => Ok(rev.trim().to_string()),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "base ref missing, diffing against HEAD");
                Ok("HEAD".to_string())
            }
        }
    }

    /// Paths touched since the base revision, including untracked files.
    ///
    /// Rename detection is off, so a moved file reports both its old and its
    /// new path. Paths are read NUL-separated and unquoted.
    pub async fn changed_files(&self, workspace: &Path) -> Result<Vec<String>, WorkspaceError> {
        let files: BTreeSet<String> = self
            .list_changes(workspace)
            .await?
            .into_iter()
            .map(|c| c.path)
            .collect();
        Ok(files.into_iter().collect())
    }

    /// Name-status listing of changes since the base revision.
    pub async fn list_changes(&self, workspace: &Path) -> Result<Vec<FileChange>, WorkspaceError> {
        let base = self.base_revision(workspace).await?;
        let tracked = git_bytes(
            workspace,
            &[
                "-c",
                "core.quotePath=false",
                "diff",
                "--name-status",
                "--no-renames",
                "-z",
                &base,
            ],
        )
        .await?;
        let untracked = git_bytes(
            workspace,
            &[
                "-c",
                "core.quotePath=false",
                "ls-files",
                "--others",
                "--exclude-standard",
                "-z",
            ],
        )
        .await?;

        let mut changes = parse_name_status(&tracked);
        changes.extend(split_nul(&untracked).map(|path| FileChange {
            status: "A".to_string(),
            path,
        }));
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes.dedup();
        Ok(changes)
    }

    /// Run a shell command inside a workspace.
    pub async fn run_shell(
        &self,
        workspace: &Path,
        command: &str,
        timeout: Duration,
        heartbeat: Duration,
        sink: Option<&dyn HeartbeatSink>,
    ) -> Result<ShellOutput, WorkspaceError> {
        run_shell(workspace, command, timeout, heartbeat, sink).await
    }

    /// True iff the main repository has no local modifications.
    pub async fn repo_is_clean(&self) -> Result<bool, WorkspaceError> {
        let status = git_output(&self.repo_root, &["status", "--porcelain"]).await?;
        Ok(status.trim().is_empty())
    }

    /// Stage everything in the workspace and return a binary diff against
    /// the base revision. Empty when nothing changed.
    ///
    /// The patch is raw bytes: file contents need not be UTF-8.
    pub async fn create_patch(&self, workspace: &Path) -> Result<Vec<u8>, WorkspaceError> {
        let base = self.base_revision(workspace).await?;
        git_output(workspace, &["add", "-A"]).await?;
        git_bytes(workspace, &["diff", "--cached", "--binary", &base]).await
    }

    /// Dry-run a patch against the main repository.
    pub async fn apply_patch_check(&self, patch: &[u8]) -> Result<(), WorkspaceError> {
        git_with_input(&self.repo_root, &["apply", "--check", "--binary", "-"], patch).await
    }

    /// Apply a patch to the main repository. `git apply` is all-or-nothing.
    pub async fn apply_patch(&self, patch: &[u8]) -> Result<(), WorkspaceError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        git_with_input(&self.repo_root, &["apply", "--binary", "-"], patch).await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workspace.apply_patch", start.elapsed());
        Ok(())
    }

    /// Commit everything in the main repository and return the new hash.
    pub async fn commit_repo_changes(&self, message: &str) -> Result<String, WorkspaceError> {
        git_output(&self.repo_root, &["add", "-A"]).await?;
        git_output(&self.repo_root, &["commit", "-m", message]).await?;
        let hash = git_output(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        Ok(hash.trim().to_string())
    }

    /// Delete a worktree with its branch and base ref.
    ///
    /// Falls back to deleting the directory when git no longer knows the
    /// worktree.
    pub async fn remove(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        let path_str = workspace.to_string_lossy().to_string();
        info!(path = %workspace.display(), "removing worktree");

        if let Err(e) = git_output(&self.repo_root, &["worktree", "remove", "--force", &path_str]).await
        {
            warn!(path = %workspace.display(), error = %e, "git worktree remove failed, deleting directory");
            if workspace.exists() {
                tokio::fs::remove_dir_all(workspace).await?;
            }
            self.prune().await?;
        }

        if let Ok(task_id) = Self::task_id_of(workspace) {
            let branch = self.branch_name(&task_id);
            if let Err(e) = git_output(&self.repo_root, &["branch", "-D", &branch]).await {
                debug!(branch = %branch, error = %e, "branch delete skipped");
            }
            if let Err(e) =
                git_output(&self.repo_root, &["update-ref", "-d", &Self::base_ref(&task_id)]).await
            {
                debug!(task_id = %task_id, error = %e, "base ref delete skipped");
            }
        }
        Ok(())
    }

    /// Drop bookkeeping for worktrees whose directories are gone.
    pub async fn prune(&self) -> Result<(), WorkspaceError> {
        git_output(&self.repo_root, &["worktree", "prune"]).await.map(|_| ())
    }
}

/// Keep task ids safe for paths and ref names.
fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// NUL-terminated entries of `-z` output, decoded lossily.
fn split_nul(raw: &[u8]) -> impl Iterator<Item = String> + '_ {
    raw.split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
}

/// Parse `diff --name-status -z` output: a status field, then the path.
/// Copies and renames carry two paths; both are kept.
fn parse_name_status(raw: &[u8]) -> Vec<FileChange> {
    let mut fields = split_nul(raw);
    let mut changes = Vec::new();
    while let Some(status) = fields.next() {
        let letter: String = status.chars().take(1).collect();
        let paths = if matches!(letter.as_str(), "R" | "C") { 2 } else { 1 };
        for path in fields.by_ref().take(paths) {
            changes.push(FileChange {
                status: letter.clone(),
                path,
            });
        }
    }
    changes
}

/// Run git in `cwd` and return stdout as bytes.
async fn git_bytes(cwd: &Path, args: &[&str]) -> Result<Vec<u8>, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(WorkspaceError::command(
            args,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Run git in `cwd` and return stdout as text.
async fn git_output(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let stdout = git_bytes(cwd, args).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Run git in `cwd` with `input` on stdin.
async fn git_with_input(cwd: &Path, args: &[&str], input: &[u8]) -> Result<(), WorkspaceError> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(WorkspaceError::command(
            args,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PathPolicy, PathPolicyMode};
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?}", args);
    }

    /// A repository with one commit holding `files`, plus a manager whose
    /// worktrees live next to it.
    fn repo_with(files: &[(&str, &[u8])]) -> (TempDir, WorktreeManager) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["config", "user.email", "tests@example.com"]);
        git(&repo, &["config", "user.name", "Tests"]);
        git(&repo, &["config", "commit.gpgsign", "false"]);
        for (path, content) in files {
            let full = repo.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        git(&repo, &["add", "-A"]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        let manager = WorktreeManager::new(&repo, temp.path().join("worktrees"));
        (temp, manager)
    }

    fn secrets_policy() -> PathPolicy {
        PathPolicy::new(
            &[],
            &["secrets/**".to_string()],
            PathPolicyMode::AllowAllWithDenylist,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_non_ascii_paths_are_reported_verbatim() {
        let (_temp, manager) = repo_with(&[("README.md", &b"# demo\n"[..])]);
        let ws = manager.ensure("t1").await.unwrap();
        std::fs::create_dir_all(ws.join("secrets")).unwrap();
        std::fs::write(ws.join("secrets/café.txt"), "token").unwrap();
        std::fs::write(ws.join("README.md"), "# démo\n").unwrap();

        let changed = manager.changed_files(&ws).await.unwrap();
        assert_eq!(changed, vec!["README.md", "secrets/café.txt"]);
        let err = secrets_policy().validate(&changed).unwrap_err();
        assert!(err.to_string().contains("secrets/café.txt"));
    }

    #[tokio::test]
    async fn test_moved_file_reports_its_source() {
        let (_temp, manager) = repo_with(&[("secrets/key.txt", &b"k"[..])]);
        let ws = manager.ensure("t2").await.unwrap();
        git(&ws, &["mv", "secrets/key.txt", "leak.txt"]);

        let changed = manager.changed_files(&ws).await.unwrap();
        assert_eq!(changed, vec!["leak.txt", "secrets/key.txt"]);
        assert!(secrets_policy().validate(&changed).is_err());

        let changes = manager.list_changes(&ws).await.unwrap();
        assert_eq!(
            changes,
            vec![
                FileChange {
                    status: "A".into(),
                    path: "leak.txt".into()
                },
                FileChange {
                    status: "D".into(),
                    path: "secrets/key.txt".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_patch_keeps_non_utf8_content() {
        let (_temp, manager) = repo_with(&[("latin1.txt", &b"caf\xe9\n"[..])]);
        let ws = manager.ensure("t3").await.unwrap();
        std::fs::write(ws.join("latin1.txt"), b"caf\xe9 cr\xe8me\n").unwrap();
        std::fs::write(ws.join("blob.bin"), [0u8, 159, 146, 150, 255]).unwrap();

        let patch = manager.create_patch(&ws).await.unwrap();
        manager.apply_patch_check(&patch).await.unwrap();
        manager.apply_patch(&patch).await.unwrap();

        let repo = manager.repo_root();
        assert_eq!(
            std::fs::read(repo.join("latin1.txt")).unwrap(),
            b"caf\xe9 cr\xe8me\n"
        );
        assert_eq!(
            std::fs::read(repo.join("blob.bin")).unwrap(),
            [0u8, 159, 146, 150, 255]
        );
        assert!(!manager.repo_is_clean().await.unwrap());
    }

    #[test]
    fn test_parse_name_status() {
        let raw = b"M\0src/a.rs\0R100\0old.txt\0new.txt\0D\0gone.txt\0";
        let paths: Vec<(String, String)> = parse_name_status(raw)
            .into_iter()
            .map(|c| (c.status, c.path))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("M".to_string(), "src/a.rs".to_string()),
                ("R".to_string(), "old.txt".to_string()),
                ("R".to_string(), "new.txt".to_string()),
                ("D".to_string(), "gone.txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_paths_and_branches() {
        let manager = WorktreeManager::new("/repo", "/wt").with_branch_prefix("bot/");
        assert_eq!(manager.workspace_path("abc123"), PathBuf::from("/wt/abc123"));
        assert_eq!(manager.branch_name("abc123"), "bot/abc123");
        assert_eq!(WorktreeManager::base_ref("abc123"), "refs/foreman/base/abc123");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b c..d"), "a-b-c--d");
        assert_eq!(sanitize("ok_id-1"), "ok_id-1");
    }

    #[test]
    fn test_task_id_of() {
        assert_eq!(
            WorktreeManager::task_id_of(Path::new("/wt/abc")).unwrap(),
            "abc"
        );
        assert!(WorktreeManager::task_id_of(Path::new("/")).is_err());
    }
}
