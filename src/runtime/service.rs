// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The runtime service: public task operations, worker pool and janitor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RiskProfile, RuntimeConfig};
use crate::error::StoreError;
use crate::policy::{
    evaluate_risk, is_long_task_intent, parse_control_intent, ControlIntent, PathPolicy,
    RiskDecision,
};
use crate::store::{
    EventRecord, NewTask, SharedStorage, Task, TaskEvent, TaskSource, TaskStatus, TaskUpdate,
};
use crate::workspace::{FileChange, WorktreeManager};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::channel::{ChannelError, ChannelSession, DecisionSurface, SessionRegistry, StatusMarker};
use super::decision::{DecisionAction, DecisionSource, TaskDecision};
use super::format;
use super::RuntimeError;

/// Sleep between claim attempts when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(800);

/// Sleep after a worker hits a storage error.
const ERROR_BACKOFF: Duration = Duration::from_millis(1500);

/// Recent tasks scanned when looking for a thread's active task.
const THREAD_SCAN_LIMIT: usize = 20;

/// Parameters for a new task. Unset budgets fall back to configuration.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub platform: String,
    pub channel_id: String,
    pub thread_id: String,
    pub created_by: String,
    pub goal: String,
    pub original_request: Option<String>,
    pub preferred_agent: Option<String>,
    pub test_command: Option<String>,
    pub max_steps: Option<u32>,
    pub max_minutes: Option<u32>,
    pub source: TaskSource,
    /// Start as DRAFT even when risk does not require it.
    pub force_draft: bool,
}

impl TaskRequest {
    pub fn new(
        platform: impl Into<String>,
        channel_id: impl Into<String>,
        thread_id: impl Into<String>,
        created_by: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
            created_by: created_by.into(),
            goal: goal.into(),
            original_request: None,
            preferred_agent: None,
            test_command: None,
            max_steps: None,
            max_minutes: None,
            source: TaskSource::Command,
            force_draft: false,
        }
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.preferred_agent = agent;
        self
    }

    pub fn with_test_command(mut self, command: Option<String>) -> Self {
        self.test_command = command;
        self
    }

    pub fn with_budget(mut self, max_steps: Option<u32>, max_minutes: Option<u32>) -> Self {
        self.max_steps = max_steps;
        self.max_minutes = max_minutes;
        self
    }

    pub fn with_original_request(mut self, text: impl Into<String>) -> Self {
        self.original_request = Some(text.into());
        self
    }

    pub fn draft(mut self, force: bool) -> Self {
        self.force_draft = force;
        self
    }
}

/// A chat message that may concern the runtime.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub platform: String,
    pub channel_id: String,
    pub thread_id: String,
    pub author: String,
    pub text: String,
    pub preferred_agent: Option<String>,
}

/// Read-only digest of a task's history.
#[derive(Debug, Clone)]
pub struct TaskLogs {
    pub task: Task,
    /// Oldest first.
    pub events: Vec<EventRecord>,
    pub agent_tail: String,
    pub test_tail: String,
}

impl TaskLogs {
    pub fn render(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            format!("**Task Logs** `{}`", task.id),
            format!("- Status: `{}`", task.status),
            format!("- Step: {}/{}", task.step_no, task.max_steps),
        ];
        if let Some(summary) = &task.summary {
            lines.push(format!("- Summary: {}", format::truncate_chars(summary, 240)));
        }
        if let Some(error) = &task.error {
            lines.push(format!("- Error: {}", format::truncate_chars(error, 240)));
        }
        if let Some(error) = &task.merge_error {
            lines.push(format!("- Merge error: {}", format::truncate_chars(error, 240)));
        }
        if !self.events.is_empty() {
            lines.push(String::new());
            lines.push("**Recent events**".to_string());
            for event in &self.events {
                let summary = format::summarize_event(event);
                if summary.is_empty() {
                    lines.push(format!("- `{}`", event.kind));
                } else {
                    lines.push(format!("- `{}`: {}", event.kind, summary));
                }
            }
        }
        if !self.agent_tail.is_empty() {
            lines.push(String::new());
            lines.push("**Last agent output tail**".to_string());
            lines.push(format!("```text\n{}\n```", self.agent_tail));
        }
        if !self.test_tail.is_empty() {
            lines.push(String::new());
            lines.push("**Last test result**".to_string());
            lines.push(format!("```text\n{}\n```", self.test_tail));
        }
        lines.join("\n")
    }
}

/// State shared by the service handle, workers and janitor.
pub(super) struct RuntimeInner {
    pub(super) config: RuntimeConfig,
    pub(super) storage: SharedStorage,
    pub(super) worktrees: WorktreeManager,
    pub(super) path_policy: PathPolicy,
    pub(super) sessions: SessionRegistry,
    /// Cancellation tokens of tasks executing in this process.
    pub(super) running: Mutex<HashMap<String, CancellationToken>>,
    /// Held for the whole of a merge; the main repository is shared.
    pub(super) merge_lock: Mutex<()>,
}

/// Autonomous task runtime.
///
/// Create tasks and decide on them through this handle; [`start`](Self::start)
/// spawns the workers that execute them. A service that was shut down
/// cannot be restarted.
pub struct RuntimeService {
    inner: Arc<RuntimeInner>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeService {
    pub fn new(
        config: RuntimeConfig,
        storage: SharedStorage,
        worktrees: WorktreeManager,
    ) -> Result<Self, RuntimeError> {
        let path_policy = config.path_policy()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                storage,
                worktrees,
                path_policy,
                sessions: SessionRegistry::new(),
                running: Mutex::new(HashMap::new()),
                merge_lock: Mutex::new(()),
            }),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> SharedStorage {
        self.inner.storage.clone()
    }

    pub fn repo_root(&self) -> &Path {
        self.inner.worktrees.repo_root()
    }

    /// Make a channel and its agents available to tasks created in it.
    pub async fn register_session(&self, session: ChannelSession) {
        self.inner.sessions.register(Arc::new(session)).await;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Recover from a previous run, then spawn workers and the janitor.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let config = &self.inner.config;
        if !config.enabled {
            info!("task runtime disabled");
            return Ok(());
        }

        let requeued = self.inner.storage.lock().await.requeue_inflight()?;
        let cleaned = if config.cleanup.enabled {
            self.inner.cleanup_expired().await?
        } else {
            0
        };

        let mut handles = self.handles.lock().await;
        for idx in 0..config.worker_concurrency {
            handles.push(tokio::spawn(worker_loop(
                self.inner.clone(),
                idx,
                self.shutdown.clone(),
            )));
        }
        if config.cleanup.enabled {
            handles.push(tokio::spawn(janitor_loop(
                self.inner.clone(),
                self.shutdown.clone(),
            )));
        }

        info!(
            workers = config.worker_concurrency,
            janitor = config.cleanup.enabled,
            requeued,
            cleaned,
            "task runtime started"
        );
        Ok(())
    }

    /// Cancel running steps and wait for every worker to exit.
    ///
    /// Interrupted tasks go back to PENDING and resume on the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "runtime worker ended abnormally");
            }
        }
        info!("task runtime stopped");
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a task, as a draft when risk requires approval.
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task, RuntimeError> {
        if !self.enabled() {
            return Err(RuntimeError::Disabled);
        }
        let config = &self.inner.config;
        let max_steps = request.max_steps.unwrap_or(config.default_max_steps);
        let max_minutes = request.max_minutes.unwrap_or(config.default_max_minutes);
        let test_command = request
            .test_command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| config.default_test_command.clone());
        let agent = request
            .preferred_agent
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| config.default_agent.clone());

        let risk = match config.risk_profile {
            RiskProfile::Strict => evaluate_risk(&request.goal, max_steps, max_minutes),
            RiskProfile::Off => RiskDecision::default(),
        };
        let is_draft = request.force_draft || risk.require_approval;
        let status = if is_draft {
            TaskStatus::Draft
        } else {
            TaskStatus::Pending
        };
        let reasons: Vec<String> = risk.reasons.iter().map(|r| r.as_str().to_string()).collect();

        let task = self.inner.storage.lock().await.create(NewTask {
            id: None,
            platform: request.platform,
            channel_id: request.channel_id,
            thread_id: request.thread_id,
            created_by: request.created_by,
            source: request.source,
            original_request: Some(
                request
                    .original_request
                    .unwrap_or_else(|| request.goal.clone()),
            ),
            goal: request.goal,
            preferred_agent: Some(agent.clone()),
            status,
            max_steps,
            max_minutes,
            test_command,
            blocked_reason: is_draft.then(|| {
                if reasons.is_empty() {
                    "Draft requires explicit approval.".to_string()
                } else {
                    risk.reason_text()
                }
            }),
        })?;
        self.inner
            .record(
                &task.id,
                TaskEvent::Created {
                    source: task.source.as_str().to_string(),
                    status,
                    risk_reasons: reasons.clone(),
                },
            )
            .await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_transition(status);

        info!(
            task_id = %task.id,
            status = %status,
            source = task.source.as_str(),
            agent = %agent,
            max_steps,
            max_minutes,
            "task created"
        );

        if is_draft {
            let text = format::draft_text(&task, &agent, &reasons);
            self.inner
                .present_decision(&task, &task.thread_id, &text, &DecisionAction::APPROVAL)
                .await?;
            self.inner
                .notify(
                    &task,
                    &format!(
                        "Task `{}` is waiting for approval. Use the buttons or `foreman task approve {}`.",
                        task.id, task.id
                    ),
                )
                .await;
        } else {
            self.inner
                .notify(
                    &task,
                    &format!(
                        "Task `{}` queued (`{}`), max {} steps / {} min.",
                        task.id, agent, max_steps, max_minutes
                    ),
                )
                .await;
        }
        self.inner.signal_status(&task, status).await;

        self.inner.require(&task.id).await
    }

    /// Create a task on behalf of a scheduled job.
    pub async fn enqueue_scheduled(
        &self,
        platform: &str,
        channel_id: &str,
        thread_id: &str,
        prompt: &str,
        author: &str,
        preferred_agent: Option<String>,
    ) -> Result<Task, RuntimeError> {
        self.create_task(
            TaskRequest::new(platform, channel_id, thread_id, author, prompt)
                .with_source(TaskSource::Scheduler)
                .with_agent(preferred_agent),
        )
        .await
    }

    /// Route a chat message. Returns true when the runtime took it.
    ///
    /// Control commands go to the thread's active task; any other message
    /// in a thread whose task is BLOCKED or PAUSED resumes it; otherwise a
    /// long-task request creates a new task.
    pub async fn handle_message(&self, message: IncomingMessage) -> Result<bool, RuntimeError> {
        if !self.enabled() {
            return Ok(false);
        }
        let active = self
            .active_task_for_thread(&message.platform, &message.channel_id, &message.thread_id)
            .await?;

        if let (Some(intent), Some(task)) = (parse_control_intent(&message.text), &active) {
            let result = match intent {
                ControlIntent::Stop => self.stop(&task.id, &message.author).await,
                ControlIntent::Pause => self.pause(&task.id, &message.author).await,
                ControlIntent::Resume(instruction) => {
                    self.resume(&task.id, &instruction, &message.author).await
                }
            };
            self.reply(&message, result).await?;
            return Ok(true);
        }

        if let Some(task) = active
            .as_ref()
            .filter(|t| matches!(t.status, TaskStatus::Blocked | TaskStatus::Paused))
        {
            let result = self.resume(&task.id, &message.text, &message.author).await;
            self.reply(&message, result).await?;
            return Ok(true);
        }

        if !is_long_task_intent(&message.text) {
            return Ok(false);
        }
        self.create_task(
            TaskRequest::new(
                message.platform,
                message.channel_id,
                message.thread_id,
                message.author,
                message.text.clone(),
            )
            .with_original_request(message.text)
            .with_source(TaskSource::Message)
            .with_agent(message.preferred_agent),
        )
        .await?;
        Ok(true)
    }

    async fn reply(
        &self,
        message: &IncomingMessage,
        result: Result<Task, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let text = match result {
            Ok(task) => format!("Task `{}` is now {}.", task.id, task.status),
            Err(e @ (RuntimeError::Store(_) | RuntimeError::Workspace(_))) => return Err(e),
            Err(e) => e.to_string(),
        };
        if let Some(session) = self
            .inner
            .sessions
            .get(&message.platform, &message.channel_id)
            .await
        {
            if let Err(e) = session.channel.send(&message.thread_id, &text).await {
                warn!(error = %e, "reply failed");
            }
        }
        Ok(())
    }

    async fn active_task_for_thread(
        &self,
        platform: &str,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let tasks = self
            .inner
            .storage
            .lock()
            .await
            .list(platform, channel_id, None, THREAD_SCAN_LIMIT)?;
        Ok(tasks
            .into_iter()
            .find(|t| t.thread_id == thread_id && t.status.is_active()))
    }

    // ========================================================================
    // Decisions and control
    // ========================================================================

    fn authorize(&self, actor: &str, what: &'static str) -> Result<(), RuntimeError> {
        let owners = &self.inner.config.owners;
        if owners.is_empty() || owners.iter().any(|o| o == actor) {
            Ok(())
        } else {
            warn!(actor, what, "unauthorized runtime request");
            Err(RuntimeError::Unauthorized(what))
        }
    }

    /// Reject an action the task's status or the merge gate does not allow.
    fn check_action(&self, task: &Task, action: DecisionAction) -> Result<(), RuntimeError> {
        if !action.accepted_from().contains(&task.status) {
            return Err(RuntimeError::invalid_status(&task.id, action.as_str(), task.status));
        }
        if action == DecisionAction::Merge {
            let gate = &self.inner.config.merge_gate;
            if !gate.enabled {
                return Err(RuntimeError::MergeGateDisabled);
            }
            if gate.target_branch_mode != "current" {
                return Err(RuntimeError::UnsupportedTargetBranchMode(
                    gate.target_branch_mode.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Apply a decision. The nonce is consumed before anything changes; a
    /// stale or reused nonce is recorded and rejected.
    pub async fn handle_decision(&self, decision: TaskDecision) -> Result<Task, RuntimeError> {
        self.authorize(&decision.actor, "perform task decisions")?;
        let task = self.inner.require(&decision.task_id).await?;
        self.check_action(&task, decision.action)?;

        let consumed = self.inner.storage.lock().await.consume_nonce(
            &task.id,
            &decision.nonce,
            &decision.actor,
            decision.action.as_str(),
            decision.source.as_str(),
        )?;
        if !consumed {
            warn!(
                task_id = %task.id,
                action = %decision.action,
                actor = %decision.actor,
                "decision rejected: nonce invalid, expired or used"
            );
            self.inner
                .record(
                    &task.id,
                    TaskEvent::DecisionRejected {
                        action: decision.action.as_str().to_string(),
                        actor: decision.actor.clone(),
                        nonce: decision.nonce.clone(),
                    },
                )
                .await?;
            return Err(RuntimeError::InvalidNonce);
        }

        let suggestion = decision
            .suggestion
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.inner
            .record(
                &task.id,
                TaskEvent::Decision {
                    action: decision.action.as_str().to_string(),
                    actor: decision.actor.clone(),
                    source: decision.source.as_str().to_string(),
                    note: suggestion.clone(),
                },
            )
            .await?;
        info!(
            task_id = %task.id,
            action = %decision.action,
            actor = %decision.actor,
            source = decision.source.as_str(),
            "decision accepted"
        );

        let action = decision.action;
        let expected = action.accepted_from();
        match action {
            DecisionAction::Approve => {
                let task = self
                    .inner
                    .transition_or_err(
                        &task,
                        action.as_str(),
                        expected,
                        TaskUpdate::status(TaskStatus::Pending)
                            .blocked_reason(None)
                            .ended_at(None),
                    )
                    .await?;
                self.inner
                    .announce(&task, &format!("Task `{}` approved and queued.", task.id))
                    .await;
                Ok(task)
            }
            DecisionAction::Reject => {
                let task = self
                    .inner
                    .transition_or_err(
                        &task,
                        action.as_str(),
                        expected,
                        TaskUpdate::status(TaskStatus::Rejected)
                            .summary(Some("Rejected by user.".into()))
                            .ended_now(),
                    )
                    .await?;
                self.inner
                    .announce(&task, &format!("Task `{}` rejected.", task.id))
                    .await;
                Ok(task)
            }
            DecisionAction::Suggest => {
                let instruction = suggestion.or_else(|| task.resume_instruction.clone());
                let task = self
                    .inner
                    .transition_or_err(
                        &task,
                        action.as_str(),
                        expected,
                        TaskUpdate::new().resume_instruction(instruction.clone()),
                    )
                    .await?;
                let text = format::suggestion_text(&task, instruction.as_deref().unwrap_or(""));
                let thread = decision.thread_id.as_deref().unwrap_or(&task.thread_id);
                self.inner
                    .present_decision(
                        &task,
                        thread,
                        &text,
                        &[DecisionAction::Approve, DecisionAction::Reject],
                    )
                    .await?;
                Ok(task)
            }
            DecisionAction::Merge => {
                self.inner
                    .execute_merge(&task.id, &decision.actor, decision.source)
                    .await
            }
            DecisionAction::Discard => {
                let task = self
                    .inner
                    .transition_or_err(
                        &task,
                        action.as_str(),
                        expected,
                        TaskUpdate::status(TaskStatus::Discarded)
                            .summary(Some("Discarded by user.".into()))
                            .ended_now(),
                    )
                    .await?;
                self.inner
                    .record(
                        &task.id,
                        TaskEvent::Discarded {
                            actor: decision.actor.clone(),
                        },
                    )
                    .await?;
                self.inner
                    .announce(&task, &format!("Task `{}` discarded.", task.id))
                    .await;
                Ok(task)
            }
            DecisionAction::RequestChanges => {
                let instruction = suggestion.or_else(|| task.resume_instruction.clone());
                let task = self
                    .inner
                    .transition_or_err(
                        &task,
                        action.as_str(),
                        expected,
                        TaskUpdate::status(TaskStatus::Blocked)
                            .blocked_reason(Some("Requested changes before merge.".into()))
                            .resume_instruction(instruction)
                            .ended_at(None),
                    )
                    .await?;
                self.inner
                    .announce(
                        &task,
                        &format!(
                            "Task `{}` marked as BLOCKED for additional changes. \
                             Use `foreman task resume {} <instruction>` to continue.",
                            task.id, task.id
                        ),
                    )
                    .await;
                Ok(task)
            }
        }
    }

    /// Build a decision for a command-line action, reusing the task's
    /// active nonce or issuing one.
    pub async fn decision_for_command(
        &self,
        task_id: &str,
        action: DecisionAction,
        actor: &str,
        suggestion: Option<String>,
    ) -> Result<TaskDecision, RuntimeError> {
        self.authorize(actor, "perform task decisions")?;
        let task = self.inner.require(task_id).await?;
        self.check_action(&task, action)?;

        let active = self.inner.storage.lock().await.active_nonce(&task.id)?;
        let nonce = match active {
            Some(nonce) => nonce,
            None => self
                .inner
                .storage
                .lock()
                .await
                .create_nonce(&task.id, self.inner.config.decision_ttl_minutes)?,
        };
        Ok(TaskDecision {
            task_id: task.id,
            nonce,
            action,
            actor: actor.to_string(),
            source: DecisionSource::Command,
            thread_id: None,
            suggestion,
        })
    }

    /// [`decision_for_command`](Self::decision_for_command) followed by
    /// [`handle_decision`](Self::handle_decision).
    pub async fn decide(
        &self,
        task_id: &str,
        action: DecisionAction,
        actor: &str,
        suggestion: Option<String>,
    ) -> Result<Task, RuntimeError> {
        let decision = self
            .decision_for_command(task_id, action, actor, suggestion)
            .await?;
        self.handle_decision(decision).await
    }

    /// Requeue a BLOCKED or PAUSED task with an instruction for its next
    /// prompt.
    pub async fn resume(
        &self,
        task_id: &str,
        instruction: &str,
        actor: &str,
    ) -> Result<Task, RuntimeError> {
        self.authorize(actor, "resume tasks")?;
        let task = self.inner.require(task_id).await?;
        let expected = [TaskStatus::Blocked, TaskStatus::Paused];
        if !expected.contains(&task.status) {
            return Err(RuntimeError::invalid_status(&task.id, "resume", task.status));
        }

        let instruction = instruction.trim();
        let task = self
            .inner
            .transition_or_err(
                &task,
                "resume",
                &expected,
                TaskUpdate::status(TaskStatus::Pending)
                    .blocked_reason(None)
                    .resume_instruction((!instruction.is_empty()).then(|| instruction.to_string()))
                    .ended_at(None),
            )
            .await?;
        self.inner
            .record(
                &task.id,
                TaskEvent::Resumed {
                    actor: actor.to_string(),
                    instruction: instruction.to_string(),
                },
            )
            .await?;
        info!(task_id = %task.id, actor, "task resumed");
        self.inner
            .announce(&task, &format!("Task `{}` resumed and queued.", task.id))
            .await;
        Ok(task)
    }

    /// Pause a queued or running task. A running agent call is cancelled.
    pub async fn pause(&self, task_id: &str, actor: &str) -> Result<Task, RuntimeError> {
        self.authorize(actor, "pause tasks")?;
        let task = self.inner.require(task_id).await?;
        let expected = [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Validating];
        if !expected.contains(&task.status) {
            return Err(RuntimeError::invalid_status(&task.id, "pause", task.status));
        }

        let task = self
            .inner
            .transition_or_err(
                &task,
                "pause",
                &expected,
                TaskUpdate::status(TaskStatus::Paused)
                    .summary(Some("Paused by user.".into()))
                    .ended_at(None),
            )
            .await?;
        self.inner.cancel_running(&task.id).await;
        self.inner
            .record(
                &task.id,
                TaskEvent::Paused {
                    actor: actor.to_string(),
                },
            )
            .await?;
        info!(task_id = %task.id, actor, "task paused");
        self.inner
            .announce(
                &task,
                &format!("Task `{}` paused. Reply with instructions to resume.", task.id),
            )
            .await;
        Ok(task)
    }

    /// Stop a task for good. A running agent call is cancelled.
    pub async fn stop(&self, task_id: &str, actor: &str) -> Result<Task, RuntimeError> {
        self.authorize(actor, "stop tasks")?;
        let task = self.inner.require(task_id).await?;
        if task.status.is_terminal() {
            return Err(RuntimeError::invalid_status(&task.id, "stop", task.status));
        }

        let live: Vec<TaskStatus> = TaskStatus::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect();
        let task = self
            .inner
            .transition_or_err(
                &task,
                "stop",
                &live,
                TaskUpdate::status(TaskStatus::Stopped)
                    .summary(Some("Stopped by user.".into()))
                    .ended_now(),
            )
            .await?;
        self.inner.cancel_running(&task.id).await;
        self.inner
            .record(
                &task.id,
                TaskEvent::Stopped {
                    actor: actor.to_string(),
                },
            )
            .await?;
        info!(task_id = %task.id, actor, "task stopped");
        self.inner
            .announce(&task, &format!("Task `{}` stopped.", task.id))
            .await;
        Ok(task)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, RuntimeError> {
        Ok(self.inner.get(task_id).await?)
    }

    pub async fn list_tasks(
        &self,
        platform: &str,
        channel_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, RuntimeError> {
        Ok(self
            .inner
            .storage
            .lock()
            .await
            .list(platform, channel_id, status, limit)?)
    }

    /// Tasks across every channel, most recent first.
    pub async fn list_recent(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, RuntimeError> {
        Ok(self.inner.storage.lock().await.list_recent(status, limit)?)
    }

    /// Status, recent events and the last step's output tails.
    pub async fn task_logs(&self, task_id: &str) -> Result<TaskLogs, RuntimeError> {
        let task = self.inner.require(task_id).await?;
        let limit = self.inner.config.log_event_limit;
        let tail = self.inner.config.log_tail_chars;
        let (events, checkpoint) = {
            let storage = self.inner.storage.lock().await;
            (
                storage.list_events(&task.id, limit)?,
                storage.last_checkpoint(&task.id)?,
            )
        };
        let (agent_tail, test_tail) = checkpoint
            .map(|c| {
                (
                    format::tail_text(&c.agent_result, tail),
                    format::format_test_output(&c.test_result, tail),
                )
            })
            .unwrap_or_default();
        Ok(TaskLogs {
            task,
            events,
            agent_tail,
            test_tail,
        })
    }

    /// Files changed by a task, from its sandbox or its last checkpoint.
    pub async fn task_changes(&self, task_id: &str) -> Result<Vec<FileChange>, RuntimeError> {
        let task = self.inner.require(task_id).await?;
        Ok(self.inner.collect_changes(&task).await?)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove one finished task's sandbox. False when it had none.
    pub async fn cleanup_task(&self, task_id: &str, actor: &str) -> Result<bool, RuntimeError> {
        self.authorize(actor, "clean task workspaces")?;
        let task = self.inner.require(task_id).await?;
        if !task.status.is_cleanable() {
            return Err(RuntimeError::invalid_status(&task.id, "be cleaned", task.status));
        }
        let cleaned = self.inner.cleanup_workspace(&task).await?;
        if cleaned {
            self.inner.prune_if_configured().await;
        }
        Ok(cleaned)
    }

    /// One janitor pass. Returns the number of sandboxes removed.
    pub async fn run_janitor(&self, actor: &str) -> Result<usize, RuntimeError> {
        self.authorize(actor, "clean task workspaces")?;
        self.inner.cleanup_expired().await
    }
}

async fn worker_loop(inner: Arc<RuntimeInner>, idx: usize, shutdown: CancellationToken) {
    debug!(worker = idx, "worker started");
    while !shutdown.is_cancelled() {
        let claimed = inner.storage.lock().await.claim_pending();
        match claimed {
            Ok(Some(task)) => {
                info!(worker = idx, task_id = %task.id, step = task.step_no, "claimed task");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_transition(TaskStatus::Running);

                let task_id = task.id.clone();
                let cancel = shutdown.child_token();
                inner
                    .running
                    .lock()
                    .await
                    .insert(task_id.clone(), cancel.clone());
                let result = inner.run_task(task, cancel).await;
                inner.running.lock().await.remove(&task_id);

                if let Err(e) = result {
                    error!(worker = idx, task_id = %task_id, error = %e, "step failed, requeueing task");
                    let requeued = inner.storage.lock().await.requeue_task(&task_id);
                    if let Err(e) = requeued {
                        error!(task_id = %task_id, error = %e, "requeue failed");
                    }
                    pause_or_shutdown(&shutdown, ERROR_BACKOFF).await;
                }
            }
            Ok(None) => pause_or_shutdown(&shutdown, POLL_INTERVAL).await,
            Err(e) => {
                error!(worker = idx, error = %e, "claim failed");
                pause_or_shutdown(&shutdown, ERROR_BACKOFF).await;
            }
        }
    }
    debug!(worker = idx, "worker exited");
}

async fn janitor_loop(inner: Arc<RuntimeInner>, shutdown: CancellationToken) {
    let period = Duration::from_secs(inner.config.cleanup.interval_minutes.max(1) * 60);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        match inner.cleanup_expired().await {
            Ok(0) => {}
            Ok(cleaned) => info!(cleaned, "janitor removed expired task workspaces"),
            Err(e) => warn!(error = %e, "janitor pass failed"),
        }
    }
}

async fn pause_or_shutdown(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

impl RuntimeInner {
    pub(super) async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.storage.lock().await.get(task_id)
    }

    pub(super) async fn require(&self, task_id: &str) -> Result<Task, RuntimeError> {
        self.get(task_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(task_id.to_string()))
    }

    pub(super) async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<Task>, StoreError> {
        self.storage.lock().await.update(task_id, &update)
    }

    /// Apply an update only if the task is still in `expected`.
    pub(super) async fn transition(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<Option<Task>, StoreError> {
        let result = self
            .storage
            .lock()
            .await
            .update_if_status(task_id, expected, &update)?;
        match (&result, update.status) {
            (Some(_), Some(status)) => {
                debug!(task_id, status = %status, "transition");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_transition(status);
            }
            (None, _) => debug!(task_id, "transition skipped, task moved on"),
            _ => {}
        }
        Ok(result)
    }

    /// [`transition`](Self::transition), reporting a lost race as an
    /// invalid-status error.
    pub(super) async fn transition_or_err(
        &self,
        task: &Task,
        action: &str,
        expected: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<Task, RuntimeError> {
        if let Some(updated) = self.transition(&task.id, expected, update).await? {
            return Ok(updated);
        }
        let current = self.require(&task.id).await?;
        Err(RuntimeError::invalid_status(&task.id, action, current.status))
    }

    pub(super) async fn record(&self, task_id: &str, event: TaskEvent) -> Result<(), StoreError> {
        self.storage.lock().await.add_event(task_id, &event)?;
        Ok(())
    }

    pub(super) async fn cancel_running(&self, task_id: &str) {
        if let Some(token) = self.running.lock().await.get(task_id) {
            debug!(task_id, "cancelling running step");
            token.cancel();
        }
    }

    async fn session_for(&self, task: &Task) -> Option<Arc<ChannelSession>> {
        self.sessions.get(&task.platform, &task.channel_id).await
    }

    /// Notify the task's thread and mark its message with the new status.
    pub(super) async fn announce(&self, task: &Task, text: &str) {
        self.notify(task, text).await;
        self.signal_status(task, task.status).await;
    }

    /// Post to the task's status message, editing it when the channel can.
    /// Delivery failures are logged, never raised.
    pub(super) async fn notify(&self, task: &Task, text: &str) {
        let Some(session) = self.session_for(task).await else {
            return;
        };
        let current_id = match self.get(&task.id).await {
            Ok(Some(current)) => current.status_message_id,
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "status message lookup failed");
                task.status_message_id.clone()
            }
        };

        let body = format::status_message(text);
        let sent = match session
            .channel
            .upsert_status(&task.thread_id, &body, current_id.as_deref())
            .await
        {
            Err(ChannelError::Unsupported) => session.channel.send(&task.thread_id, &body).await,
            other => other,
        };
        match sent {
            Ok(Some(id)) if current_id.as_deref() != Some(id.as_str()) => {
                if let Err(e) = self
                    .update(&task.id, TaskUpdate::new().status_message_id(Some(id)))
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "failed to store status message id");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task.id, error = %e, "notification failed"),
        }
    }

    /// Best-effort status marker on the task's status or decision message.
    pub(super) async fn signal_status(&self, task: &Task, status: TaskStatus) {
        let Some(session) = self.session_for(task).await else {
            return;
        };
        let message_id = match self.get(&task.id).await {
            Ok(Some(current)) => current.status_message_id.or(current.decision_message_id),
            _ => task
                .status_message_id
                .clone()
                .or_else(|| task.decision_message_id.clone()),
        };
        let Some(message_id) = message_id else {
            return;
        };
        if let Err(e) = session
            .channel
            .signal_task_status(&task.thread_id, &message_id, StatusMarker::for_status(status))
            .await
        {
            debug!(task_id = %task.id, error = %e, "status marker failed");
        }
    }

    /// Issue a fresh nonce and show a decision surface for it.
    pub(super) async fn present_decision(
        &self,
        task: &Task,
        thread_id: &str,
        text: &str,
        actions: &[DecisionAction],
    ) -> Result<String, StoreError> {
        let nonce = self
            .storage
            .lock()
            .await
            .create_nonce(&task.id, self.config.decision_ttl_minutes)?;
        let Some(session) = self.session_for(task).await else {
            return Ok(nonce);
        };

        let surface = DecisionSurface {
            thread_id,
            text,
            task_id: &task.id,
            nonce: &nonce,
            actions,
        };
        let message_id = match session.channel.send_task_draft(surface).await {
            Ok(id) => id,
            Err(e) => {
                if e != ChannelError::Unsupported {
                    warn!(task_id = %task.id, error = %e, "decision surface failed, sending plain text");
                }
                let names: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
                let plain = format!("{}\nActions: {}", text, names.join(", "));
                match session.channel.send(thread_id, &plain).await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "decision text failed");
                        None
                    }
                }
            }
        };
        if let Some(id) = message_id {
            self.update(&task.id, TaskUpdate::new().decision_message_id(Some(id)))
                .await?;
        }
        Ok(nonce)
    }

    /// Name-status changes from the sandbox, else the last checkpoint.
    pub(super) async fn collect_changes(&self, task: &Task) -> Result<Vec<FileChange>, StoreError> {
        if let Some(path) = task.workspace_path.as_deref().map(Path::new) {
            if path.exists() {
                match self.worktrees.list_changes(path).await {
                    Ok(changes) if !changes.is_empty() => return Ok(changes),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "failed to list workspace changes")
                    }
                }
            }
        }
        let checkpoint = self.storage.lock().await.last_checkpoint(&task.id)?;
        Ok(checkpoint
            .map(|c| {
                c.files_changed
                    .into_iter()
                    .map(|path| FileChange {
                        status: "M".to_string(),
                        path,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
