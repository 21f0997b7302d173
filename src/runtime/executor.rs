// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The step loop a worker runs for one claimed task.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::policy::{build_prompt, parse_state, prompt_digest, AgentState, PromptContext};
use crate::store::{NewCheckpoint, Task, TaskEvent, TaskStatus, TaskUpdate};
use crate::workspace::HeartbeatSink;

use super::agent::{AgentCall, AgentResponse};
use super::channel::ChannelSession;
use super::decision::DecisionAction;
use super::format::{self, CompletionStats};
use super::service::RuntimeInner;
use super::RuntimeError;

/// Blocked reason when no channel session serves the task.
pub(super) const NO_SESSION_REASON: &str =
    "No live session for this channel. Resume once it is connected again.";

const AGENT_RESULT_LIMIT: usize = 4000;
const TEST_RESULT_LIMIT: usize = 2000;
const PRIOR_FAILURE_LIMIT: usize = 1500;

const IN_FLIGHT: [TaskStatus; 2] = [TaskStatus::Running, TaskStatus::Validating];

#[derive(Debug, Clone, Copy)]
enum Phase {
    Agent,
    Test,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Test => "tests",
        }
    }
}

/// Heartbeat receiver for one phase of one step.
///
/// Persists a progress event every `progress_persist_seconds`, posts a
/// notice every `progress_notice_seconds` and cancels the step once the
/// task has left RUNNING/VALIDATING (stopped from another process, say).
struct ProgressSink<'a> {
    inner: &'a RuntimeInner,
    task: &'a Task,
    phase: Phase,
    step: u32,
    cancel: CancellationToken,
    last_persist: AtomicU64,
    last_notice: AtomicU64,
}

impl<'a> ProgressSink<'a> {
    fn new(
        inner: &'a RuntimeInner,
        task: &'a Task,
        phase: Phase,
        step: u32,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            inner,
            task,
            phase,
            step,
            cancel: cancel.clone(),
            last_persist: AtomicU64::new(0),
            last_notice: AtomicU64::new(0),
        }
    }

    fn due(last: &AtomicU64, every: u64, now: u64) -> bool {
        if every == 0 || now.saturating_sub(last.load(Ordering::Relaxed)) < every {
            return false;
        }
        last.store(now, Ordering::Relaxed);
        true
    }
}

#[async_trait]
impl HeartbeatSink for ProgressSink<'_> {
    async fn beat(&self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        let task_id = &self.task.id;
        debug!(task_id = %task_id, phase = self.phase.label(), elapsed_secs = secs, "heartbeat");

        match self.inner.get(task_id).await {
            Ok(Some(current)) if !current.status.is_inflight() => {
                info!(task_id = %task_id, status = %current.status, "task left in-flight state, cancelling step");
                self.cancel.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat status check failed"),
        }

        let config = &self.inner.config;
        if Self::due(&self.last_persist, config.progress_persist_seconds, secs) {
            let event = match self.phase {
                Phase::Agent => TaskEvent::AgentProgress {
                    step: self.step,
                    elapsed_secs: secs,
                },
                Phase::Test => TaskEvent::TestProgress {
                    step: self.step,
                    elapsed_secs: secs,
                },
            };
            if let Err(e) = self.inner.record(task_id, event).await {
                warn!(task_id = %task_id, error = %e, "failed to persist progress");
            }
        }
        if Self::due(&self.last_notice, config.progress_notice_seconds, secs) {
            self.inner
                .notify(
                    self.task,
                    &format!(
                        "Task `{}` step {}/{}: {} still running ({}s).",
                        task_id,
                        self.step,
                        self.task.max_steps,
                        self.phase.label(),
                        secs
                    ),
                )
                .await;
        }
    }
}

impl RuntimeInner {
    /// Drive a claimed task until it blocks, finishes, fails or is
    /// interrupted.
    ///
    /// Errors are storage or other infrastructure failures; the caller
    /// requeues the task. Task-level failures are recorded on the task and
    /// return `Ok`.
    pub(super) async fn run_task(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let Some(session) = self.sessions.get(&task.platform, &task.channel_id).await else {
            warn!(task_id = %task.id, platform = %task.platform, channel_id = %task.channel_id, "no session for task");
            if self
                .transition(
                    &task.id,
                    &IN_FLIGHT,
                    TaskUpdate::status(TaskStatus::Blocked)
                        .blocked_reason(Some(NO_SESSION_REASON.to_string())),
                )
                .await?
                .is_some()
            {
                self.record(
                    &task.id,
                    TaskEvent::Blocked {
                        reason: NO_SESSION_REASON.to_string(),
                    },
                )
                .await?;
            }
            return Ok(());
        };

        let workspace = match self.worktrees.ensure(&task.id).await {
            Ok(path) => path,
            Err(e) => {
                return self
                    .fail(&task, format!("Failed to prepare worktree: {}", e))
                    .await;
            }
        };
        let workspace_str = workspace.to_string_lossy().to_string();
        let task = self
            .update(
                &task.id,
                TaskUpdate::new()
                    .workspace_path(Some(workspace_str.clone()))
                    .workspace_cleaned_at(None),
            )
            .await?
            .unwrap_or(task);
        self.record(
            &task.id,
            TaskEvent::Started {
                workspace: workspace_str.clone(),
            },
        )
        .await?;
        let started = if task.step_no == 0 {
            format!("Task `{}` started in `{}`.", task.id, workspace_str)
        } else {
            format!(
                "Task `{}` resumed at step {}/{}.",
                task.id, task.step_no, task.max_steps
            )
        };
        self.notify(&task, &started).await;
        self.signal_status(&task, TaskStatus::Running).await;

        let mut prior_failure = self
            .storage
            .lock()
            .await
            .last_checkpoint(&task.id)?
            .filter(|c| c.status == TaskStatus::Running && !c.test_result.trim().is_empty())
            .map(|c| format::format_test_output(&c.test_result, PRIOR_FAILURE_LIMIT));

        let run_start = Instant::now();
        let budget = Duration::from_secs(u64::from(task.max_minutes) * 60);
        let mut agent_time = Duration::ZERO;
        let mut test_time = Duration::ZERO;
        let mut step = task.step_no;

        while step < task.max_steps {
            if cancel.is_cancelled() {
                return self.on_cancelled(&task).await;
            }
            if run_start.elapsed() >= budget {
                return self
                    .time_out(
                        &task,
                        format!("Task exceeded time budget ({} min).", task.max_minutes),
                        None,
                    )
                    .await;
            }

            step += 1;
            let Some(current) = self
                .transition(
                    &task.id,
                    &IN_FLIGHT,
                    TaskUpdate::status(TaskStatus::Running).step_no(step),
                )
                .await?
            else {
                info!(task_id = %task.id, "task left in-flight state, ending run");
                return Ok(());
            };
            let agent_label = current
                .preferred_agent
                .clone()
                .unwrap_or_else(|| self.config.default_agent.clone());
            info!(task_id = %current.id, step, max_steps = current.max_steps, agent = %agent_label, "step started");
            self.notify(
                &current,
                &format!(
                    "Task `{}` step {}/{}: running agent `{}`.",
                    current.id, step, current.max_steps, agent_label
                ),
            )
            .await;

            let prompt = build_prompt(&PromptContext {
                goal: &current.goal,
                original_request: current.original_request.as_deref(),
                step_no: step,
                max_steps: current.max_steps,
                prior_failure: prior_failure.as_deref(),
                resume_instruction: current.resume_instruction.as_deref(),
            });

            let agent_start = Instant::now();
            let (agent_name, result) = self
                .run_agent(&current, &session, &prompt, &workspace, step, &cancel)
                .await;
            agent_time += agent_start.elapsed();
            let response = match result {
                Ok(response) => response,
                Err(AgentError::Cancelled) => return self.on_cancelled(&current).await,
                Err(e) => {
                    let name = if agent_name.is_empty() {
                        agent_label.as_str()
                    } else {
                        agent_name.as_str()
                    };
                    return self.fail(&current, format!("Agent `{}` failed: {}", name, e)).await;
                }
            };

            let changed = match self.worktrees.changed_files(&workspace).await {
                Ok(files) => files,
                Err(e) => {
                    return self
                        .fail(&current, format!("Failed to compute changed files: {}", e))
                        .await;
                }
            };
            if let Err(violation) = self.path_policy.validate(&changed) {
                warn!(task_id = %current.id, error = %violation, "path policy violation");
                return self.fail(&current, violation.to_string()).await;
            }
            let (state, block_reason) = parse_state(&response.text);
            debug!(task_id = %current.id, step, state = %state, files = changed.len(), "agent turn parsed");

            let Some(current) = self
                .transition(
                    &current.id,
                    &[TaskStatus::Running],
                    TaskUpdate::status(TaskStatus::Validating),
                )
                .await?
            else {
                info!(task_id = %task.id, "task left in-flight state before tests");
                return Ok(());
            };
            self.notify(
                &current,
                &format!(
                    "Task `{}` step {}/{}: running `{}`.",
                    current.id, step, current.max_steps, current.test_command
                ),
            )
            .await;
            self.signal_status(&current, TaskStatus::Validating).await;

            let test_start = Instant::now();
            let sink = ProgressSink::new(self, &current, Phase::Test, step, &cancel);
            let output = tokio::select! {
                output = self.worktrees.run_shell(
                    &workspace,
                    &current.test_command,
                    Duration::from_secs(self.config.test_timeout_seconds),
                    Duration::from_secs(self.config.test_heartbeat_seconds),
                    Some(&sink as &dyn HeartbeatSink),
                ) => output,
                _ = cancel.cancelled() => return self.on_cancelled(&current).await,
            };
            test_time += test_start.elapsed();
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    return self
                        .fail(&current, format!("Failed to run test command: {}", e))
                        .await;
                }
            };
            let test_text = output.combined();
            let tests_passed = output.success();

            let outcome = if output.timed_out {
                TaskStatus::Timeout
            } else if state == AgentState::Blocked {
                TaskStatus::Blocked
            } else if state == AgentState::Done && tests_passed {
                if self.config.merge_gate.enabled {
                    TaskStatus::WaitingMerge
                } else {
                    TaskStatus::Applied
                }
            } else {
                TaskStatus::Running
            };

            self.storage.lock().await.add_checkpoint(&NewCheckpoint {
                task_id: current.id.clone(),
                step_no: step,
                status: outcome,
                prompt_digest: prompt_digest(&prompt),
                agent_result: format::truncate_chars(&response.text, AGENT_RESULT_LIMIT),
                test_result: format::tail_text(&test_text, TEST_RESULT_LIMIT),
                files_changed: changed.clone(),
            })?;
            self.record(
                &current.id,
                TaskEvent::Step {
                    step,
                    agent: agent_name.clone(),
                    state: state.as_str().to_string(),
                    exit_code: output.exit_code,
                    files_changed: changed.clone(),
                },
            )
            .await?;
            info!(
                task_id = %current.id,
                step,
                state = %state,
                exit_code = ?output.exit_code,
                tests_passed,
                outcome = %outcome,
                "step finished"
            );

            match outcome {
                TaskStatus::Timeout => {
                    let reason = format!(
                        "Test command timed out after {}s.",
                        self.config.test_timeout_seconds
                    );
                    let tail = format::format_test_output(&test_text, format::ERROR_LIMIT);
                    return self.time_out(&current, reason, Some(tail)).await;
                }
                TaskStatus::Blocked => {
                    let reason = block_reason
                        .unwrap_or_else(|| crate::policy::DEFAULT_BLOCK_REASON.to_string());
                    return self.block(&current, reason).await;
                }
                TaskStatus::WaitingMerge | TaskStatus::Applied => {
                    let stats = CompletionStats {
                        goal: &current.goal,
                        steps: step,
                        changed_files: &changed,
                        test_output: &test_text,
                        agent_time,
                        test_time,
                        total_time: run_start.elapsed(),
                        waiting_merge: outcome == TaskStatus::WaitingMerge,
                    };
                    let summary = format::completion_summary(&stats);
                    return self
                        .complete(&current, outcome, &agent_name, summary, &test_text)
                        .await;
                }
                _ => {
                    prior_failure = (!tests_passed)
                        .then(|| format::format_test_output(&test_text, PRIOR_FAILURE_LIMIT))
                        .or_else(|| {
                            (state == AgentState::Done).then(|| {
                                "Agent reported DONE but the test command did not pass.".to_string()
                            })
                        });
                    if current.resume_instruction.is_some() {
                        self.update(&current.id, TaskUpdate::new().resume_instruction(None))
                            .await?;
                    }
                }
            }
        }

        self.time_out(
            &task,
            format!("Task exceeded step budget ({} steps).", task.max_steps),
            None,
        )
        .await
    }

    /// Run one agent turn with heartbeats, racing cancellation.
    async fn run_agent(
        &self,
        task: &Task,
        session: &ChannelSession,
        prompt: &str,
        workspace: &Path,
        step: u32,
        cancel: &CancellationToken,
    ) -> (String, Result<AgentResponse, AgentError>) {
        let history: Vec<String> = Vec::new();
        let call = AgentCall {
            preferred: task.preferred_agent.as_deref(),
            prompt,
            history: &history,
            thread_id: Some(&task.thread_id),
            workspace: Some(workspace),
        };
        let sink = ProgressSink::new(self, task, Phase::Agent, step, cancel);

        let heartbeat = self.config.agent_heartbeat_seconds;
        let period = Duration::from_secs(heartbeat.max(1));
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let start = Instant::now();
        let run = session.agents.run(call, cancel);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = cancel.cancelled() => {
                    let name = task.preferred_agent.clone().unwrap_or_default();
                    return (name, Err(AgentError::Cancelled));
                }
                _ = ticker.tick(), if heartbeat > 0 => sink.beat(start.elapsed()).await,
            }
        }
    }

    /// Finish a successful step: park for a merge decision or mark applied.
    async fn complete(
        &self,
        task: &Task,
        outcome: TaskStatus,
        agent: &str,
        summary: String,
        test_text: &str,
    ) -> Result<(), RuntimeError> {
        let mut update = TaskUpdate::status(outcome)
            .summary(Some(summary.clone()))
            .resume_instruction(None)
            .error(None);
        if outcome == TaskStatus::Applied {
            update = update.ended_now();
        }
        let Some(task) = self.transition(&task.id, &[TaskStatus::Validating], update).await? else {
            return Ok(());
        };

        if outcome == TaskStatus::WaitingMerge {
            let changes = self.collect_changes(&task).await?;
            let test_summary = format::format_test_output(test_text, 500);
            let text = format::merge_gate_text(&task, agent, &changes, Some(&test_summary));
            let nonce = self
                .present_decision(&task, &task.thread_id, &text, &DecisionAction::MERGE)
                .await?;
            self.record(&task.id, TaskEvent::WaitingMerge { nonce }).await?;
            info!(task_id = %task.id, "task waiting for merge decision");
        } else {
            self.record(&task.id, TaskEvent::Applied {}).await?;
            info!(task_id = %task.id, "task applied");
        }

        self.notify(&task, &format!("Task `{}` completed. {}", task.id, summary))
            .await;
        self.signal_status(&task, outcome).await;
        Ok(())
    }

    async fn block(&self, task: &Task, reason: String) -> Result<(), RuntimeError> {
        let Some(task) = self
            .transition(
                &task.id,
                &[TaskStatus::Validating],
                TaskUpdate::status(TaskStatus::Blocked)
                    .blocked_reason(Some(reason.clone()))
                    .resume_instruction(None),
            )
            .await?
        else {
            return Ok(());
        };
        self.record(
            &task.id,
            TaskEvent::Blocked {
                reason: reason.clone(),
            },
        )
        .await?;
        info!(task_id = %task.id, reason = %reason, "task blocked");
        self.notify(
            &task,
            &format!(
                "Task `{}` is BLOCKED: {}\nReply in this thread or run `foreman task resume {} <instruction>`.",
                task.id, reason, task.id
            ),
        )
        .await;
        self.signal_status(&task, TaskStatus::Blocked).await;
        Ok(())
    }

    async fn time_out(
        &self,
        task: &Task,
        reason: String,
        output: Option<String>,
    ) -> Result<(), RuntimeError> {
        let error = match &output {
            Some(tail) if !tail.is_empty() => format!("{}\n{}", reason, tail),
            _ => reason.clone(),
        };
        let Some(task) = self
            .transition(
                &task.id,
                &IN_FLIGHT,
                TaskUpdate::status(TaskStatus::Timeout)
                    .error(Some(format::truncate_chars(&error, format::ERROR_LIMIT)))
                    .summary(Some(reason.clone()))
                    .ended_now(),
            )
            .await?
        else {
            return Ok(());
        };
        self.record(
            &task.id,
            TaskEvent::TimedOut {
                reason: reason.clone(),
            },
        )
        .await?;
        warn!(task_id = %task.id, reason = %reason, "task timed out");
        self.notify(
            &task,
            &format!(
                "Task `{}` timed out: {}",
                task.id,
                format::truncate_chars(&error, format::NOTICE_ERROR_LIMIT)
            ),
        )
        .await;
        self.signal_status(&task, TaskStatus::Timeout).await;
        Ok(())
    }

    /// Mark an in-flight task FAILED. The full error goes to the event log.
    pub(super) async fn fail(&self, task: &Task, error: String) -> Result<(), RuntimeError> {
        let Some(task) = self
            .transition(
                &task.id,
                &IN_FLIGHT,
                TaskUpdate::status(TaskStatus::Failed)
                    .error(Some(format::truncate_chars(&error, format::ERROR_LIMIT)))
                    .ended_now(),
            )
            .await?
        else {
            return Ok(());
        };
        self.record(
            &task.id,
            TaskEvent::Failed {
                error: error.clone(),
            },
        )
        .await?;
        error!(task_id = %task.id, error = %error, "task failed");
        self.notify(
            &task,
            &format!(
                "Task `{}` failed: {}",
                task.id,
                format::truncate_chars(&error, format::NOTICE_ERROR_LIMIT)
            ),
        )
        .await;
        self.signal_status(&task, TaskStatus::Failed).await;
        Ok(())
    }

    /// A step was interrupted. Stop and pause already moved the task; any
    /// other cancellation is a shutdown, so the task goes back to the queue.
    async fn on_cancelled(&self, task: &Task) -> Result<(), RuntimeError> {
        let current = self.get(&task.id).await?;
        if current.map_or(true, |t| !t.status.is_inflight()) {
            debug!(task_id = %task.id, "step cancelled after status change");
            return Ok(());
        }
        if self.storage.lock().await.requeue_task(&task.id)? {
            self.record(
                &task.id,
                TaskEvent::Requeued {
                    reason: "runtime shutdown".to_string(),
                },
            )
            .await?;
            info!(task_id = %task.id, "step interrupted, task requeued");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_due() {
        let last = AtomicU64::new(0);
        assert!(!ProgressSink::due(&last, 60, 20));
        assert!(ProgressSink::due(&last, 60, 60));
        assert_eq!(last.load(Ordering::Relaxed), 60);
        assert!(!ProgressSink::due(&last, 60, 100));
        assert!(ProgressSink::due(&last, 60, 121));
        assert!(!ProgressSink::due(&last, 0, 500));
    }
}
