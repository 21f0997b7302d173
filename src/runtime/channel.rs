// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delivery surface for task notifications and decisions.
//!
//! A [`Channel`] is whatever carries text to people: a chat adapter, a
//! terminal, a test recorder. Only `send` is required; richer surfaces
//! (buttons, editable status messages, reactions) are optional and the
//! runtime falls back to plain text when a channel reports them as
//! unsupported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use colored::Colorize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::TaskStatus;

use super::agent::AgentRegistry;
use super::decision::DecisionAction;

/// Error from a channel operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel has no such surface; callers fall back to `send`.
    #[error("Operation not supported by channel")]
    Unsupported,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Marker attached to a task's message to show its status at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    Running,
    Testing,
    Waiting,
    Done,
    Discarded,
    Paused,
    Attention,
}

impl StatusMarker {
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Running => Self::Running,
            TaskStatus::Validating => Self::Testing,
            TaskStatus::Draft | TaskStatus::Pending | TaskStatus::WaitingMerge => Self::Waiting,
            TaskStatus::Merged | TaskStatus::Applied => Self::Done,
            TaskStatus::Discarded => Self::Discarded,
            TaskStatus::Paused => Self::Paused,
            TaskStatus::Blocked
            | TaskStatus::Failed
            | TaskStatus::Timeout
            | TaskStatus::Stopped
            | TaskStatus::Rejected
            | TaskStatus::MergeFailed => Self::Attention,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Running => "👀",
            Self::Testing => "🧪",
            Self::Waiting => "⏳",
            Self::Done => "✅",
            Self::Discarded => "🗑️",
            Self::Paused => "⏸️",
            Self::Attention => "⚠️",
        }
    }
}

/// A decision prompt with buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSurface<'a> {
    pub thread_id: &'a str,
    pub text: &'a str,
    pub task_id: &'a str,
    pub nonce: &'a str,
    pub actions: &'a [DecisionAction],
}

/// Message delivery for one chat channel.
///
/// Message ids are opaque strings; `None` means the channel does not track
/// messages.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, thread_id: &str, text: &str) -> Result<Option<String>, ChannelError>;

    /// Present a decision with one button per action.
    async fn send_task_draft(
        &self,
        _surface: DecisionSurface<'_>,
    ) -> Result<Option<String>, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    /// Create or edit the task's status message.
    async fn upsert_status(
        &self,
        _thread_id: &str,
        _text: &str,
        _message_id: Option<&str>,
    ) -> Result<Option<String>, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    /// Mark a message with a status marker. Best effort.
    async fn signal_task_status(
        &self,
        _thread_id: &str,
        _message_id: &str,
        _marker: StatusMarker,
    ) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// A channel and the agents that serve it.
pub struct ChannelSession {
    pub platform: String,
    pub channel_id: String,
    pub channel: Arc<dyn Channel>,
    pub agents: Arc<AgentRegistry>,
}

impl ChannelSession {
    pub fn new(
        platform: impl Into<String>,
        channel_id: impl Into<String>,
        channel: Arc<dyn Channel>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel_id: channel_id.into(),
            channel,
            agents,
        }
    }
}

/// Live sessions keyed by `(platform, channel_id)`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<(String, String), Arc<ChannelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous one for the same channel.
    pub async fn register(&self, session: Arc<ChannelSession>) {
        let key = (session.platform.clone(), session.channel_id.clone());
        debug!(platform = %key.0, channel_id = %key.1, "registered session");
        self.sessions.write().await.insert(key, session);
    }

    pub async fn get(&self, platform: &str, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions
            .read()
            .await
            .get(&(platform.to_string(), channel_id.to_string()))
            .cloned()
    }

    pub async fn remove(&self, platform: &str, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions
            .write()
            .await
            .remove(&(platform.to_string(), channel_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Channel that prints to the terminal.
#[derive(Debug, Default)]
pub struct ConsoleChannel {
    next_id: AtomicU64,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_message_id(&self) -> String {
        format!("console-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    async fn send(&self, thread_id: &str, text: &str) -> Result<Option<String>, ChannelError> {
        println!("{} {}", format!("[{}]", thread_id).dimmed(), text);
        Ok(Some(self.next_message_id()))
    }

    async fn send_task_draft(
        &self,
        surface: DecisionSurface<'_>,
    ) -> Result<Option<String>, ChannelError> {
        let actions: Vec<String> = surface
            .actions
            .iter()
            .map(|a| format!("foreman task {} {}", a.as_str().replace('_', "-"), surface.task_id))
            .collect();
        println!(
            "{} {}\n{} {}",
            format!("[{}]", surface.thread_id).dimmed(),
            surface.text,
            "Actions:".bold(),
            actions.join(" | ").cyan()
        );
        Ok(Some(self.next_message_id()))
    }

    async fn signal_task_status(
        &self,
        thread_id: &str,
        message_id: &str,
        marker: StatusMarker,
    ) -> Result<(), ChannelError> {
        debug!(thread_id, message_id, marker = marker.emoji(), "status marker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl Channel for Plain {
        async fn send(&self, _thread_id: &str, _text: &str) -> Result<Option<String>, ChannelError> {
            Ok(None)
        }
    }

    #[test]
    fn test_every_status_has_a_marker() {
        assert_eq!(StatusMarker::for_status(TaskStatus::Running).emoji(), "👀");
        assert_eq!(StatusMarker::for_status(TaskStatus::Validating).emoji(), "🧪");
        assert_eq!(StatusMarker::for_status(TaskStatus::WaitingMerge).emoji(), "⏳");
        assert_eq!(StatusMarker::for_status(TaskStatus::Merged).emoji(), "✅");
        assert_eq!(StatusMarker::for_status(TaskStatus::Paused).emoji(), "⏸️");
        assert_eq!(StatusMarker::for_status(TaskStatus::MergeFailed).emoji(), "⚠️");
    }

    #[tokio::test]
    async fn test_optional_surfaces_default_to_unsupported() {
        let channel = Plain;
        let surface = DecisionSurface {
            thread_id: "t",
            text: "x",
            task_id: "id",
            nonce: "n",
            actions: &DecisionAction::APPROVAL,
        };
        assert_eq!(
            channel.send_task_draft(surface).await,
            Err(ChannelError::Unsupported)
        );
        assert_eq!(
            channel.upsert_status("t", "x", None).await,
            Err(ChannelError::Unsupported)
        );
        assert!(channel
            .signal_task_status("t", "m", StatusMarker::Done)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_session_registry() {
        let registry = SessionRegistry::new();
        let session = Arc::new(ChannelSession::new(
            "cli",
            "local",
            Arc::new(Plain),
            Arc::new(AgentRegistry::new()),
        ));
        registry.register(session).await;

        assert!(registry.get("cli", "local").await.is_some());
        assert!(registry.get("cli", "other").await.is_none());
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove("cli", "local").await.is_some());
        assert_eq!(registry.len().await, 0);
    }
}
