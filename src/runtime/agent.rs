// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent contract and registry.
//!
//! An agent turns a prompt into text. What it does to the files in the
//! workspace along the way is its own business; the runtime only looks at
//! the diff afterwards.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentCommandConfig;
use crate::error::AgentError;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// What an agent understands besides the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCapabilities {
    /// Accepts a thread id to resume its own session.
    pub thread_scoped: bool,
    /// Works inside a workspace directory it is given.
    pub workspace_scoped: bool,
}

/// One agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    /// Prior conversation turns, oldest first.
    pub history: Vec<String>,
    /// Only set for thread-scoped agents.
    pub thread_id: Option<String>,
    /// Only set for workspace-scoped agents.
    pub workspace: Option<PathBuf>,
    pub cancel: CancellationToken,
}

/// Token usage, when the agent reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    pub text: String,
    pub usage: Option<AgentUsage>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// A code-generation backend.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::default()
    }

    /// Run one turn. Implementations should return
    /// [`AgentError::Cancelled`] promptly once `request.cancel` fires.
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    capabilities: AgentCapabilities,
}

/// Ordered agents with fallback.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<RegisteredAgent>,
}

/// Inputs shared by every attempt of one registry call.
#[derive(Debug, Clone, Default)]
pub struct AgentCall<'a> {
    pub preferred: Option<&'a str>,
    pub prompt: &'a str,
    pub history: &'a [String],
    pub thread_id: Option<&'a str>,
    pub workspace: Option<&'a std::path::Path>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Capabilities are read once, here.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let capabilities = agent.capabilities();
        debug!(agent = agent.name(), ?capabilities, "registered agent");
        self.agents.push(RegisteredAgent {
            agent,
            capabilities,
        });
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    /// Build command agents from configuration.
    pub fn from_config(configs: &[AgentCommandConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Arc::new(CommandAgent::from_config(config)));
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.find(name).map(|r| r.agent.clone())
    }

    fn find(&self, name: &str) -> Option<&RegisteredAgent> {
        self.agents.iter().find(|r| r.agent.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|r| r.agent.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Run the preferred agent if it is registered, otherwise try every
    /// agent in order until one succeeds.
    ///
    /// Returns the name of the agent that produced the result.
    pub async fn run(
        &self,
        call: AgentCall<'_>,
        cancel: &CancellationToken,
    ) -> (String, Result<AgentResponse, AgentError>) {
        if let Some(forced) = call.preferred.and_then(|name| self.find(name)) {
            let result = invoke(forced, &call, cancel).await;
            return (forced.agent.name().to_string(), result);
        }
        if let Some(name) = call.preferred {
            warn!(agent = name, "preferred agent not registered, falling back");
        }

        let mut last: (String, Result<AgentResponse, AgentError>) =
            (String::new(), Err(AgentError::NoAgents));
        for registered in &self.agents {
            let name = registered.agent.name().to_string();
            info!(agent = %name, "trying agent");
            match invoke(registered, &call, cancel).await {
                Ok(response) => return (name, Ok(response)),
                Err(AgentError::Cancelled) => return (name, Err(AgentError::Cancelled)),
                Err(e) => {
                    warn!(agent = %name, error = %e, "agent failed, trying next");
                    last = (name, Err(e));
                }
            }
        }
        last
    }
}

async fn invoke(
    registered: &RegisteredAgent,
    call: &AgentCall<'_>,
    cancel: &CancellationToken,
) -> Result<AgentResponse, AgentError> {
    let caps = registered.capabilities;
    let request = AgentRequest {
        prompt: call.prompt.to_string(),
        history: call.history.to_vec(),
        thread_id: call
            .thread_id
            .filter(|_| caps.thread_scoped)
            .map(str::to_string),
        workspace: call
            .workspace
            .filter(|_| caps.workspace_scoped)
            .map(|p| p.to_path_buf()),
        cancel: cancel.clone(),
    };

    let start = Instant::now();
    let result = registered.agent.run(request).await;

    #[cfg(feature = "telemetry")]
    GLOBAL_METRICS.record_agent(registered.agent.name(), start.elapsed(), result.is_ok());

    debug!(
        agent = registered.agent.name(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "agent call finished"
    );
    result
}

/// Agent backed by a command line.
///
/// The prompt goes to stdin and the reply is read from stdout. The process
/// runs in the workspace and is killed when the call is cancelled or times
/// out.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn from_config(config: &AgentCommandConfig) -> Self {
        let mut parts = config.command.iter();
        let program = parts.next().cloned().unwrap_or_default();
        let agent = Self::new(config.name.clone(), program, parts.cloned().collect());
        match config.timeout_seconds {
            Some(secs) => agent.with_timeout(Duration::from_secs(secs)),
            None => agent,
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            thread_scoped: false,
            workspace_scoped: true,
        }
    }

    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.workspace {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::ProcessFailed(format!("{}: {}", self.program, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| AgentError::ProcessFailed(e.to_string()))?;
            drop(stdin);
        }

        let limit = self.timeout.unwrap_or(Duration::MAX);
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| AgentError::ProcessFailed(e.to_string()))?
            }
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(limit) => {
                return Err(AgentError::Timeout(limit.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(AgentError::ProcessFailed(if detail.is_empty() {
                format!("{} exited with {}", self.name, output.status)
            } else {
                detail.to_string()
            }));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(AgentError::Malformed("empty response".to_string()));
        }
        Ok(AgentResponse::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAgent {
        name: &'static str,
        reply: Result<&'static str, AgentError>,
        calls: AtomicUsize,
        capabilities: AgentCapabilities,
    }

    impl StubAgent {
        fn ok(name: &'static str, reply: &'static str) -> Self {
            Self {
                name,
                reply: Ok(reply),
                calls: AtomicUsize::new(0),
                capabilities: AgentCapabilities::default(),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                reply: Err(AgentError::ProcessFailed("boom".into())),
                calls: AtomicUsize::new(0),
                capabilities: AgentCapabilities::default(),
            }
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> AgentCapabilities {
            self.capabilities
        }

        async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Echo what was forwarded so capability filtering is observable.
            self.reply.clone().map(|r| {
                AgentResponse::text(format!(
                    "{} thread={:?} ws={:?}",
                    r,
                    request.thread_id,
                    request.workspace.is_some()
                ))
            })
        }
    }

    fn call<'a>(preferred: Option<&'a str>) -> AgentCall<'a> {
        AgentCall {
            preferred,
            prompt: "do it",
            history: &[],
            thread_id: Some("t-1"),
            workspace: Some(std::path::Path::new("/tmp")),
        }
    }

    #[tokio::test]
    async fn test_fallback_in_order() {
        let first = Arc::new(StubAgent::failing("first"));
        let second = Arc::new(StubAgent::ok("second", "hi"));
        let registry = AgentRegistry::new()
            .with_agent(first.clone())
            .with_agent(second.clone());

        let (name, result) = registry.run(call(None), &CancellationToken::new()).await;
        assert_eq!(name, "second");
        assert!(result.unwrap().text.starts_with("hi"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preferred_agent_has_no_fallback() {
        let first = Arc::new(StubAgent::ok("first", "hi"));
        let second = Arc::new(StubAgent::failing("second"));
        let registry = AgentRegistry::new()
            .with_agent(first.clone())
            .with_agent(second);

        let (name, result) = registry
            .run(call(Some("second")), &CancellationToken::new())
            .await;
        assert_eq!(name, "second");
        assert!(matches!(result, Err(AgentError::ProcessFailed(_))));
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capabilities_filter_arguments() {
        let mut scoped = StubAgent::ok("scoped", "ok");
        scoped.capabilities = AgentCapabilities {
            thread_scoped: true,
            workspace_scoped: true,
        };
        let registry = AgentRegistry::new()
            .with_agent(Arc::new(StubAgent::ok("plain", "ok")))
            .with_agent(Arc::new(scoped));

        let (_, plain) = registry
            .run(call(Some("plain")), &CancellationToken::new())
            .await;
        assert_eq!(plain.unwrap().text, "ok thread=None ws=false");

        let (_, scoped) = registry
            .run(call(Some("scoped")), &CancellationToken::new())
            .await;
        assert_eq!(scoped.unwrap().text, "ok thread=Some(\"t-1\") ws=true");
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = AgentRegistry::new();
        let (_, result) = registry.run(call(None), &CancellationToken::new()).await;
        assert_eq!(result, Err(AgentError::NoAgents));
    }

    #[tokio::test]
    async fn test_command_agent_reads_stdin() {
        let agent = CommandAgent::new("cat", "cat", vec![]);
        let response = agent
            .run(AgentRequest {
                prompt: "hello agent\nTASK_STATE: DONE".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.text.ends_with("TASK_STATE: DONE"));
    }

    #[tokio::test]
    async fn test_command_agent_failure_and_cancel() {
        let failing = CommandAgent::new("sh", "sh", vec!["-c".into(), "echo nope >&2; exit 2".into()]);
        let err = failing.run(AgentRequest::default()).await.unwrap_err();
        assert_eq!(err, AgentError::ProcessFailed("nope".into()));

        let slow = CommandAgent::new("sleep", "sleep", vec!["30".into()]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = slow
            .run(AgentRequest {
                cancel,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }

    #[tokio::test]
    async fn test_command_agent_timeout() {
        let slow = CommandAgent::new("sleep", "sleep", vec!["30".into()])
            .with_timeout(Duration::from_millis(200));
        let err = slow.run(AgentRequest::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }
}
