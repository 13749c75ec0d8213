//! The per-process conversation: history, the active backend and the turn
//! loop that mediates tool calls between the model and a backend.

use crate::api::{ChatMessage, ChatRequest, ChatToolCall};
use crate::core::catalog::ToolCatalog;
use crate::core::llm::{ChatProvider, ChatReply, LlmError};
use crate::core::router::{self, DecisionSource, RouterDecision};
use crate::mcp::{BackendSession, McpError, SessionRegistry};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("No backend selected: configure servers.default or use !connect <name>")]
    NoBackendSelected,
    #[error("Tool budget exceeded: stopped after {limit} tool rounds without a final answer")]
    ToolBudgetExceeded { limit: usize },
    #[error("Turn interrupted")]
    Interrupted,
    #[error(transparent)]
    Backend(#[from] McpError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub model: String,
    pub system_message: String,
    pub max_tool_rounds: usize,
    pub auto_select: bool,
    pub default_backend: Option<String>,
    pub max_tokens: Option<u32>,
}

/// One tool call made during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub decision: RouterDecision,
    pub reply: String,
    pub tool_rounds: usize,
    pub invocations: Vec<ToolInvocation>,
}

pub struct Conversation {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn ChatProvider>,
    settings: ConversationSettings,
    active_backend: Option<String>,
    history: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provider: Arc<dyn ChatProvider>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            settings,
            active_backend: None,
            history: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn active_backend(&self) -> Option<&str> {
        self.active_backend.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub fn set_model(&mut self, model: &str) {
        info!(model = %model, "Model switched");
        self.settings.model = model.to_string();
    }

    /// Makes `name` the active backend without running a query.
    pub async fn switch_backend(&mut self, name: &str) -> Result<Arc<BackendSession>, TurnError> {
        let session = self.registry.ensure_connected(name).await?;
        self.active_backend = Some(name.to_string());
        Ok(session)
    }

    /// Forgets the active backend if it is `name`.
    pub fn release_backend(&mut self, name: &str) {
        if self.active_backend.as_deref() == Some(name) {
            self.active_backend = None;
        }
    }

    /// Runs one user query to a final answer.
    ///
    /// `explicit` pins the turn to a backend and skips model selection. The
    /// user message stays in history whatever the outcome.
    pub async fn run_turn(
        &mut self,
        query: &str,
        explicit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        self.history.push(ChatMessage::new("user", query));

        let decision = self.route(query, explicit, cancel).await?;
        checkpoint(cancel)?;
        let connect = self.registry.ensure_connected(&decision.backend);
        let session = match interruptible(cancel, connect).await {
            Ok(connected) => connected?,
            Err(interrupted) => {
                // The abandoned connect leaves a half-open session in the slot.
                if let Err(err) = self.registry.disconnect(&decision.backend).await {
                    debug!(backend = %decision.backend, error = %err, "Cleanup after interrupted connect failed");
                }
                return Err(interrupted);
            }
        };
        if self.active_backend.as_deref() != Some(decision.backend.as_str()) {
            info!(backend = %decision.backend, source = %decision.source, "Active backend changed");
        }
        self.active_backend = Some(decision.backend.clone());

        let tools = session.list_tools().await?;
        let catalog = ToolCatalog::new(&tools, &self.settings.model);

        let mut tool_rounds = 0;
        let mut invocations = Vec::new();
        loop {
            checkpoint(cancel)?;
            let request = self.request(self.history.clone(), Some(&catalog));
            let reply = interruptible(cancel, self.provider.complete(request)).await??;

            if !reply.wants_tools() {
                let text = router::strip_directive(reply.text());
                self.history.push(ChatMessage::new("assistant", text.clone()));
                return Ok(TurnOutcome {
                    decision,
                    reply: text,
                    tool_rounds,
                    invocations,
                });
            }

            self.push_tool_request(&reply);
            if tool_rounds >= self.settings.max_tool_rounds {
                let limit = self.settings.max_tool_rounds;
                warn!(limit, backend = %decision.backend, "Tool budget exhausted");
                self.answer_unfinished(
                    &reply.tool_calls,
                    &format!("Tool call skipped: the budget of {limit} tool rounds is exhausted."),
                );
                return Err(TurnError::ToolBudgetExceeded { limit });
            }
            tool_rounds += 1;

            for (index, call) in reply.tool_calls.iter().enumerate() {
                let outcome = match checkpoint(cancel) {
                    Ok(()) => {
                        interruptible(cancel, dispatch(&session, &catalog, call))
                            .await
                            .and_then(|result| result)
                    }
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok((content, succeeded)) => {
                        invocations.push(ToolInvocation {
                            tool: call.function.name.clone(),
                            succeeded,
                        });
                        self.history.push(tool_message(call, content));
                    }
                    Err(err) => {
                        self.answer_unfinished(
                            &reply.tool_calls[index..],
                            &format!("Tool call not completed: {err}"),
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn route(
        &self,
        query: &str,
        explicit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RouterDecision, TurnError> {
        if let Some(name) = explicit {
            if !self.registry.contains(name) {
                return Err(McpError::UnknownBackend {
                    name: name.to_string(),
                    available: self.registry.names(),
                }
                .into());
            }
            return Ok(RouterDecision::new(name, DecisionSource::Explicit));
        }

        let active = self.active_backend.as_deref();
        let default = self.settings.default_backend.as_deref();
        if !self.settings.auto_select {
            return router::fallback(active, default).ok_or(TurnError::NoBackendSelected);
        }

        let messages = router::selection_messages(
            &self.settings.system_message,
            self.registry.list_available(),
            active,
            query,
        );
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages,
            tools: None,
            max_tokens: self.settings.max_tokens,
        };
        let reply = interruptible(cancel, self.provider.complete(request)).await??;
        let decision =
            router::decide_from_reply(reply.text(), &self.registry.names(), active, default)
                .ok_or(TurnError::NoBackendSelected)?;
        debug!(backend = %decision.backend, source = %decision.source, "Backend selected");
        Ok(decision)
    }

    fn request(&self, history: Vec<ChatMessage>, catalog: Option<&ToolCatalog>) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::new("system", self.settings.system_message.clone()));
        messages.extend(history);
        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            tools: catalog
                .filter(|catalog| !catalog.is_empty())
                .map(|catalog| catalog.definitions().to_vec()),
            max_tokens: self.settings.max_tokens,
        }
    }

    fn push_tool_request(&mut self, reply: &ChatReply) {
        self.history.push(ChatMessage {
            role: "assistant".to_string(),
            content: reply.content.clone(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(reply.tool_calls.clone()),
        });
    }

    /// Every requested call needs a tool message, or the next request is
    /// rejected by the API.
    fn answer_unfinished(&mut self, calls: &[ChatToolCall], text: &str) {
        for call in calls {
            self.history.push(tool_message(call, text.to_string()));
        }
    }
}

/// Runs one tool call. Problems the model can react to come back as tool
/// output; only channel failures end the turn.
async fn dispatch(
    session: &BackendSession,
    catalog: &ToolCatalog,
    call: &ChatToolCall,
) -> Result<(String, bool), TurnError> {
    let tool = call.function.name.as_str();
    let arguments = match catalog.prepare_arguments(tool, &call.function.arguments) {
        Ok(arguments) => arguments,
        Err(problem) => {
            debug!(tool = %tool, problem = %problem, "Rejected tool arguments");
            return Ok((problem, false));
        }
    };

    info!(backend = %session.name(), tool = %tool, "Calling tool");
    match session.invoke_tool(tool, arguments).await {
        Ok(output) => Ok((output, true)),
        Err(McpError::ToolExecution { tool, message }) => {
            Ok((format!("Tool '{tool}' failed: {message}"), false))
        }
        Err(err @ McpError::UnknownTool { .. }) => Ok((err.to_string(), false)),
        Err(err) => Err(err.into()),
    }
}

fn tool_message(call: &ChatToolCall, content: String) -> ChatMessage {
    ChatMessage {
        role: "tool".to_string(),
        content: Some(content),
        name: Some(call.function.name.clone()),
        tool_call_id: Some(call.id.clone()),
        tool_calls: None,
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), TurnError> {
    if cancel.is_cancelled() {
        Err(TurnError::Interrupted)
    } else {
        Ok(())
    }
}

async fn interruptible<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = T>,
) -> Result<T, TurnError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TurnError::Interrupted),
        output = work => Ok(output),
    }
}
