//! One live connection to a tool-provider backend.
//!
//! A session owns its transport, the handshake state and the tool catalog the
//! backend declared. State only moves forward:
//! `Disconnected -> Connecting -> Ready`, `Connecting | Ready -> Failed`, and
//! `Ready | Failed -> Disconnected` on explicit close. A failed session is
//! never revived; the registry builds a fresh one instead.

use crate::core::config::data::BackendConfig;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{self, Inbound, MAX_TOOL_LIST};
use crate::mcp::transport::{Connector, Transport, TransportKind};
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::{CallToolRequestParams, InitializeResult, ListToolsResult, RpcError};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool as declared by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

impl ToolSchema {
    pub fn from_mcp(tool: &rust_mcp_schema::Tool) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters: serde_json::to_value(&tool.input_schema)
                .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
        }
    }
}

struct Channel {
    transport: Option<Box<dyn Transport>>,
    next_request_id: i64,
}

pub struct BackendSession {
    config: BackendConfig,
    generation: u64,
    timeout: Duration,
    state: RwLock<SessionState>,
    channel: Mutex<Channel>,
    tools: RwLock<Vec<ToolSchema>>,
    server_info: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("backend", &self.config.name)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl BackendSession {
    pub fn new(config: BackendConfig, timeout: Duration) -> Self {
        Self {
            config,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            timeout,
            state: RwLock::new(SessionState::Disconnected),
            channel: Mutex::new(Channel {
                transport: None,
                next_request_id: 0,
            }),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Distinguishes this session from earlier sessions for the same backend.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Server name and version reported during the handshake.
    pub async fn server_info(&self) -> Option<String> {
        self.server_info.read().await.clone()
    }

    /// Opens the transport, performs the handshake and caches the tool
    /// catalog. Any failure leaves the session `Failed`; nothing is retried.
    pub async fn connect(&self, connector: &dyn Connector) -> Result<(), McpError> {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::Disconnected {
                return Err(McpError::NotReady {
                    backend: self.config.name.clone(),
                    state: state.to_string(),
                });
            }
            *state = SessionState::Connecting;
        }
        debug!(backend = %self.config.name, generation = self.generation, "Connecting backend");

        let mut channel = self.channel.lock().await;
        match self.handshake(&mut channel, connector).await {
            Ok(tools) => {
                info!(
                    backend = %self.config.name,
                    tools = tools.len(),
                    transport = ?channel.transport.as_ref().map(|transport| transport.kind()),
                    "Backend ready"
                );
                *self.tools.write().await = tools;
                *self.state.write().await = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                if let Some(mut transport) = channel.transport.take() {
                    transport.close().await;
                }
                let err = match err {
                    McpError::Connect { .. } => err,
                    other => McpError::connect(&self.config.name, other),
                };
                warn!(backend = %self.config.name, error = %err, "Backend connect failed");
                *self.last_error.write().await = Some(err.to_string());
                *self.state.write().await = SessionState::Failed;
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        channel: &mut Channel,
        connector: &dyn Connector,
    ) -> Result<Vec<ToolSchema>, McpError> {
        let transport = connector.open(&self.config, self.timeout).await?;
        channel.transport = Some(transport);

        let reply = self
            .request(
                channel,
                "initialize",
                RequestFromClient::InitializeRequest(protocol::client_details()),
            )
            .await?;
        let initialized: InitializeResult = protocol::parse_result("initialize", reply)?;
        debug!(
            backend = %self.config.name,
            protocol_version = %initialized.protocol_version,
            server = %initialized.server_info.name,
            "Handshake complete"
        );
        *self.server_info.write().await = Some(format!(
            "{} {}",
            initialized.server_info.name, initialized.server_info.version
        ));

        self.notify(
            channel,
            NotificationFromClient::InitializedNotification(None),
        )
        .await?;

        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let reply = self
                .request(
                    channel,
                    "tools/list",
                    RequestFromClient::ListToolsRequest(protocol::paginated_params(cursor)),
                )
                .await?;
            let page: ListToolsResult = protocol::parse_result("tools/list", reply)?;
            tools.extend(
                page.tools
                    .iter()
                    .filter(|tool| self.config.allows_tool(&tool.name))
                    .map(ToolSchema::from_mcp),
            );
            cursor = page.next_cursor.filter(|next| !next.is_empty());
            if cursor.is_none() || tools.len() >= MAX_TOOL_LIST {
                break;
            }
        }
        tools.truncate(MAX_TOOL_LIST);
        Ok(tools)
    }

    /// Returns the cached catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, McpError> {
        self.require_ready().await?;
        Ok(self.tools.read().await.clone())
    }

    /// Calls `name` on the backend and returns its textual result.
    ///
    /// Catalog and state checks happen before the transport is touched. A
    /// channel failure mid-call demotes the session to `Failed`.
    pub async fn invoke_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, McpError> {
        self.require_ready().await?;
        if !self.tools.read().await.iter().any(|tool| tool.name == name) {
            return Err(McpError::UnknownTool {
                backend: self.config.name.clone(),
                tool: name.to_string(),
            });
        }

        let mut channel = self.channel.lock().await;
        // The session may have failed while this call waited for the channel.
        self.require_ready().await?;

        debug!(backend = %self.config.name, tool = %name, "Invoking tool");
        let params = CallToolRequestParams::new(name).with_arguments(arguments);
        let reply = match self
            .request(
                &mut channel,
                "tools/call",
                RequestFromClient::CallToolRequest(params),
            )
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_channel_failure() {
                    self.fail(&mut channel, &err).await;
                }
                return Err(err);
            }
        };

        match reply {
            Ok(payload) => {
                let text = protocol::tool_output_text(&payload);
                if protocol::is_tool_error_payload(&payload) {
                    Err(McpError::ToolExecution {
                        tool: name.to_string(),
                        message: text,
                    })
                } else {
                    Ok(text)
                }
            }
            Err(error) => Err(McpError::ToolExecution {
                tool: name.to_string(),
                message: protocol::format_rpc_error(&error),
            }),
        }
    }

    /// Releases the transport. Safe to call from any state.
    pub async fn disconnect(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(mut transport) = channel.transport.take() {
            transport.close().await;
            debug!(backend = %self.config.name, generation = self.generation, "Backend disconnected");
        }
        self.tools.write().await.clear();
        *self.state.write().await = SessionState::Disconnected;
    }

    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.channel
            .lock()
            .await
            .transport
            .as_ref()
            .map(|transport| transport.kind())
    }

    async fn require_ready(&self) -> Result<(), McpError> {
        let state = self.state().await;
        if state == SessionState::Ready {
            Ok(())
        } else {
            Err(McpError::NotReady {
                backend: self.config.name.clone(),
                state: state.to_string(),
            })
        }
    }

    async fn fail(&self, channel: &mut Channel, err: &McpError) {
        warn!(backend = %self.config.name, error = %err, "Backend channel failed");
        if let Some(mut transport) = channel.transport.take() {
            transport.close().await;
        }
        *self.last_error.write().await = Some(err.to_string());
        *self.state.write().await = SessionState::Failed;
    }

    async fn notify(
        &self,
        channel: &mut Channel,
        notification: NotificationFromClient,
    ) -> Result<(), McpError> {
        let frame = protocol::notification_frame(notification)?;
        let transport = channel.transport.as_mut().ok_or(McpError::Closed)?;
        tokio::time::timeout(self.timeout, transport.send(&frame))
            .await
            .map_err(|_| McpError::timeout("notification", self.timeout))?
    }

    /// Sends one request and waits for its reply, answering server-initiated
    /// requests and skipping notifications in between.
    async fn request(
        &self,
        channel: &mut Channel,
        operation: &str,
        request: RequestFromClient,
    ) -> Result<Result<Value, RpcError>, McpError> {
        let id = channel.next_request_id;
        channel.next_request_id += 1;
        let frame = protocol::request_frame(id, request)?;
        let transport = channel.transport.as_mut().ok_or(McpError::Closed)?;

        debug!(backend = %self.config.name, request_id = id, operation, "Sending request");
        tokio::time::timeout(self.timeout, transport.send(&frame))
            .await
            .map_err(|_| McpError::timeout(operation, self.timeout))??;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, transport.receive())
                .await
                .map_err(|_| McpError::timeout(operation, self.timeout))??;
            match protocol::classify(frame, id) {
                Inbound::Reply(reply) => return Ok(reply),
                Inbound::ServerRequest { id, method } => {
                    debug!(backend = %self.config.name, method = %method, "Declining server request");
                    let reply = protocol::method_not_found_frame(&id, &method);
                    transport.send(&reply).await?;
                }
                Inbound::Notification { method } => {
                    debug!(backend = %self.config.name, method = %method, "Server notification");
                }
                Inbound::Stale => {
                    debug!(backend = %self.config.name, "Skipping reply to an abandoned request");
                }
                Inbound::Invalid(reason) => {
                    debug!(backend = %self.config.name, reason = %reason, "Skipping invalid frame");
                }
            }
        }
    }
}
