//! Transport adapters for tool-provider backends.
//!
//! A transport moves JSON-RPC frames between this process and one backend. It
//! knows nothing about the protocol running on top of it: framing, process
//! lifecycle and HTTP plumbing live here, while request ids, handshakes and
//! tool catalogs belong to [`crate::mcp::session`].

use crate::core::config::data::BackendConfig;
use crate::mcp::error::McpError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub mod sse;
pub mod stdio;

/// How a backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A local script run through an interpreter inferred from its extension.
    PipedScript,
    /// An arbitrary executable with arguments.
    LaunchedCommand,
    /// A remote server speaking JSON-RPC over server-sent events.
    EventStream,
}

impl TransportKind {
    pub fn from_config(config: &BackendConfig) -> Result<Self, String> {
        let kind = match config.transport.trim().to_ascii_lowercase().as_str() {
            "piped-script" | "piped_script" | "stdio" | "script" => TransportKind::PipedScript,
            "launched-command" | "launched_command" | "command" => TransportKind::LaunchedCommand,
            "event-stream" | "event_stream" | "sse" => TransportKind::EventStream,
            other => return Err(format!("Unsupported transport: {other}")),
        };
        match kind {
            TransportKind::PipedScript if config.script.is_none() => {
                Err("`script` is required for piped-script backends.".to_string())
            }
            TransportKind::LaunchedCommand if config.command.is_none() => {
                Err("`command` is required for launched-command backends.".to_string())
            }
            TransportKind::EventStream if config.url.is_none() => {
                Err("`url` is required for event-stream backends.".to_string())
            }
            _ => Ok(kind),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TransportKind::PipedScript => "piped-script",
            TransportKind::LaunchedCommand => "launched-command",
            TransportKind::EventStream => "event-stream",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A bidirectional JSON-RPC frame channel to a single backend.
///
/// Messages on one transport are delivered in order. After `close` (or after
/// the peer goes away) both `send` and `receive` fail.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn send(&mut self, message: &Value) -> Result<(), McpError>;

    /// Waits for the next inbound frame.
    async fn receive(&mut self) -> Result<Value, McpError>;

    /// Releases the channel. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens transports for backend descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        config: &BackendConfig,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, McpError>;
}

/// Connector that spawns processes and dials event streams for real.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Result<Self, McpError> {
        Ok(Self {
            http: sse::build_event_stream_client()?,
        })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        config: &BackendConfig,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, McpError> {
        let kind = TransportKind::from_config(config).map_err(McpError::InvalidConfig)?;
        match kind {
            TransportKind::PipedScript | TransportKind::LaunchedCommand => {
                let transport = stdio::StdioTransport::spawn(config, kind, timeout)?;
                Ok(Box::new(transport))
            }
            TransportKind::EventStream => {
                let transport =
                    sse::SseTransport::connect(self.http.clone(), config, timeout).await?;
                Ok(Box::new(transport))
            }
        }
    }
}
