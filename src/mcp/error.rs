use std::time::Duration;
use thiserror::Error;

/// Failures raised by transports, backend sessions and the session registry.
#[derive(Debug, Error)]
pub enum McpError {
    /// The backend could not be started or the handshake failed.
    #[error("failed to connect to `{backend}`: {cause}")]
    Connect { backend: String, cause: String },

    /// The channel failed mid-session (process exit, broken pipe, dropped stream).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {}s waiting for {operation}", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// The transport was closed locally.
    #[error("transport closed")]
    Closed,

    #[error("backend `{backend}` is not ready (state: {state})")]
    NotReady { backend: String, state: String },

    #[error("backend `{backend}` has no tool named `{tool}`")]
    UnknownTool { backend: String, tool: String },

    #[error("unknown backend `{name}` (available: {})", .available.join(", "))]
    UnknownBackend {
        name: String,
        available: Vec<String>,
    },

    /// The backend ran the tool and reported a failure.
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The backend replied with something that is not valid protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),
}

impl McpError {
    /// Returns true for failures that leave the underlying channel unusable.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_) | McpError::Timeout { .. } | McpError::Closed
        )
    }

    pub(crate) fn connect(backend: &str, cause: impl std::fmt::Display) -> Self {
        McpError::Connect {
            backend: backend.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        McpError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
