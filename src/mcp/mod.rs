//! Tool-provider (MCP) backends: transports, sessions and the registry that
//! owns them.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::McpError;
pub use registry::SessionRegistry;
pub use session::{BackendSession, SessionState, ToolSchema};
