//! Text listings for backends and their tools.

use crate::core::config::data::BackendConfig;
use crate::mcp::registry::BackendStatus;
use crate::mcp::transport::TransportKind;
use crate::mcp::{McpError, SessionRegistry, ToolSchema};

fn transport_label(backend: &BackendConfig) -> String {
    TransportKind::from_config(backend)
        .map(|kind| kind.label().to_string())
        .unwrap_or_else(|_| backend.transport.clone())
}

fn target(backend: &BackendConfig) -> String {
    if let Some(script) = &backend.script {
        return script.display().to_string();
    }
    if let Some(command) = &backend.command {
        let mut line = command.clone();
        for arg in &backend.args {
            line.push(' ');
            line.push_str(arg);
        }
        return line;
    }
    backend.url.clone().unwrap_or_default()
}

/// Configured backends, the default one marked with `*`.
pub fn format_descriptors(backends: &[BackendConfig], default: Option<&str>) -> String {
    let mut text = String::from("🔌 Configured backends\n");
    for backend in backends {
        let marker = if default == Some(backend.name.as_str()) {
            "*"
        } else {
            " "
        };
        text.push_str(&format!(
            "{marker} {} [{}] {}\n",
            backend.name,
            transport_label(backend),
            target(backend)
        ));
        let description = backend.display_description();
        if !description.is_empty() {
            text.push_str(&format!("    {description}\n"));
        }
    }
    if default.is_some() {
        text.push_str("\n* = default backend");
    }
    text.trim_end().to_string()
}

pub fn print_descriptors(backends: &[BackendConfig], default: Option<&str>) {
    println!("{}", format_descriptors(backends, default));
}

/// Backends with their live connection state, the active one marked.
pub fn format_statuses(statuses: &[BackendStatus], active: Option<&str>) -> String {
    let mut text = String::from("🔌 Backends\n");
    for status in statuses {
        let marker = if active == Some(status.config.name.as_str()) {
            ">"
        } else {
            " "
        };
        text.push_str(&format!(
            "{marker} {} [{}] {}",
            status.config.name,
            transport_label(&status.config),
            status.state
        ));
        if status.tool_count > 0 {
            text.push_str(&format!(", {} tools", status.tool_count));
        }
        text.push('\n');
        if let Some(error) = &status.last_error {
            text.push_str(&format!("    last error: {error}\n"));
        }
    }
    text.trim_end().to_string()
}

pub fn format_tools(backend: &str, tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return format!("Backend `{backend}` exposes no tools.");
    }
    let mut text = format!("🛠️  Tools on {backend} ({})\n", tools.len());
    for tool in tools {
        if tool.description.is_empty() {
            text.push_str(&format!("  {}\n", tool.name));
        } else {
            // Only the first line; some servers ship multi-paragraph docs.
            let summary = tool.description.lines().next().unwrap_or_default().trim();
            text.push_str(&format!("  {}: {summary}\n", tool.name));
        }
    }
    text.trim_end().to_string()
}

/// Connects `backend` if needed and prints its tool catalog.
pub async fn print_backend_tools(
    registry: &SessionRegistry,
    backend: &str,
) -> Result<(), McpError> {
    let session = registry.ensure_connected(backend).await?;
    let tools = session.list_tools().await?;
    if let Some(info) = session.server_info().await {
        println!("Connected to {info}");
    }
    println!("{}", format_tools(backend, &tools));
    Ok(())
}
