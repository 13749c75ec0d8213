//! JSON-RPC framing helpers for the tool-provider protocol.

use crate::mcp::error::McpError;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
};
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, PaginatedRequestParams,
    RequestId, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::{json, Value};

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Upper bound on tools accepted from a single backend across all pages.
pub const MAX_TOOL_LIST: usize = 100;

pub fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "switchboard".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Switchboard".to_string()),
            description: Some("Routes LLM tool calls to tool-provider backends".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub fn request_frame(id: i64, request: RequestFromClient) -> Result<Value, McpError> {
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(id)),
    )
    .map_err(|err| McpError::Protocol(err.to_string()))?;
    serde_json::to_value(&message).map_err(|err| McpError::Protocol(err.to_string()))
}

pub fn notification_frame(notification: NotificationFromClient) -> Result<Value, McpError> {
    let message = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(notification),
        None,
    )
    .map_err(|err| McpError::Protocol(err.to_string()))?;
    serde_json::to_value(&message).map_err(|err| McpError::Protocol(err.to_string()))
}

/// Reply sent for server-initiated requests this client does not serve.
pub fn method_not_found_frame(id: &Value, method: &str) -> Value {
    let error = RpcError::method_not_found()
        .with_message(&format!("Unsupported request from server: {method}"));
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// What an inbound frame means to a caller waiting on request `expected`.
#[derive(Debug)]
pub enum Inbound {
    /// The reply to the outstanding request.
    Reply(Result<Value, RpcError>),
    /// The server is asking this client to do something.
    ServerRequest { id: Value, method: String },
    Notification { method: String },
    /// A reply for some other (abandoned) request.
    Stale,
    Invalid(String),
}

pub fn classify(frame: Value, expected: i64) -> Inbound {
    let Value::Object(mut object) = frame else {
        return Inbound::Invalid("frame is not a JSON object".to_string());
    };
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = object.remove("id").filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => Inbound::ServerRequest { id, method },
        (Some(method), None) => Inbound::Notification { method },
        (None, Some(id)) if !id_matches(&id, expected) => Inbound::Stale,
        (None, id) => {
            if let Some(error) = object.remove("error") {
                return match serde_json::from_value::<RpcError>(error) {
                    Ok(error) => Inbound::Reply(Err(error)),
                    Err(err) => Inbound::Invalid(format!("malformed error reply: {err}")),
                };
            }
            match (object.remove("result"), id) {
                (Some(result), Some(_)) => Inbound::Reply(Ok(result)),
                _ => Inbound::Invalid("reply has neither result nor error".to_string()),
            }
        }
    }
}

fn id_matches(id: &Value, expected: i64) -> bool {
    match id {
        Value::Number(number) => number.as_i64() == Some(expected),
        Value::String(text) => text.parse::<i64>().ok() == Some(expected),
        _ => false,
    }
}

/// Deserializes a successful reply into a typed protocol result.
pub fn parse_result<T: serde::de::DeserializeOwned>(
    operation: &str,
    reply: Result<Value, RpcError>,
) -> Result<T, McpError> {
    let value = reply.map_err(|err| McpError::Protocol(format_rpc_error(&err)))?;
    serde_json::from_value::<T>(value)
        .map_err(|err| McpError::Protocol(format!("invalid {operation} result: {err}")))
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

pub fn is_tool_error_payload(payload: &Value) -> bool {
    payload
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Renders a `tools/call` result as the text handed back to the model.
///
/// Text-only content is joined verbatim; anything else is shown as JSON so
/// no part of the result is lost.
pub fn tool_output_text(payload: &Value) -> String {
    let content = payload.get("content").and_then(Value::as_array);
    match content {
        Some(blocks) if !blocks.is_empty() => {
            let texts: Option<Vec<&str>> = blocks
                .iter()
                .map(|block| match block.get("type").and_then(Value::as_str) {
                    Some("text") => block.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            match texts {
                Some(texts) => texts.join("\n"),
                None => serde_json::to_string_pretty(blocks).unwrap_or_default(),
            }
        }
        _ => match payload.get("structuredContent") {
            Some(structured) => serde_json::to_string_pretty(structured).unwrap_or_default(),
            None => String::new(),
        },
    }
}
