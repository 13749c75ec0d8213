//! Anthropic Messages API.

use super::{non_blank, send_for_body, ChatProvider, ChatReply, LlmError};
use crate::api::{ChatMessage, ChatRequest, ChatToolCall, ChatToolCallFunction};
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API requires an output budget on every request.
const DEFAULT_MAX_TOKENS: u32 = 1000;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicProvider {
    pub fn with_client(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key: non_blank(api_key),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let url = construct_api_url(&self.base_url, "messages");
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "Requesting Anthropic message"
        );

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&messages_payload(&request));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let body = send_for_body(builder).await?;
        let response: MessagesResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        debug!(stop_reason = ?response.stop_reason, "Anthropic message received");
        Ok(into_reply(response))
    }
}

fn messages_payload(request: &ChatRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|message| message.role == "system")
        .map(ChatMessage::content_str)
        .collect();

    let mut messages: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != "system") {
        match message.role.as_str() {
            "assistant" => messages.push(assistant_message(message)),
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content_str(),
                });
                // Results for one assistant turn travel in a single user turn.
                match messages.last_mut().and_then(tool_result_blocks) {
                    Some(blocks) => blocks.push(block),
                    None => messages.push(json!({"role": "user", "content": [block]})),
                }
            }
            _ => messages.push(json!({"role": "user", "content": message.content_str()})),
        }
    }

    let mut payload = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if !system.is_empty() {
        payload["system"] = Value::String(system.join("\n\n"));
    }
    if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
        payload["tools"] = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description.clone().unwrap_or_default(),
                    "input_schema": tool.function.parameters,
                })
            })
            .collect();
    }
    payload
}

fn assistant_message(message: &ChatMessage) -> Value {
    let mut blocks = Vec::new();
    if let Some(text) = message.content.as_deref().filter(|text| !text.is_empty()) {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in message.tool_calls.iter().flatten() {
        let input = serde_json::from_str::<Value>(&call.function.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }
    json!({"role": "assistant", "content": blocks})
}

/// The block list of a user turn made only of tool results.
fn tool_result_blocks(message: &mut Value) -> Option<&mut Vec<Value>> {
    if message["role"] != "user" {
        return None;
    }
    let blocks = message.get_mut("content")?.as_array_mut()?;
    blocks
        .iter()
        .all(|block| block["type"] == "tool_result")
        .then_some(blocks)
}

fn into_reply(response: MessagesResponse) -> ChatReply {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id,
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::Other => {}
        }
    }
    ChatReply {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
    }
}
