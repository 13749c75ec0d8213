//! Google Gemini `generateContent` API.

use super::{non_blank, send_for_body, ChatProvider, ChatReply, LlmError};
use crate::api::{ChatMessage, ChatRequest, ChatToolCall, ChatToolCallFunction};
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiProvider {
    pub fn with_client(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key: non_blank(api_key),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let url = construct_api_url(
            &self.base_url,
            &format!("models/{}:generateContent", request.model),
        );
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "Requesting Gemini content"
        );

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&generate_payload(&request));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-goog-api-key", key);
        }

        let body = send_for_body(builder).await?;
        let response: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no candidates in response".to_string()))?;
        debug!(finish_reason = ?candidate.finish_reason, "Gemini content received");
        Ok(into_reply(candidate))
    }
}

fn generate_payload(request: &ChatRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|message| message.role == "system")
        .map(ChatMessage::content_str)
        .collect();

    // Function responses are matched by name, not by call id.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != "system") {
        match message.role.as_str() {
            "assistant" => {
                let mut parts = Vec::new();
                if let Some(text) = message.content.as_deref().filter(|text| !text.is_empty()) {
                    parts.push(json!({"text": text}));
                }
                for call in message.tool_calls.iter().flatten() {
                    call_names.insert(&call.id, &call.function.name);
                    let args = serde_json::from_str::<Value>(&call.function.arguments)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    parts.push(json!({"functionCall": {"name": call.function.name, "args": args}}));
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            "tool" => {
                let name = message.name.as_deref().or_else(|| {
                    message
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id).copied())
                });
                let part = json!({"functionResponse": {
                    "name": name.unwrap_or_default(),
                    "response": {"content": message.content_str()},
                }});
                match contents.last_mut().and_then(function_response_parts) {
                    Some(parts) => parts.push(part),
                    None => contents.push(json!({"role": "user", "parts": [part]})),
                }
            }
            _ => contents.push(json!({"role": "user", "parts": [{"text": message.content_str()}]})),
        }
    }

    let mut payload = json!({"contents": contents});
    if !system.is_empty() {
        payload["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
    }
    if let Some(max_tokens) = request.max_tokens {
        payload["generationConfig"] = json!({"maxOutputTokens": max_tokens});
    }
    if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description.clone().unwrap_or_default(),
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
        payload["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    payload
}

fn function_response_parts(content: &mut Value) -> Option<&mut Vec<Value>> {
    if content["role"] != "user" {
        return None;
    }
    let parts = content.get_mut("parts")?.as_array_mut()?;
    parts
        .iter()
        .all(|part| part.get("functionResponse").is_some())
        .then_some(parts)
}

fn into_reply(candidate: Candidate) -> ChatReply {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            let arguments = if call.args.is_null() {
                "{}".to_string()
            } else {
                call.args.to_string()
            };
            tool_calls.push(ChatToolCall {
                id: format!("call_{}", tool_calls.len()),
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name: call.name,
                    arguments,
                },
            });
        }
    }
    ChatReply {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
    }
}
