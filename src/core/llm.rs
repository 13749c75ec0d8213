//! Chat-completion providers.
//!
//! The conversation loop only sees [`ChatProvider`]. Requests and replies use
//! the OpenAI chat shape throughout; the Anthropic and Gemini providers
//! translate at the wire.

mod anthropic;
mod gemini;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;

use crate::api::{ChatCompletion, ChatRequest, ChatToolCall};
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const ERROR_SUMMARY_LIMIT: usize = 400;

/// Which wire protocol a chat endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

const MODEL_PREFIXES: &[(&str, ProviderKind)] = &[
    ("gpt", ProviderKind::OpenAi),
    ("claude", ProviderKind::Anthropic),
    ("gemini", ProviderKind::Gemini),
    ("text-bison", ProviderKind::Gemini),
    ("palm", ProviderKind::Gemini),
];

impl ProviderKind {
    const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Anthropic, Self::Gemini];

    /// Picks the protocol for `model` served from `base_url`.
    ///
    /// An explicit base URL decides on its own: a vendor's official host
    /// selects that vendor, any other host is treated as an OpenAI-compatible
    /// proxy. Without one (or when it does not parse) the model name prefix
    /// decides, defaulting to OpenAI.
    pub fn select(model: &str, base_url: Option<&str>) -> Self {
        if let Some(host) = base_url
            .and_then(|url| Url::parse(url).ok())
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        {
            return Self::ALL
                .into_iter()
                .find(|kind| kind.is_official_host(&host))
                .unwrap_or(Self::OpenAi);
        }

        let model = model.to_ascii_lowercase();
        MODEL_PREFIXES
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map_or(Self::OpenAi, |(_, kind)| *kind)
    }

    fn official_hosts(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["api.openai.com"],
            Self::Anthropic => &["api.anthropic.com", "claude.ai"],
            Self::Gemini => &["generativelanguage.googleapis.com", "ai.googleapis.com"],
        }
    }

    fn is_official_host(self, host: &str) -> bool {
        self.official_hosts().iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Environment variable holding this vendor's key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        })
    }
}

/// Builds the provider for `kind`, falling back to the vendor's public
/// endpoint when no base URL is configured.
pub fn build_provider(
    kind: ProviderKind,
    base_url: Option<&str>,
    api_key: Option<String>,
    timeout: Duration,
) -> Result<Arc<dyn ChatProvider>, LlmError> {
    let base_url = base_url.unwrap_or(kind.default_base_url());
    info!(provider = %kind, base_url = %base_url, "Using chat provider");
    let client = http_client(timeout)?;
    Ok(match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiCompatibleProvider::with_client(
            client, base_url, api_key,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::with_client(
            client, base_url, api_key,
        )),
        ProviderKind::Gemini => Arc::new(GeminiProvider::with_client(client, base_url, api_key)),
    })
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| LlmError::Http(err.to_string()))
}

/// Sends a prepared request and returns the body of a 2xx reply.
async fn send_for_body(builder: reqwest::RequestBuilder) -> Result<String, LlmError> {
    let response = builder
        .send()
        .await
        .map_err(|err| LlmError::Http(err.to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| LlmError::Http(err.to_string()))?;
    if !status.is_success() {
        return Err(LlmError::Api {
            status: status.as_u16(),
            message: format_api_error(&body),
        });
    }
    Ok(body)
}

fn non_blank(api_key: Option<String>) -> Option<String> {
    api_key.filter(|key| !key.trim().is_empty())
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(String),
    #[error("LLM API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("LLM returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// The assistant side of one completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ChatToolCall>,
}

impl ChatReply {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError>;
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self::with_client(http_client(timeout)?, base_url, api_key))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key: non_blank(api_key),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let url = construct_api_url(&self.base_url, "chat/completions");
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "Requesting completion"
        );

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let body = send_for_body(builder).await?;
        let completion: ChatCompletion = serde_json::from_str(&body)
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in completion".to_string()))?;
        debug!(finish_reason = ?choice.finish_reason, "Completion received");

        Ok(ChatReply {
            content: choice.message.content.filter(|text| !text.is_empty()),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Condenses an error body into a single line for display.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "<empty response body>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value).filter(|s| !s.is_empty()) {
            return summary;
        }
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > ERROR_SUMMARY_LIMIT {
        let cut: String = collapsed.chars().take(ERROR_SUMMARY_LIMIT).collect();
        format!("{cut}…")
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatMessage;
    use crate::utils::test_utils::{no_proxy_client, MockHttpServer};
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::new("user", "hello")],
            tools: None,
            max_tokens: Some(100),
        }
    }

    #[test]
    fn format_api_error_prefers_json_summary() {
        let raw = r#"{"error":{"message":"model   overloaded","type":"server_error"}}"#;
        assert_eq!(format_api_error(raw), "model overloaded");
        assert_eq!(format_api_error(r#"{"error":"bad key"}"#), "bad key");
    }

    #[test]
    fn format_api_error_handles_plain_and_empty_bodies() {
        assert_eq!(format_api_error("  gateway\n timeout "), "gateway timeout");
        assert_eq!(format_api_error(""), "<empty response body>");
        assert_eq!(format_api_error(r#"{"status":"failed"}"#), r#"{"status":"failed"}"#);
    }

    #[tokio::test]
    async fn complete_returns_text_and_sends_bearer_request() {
        let server = MockHttpServer::start(
            200,
            json!({"choices": [{"message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}]}),
        )
        .await;
        let provider = OpenAiCompatibleProvider::with_client(
            no_proxy_client(),
            &format!("{}/", server.base_url()),
            Some("sk-test".to_string()),
        );

        let reply = provider.complete(request()).await.expect("complete");
        assert_eq!(reply.text(), "Hi there");
        assert!(!reply.wants_tools());

        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_line, "POST /v1/chat/completions HTTP/1.1");
        assert_eq!(requests[0].body["model"], json!("gpt-4o"));
        assert_eq!(requests[0].body["messages"][0]["role"], json!("user"));
    }

    #[tokio::test]
    async fn complete_parses_tool_calls() {
        let server = MockHttpServer::start(
            200,
            json!({"choices": [{"message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"id": "call_1", "type": "function",
                    "function": {"name": "get_forecast", "arguments": "{\"city\":\"Lyon\"}"}}]
            }}]}),
        )
        .await;
        let provider = OpenAiCompatibleProvider::with_client(no_proxy_client(), &server.base_url(), None);

        let reply = provider.complete(request()).await.expect("complete");
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].function.name, "get_forecast");
    }

    #[tokio::test]
    async fn non_success_status_becomes_api_error() {
        let server = MockHttpServer::start(
            429,
            json!({"error": {"message": "rate limited"}}),
        )
        .await;
        let provider = OpenAiCompatibleProvider::with_client(no_proxy_client(), &server.base_url(), None);

        let err = provider.complete(request()).await.unwrap_err();
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn official_hosts_pick_their_vendor_whatever_the_model() {
        assert_eq!(
            ProviderKind::select("gpt-4o", Some("https://api.anthropic.com/v1")),
            ProviderKind::Anthropic
        );
        assert_eq!(
            ProviderKind::select(
                "my-model",
                Some("https://generativelanguage.googleapis.com/v1beta")
            ),
            ProviderKind::Gemini
        );
        assert_eq!(
            ProviderKind::select("claude-3-5-sonnet", Some("https://api.openai.com/v1")),
            ProviderKind::OpenAi
        );
        assert_eq!(
            ProviderKind::select("gemini-1.5-pro", Some("https://us-central1-aiplatform.ai.googleapis.com")),
            ProviderKind::Gemini
        );
    }

    #[test]
    fn other_hosts_are_treated_as_openai_compatible_proxies() {
        assert_eq!(
            ProviderKind::select("claude-3-opus", Some("http://localhost:4000/v1")),
            ProviderKind::OpenAi
        );
        assert_eq!(
            ProviderKind::select("gemini-pro", Some("https://openrouter.ai/api/v1")),
            ProviderKind::OpenAi
        );
        // Look-alike hosts are not official.
        assert_eq!(
            ProviderKind::select("claude-3-opus", Some("https://evilapi.anthropic.com.example/v1")),
            ProviderKind::OpenAi
        );
    }

    #[test]
    fn model_prefix_decides_without_a_base_url() {
        assert_eq!(ProviderKind::select("gpt-4o-mini", None), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::select("Claude-3-Haiku", None), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::select("gemini-2.0-flash", None), ProviderKind::Gemini);
        assert_eq!(ProviderKind::select("text-bison-001", None), ProviderKind::Gemini);
        assert_eq!(ProviderKind::select("llama3", None), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::select("claude-3", Some("not a url")), ProviderKind::Anthropic);
    }

    #[test]
    fn each_vendor_has_its_own_key_and_endpoint() {
        assert_eq!(ProviderKind::Anthropic.api_key_env(), "ANTHROPIC_API_KEY");
        assert_eq!(ProviderKind::Gemini.api_key_env(), "GEMINI_API_KEY");
        assert_eq!(
            ProviderKind::Anthropic.default_base_url(),
            "https://api.anthropic.com/v1"
        );
        assert_eq!(ProviderKind::Gemini.to_string(), "gemini");
    }

    #[tokio::test]
    async fn empty_choices_are_invalid() {
        let server = MockHttpServer::start(200, json!({"choices": []})).await;
        let provider = OpenAiCompatibleProvider::with_client(no_proxy_client(), &server.base_url(), None);

        assert!(matches!(
            provider.complete(request()).await,
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
