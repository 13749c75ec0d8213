//! Event-stream transport (JSON-RPC over HTTP server-sent events).
//!
//! The client holds a long-lived `GET` open on the stream URL. The server's
//! first `endpoint` event names the URL that outbound frames are `POST`ed to;
//! replies come back as `message` events on the stream. Servers that answer
//! a `POST` inline (JSON or a short event-stream body) are also accepted.

use super::{Transport, TransportKind};
use crate::core::config::data::BackendConfig;
use crate::mcp::error::McpError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

const CONNECT_TIMEOUT_SECONDS: u64 = 10;
const POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;

/// Builds the HTTP client shared by event-stream backends.
///
/// No overall request timeout is set because the stream request stays open
/// for the life of the session; outbound posts carry their own timeout.
pub fn build_event_stream_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| McpError::InvalidConfig(format!("unable to build HTTP client: {err}")))
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case(EVENT_STREAM_ACCEPT))
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental server-sent-event decoder that tolerates arbitrary chunk
/// boundaries.
#[derive(Default)]
pub struct SseEventBuffer {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        self.drain(false)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr::memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buffer[search_index..line_end]).into_owned();
            self.accept_line(&line, &mut events);
            search_index = newline_index + 1;
        }
        self.buffer.drain(..search_index);

        if flush {
            if !self.buffer.is_empty() {
                let line = String::from_utf8_lossy(&self.buffer).into_owned();
                self.accept_line(&line, &mut events);
                self.buffer.clear();
            }
            self.dispatch(&mut events);
        }
        events
    }

    fn accept_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
        });
        self.data.clear();
    }
}

#[derive(Debug)]
enum SseInbound {
    Endpoint(String),
    Message(Value),
    Dropped(String),
}

struct StreamHandle {
    inbound: mpsc::UnboundedReceiver<SseInbound>,
    listener: JoinHandle<()>,
    endpoint: Url,
    early: Vec<Value>,
}

pub struct SseTransport {
    backend: String,
    client: reqwest::Client,
    stream_url: Url,
    headers: HashMap<String, String>,
    timeout: Duration,
    endpoint: Url,
    inbound: mpsc::UnboundedReceiver<SseInbound>,
    listener: JoinHandle<()>,
    pending: VecDeque<Value>,
    /// Last request POSTed and not yet answered; replayed after a reconnect.
    in_flight: Option<Value>,
    reconnect_used: bool,
    closed: bool,
}

impl SseTransport {
    pub async fn connect(
        client: reqwest::Client,
        config: &BackendConfig,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let url = config.url.as_deref().ok_or_else(|| {
            McpError::InvalidConfig(format!("backend `{}` has no url", config.name))
        })?;
        let stream_url = Url::parse(url).map_err(|err| McpError::connect(&config.name, err))?;
        debug!(backend = %config.name, url = %stream_url, "Opening event stream");

        let handle = open_stream(&client, &config.name, &stream_url, &config.headers, timeout)
            .await
            .map_err(|err| McpError::connect(&config.name, err))?;

        Ok(Self {
            backend: config.name.clone(),
            client,
            stream_url,
            headers: config.headers.clone(),
            timeout,
            endpoint: handle.endpoint,
            inbound: handle.inbound,
            listener: handle.listener,
            pending: handle.early.into(),
            in_flight: None,
            reconnect_used: false,
            closed: false,
        })
    }

    async fn reopen(&mut self) -> Result<(), McpError> {
        self.listener.abort();
        let handle = open_stream(
            &self.client,
            &self.backend,
            &self.stream_url,
            &self.headers,
            self.timeout,
        )
        .await?;
        self.endpoint = handle.endpoint;
        self.inbound = handle.inbound;
        self.listener = handle.listener;
        for frame in handle.early {
            self.queue_frames(frame);
        }
        Ok(())
    }

    /// Spends the single reconnect allowance. A second drop before any
    /// message arrives is a transport error.
    async fn reconnect(&mut self, reason: &str) -> Result<(), McpError> {
        if self.reconnect_used {
            return Err(McpError::Transport(format!(
                "event stream to `{}` dropped: {reason}",
                self.backend
            )));
        }
        self.reconnect_used = true;
        warn!(backend = %self.backend, reason = %reason, "Event stream dropped; reconnecting once");
        self.reopen().await.map_err(|err| {
            McpError::Transport(format!(
                "event stream to `{}` dropped ({reason}) and reconnect failed: {err}",
                self.backend
            ))
        })
    }

    /// Handles whatever the listener queued while no call was waiting, so a
    /// stream that dropped between calls is reopened before the next `POST`.
    async fn recover_idle_drop(&mut self) -> Result<(), McpError> {
        loop {
            match self.inbound.try_recv() {
                Ok(SseInbound::Message(value)) => self.accept_message(value),
                Ok(SseInbound::Endpoint(path)) => self.update_endpoint(&path),
                Ok(SseInbound::Dropped(reason)) => return self.reconnect(&reason).await,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return self.reconnect("event stream listener stopped").await
                }
            }
        }
    }

    fn update_endpoint(&mut self, path: &str) {
        if let Ok(endpoint) = self.stream_url.join(path) {
            self.endpoint = endpoint;
        }
    }

    fn accept_message(&mut self, value: Value) {
        self.reconnect_used = false;
        self.queue_frames(value);
    }

    fn queue_frames(&mut self, value: Value) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.queue_frame(item);
                }
            }
            other => self.queue_frame(other),
        }
    }

    fn queue_frame(&mut self, frame: Value) {
        let answers_in_flight = self.in_flight.as_ref().is_some_and(|request| {
            frame.get("method").is_none() && frame.get("id") == request.get("id")
        });
        if answers_in_flight {
            self.in_flight = None;
        }
        self.pending.push_back(frame);
    }

    async fn post(&mut self, message: &Value) -> Result<(), McpError> {
        let request = apply_headers(
            self.client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .header(ACCEPT, JSON_AND_SSE_ACCEPT),
            &self.headers,
        )
        .timeout(self.timeout)
        .json(message);

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                McpError::timeout(format!("POST to `{}`", self.backend), self.timeout)
            } else {
                McpError::Transport(err.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "POST {} returned HTTP {status}",
                self.endpoint
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|err| McpError::Transport(err.to_string()))?;

        if is_event_stream_content_type(&content_type) {
            let mut buffer = SseEventBuffer::default();
            let mut events = buffer.push(&body);
            events.extend(buffer.finish());
            for event in events.into_iter().filter(|event| event.event == "message") {
                if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                    self.queue_frames(value);
                }
            }
        } else if let Ok(value) = serde_json::from_slice::<Value>(&body) {
            // Legacy servers answer "Accepted"; only JSON bodies are frames.
            if value.is_object() || value.is_array() {
                self.queue_frames(value);
            }
        }
        Ok(())
    }
}

fn is_request(message: &Value) -> bool {
    message.get("id").is_some() && message.get("method").is_some()
}

fn apply_headers(
    mut request: reqwest::RequestBuilder,
    headers: &HashMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

async fn open_stream(
    client: &reqwest::Client,
    backend: &str,
    stream_url: &Url,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> Result<StreamHandle, McpError> {
    let request = apply_headers(
        client
            .get(stream_url.clone())
            .header(ACCEPT, EVENT_STREAM_ACCEPT)
            .header(CACHE_CONTROL, "no-cache"),
        headers,
    );
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| McpError::timeout("event stream", timeout))?
        .map_err(|err| McpError::Transport(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(McpError::Transport(format!(
            "event stream returned HTTP {status}"
        )));
    }

    let (tx, mut inbound) = mpsc::unbounded_channel();
    let listener = spawn_listener(backend.to_string(), response, tx);

    let mut early = Vec::new();
    let waited = tokio::time::timeout(timeout, async {
        loop {
            match inbound.recv().await {
                Some(SseInbound::Endpoint(path)) => return Ok(path),
                Some(SseInbound::Message(value)) => early.push(value),
                Some(SseInbound::Dropped(reason)) => return Err(reason),
                None => return Err("event stream listener stopped".to_string()),
            }
        }
    })
    .await;

    let path = match waited {
        Ok(Ok(path)) => path,
        Ok(Err(reason)) => {
            listener.abort();
            return Err(McpError::Transport(format!(
                "event stream closed before announcing an endpoint: {reason}"
            )));
        }
        Err(_) => {
            listener.abort();
            return Err(McpError::timeout("endpoint event", timeout));
        }
    };
    let endpoint = stream_url
        .join(&path)
        .map_err(|err| McpError::Protocol(format!("invalid endpoint `{path}`: {err}")))?;
    debug!(backend = %backend, endpoint = %endpoint, "Event stream ready");

    Ok(StreamHandle {
        inbound,
        listener,
        endpoint,
        early,
    })
}

fn spawn_listener(
    backend: String,
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<SseInbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buffer = SseEventBuffer::default();
        let reason = loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    for event in buffer.push(&chunk) {
                        if !forward_event(&backend, &tx, event) {
                            return;
                        }
                    }
                }
                Some(Err(err)) => break err.to_string(),
                None => {
                    for event in buffer.finish() {
                        if !forward_event(&backend, &tx, event) {
                            return;
                        }
                    }
                    break "stream ended".to_string();
                }
            }
        };
        debug!(backend = %backend, reason = %reason, "Event stream dropped");
        let _ = tx.send(SseInbound::Dropped(reason));
    })
}

fn forward_event(backend: &str, tx: &mpsc::UnboundedSender<SseInbound>, event: SseEvent) -> bool {
    let inbound = match event.event.as_str() {
        "endpoint" => SseInbound::Endpoint(event.data.trim().to_string()),
        "message" => match serde_json::from_str::<Value>(&event.data) {
            Ok(value) => SseInbound::Message(value),
            Err(err) => {
                debug!(backend = %backend, error = %err, "Skipping malformed event payload");
                return true;
            }
        },
        other => {
            debug!(backend = %backend, event = %other, "Ignoring event");
            return true;
        }
    };
    tx.send(inbound).is_ok()
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn send(&mut self, message: &Value) -> Result<(), McpError> {
        if self.closed {
            return Err(McpError::Closed);
        }
        self.recover_idle_drop().await?;
        if is_request(message) {
            self.in_flight = Some(message.clone());
        }

        match self.post(message).await {
            Ok(()) => Ok(()),
            // The session behind the endpoint may be gone even though the
            // listener has not noticed the drop yet.
            Err(McpError::Transport(reason)) if !self.reconnect_used => {
                self.reconnect(&reason).await?;
                self.post(message).await
            }
            Err(err) => Err(err),
        }
    }

    async fn receive(&mut self) -> Result<Value, McpError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            if self.closed {
                return Err(McpError::Closed);
            }
            let reason = match self.inbound.recv().await {
                Some(SseInbound::Message(value)) => {
                    self.accept_message(value);
                    continue;
                }
                Some(SseInbound::Endpoint(path)) => {
                    self.update_endpoint(&path);
                    continue;
                }
                Some(SseInbound::Dropped(reason)) => reason,
                None => "event stream listener stopped".to_string(),
            };

            self.reconnect(&reason).await?;
            // The old session took the request with it.
            if let Some(request) = self.in_flight.clone() {
                debug!(backend = %self.backend, "Replaying in-flight request on the new stream");
                self.post(&request).await?;
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener.abort();
        self.inbound.close();
        self.pending.clear();
        self.in_flight = None;
        debug!(backend = %self.backend, "Event stream closed");
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
