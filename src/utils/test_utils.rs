use crate::api::{ChatRequest, ChatToolCall, ChatToolCallFunction};
use crate::core::config::data::BackendConfig;
use crate::core::llm::{ChatProvider, ChatReply, LlmError};
use crate::mcp::error::McpError;
use crate::mcp::transport::{Connector, Transport, TransportKind};
use async_trait::async_trait;
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How a fake backend answers `tools/call` for one tool.
#[derive(Debug, Clone)]
pub enum FakeToolReply {
    Text(String),
    Error(String),
    /// Never answers.
    Hang,
    /// Breaks the channel as if the process died.
    DropChannel,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    tools: Vec<Value>,
    replies: HashMap<String, FakeToolReply>,
    fail_connect: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, reply: FakeToolReply) -> Self {
        self.tools.push(sample_tool_json(name));
        self.replies.insert(name.to_string(), reply);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    fn reply_to(&self, frame: &Value) -> Reply {
        let Some(id) = frame.get("id").cloned() else {
            return Reply::Nothing;
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or_default();
        let result = match method {
            "initialize" => initialize_result(),
            "tools/list" => json!({ "tools": self.tools }),
            "tools/call" => {
                let name = frame["params"]["name"].as_str().unwrap_or_default();
                match self.replies.get(name) {
                    Some(FakeToolReply::Text(text)) => text_result(text, false),
                    Some(FakeToolReply::Error(text)) => text_result(text, true),
                    Some(FakeToolReply::Hang) => return Reply::Hang,
                    Some(FakeToolReply::DropChannel) => return Reply::Break,
                    None => {
                        return Reply::Frame(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32602, "message": format!("Unknown tool: {name}")}
                        }))
                    }
                }
            }
            _ => json!({}),
        };
        Reply::Frame(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

enum Reply {
    Frame(Value),
    Nothing,
    Hang,
    Break,
}

pub fn sample_tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        }
    })
}

pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": LATEST_PROTOCOL_VERSION,
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "fake-backend", "version": "0.1.0"}
    })
}

pub fn text_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error
    })
}

/// Frames sent by every fake transport, tagged with the backend name.
pub type SentLog = Arc<Mutex<Vec<(String, Value)>>>;

pub struct FakeTransport {
    backend: String,
    script: FakeBackend,
    pending: VecDeque<Value>,
    sent: SentLog,
    hanging: bool,
    broken: bool,
    closed: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LaunchedCommand
    }

    async fn send(&mut self, message: &Value) -> Result<(), McpError> {
        if self.closed {
            return Err(McpError::Closed);
        }
        if self.broken {
            return Err(McpError::Transport("broken pipe".to_string()));
        }
        self.sent
            .lock()
            .expect("sent log")
            .push((self.backend.clone(), message.clone()));
        match self.script.reply_to(message) {
            Reply::Frame(frame) => self.pending.push_back(frame),
            Reply::Nothing => {}
            Reply::Hang => self.hanging = true,
            Reply::Break => self.broken = true,
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Value, McpError> {
        if self.closed {
            return Err(McpError::Closed);
        }
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        if self.broken {
            return Err(McpError::Transport("connection reset".to_string()));
        }
        if self.hanging {
            std::future::pending::<()>().await;
        }
        Err(McpError::Transport("no reply queued".to_string()))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Connector handing out scripted in-memory transports.
#[derive(Clone, Default)]
pub struct FakeConnector {
    backends: HashMap<String, FakeBackend>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
    sent: SentLog,
    open_delay: Duration,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, name: &str, backend: FakeBackend) -> Self {
        self.backends.insert(name.to_string(), backend);
        self
    }

    /// Slows every open down so concurrent connects overlap.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn opens(&self, name: &str) -> usize {
        self.opens
            .lock()
            .expect("opens")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent_methods(&self, name: &str) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent log")
            .iter()
            .filter(|(backend, _)| backend == name)
            .filter_map(|(_, frame)| frame.get("method").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    pub fn sent_frames(&self, name: &str) -> Vec<Value> {
        self.sent
            .lock()
            .expect("sent log")
            .iter()
            .filter(|(backend, _)| backend == name)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        config: &BackendConfig,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, McpError> {
        *self
            .opens
            .lock()
            .expect("opens")
            .entry(config.name.clone())
            .or_default() += 1;
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let script = self
            .backends
            .get(&config.name)
            .cloned()
            .ok_or_else(|| McpError::connect(&config.name, "no such fake backend"))?;
        if script.fail_connect {
            return Err(McpError::connect(&config.name, "connection refused"));
        }
        Ok(Box::new(FakeTransport {
            backend: config.name.clone(),
            script,
            pending: VecDeque::new(),
            sent: self.sent.clone(),
            hanging: false,
            broken: false,
            closed: false,
        }))
    }
}

pub fn fake_backend_config(name: &str) -> BackendConfig {
    BackendConfig::launched_command(name, "fake", &[])
}

/// HTTP client that ignores proxy settings from the environment.
pub fn no_proxy_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("http client")
}

/// When the mock event-stream server drops its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDrop {
    Never,
    OnFirstPost,
    OnToolCall,
}

#[derive(Default)]
struct MockSseState {
    stream_requests: usize,
    stream_opens: usize,
    posted_paths: Vec<String>,
    stream: Option<mpsc::UnboundedSender<String>>,
    reject_next_open: bool,
    refuse_reconnect: bool,
    dropped: bool,
}

/// Minimal tool-provider server speaking JSON-RPC over server-sent events.
///
/// Each accepted stream is a session with its own `/messages?session=N`
/// endpoint; posts to a session whose stream is gone get 404. Servers built
/// with [`MockSseServer::start`] refuse the first stream request after a drop
/// with 503, so the transport's single reconnect attempt fails.
/// [`MockSseServer::start_recovering`] accepts it.
pub struct MockSseServer {
    addr: SocketAddr,
    state: Arc<tokio::sync::Mutex<MockSseState>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockSseServer {
    pub async fn start(drop_mode: StreamDrop) -> Self {
        Self::start_with_tools(drop_mode, vec![sample_tool_json("find_route")]).await
    }

    pub async fn start_with_tools(drop_mode: StreamDrop, tools: Vec<Value>) -> Self {
        Self::spawn(drop_mode, tools, true).await
    }

    pub async fn start_recovering(drop_mode: StreamDrop) -> Self {
        Self::spawn(drop_mode, vec![sample_tool_json("find_route")], false).await
    }

    async fn spawn(drop_mode: StreamDrop, tools: Vec<Value>, refuse_reconnect: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(tokio::sync::Mutex::new(MockSseState {
            refuse_reconnect,
            ..MockSseState::default()
        }));
        let tools = Arc::new(tools);
        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                let tools = tools.clone();
                tokio::spawn(async move {
                    handle_connection(socket, state, drop_mode, tools).await;
                });
            }
        });
        Self { addr, state, task }
    }

    pub fn stream_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    /// Streams that were accepted and handed an endpoint.
    pub async fn stream_opens(&self) -> usize {
        self.state.lock().await.stream_opens
    }

    /// Every `GET` on the stream URL, refused ones included.
    pub async fn stream_requests(&self) -> usize {
        self.state.lock().await.stream_requests
    }

    /// Closes the live stream without any request in flight.
    pub async fn drop_stream(&self) {
        self.state.lock().await.stream = None;
    }

    pub async fn posted_paths(&self) -> Vec<String> {
        self.state.lock().await.posted_paths.clone()
    }
}

impl Drop for MockSseServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    state: Arc<tokio::sync::Mutex<MockSseState>>,
    drop_mode: StreamDrop,
    tools: Arc<Vec<Value>>,
) {
    let Ok(RawRequest {
        line: request_line,
        body,
        ..
    }) = read_http_request(&mut socket).await
    else {
        return;
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    if method == "GET" {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let session = {
            let mut state = state.lock().await;
            state.stream_requests += 1;
            if state.reject_next_open {
                state.reject_next_open = false;
                drop(state);
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
                return;
            }
            state.stream_opens += 1;
            state.stream = Some(tx);
            state.stream_opens
        };
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
        let endpoint = format!("event: endpoint\ndata: /messages?session={session}\n\n");
        if socket.write_all(head.as_bytes()).await.is_err()
            || socket.write_all(endpoint.as_bytes()).await.is_err()
        {
            return;
        }
        let _ = socket.flush().await;
        while let Some(event) = rx.recv().await {
            if socket.write_all(event.as_bytes()).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }
        return;
    }

    let frame: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let rpc_method = frame
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reply = {
        let mut state = state.lock().await;
        let live_path = format!("/messages?session={}", state.stream_opens);
        let live = state.stream.is_some() && path == live_path;
        state.posted_paths.push(path);
        if !live {
            drop(state);
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return;
        }
        let first_post = state.posted_paths.len() == 1;
        let should_drop = !state.dropped
            && match drop_mode {
                StreamDrop::Never => false,
                StreamDrop::OnFirstPost => first_post,
                StreamDrop::OnToolCall => rpc_method == "tools/call",
            };
        if should_drop {
            state.dropped = true;
            state.reject_next_open = state.refuse_reconnect;
            state.stream = None;
            None
        } else {
            mock_reply(&frame, &tools).map(|reply| (reply, state.stream.clone()))
        }
    };

    let _ = socket
        .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;
    let _ = socket.flush().await;

    if let Some((reply, Some(stream))) = reply {
        let _ = stream.send(format!("event: message\ndata: {reply}\n\n"));
    }
}

fn mock_reply(frame: &Value, tools: &[Value]) -> Option<Value> {
    let id = frame.get("id")?.clone();
    let method = frame.get("method").and_then(Value::as_str).unwrap_or_default();
    let result = match method {
        "initialize" => initialize_result(),
        "tools/list" => json!({ "tools": tools }),
        "tools/call" => {
            let name = frame["params"]["name"].as_str().unwrap_or_default();
            text_result(&format!("{name} ok"), false)
        }
        _ => json!({}),
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

struct RawRequest {
    line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

async fn read_http_request(stream: &mut TcpStream) -> Result<RawRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text = std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok(RawRequest {
        line: request_line,
        headers,
        body,
    })
}

/// A request captured by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_line: String,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP server that answers every request with the same status and JSON body.
pub struct MockHttpServer {
    addr: SocketAddr,
    requests: Arc<tokio::sync::Mutex<Vec<CapturedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start(status: u16, body: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let captured = requests.clone();
        let payload = body.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let Ok(request) = read_http_request(&mut socket).await else {
                    continue;
                };
                captured.lock().await.push(CapturedRequest {
                    request_line: request.line,
                    headers: request.headers,
                    body: serde_json::from_slice(&request.body).unwrap_or(Value::Null),
                });
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
            }
        });
        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub async fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One scripted LLM reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    ToolCall { name: String, arguments: String },
    Fail(String),
    Hang,
}

impl ScriptedReply {
    pub fn text(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        ScriptedReply::ToolCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}

/// LLM stub that replays a script and records every request it receives.
///
/// Once the script runs out, the fallback reply (if any) repeats forever.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<ScriptedReply>>>,
    fallback: Option<ScriptedReply>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    pub fn repeating(reply: ScriptedReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests").push(request);
        let next = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .or_else(|| self.fallback.clone());
        match next {
            Some(ScriptedReply::Text(text)) => Ok(ChatReply {
                content: Some(text),
                tool_calls: Vec::new(),
            }),
            Some(ScriptedReply::ToolCall { name, arguments }) => Ok(ChatReply {
                content: None,
                tool_calls: vec![ChatToolCall {
                    id: format!("call_{call}"),
                    kind: "function".to_string(),
                    function: ChatToolCallFunction { name, arguments },
                }],
            }),
            Some(ScriptedReply::Fail(message)) => Err(LlmError::Api {
                status: 500,
                message,
            }),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Err(LlmError::InvalidResponse("unreachable".to_string()))
            }
            None => Err(LlmError::InvalidResponse("script exhausted".to_string())),
        }
    }
}
