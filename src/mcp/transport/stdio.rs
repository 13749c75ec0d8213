//! Child-process transport shared by piped-script and launched-command
//! backends.
//!
//! Frames are newline-delimited JSON on the child's stdout/stdin. Stdout is
//! read by a background task into a channel so `receive` can be raced
//! against timeouts and cancellation; stderr is drained by its own task into
//! `debug!` events so a chatty backend cannot fill the pipe and stall.

use super::{Transport, TransportKind};
use crate::core::config::data::BackendConfig;
use crate::mcp::error::McpError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Resolves the program and arguments used to start a child backend.
pub fn launch_command(
    config: &BackendConfig,
    kind: TransportKind,
) -> Result<(String, Vec<String>), McpError> {
    match kind {
        TransportKind::PipedScript => {
            let script = config.script.as_deref().ok_or_else(|| {
                McpError::InvalidConfig(format!("backend `{}` has no script", config.name))
            })?;
            let interpreter = script_interpreter(script).ok_or_else(|| {
                McpError::connect(
                    &config.name,
                    format!(
                        "server script must be a .py or .js file: {}",
                        script.display()
                    ),
                )
            })?;
            let mut args = vec![script.display().to_string()];
            args.extend(config.args.iter().cloned());
            Ok((interpreter.to_string(), args))
        }
        TransportKind::LaunchedCommand => {
            let command = config.command.clone().ok_or_else(|| {
                McpError::InvalidConfig(format!("backend `{}` has no command", config.name))
            })?;
            Ok((command, config.args.clone()))
        }
        TransportKind::EventStream => Err(McpError::InvalidConfig(format!(
            "backend `{}` is not a process backend",
            config.name
        ))),
    }
}

/// Picks the interpreter for a script from its extension.
pub fn script_interpreter(script: &Path) -> Option<&'static str> {
    match script
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("py") => Some("python"),
        Some("js") => Some("node"),
        _ => None,
    }
}

pub struct StdioTransport {
    backend: String,
    kind: TransportKind,
    child: Child,
    stdin: Option<ChildStdin>,
    inbound: mpsc::UnboundedReceiver<Value>,
    reader: JoinHandle<()>,
    stderr_drain: JoinHandle<()>,
    write_timeout: Duration,
    closed: bool,
}

impl StdioTransport {
    pub fn spawn(
        config: &BackendConfig,
        kind: TransportKind,
        write_timeout: Duration,
    ) -> Result<Self, McpError> {
        let (program, args) = launch_command(config, kind)?;
        debug!(backend = %config.name, command = %program, args = ?args, "Starting backend process");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::connect(&config.name, format!("{program}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connect(&config.name, "unable to retrieve stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connect(&config.name, "unable to retrieve stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::connect(&config.name, "unable to retrieve stderr"))?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let reader = spawn_stdout_reader(config.name.clone(), stdout, tx);
        let stderr_drain = spawn_stderr_drain(config.name.clone(), stderr);

        Ok(Self {
            backend: config.name.clone(),
            kind,
            child,
            stdin: Some(stdin),
            inbound,
            reader,
            stderr_drain,
            write_timeout,
            closed: false,
        })
    }

    fn exit_description(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("backend process exited ({status})"),
            _ => "backend closed its output stream".to_string(),
        }
    }
}

fn spawn_stdout_reader(
    backend: String,
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value = match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    debug!(backend = %backend, error = %err, line = %trimmed, "Skipping non-JSON stdout line");
                    continue;
                }
            };
            let frames = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            for frame in frames {
                if tx.send(frame).is_err() {
                    return;
                }
            }
        }
        debug!(backend = %backend, "Backend stdout closed");
    })
}

fn spawn_stderr_drain(backend: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(backend = %backend, "stderr: {}", line);
        }
    })
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&mut self, message: &Value) -> Result<(), McpError> {
        if self.closed {
            return Err(McpError::Closed);
        }
        let mut payload =
            serde_json::to_vec(message).map_err(|err| McpError::Protocol(err.to_string()))?;
        payload.push(b'\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(McpError::Closed);
        };
        let write = async {
            stdin.write_all(&payload).await?;
            stdin.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                debug!(backend = %self.backend, bytes = payload.len(), "Wrote frame to backend");
                Ok(())
            }
            Ok(Err(err)) => Err(McpError::Transport(format!(
                "write to `{}` failed: {err}",
                self.backend
            ))),
            Err(_) => Err(McpError::timeout(
                format!("write to `{}`", self.backend),
                self.write_timeout,
            )),
        }
    }

    async fn receive(&mut self) -> Result<Value, McpError> {
        if self.closed {
            return Err(McpError::Closed);
        }
        match self.inbound.recv().await {
            Some(frame) => Ok(frame),
            None => Err(McpError::Transport(self.exit_description())),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Closing stdin is the polite shutdown signal for stdio servers.
        self.stdin.take();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(backend = %self.backend, status = %status, "Backend process exited")
            }
            _ => {
                if let Err(err) = self.child.kill().await {
                    warn!(backend = %self.backend, error = %err, "Failed to kill backend process");
                }
            }
        }
        self.reader.abort();
        self.stderr_drain.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the reader tasks would otherwise
        // linger until the pipes close.
        self.reader.abort();
        self.stderr_drain.abort();
    }
}
