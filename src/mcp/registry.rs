//! Named backend sessions, connected lazily or at startup.

use crate::core::config::data::BackendConfig;
use crate::mcp::error::McpError;
use crate::mcp::session::{BackendSession, SessionState};
use crate::mcp::transport::Connector;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STARTUP_CONCURRENCY_LIMIT: usize = 3;

type Slot = Arc<Mutex<Option<Arc<BackendSession>>>>;

/// Outcome of connecting one backend during preload.
#[derive(Debug)]
pub struct PreloadResult {
    pub name: String,
    pub result: Result<usize, McpError>,
}

/// Snapshot of a backend for listings.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub config: BackendConfig,
    pub state: SessionState,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

/// What a slot holds when looked at without waiting for its lock.
enum SlotView {
    Busy,
    Empty,
    Session(Arc<BackendSession>),
}

pub struct SessionRegistry {
    backends: Vec<BackendConfig>,
    connector: Arc<dyn Connector>,
    timeout: Duration,
    slots: HashMap<String, Slot>,
}

impl SessionRegistry {
    /// `backends` keep their declaration order for listings and defaults.
    pub fn new(
        backends: Vec<BackendConfig>,
        connector: Arc<dyn Connector>,
        timeout: Duration,
    ) -> Self {
        let slots = backends
            .iter()
            .map(|backend| (backend.name.clone(), Arc::new(Mutex::new(None))))
            .collect();
        Self {
            backends,
            connector,
            timeout,
            slots,
        }
    }

    /// Every configured backend, regardless of connection state.
    pub fn list_available(&self) -> &[BackendConfig] {
        &self.backends
    }

    pub fn names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|backend| backend.name == name)
    }

    fn slot(&self, name: &str) -> Result<&Slot, McpError> {
        self.slots.get(name).ok_or_else(|| McpError::UnknownBackend {
            name: name.to_string(),
            available: self.names(),
        })
    }

    /// Returns the ready session for `name`, connecting a fresh one when
    /// there is none or the previous one is no longer ready.
    ///
    /// Calls for the same name are serialized, so concurrent callers share a
    /// single connection.
    pub async fn ensure_connected(&self, name: &str) -> Result<Arc<BackendSession>, McpError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            let state = existing.state().await;
            if state == SessionState::Ready {
                return Ok(existing.clone());
            }
            debug!(
                backend = %name,
                generation = existing.generation(),
                state = %state,
                "Replacing stale session"
            );
            existing.disconnect().await;
        }

        let config = self
            .descriptor(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownBackend {
                name: name.to_string(),
                available: self.names(),
            })?;
        let session = Arc::new(BackendSession::new(config, self.timeout));
        // The failed session stays in the slot so its error can be listed.
        *guard = Some(session.clone());
        session.connect(self.connector.as_ref()).await?;
        Ok(session)
    }

    /// Best-effort startup connect. Failures are logged and returned, never
    /// raised; unknown names are reported the same way.
    pub async fn preload(&self, names: &[String]) -> Vec<PreloadResult> {
        let results = stream::iter(names.iter().cloned())
            .map(|name| async move {
                let result = match self.ensure_connected(&name).await {
                    Ok(session) => session.list_tools().await.map(|tools| tools.len()),
                    Err(err) => Err(err),
                };
                PreloadResult { name, result }
            })
            .buffer_unordered(STARTUP_CONCURRENCY_LIMIT)
            .collect::<Vec<_>>()
            .await;

        for preload in &results {
            match &preload.result {
                Ok(tools) => info!(backend = %preload.name, tools, "Preloaded backend"),
                Err(err) => warn!(backend = %preload.name, error = %err, "Preload failed"),
            }
        }
        results
    }

    /// Drops whatever session exists for `name` and connects a new one.
    pub async fn reconnect(&self, name: &str) -> Result<Arc<BackendSession>, McpError> {
        {
            let slot = self.slot(name)?;
            let mut guard = slot.lock().await;
            if let Some(existing) = guard.take() {
                existing.disconnect().await;
            }
        }
        self.ensure_connected(name).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.take() {
            existing.disconnect().await;
        }
        Ok(())
    }

    /// Disconnects every session. Used on exit.
    pub async fn shutdown(&self) {
        for backend in &self.backends {
            if let Err(err) = self.disconnect(&backend.name).await {
                debug!(backend = %backend.name, error = %err, "Shutdown skipped backend");
            }
        }
    }

    /// The current session for `name`, if one was ever created.
    pub async fn session(&self, name: &str) -> Option<Arc<BackendSession>> {
        let slot = self.slots.get(name)?;
        slot.lock().await.clone()
    }

    fn peek(&self, name: &str) -> SlotView {
        let Some(slot) = self.slots.get(name) else {
            return SlotView::Empty;
        };
        match slot.try_lock() {
            Ok(guard) => guard.clone().map_or(SlotView::Empty, SlotView::Session),
            Err(_) => SlotView::Busy,
        }
    }

    /// Current state of `name`. A slot held by a connect in progress reads as
    /// `Connecting` instead of waiting for the handshake to finish.
    pub async fn session_state(&self, name: &str) -> SessionState {
        match self.peek(name) {
            SlotView::Busy => SessionState::Connecting,
            SlotView::Empty => SessionState::Disconnected,
            SlotView::Session(session) => session.state().await,
        }
    }

    /// Listing snapshot; never waits on a backend that is still connecting.
    pub async fn status(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::with_capacity(self.backends.len());
        for config in &self.backends {
            let (state, tool_count, last_error) = match self.peek(&config.name) {
                SlotView::Busy => (SessionState::Connecting, 0, None),
                SlotView::Empty => (SessionState::Disconnected, 0, None),
                SlotView::Session(session) => (
                    session.state().await,
                    session.list_tools().await.map(|tools| tools.len()).unwrap_or(0),
                    session.last_error().await,
                ),
            };
            statuses.push(BackendStatus {
                config: config.clone(),
                state,
                tool_count,
                last_error,
            });
        }
        statuses
    }
}
