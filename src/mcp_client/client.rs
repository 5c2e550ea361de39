//! MCP Client — high-level interface for tool execution.
//!
//! Owns at most one live [`Connection`] to the navigation tool server and
//! keeps it healthy with a heartbeat. Callers share the service by cloning
//! it; concurrent tool calls multiplex over the same connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::backoff::{retry_transient, Backoff, BackoffConfig};
use super::errors::{error_codes, McpError};
use super::heartbeat::{HeartbeatMonitor, HeartbeatSettings, HeartbeatTarget};
use super::lifecycle::{Connection, TeardownTimeouts};
use super::transport::extract_result;
use super::types::{
    CallToolResult, ClientConfig, ConnectionInfo, ConnectionState, ServerConfig, ToolCallResult,
    ToolDescriptor, ToolOutput,
};

// ─── McpClientService ────────────────────────────────────────────────────────

/// Client for one stdio tool server.
#[derive(Clone)]
pub struct McpClientService {
    inner: Arc<ServiceInner>,
    retry: BackoffConfig,
}

struct ServiceInner {
    server: ServerConfig,
    config: ClientConfig,
    state: StdMutex<ConnectionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serialises connect, disconnect and reconnect.
    lifecycle: Mutex<()>,
    heartbeat: StdMutex<Option<HeartbeatMonitor>>,
    generation: AtomicU64,
}

impl McpClientService {
    pub fn new(server: ServerConfig, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                server,
                config,
                state: StdMutex::new(ConnectionState::Disconnected),
                connection: RwLock::new(None),
                lifecycle: Mutex::new(()),
                heartbeat: StdMutex::new(None),
                generation: AtomicU64::new(0),
            }),
            retry: BackoffConfig::default(),
        }
    }

    /// Replace the backoff curve used by [`call_tool_with_retry`](Self::call_tool_with_retry).
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server, complete the handshake and start the heartbeat.
    ///
    /// A no-op when already connected. On failure the service stays
    /// `Disconnected` and the error is permanent.
    ///
    /// The heartbeat is started and stopped only under the lifecycle lock,
    /// so once `disconnect` returns no monitor survives it.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.connect_locked().await?;
        self.start_heartbeat();
        Ok(())
    }

    /// Stop the heartbeat and tear the server down. Always succeeds.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        // The monitor may be parked on the lifecycle lock inside its own
        // reconnect; aborting drops that wait.
        self.stop_heartbeat().await;
        self.inner.teardown_locked().await;
    }

    /// Tear down, pause for the reconnect delay, connect again.
    pub async fn reconnect(&self) -> Result<(), McpError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_heartbeat().await;
        self.inner.reconnect_locked().await?;
        self.start_heartbeat();
        Ok(())
    }

    /// Alias of [`disconnect`](Self::disconnect) for process shutdown paths.
    pub async fn shutdown(&self) {
        self.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        let state = *lock(&self.inner.state);
        if state == ConnectionState::Connected && self.inner.live_connection().is_none() {
            return ConnectionState::Disconnected;
        }
        state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.live_connection().map(|c| c.info())
    }

    /// Tools advertised by the live server; empty when disconnected.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.inner
            .live_connection()
            .map(|c| c.tools().to_vec())
            .unwrap_or_default()
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke a tool once.
    ///
    /// Timeouts and connection loss mid-call are transient; server-side
    /// rejections are recoverable and keep the server's code; calling
    /// while disconnected is permanent and sends nothing.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let conn = self
            .inner
            .live_connection()
            .ok_or_else(McpError::not_connected)?;
        let timeout = self.inner.config.tool_call_timeout();
        let start = Instant::now();

        tracing::info!(tool = tool_name, generation = conn.generation(), "calling tool");

        let params = json!({ "name": tool_name, "arguments": &arguments });
        let response = conn
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| annotate_call_error(e, tool_name, &arguments, timeout))?;

        let result = extract_result(response).map_err(|e| e.with_data("tool_name", tool_name))?;
        let call: CallToolResult = serde_json::from_value(result.clone()).map_err(|e| {
            McpError::recoverable(
                error_codes::PROTOCOL_ERROR,
                format!("malformed tools/call result: {e}"),
            )
            .with_data("tool_name", tool_name)
        })?;

        let text = call.joined_text().ok_or_else(|| {
            McpError::recoverable(error_codes::PROTOCOL_ERROR, "No content in response")
                .with_data("tool_name", tool_name)
        })?;

        let execution_time_ms = start.elapsed().as_millis() as u64;

        if call.is_error {
            let output = ToolOutput::from_text(text.clone());
            let message = output
                .as_json()
                .and_then(|v| v.get("error").or_else(|| v.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(text);
            tracing::warn!(tool = tool_name, execution_time_ms, error = %message, "tool reported an error");
            let mut err = McpError::recoverable(error_codes::TOOL_EXECUTION_ERROR, message)
                .with_data("tool_name", tool_name);
            if let ToolOutput::Json(body) = output {
                err = err.with_data("content", body);
            }
            return Err(err);
        }

        tracing::info!(tool = tool_name, execution_time_ms, "tool call succeeded");

        Ok(ToolCallResult {
            tool_name: tool_name.to_string(),
            output: ToolOutput::from_text(text),
            raw: result,
            execution_time_ms,
        })
    }

    /// [`call_tool`](Self::call_tool) wrapped in exponential backoff.
    ///
    /// Only transient failures are retried. Exhaustion yields
    /// `RETRY_EXHAUSTED` with the last failure as its cause.
    pub async fn call_tool_with_retry(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let mut backoff = Backoff::new(self.retry.clone());
        retry_transient(&mut backoff, tool_name, || {
            self.call_tool(tool_name, arguments.clone())
        })
        .await
    }

    // ─── Heartbeat ───────────────────────────────────────────────────────

    /// Caller holds the lifecycle lock.
    fn start_heartbeat(&self) {
        let config = &self.inner.config;
        if !config.heartbeat_enabled {
            return;
        }

        let mut slot = lock(&self.inner.heartbeat);
        if slot.as_ref().is_some_and(|m| !m.is_finished()) {
            return;
        }

        let settings = HeartbeatSettings {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
            max_failures: config.heartbeat_max_failures,
        };
        *slot = Some(HeartbeatMonitor::spawn(Arc::downgrade(&self.inner), settings));
    }

    /// Caller holds the lifecycle lock.
    async fn stop_heartbeat(&self) {
        let monitor = lock(&self.inner.heartbeat).take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }
}

// ─── ServiceInner ────────────────────────────────────────────────────────────

impl ServiceInner {
    fn live_connection(&self) -> Option<Arc<Connection>> {
        let slot = self
            .connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().filter(|c| c.is_alive()).cloned()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Caller holds the lifecycle lock.
    async fn connect_locked(&self) -> Result<(), McpError> {
        if self.live_connection().is_some() {
            tracing::debug!("connect requested while connected, ignoring");
            return Ok(());
        }

        // A connection whose server already died still owns a process handle.
        self.teardown_locked().await;

        self.set_state(ConnectionState::Connecting);
        let generation = self.generation.load(Ordering::Acquire) + 1;

        match Connection::open(&self.server, &self.config, generation).await {
            Ok(conn) => {
                let info = conn.info();
                *self
                    .connection
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(conn));
                self.generation.store(generation, Ordering::Release);
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    generation,
                    pid = ?info.pid,
                    server = ?info.server_name,
                    tools = info.tool_count,
                    "connected to tool server"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                tracing::error!(error = %e, command = %self.server.command, "failed to connect");
                Err(e)
            }
        }
    }

    /// Caller holds the lifecycle lock.
    async fn teardown_locked(&self) {
        let conn = self
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.set_state(ConnectionState::Disconnected);

        if let Some(conn) = conn {
            let path = conn.shutdown(TeardownTimeouts::from(&self.config)).await;
            tracing::info!(generation = conn.generation(), ?path, "disconnected from tool server");
        }
    }

    /// Caller holds the lifecycle lock.
    async fn reconnect_locked(&self) -> Result<(), McpError> {
        self.teardown_locked().await;
        tokio::time::sleep(self.config.reconnect_delay()).await;
        self.connect_locked().await
    }

}

impl HeartbeatTarget for ServiceInner {
    async fn probe(&self, timeout: Duration) -> Result<(), McpError> {
        let conn = self.live_connection().ok_or_else(McpError::not_connected)?;
        let response = conn.request("tools/list", Some(json!({})), timeout).await?;
        extract_result(response).map(|_| ())
    }

    async fn reconnect(&self) -> Result<(), McpError> {
        let _guard = self.lifecycle.lock().await;
        self.reconnect_locked().await
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.heartbeat).take() {
            monitor.abort();
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn annotate_call_error(err: McpError, tool_name: &str, arguments: &Value, timeout: Duration) -> McpError {
    if err.code == error_codes::TIMEOUT_ERROR {
        return McpError::transient(format!(
            "Tool call timed out after {}s",
            timeout.as_secs_f64()
        ))
        .with_data("tool_name", tool_name)
        .with_data("arguments", arguments.clone())
        .with_data("timeout_ms", timeout.as_millis() as u64)
        .with_cause(err);
    }
    err.with_data("tool_name", tool_name)
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
