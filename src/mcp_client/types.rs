//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is `None` only for errors the peer could not attribute to a request
/// (e.g. a parse error); such responses never match a pending entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    /// `Some(Value::Null)` for `"result": null`; `None` only when absent.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool advertised by the server in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One item of a `tools/call` result's `content` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Option<Vec<ContentItem>>,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenated text of every text item, or `None` when there is no content.
    pub fn joined_text(&self) -> Option<String> {
        let items = self.content.as_ref()?;
        Some(items.iter().filter_map(|c| c.text.as_deref()).collect())
    }
}

// ─── Client-side results ─────────────────────────────────────────────────────

/// Decoded output of a successful tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    /// The text content parsed as JSON.
    Json(Value),
    /// The text content as-is.
    Text(String),
}

impl ToolOutput {
    /// Decode concatenated text content, preferring JSON.
    pub fn from_text(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => ToolOutput::Json(value),
            Err(_) => ToolOutput::Text(text),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ToolOutput::Json(v) => Some(v),
            ToolOutput::Text(_) => None,
        }
    }
}

/// Result of a successful tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub output: ToolOutput,
    /// The untouched `result` object from the server.
    pub raw: Value,
    pub execution_time_ms: u64,
}

// ─── Server launch configuration ─────────────────────────────────────────────

/// How to launch the tool server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    pub cwd: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "navsim-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Timeouts and handshake identity for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection_timeout_ms: u64,
    pub tool_call_timeout_ms: u64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Consecutive probe failures that trigger a reconnect.
    pub heartbeat_max_failures: u32,
    /// Pause between teardown and respawn during a reconnect.
    pub reconnect_delay_ms: u64,
    /// Grace period after closing stdin before SIGTERM.
    pub exit_timeout_ms: u64,
    /// Grace period after SIGTERM before SIGKILL.
    pub terminate_timeout_ms: u64,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            tool_call_timeout_ms: 30_000,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 5_000,
            heartbeat_max_failures: 3,
            reconnect_delay_ms: 2_000,
            exit_timeout_ms: 5_000,
            terminate_timeout_ms: 2_000,
            protocol_version: "2025-03-26".to_string(),
            client_name: "navlink".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

// ─── Connection status ───────────────────────────────────────────────────────

/// Where the client is in its connect/disconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Increments on every successful connect, including heartbeat reconnects.
    pub generation: u64,
    pub pid: Option<u32>,
    pub connected_at: DateTime<Utc>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tool_count: usize,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
