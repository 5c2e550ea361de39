//! MCP Client error types.
//!
//! Every failure crossing the client boundary is an [`McpError`] carrying a
//! machine-readable code, a human message, a [`Severity`] and optional
//! structured data. Severity alone decides whether a failure is retried.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::JsonRpcError;

// ─── Error Codes ─────────────────────────────────────────────────────────────

/// Well-known JSON-RPC codes plus the client's private range.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// No live connection to the tool server.
    pub const CONNECTION_ERROR: i32 = -32000;
    /// A request did not complete in time.
    pub const TIMEOUT_ERROR: i32 = -32001;
    /// The named tool does not exist on the server.
    pub const TOOL_NOT_FOUND: i32 = -32002;
    /// The tool ran and reported a failure.
    pub const TOOL_EXECUTION_ERROR: i32 = -32003;
    /// The initialize / tools/list handshake failed.
    pub const INITIALIZATION_ERROR: i32 = -32004;
    /// The peer violated the wire protocol.
    pub const PROTOCOL_ERROR: i32 = -32005;
    /// A transient failure persisted through every retry attempt.
    pub const RETRY_EXHAUSTED: i32 = -32006;
}

// ─── Severity ────────────────────────────────────────────────────────────────

/// How a failure may be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Timeout-class failure; retried by the backoff policy.
    Transient,
    /// The request itself is wrong; the caller must change it.
    Recoverable,
    /// The connection or the client is broken; never retried.
    Permanent,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Transient => "transient",
            Severity::Recoverable => "recoverable",
            Severity::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── McpError ────────────────────────────────────────────────────────────────

/// A classified MCP client failure. Immutable once built.
#[derive(Debug, Clone, Error)]
#[error("{severity} error [{code}]: {message}")]
pub struct McpError {
    pub code: i32,
    pub message: String,
    pub severity: Severity,
    /// Structured diagnostics (tool name, arguments, server data, ...).
    pub data: Map<String, Value>,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl McpError {
    /// Build an error with an explicit severity.
    pub fn new(code: i32, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code,
            message: message.into(),
            severity,
            data: Map::new(),
            cause: None,
        }
    }

    /// A retryable timeout-class failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(error_codes::TIMEOUT_ERROR, message, Severity::Transient)
    }

    /// The connection dropped under an in-flight request; retryable.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(error_codes::CONNECTION_ERROR, message, Severity::Transient)
    }

    /// A failure the caller can fix by changing the request.
    pub fn recoverable(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message, Severity::Recoverable)
    }

    /// A failure that needs reconnection or operator attention.
    pub fn permanent(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message, Severity::Permanent)
    }

    /// The client has no live connection to the tool server.
    pub fn not_connected() -> Self {
        Self::permanent(error_codes::CONNECTION_ERROR, "MCP client not connected")
    }

    /// Attach one diagnostic field.
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Merge a server-supplied `data` value. Objects are flattened, anything
    /// else is kept under `detail`.
    pub fn with_server_data(mut self, data: Option<Value>) -> Self {
        match data {
            Some(Value::Object(map)) => self.data.extend(map),
            Some(Value::Null) | None => {}
            Some(other) => {
                self.data.insert("detail".to_string(), other);
            }
        }
        self
    }

    /// Wrap the underlying cause for diagnostics.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Whether the backoff policy may retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.severity == Severity::Transient
    }

    /// Convert to a JSON-RPC error object: `{code, message, data: {severity, ...}}`.
    pub fn to_json_rpc_error(&self) -> JsonRpcError {
        let mut data = Map::with_capacity(self.data.len() + 1);
        data.insert(
            "severity".to_string(),
            Value::String(self.severity.as_str().to_string()),
        );
        for (k, v) in &self.data {
            data.insert(k.clone(), v.clone());
        }
        JsonRpcError {
            code: self.code,
            message: self.message.clone(),
            data: Some(Value::Object(data)),
        }
    }

    /// The message a call-site presents to the end user.
    pub fn user_message(&self) -> String {
        if self.code == error_codes::RETRY_EXHAUSTED {
            return format!(
                "The navigation system is temporarily unavailable, please try again later. ({})",
                self.message
            );
        }
        match self.severity {
            Severity::Transient => format!(
                "The navigation system is temporarily busy, please try again later. ({})",
                self.message
            ),
            Severity::Recoverable => format!(
                "Cannot execute this request: {}. Please adjust it and try again.",
                self.message
            ),
            Severity::Permanent => format!(
                "Navigation system fault: {}. Please contact an operator.",
                self.message
            ),
        }
    }
}

impl From<JsonRpcError> for McpError {
    /// A server-side JSON-RPC error is a rejection of this request.
    fn from(err: JsonRpcError) -> Self {
        McpError::recoverable(err.code, err.message).with_server_data(err.data)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
