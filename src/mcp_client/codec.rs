//! Line-delimited JSON-RPC framing.
//!
//! One JSON object per `\n`-terminated UTF-8 line, no batching. The codec
//! does not interpret method semantics.

use serde::Serialize;
use serde_json::Value;

use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// A decoded line received from the peer.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated notification (no `id`).
    Notification(JsonRpcNotification),
    /// Server-initiated request (has both `id` and `method`).
    Request(JsonRpcRequest),
}

/// Why a line could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a JSON-RPC 2.0 message: {0}")]
    NotJsonRpc(String),
}

/// Serialize a message and append the line terminator.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (surrounding whitespace and the terminator are ignored).
pub fn decode_line(line: &str) -> Result<IncomingMessage, DecodeError> {
    let value: Value = serde_json::from_str(line.trim())?;

    let Some(obj) = value.as_object() else {
        return Err(DecodeError::NotJsonRpc("top-level value is not an object".into()));
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(DecodeError::NotJsonRpc("missing jsonrpc: \"2.0\"".into()));
    }

    let has_method = obj.contains_key("method");
    let has_id = obj.get("id").is_some_and(|id| !id.is_null());

    let message = match (has_method, has_id) {
        (true, true) => IncomingMessage::Request(serde_json::from_value(value)?),
        (true, false) => IncomingMessage::Notification(serde_json::from_value(value)?),
        (false, _) => {
            if !obj.contains_key("result") && !obj.contains_key("error") {
                return Err(DecodeError::NotJsonRpc(
                    "response carries neither result nor error".into(),
                ));
            }
            IncomingMessage::Response(serde_json::from_value(value)?)
        }
    };

    Ok(message)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
