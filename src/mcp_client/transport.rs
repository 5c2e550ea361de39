//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with the tool server child process:
//! - Writing newline-delimited JSON-RPC requests to stdin (serialised)
//! - A background reader loop draining stdout into the [`Correlator`]
//! - Per-connection monotonically increasing request IDs starting at 1

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::codec::{decode_line, encode_line, IncomingMessage};
use super::correlator::Correlator;
use super::errors::{error_codes, McpError};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    correlator: Arc<Correlator>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Wrap a writer/reader pair and start the reader loop.
    pub fn start<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let correlator = Arc::new(Correlator::new());
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&correlator),
            Arc::clone(&alive),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            correlator,
            alive,
            next_id: AtomicU64::new(1),
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }
    }

    /// Allocate the next request ID for this connection.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// False once stdout closed, the transport was shut down, or a write stalled.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` bounds the write and the wait together. On timeout the
    /// pending entry is discarded; a late response is dropped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let line = encode_line(&req).map_err(|e| {
            McpError::permanent(
                error_codes::INTERNAL_ERROR,
                format!("failed to serialize request: {e}"),
            )
            .with_cause(e)
        })?;

        let pending = self.correlator.register(id)?;
        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, self.write_line(&line)).await {
            Ok(result) => result?,
            Err(_) => {
                // A cancelled write may have left half a line on the pipe.
                self.mark_dead("stdin write stalled");
                return Err(timeout_error(method, id, timeout));
            }
        }

        tracing::trace!(server = %self.server_name, id, method, "request sent");

        match tokio::time::timeout_at(deadline, pending.wait()).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(method, id, timeout)),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = encode_line(&notification).map_err(|e| {
            McpError::permanent(
                error_codes::INTERNAL_ERROR,
                format!("failed to serialize notification: {e}"),
            )
        })?;
        self.write_line(&line).await
    }

    /// Stop the reader loop, close stdin and fail every waiter.
    pub async fn close(&self) {
        let handle = self.lock_reader_task().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.alive.store(false, Ordering::Release);
        self.correlator.close();
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(w) if self.is_alive() => w,
            _ => {
                return Err(McpError::connection_lost("connection closed")
                    .with_data("server", self.server_name.clone()));
            }
        };

        writer.write_all(line.as_bytes()).await.map_err(|e| {
            McpError::connection_lost(format!("failed to write to stdin: {e}")).with_cause(e)
        })?;
        writer.flush().await.map_err(|e| {
            McpError::connection_lost(format!("failed to flush stdin: {e}")).with_cause(e)
        })?;

        Ok(())
    }

    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::warn!(server = %self.server_name, reason, "transport marked dead");
        }
    }

    fn lock_reader_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_reader_task().take() {
            handle.abort();
        }
    }
}

// ─── Reader Loop ─────────────────────────────────────────────────────────────

/// Drain the server's stdout, resolving pending requests until EOF.
async fn read_loop<R>(
    server_name: String,
    reader: R,
    correlator: Arc<Correlator>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::warn!(server = %server_name, "server stdout closed");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_line(&server_name, &line, &correlator);
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read from stdout");
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    correlator.close();
}

fn dispatch_line(server_name: &str, line: &str, correlator: &Correlator) {
    match decode_line(line) {
        Ok(IncomingMessage::Response(resp)) => match resp.id {
            Some(id) => {
                correlator.resolve(id, resp);
            }
            None => {
                tracing::warn!(
                    server = %server_name,
                    error = ?resp.error,
                    "server returned an error for an unidentified request"
                );
            }
        },
        Ok(IncomingMessage::Notification(n)) => {
            tracing::debug!(server = %server_name, method = %n.method, "server notification");
        }
        Ok(IncomingMessage::Request(r)) => {
            tracing::debug!(
                server = %server_name,
                id = r.id,
                method = %r.method,
                "ignoring server-initiated request"
            );
        }
        Err(e) => {
            tracing::warn!(
                server = %server_name,
                error = %e,
                line = %truncate(line.trim(), 200),
                "failed to parse line from server"
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

fn timeout_error(method: &str, id: u64, timeout: Duration) -> McpError {
    McpError::transient(format!(
        "'{method}' timed out after {}ms",
        timeout.as_millis()
    ))
    .with_data("method", method)
    .with_data("id", id)
    .with_data("timeout_ms", timeout.as_millis() as u64)
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::from(err));
    }

    response.result.ok_or_else(|| {
        McpError::recoverable(
            error_codes::PROTOCOL_ERROR,
            "response missing both result and error",
        )
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::errors::Severity;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Transport wired to an in-memory peer: (transport, peer stdin reader, peer stdout writer).
    fn transport_pair() -> (StdioTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_out, peer_in) = duplex(64 * 1024);
        let (peer_out, client_in) = duplex(64 * 1024);
        let transport = StdioTransport::start("test", client_out, client_in);
        (transport, BufReader::new(peer_in), peer_out)
    }

    async fn read_request(peer_in: &mut BufReader<DuplexStream>) -> JsonRpcRequest {
        let mut line = String::new();
        peer_in.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (transport, _peer_in, _peer_out) = transport_pair();
        assert_eq!(transport.next_request_id(), 1);
        assert_eq!(transport.next_request_id(), 2);
    }

    #[tokio::test]
    async fn test_request_round_trip_through_reader_loop() {
        let (transport, mut peer_in, mut peer_out) = transport_pair();

        let peer = tokio::spawn(async move {
            let req = read_request(&mut peer_in).await;
            assert_eq!(req.method, "tools/list");
            let resp = JsonRpcResponse::success(req.id, json!({"tools": []}));
            peer_out
                .write_all(encode_line(&resp).unwrap().as_bytes())
                .await
                .unwrap();
            (peer_in, peer_out)
        });

        let resp = transport
            .request("tools/list", Some(json!({})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(1));
        assert!(extract_result(resp).unwrap()["tools"].is_array());
        let _ = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (transport, mut peer_in, mut peer_out) = transport_pair();

        let peer = tokio::spawn(async move {
            let req = read_request(&mut peer_in).await;
            peer_out.write_all(b"not json at all\n").await.unwrap();
            peer_out.write_all(b"\n").await.unwrap();
            peer_out.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
            let resp = JsonRpcResponse::success(req.id, json!("ok"));
            peer_out
                .write_all(encode_line(&resp).unwrap().as_bytes())
                .await
                .unwrap();
            (peer_in, peer_out)
        });

        let resp = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap(), "ok");
        assert!(transport.is_alive());
        let _ = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_discards_entry() {
        let (transport, _peer_in, _peer_out) = transport_pair();

        let err = transport
            .request("tools/call", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.severity, Severity::Transient);
        assert_eq!(err.code, error_codes::TIMEOUT_ERROR);
        assert_eq!(err.data["method"], "tools/call");
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_stdout_close_fails_in_flight_request() {
        let (transport, mut peer_in, peer_out) = transport_pair();

        let peer = tokio::spawn(async move {
            let _req = read_request(&mut peer_in).await;
            drop(peer_out);
            peer_in
        });

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.severity, Severity::Transient);
        let _ = peer.await.unwrap();

        // The reader loop has exited and marked the transport dead.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_close_rejects_further_writes() {
        let (transport, _peer_in, _peer_out) = transport_pair();
        transport.close().await;

        assert!(!transport.is_alive());
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert_eq!(err.severity, Severity::Transient);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse::success(1, json!({"text": "hello"}));
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse::failure(
            Some(1),
            super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            },
        );
        let err = extract_result(resp).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
        assert_eq!(err.severity, Severity::Recoverable);
    }

    #[test]
    fn test_extract_result_accepts_null_result() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(extract_result(resp).unwrap(), Value::Null);
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert_eq!(err.code, error_codes::PROTOCOL_ERROR);
    }
}
