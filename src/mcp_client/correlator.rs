//! Request correlation — matches responses to in-flight requests by ID.
//!
//! Each dispatched request owns a one-shot slot in the pending table. The
//! reader loop resolves slots as responses arrive, in any order. A waiter
//! that gives up drops its [`PendingRequest`], which removes the slot, so a
//! late response finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::errors::{error_codes, McpError};
use super::types::JsonRpcResponse;

/// Table of in-flight requests for one connection.
#[derive(Debug, Default)]
pub struct Correlator {
    inner: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry for `id` and return its completion handle.
    pub fn register(&self, id: u64) -> Result<PendingRequest<'_>, McpError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();

        if table.closed {
            return Err(McpError::connection_lost("connection closed")
                .with_data("id", id));
        }
        if table.pending.contains_key(&id) {
            return Err(McpError::permanent(
                error_codes::INTERNAL_ERROR,
                format!("request id {id} is already in flight"),
            ));
        }
        table.pending.insert(id, tx);

        Ok(PendingRequest {
            id,
            rx,
            correlator: self,
        })
    }

    /// Deliver a response. Returns `false` when no waiter holds `id` (stray
    /// duplicate, or the waiter already gave up); the response is dropped.
    pub fn resolve(&self, id: u64, response: JsonRpcResponse) -> bool {
        let sender = self.lock().pending.remove(&id);
        match sender {
            // A waiter may drop between removal and send; that is a drop too.
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::debug!(id, "dropping response with no pending request");
                false
            }
        }
    }

    /// Fail every waiter and refuse new registrations.
    pub fn close(&self) {
        let mut table = self.lock();
        table.closed = true;
        let dropped = table.pending.len();
        table.pending.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "closed correlator with requests in flight");
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn discard(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        // The table holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── PendingRequest ──────────────────────────────────────────────────────────

/// Completion handle for one request. Dropping it discards the table entry.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    correlator: &'a Correlator,
}

impl PendingRequest<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response. Fails with a transient error if the connection
    /// closes first.
    pub async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        (&mut self.rx).await.map_err(|_| {
            McpError::connection_lost("connection closed while awaiting response")
                .with_data("id", self.id)
        })
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.correlator.discard(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
