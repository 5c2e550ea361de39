//! MCP Client — JSON-RPC over stdio transport for the navigation tool server.
//!
//! This module handles:
//! - Spawning the tool server child process and the MCP handshake
//! - JSON-RPC 2.0 framing and request/response correlation over stdio
//! - Tool call execution with a transient/recoverable/permanent error taxonomy
//! - Exponential backoff for transient failures
//! - Heartbeat probing with automatic reconnection
//! - Escalating teardown (close stdin, SIGTERM, SIGKILL)

pub mod backoff;
pub mod client;
pub mod codec;
pub mod correlator;
pub mod errors;
pub mod heartbeat;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use backoff::{Backoff, BackoffConfig};
pub use client::McpClientService;
pub use errors::{error_codes, McpError, Severity};
pub use types::{
    ClientConfig, ConnectionInfo, ConnectionState, ServerConfig, ToolCallResult, ToolDescriptor,
    ToolOutput,
};
