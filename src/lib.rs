//! navlink: a resilient MCP client for a robot navigation tool server.
//!
//! The client spawns the tool server as a child process, speaks
//! line-delimited JSON-RPC 2.0 over its stdio, and keeps the connection
//! alive with heartbeat probing, automatic reconnection and exponential
//! backoff for transient failures.

pub mod config;
pub mod logging;
pub mod mcp_client;
pub mod navsim;

pub use config::NavlinkConfig;
pub use mcp_client::{McpClientService, McpError, Severity};
