//! Simulated navigation tool server.
//!
//! A stand-in for the robot's navigation stack that speaks the same MCP
//! tool surface over stdio. The `navsim-server` binary wraps [`serve`];
//! environment switches in [`SimOptions`] inject the faults the client's
//! heartbeat and teardown paths need to be exercised against.

pub mod robot;
pub mod server;

pub use robot::{GoalError, NavStatus, Pose, Robot};
pub use server::{serve, tool_descriptors, SimOptions};
