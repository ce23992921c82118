//! Toolgate - a session-scoped sandboxed execution gateway for agent tool calls.
//!
//! Accepts requests to run Python code or shell commands, executes them inside
//! isolated, time-boxed, resource-bounded per-session workspaces, and returns
//! captured output in a uniform result envelope.

pub mod config;
pub mod gateway;
pub mod policy;
pub mod sandbox;
pub mod session;
pub mod workspace;

pub use config::GatewayConfig;
pub use gateway::{Envelope, ExecStatus, Gateway};
