//! MCP Client — JSON-RPC over stdio and streamable HTTP for one MCP server.
//!
//! This module handles:
//! - Spawning a server child process or opening an HTTP session
//! - JSON-RPC 2.0 framing, correlation and per-call timeouts
//! - The `initialize` handshake and connection state
//! - Tool discovery, caching, and argument validation before any I/O
//!
//! `McpClient` is the entry point; `Connection` is the lower-level session.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod transport;
pub mod types;
pub mod validator;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ConnectionOptions, ConnectionSettings, Manifest, ServerManifestEntry};
pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use errors::{ErrorKind, McpError};
pub use registry::{ToolRegistry, ToolSet};
pub use types::{ToolCallResult, ToolDefinition};
pub use validator::{ValidationError, ValidationMode};
