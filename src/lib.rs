//! Client runtime for Model Context Protocol servers.
//!
//! Connects to one server over stdio or streamable HTTP, discovers its tools,
//! validates arguments against their schemas and dispatches calls.

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{
    Connection, ConnectionOptions, ConnectionState, ErrorKind, McpClient, McpError,
    ToolCallResult, ToolDefinition, ValidationError, ValidationMode,
};
