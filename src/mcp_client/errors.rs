//! MCP Client error types.
//!
//! One enum covers every failure the runtime can surface. `kind()` collapses
//! the variants into the taxonomy callers branch on: configuration, transport,
//! protocol, validation, tool-execution, timeout, connection-state and RPC.

use thiserror::Error;

use super::connection::ConnectionState;
use super::types::ToolCallResult;
use super::validator::ValidationError;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Manifest missing or malformed, unknown server, bad option values.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Pipe or HTTP failure, unexpected process exit, TLS failure.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Malformed frame, unexpected correlation id, bad response payload.
    #[error("protocol error for server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// The initialize handshake was rejected (version or capability mismatch).
    #[error("server '{name}' initialization failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the discovered tool list.
    #[error("Tool '{name}' not found")]
    UnknownTool { name: String },

    /// Tool call arguments failed schema validation. No I/O was performed.
    #[error(transparent)]
    InvalidArguments(#[from] ValidationError),

    /// The tool ran and reported `isError: true`.
    #[error("tool '{tool}' reported an error: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        result: ToolCallResult,
    },

    /// No response within the allotted time. `sent` is false when the
    /// request was still queued behind another stdio request.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
        sent: bool,
    },

    /// A call was attempted while the connection was not ready.
    #[error("connection to server '{server}' is {state}, expected ready")]
    InvalidState {
        server: String,
        state: ConnectionState,
    },
}

/// Coarse classification of [`McpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Validation,
    ToolExecution,
    Timeout,
    ConnectionState,
    Rpc,
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::ConfigError { .. } => ErrorKind::Configuration,
            McpError::SpawnFailed { .. } | McpError::TransportError { .. } => ErrorKind::Transport,
            McpError::ProtocolError { .. } | McpError::HandshakeFailed { .. } => {
                ErrorKind::Protocol
            }
            McpError::UnknownTool { .. } | McpError::InvalidArguments(_) => ErrorKind::Validation,
            McpError::ToolExecution { .. } => ErrorKind::ToolExecution,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::InvalidState { .. } => ErrorKind::ConnectionState,
            McpError::ServerError { .. } => ErrorKind::Rpc,
        }
    }

    /// Ordinary outcomes: the connection is still usable after these.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::ToolExecution | ErrorKind::Rpc
        )
    }

    /// Whether this error must take the connection to `Failed`.
    ///
    /// Timeouts only poison stdio connections, and only once the request was
    /// written: an unanswered request leaves output on the pipe that can no
    /// longer be attributed to a caller.
    pub fn is_fatal_for_connection(&self, stdio: bool) -> bool {
        match self {
            McpError::Timeout { sent, .. } => stdio && *sent,
            other => matches!(other.kind(), ErrorKind::Transport | ErrorKind::Protocol),
        }
    }

    /// The validation failure, if this is one.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            McpError::InvalidArguments(err) => Some(err),
            _ => None,
        }
    }
}
