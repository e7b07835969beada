//! MCP Client — high-level interface for tool execution against one server.
//!
//! Resolves [`ConnectionOptions`] against the manifest, opens a
//! [`Connection`] and exposes discovery, validation and tool calls on top of
//! it. This is the primary API for collaborators.

use std::time::Duration;

use serde_json::Value;

use super::config::{ConnectionOptions, ConnectionSettings};
use super::connection::{Connection, ConnectionInfo, ConnectionState};
use super::errors::McpError;
use super::types::{Implementation, ToolCallResult, ToolDefinition};
use super::validator::validate_with_mode;

// ─── McpClient ───────────────────────────────────────────────────────────────

/// A connected client for the server named in its options.
pub struct McpClient {
    options: ConnectionOptions,
    connection: Connection,
}

impl McpClient {
    /// Resolve `options` against the manifest and connect.
    pub async fn connect(options: ConnectionOptions) -> Result<Self, McpError> {
        let settings = options.resolve()?;
        Self::connect_with(options, settings).await
    }

    /// Connect with already-resolved settings. `options` are kept for
    /// [`reconnect`](Self::reconnect).
    pub async fn connect_with(
        options: ConnectionOptions,
        settings: ConnectionSettings,
    ) -> Result<Self, McpError> {
        let mut connection = Connection::new(settings);
        connection.connect().await?;
        Ok(Self {
            options,
            connection,
        })
    }

    pub fn server_name(&self) -> &str {
        self.connection.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    /// Server identity reported during the handshake.
    pub fn server_info(&self) -> Option<&Implementation> {
        self.connection.server_info()
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// All tools the server offers, in server order.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        Ok(self.connection.tools().await?.tools().to_vec())
    }

    pub async fn get_tool(&self, name: &str) -> Result<ToolDefinition, McpError> {
        self.connection.tool(name).await
    }

    /// Check `args` against the tool's schema without calling it.
    pub async fn validate(&self, name: &str, args: &Value) -> Result<(), McpError> {
        let tool = self.get_tool(name).await?;
        validate_with_mode(&tool, args, self.connection.settings().validation_mode)?;
        Ok(())
    }

    /// Validate and execute a tool call with the default command timeout.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolCallResult, McpError> {
        self.connection.call_tool(name, args, None).await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, McpError> {
        self.connection.call_tool(name, args, Some(timeout)).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Close the current connection and open a fresh one.
    ///
    /// The manifest is read again. On failure the client holds the failed
    /// connection and every call reports its state.
    pub async fn reconnect(&mut self) -> Result<(), McpError> {
        self.connection.close().await;
        let settings = self.options.resolve()?;
        let mut next = Connection::new(settings);
        let result = next.connect().await;
        self.connection = next;
        if result.is_ok() {
            tracing::info!(server = %self.server_name(), "MCP connection re-established");
        }
        result
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        self.connection.close().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
