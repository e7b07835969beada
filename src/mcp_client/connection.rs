//! Connection manager.
//!
//! A [`Connection`] owns one transport for the life of a session and walks
//! the state machine:
//!
//! ```text
//! Disconnected → Connecting → Handshaking → Ready → Closing → Closed
//!                     └────────────┴──────────┴──→ Failed
//! ```
//!
//! Calls are only dispatched in `Ready`. There is no automatic reconnect:
//! once `Failed`, every call fails fast until the owner closes the
//! connection and opens a new one.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::config::{ConnectionSettings, ServerManifestEntry};
use super::dispatcher::{self, answer_server_request, Dispatcher};
use super::errors::McpError;
use super::registry::{ToolRegistry, ToolSet};
use super::transport::{HttpTransport, StdioReader, StdioTransport, Transport};
use super::types::{
    Implementation, InitializeResult, JsonRpcNotification, RpcMessage, ServerCapabilities,
    ToolCallResult, ToolDefinition, CLIENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Name reported in `clientInfo`.
pub const CLIENT_NAME: &str = "mcp-client-runtime";

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server told us during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Serializable snapshot of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub server: String,
    pub transport: &'static str,
    pub state: ConnectionState,
    pub protocol_version: Option<String>,
    pub server_info: Option<Implementation>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub in_flight: usize,
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State reachable from both the owner and the stdio reader task.
struct Shared {
    server: String,
    state: StdMutex<ConnectionState>,
    dispatcher: Dispatcher,
    registry: ToolRegistry,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Failed)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            let previous = *state;
            if previous != next {
                tracing::debug!(server = %self.server, from = %previous, to = %next, "connection state");
                *state = next;
            }
        }
    }

    /// Move `from` → `to`, unless something else (the reader task failing the
    /// connection) changed the state first.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> Result<(), McpError> {
        let mut state = self.state.lock().map_err(|_| McpError::InvalidState {
            server: self.server.clone(),
            state: ConnectionState::Failed,
        })?;
        if *state != from {
            return Err(McpError::InvalidState {
                server: self.server.clone(),
                state: *state,
            });
        }
        tracing::debug!(server = %self.server, from = %from, to = %to, "connection state");
        *state = to;
        Ok(())
    }

    /// Mark the connection failed and wake every waiter with `error`.
    ///
    /// A connection that is already closing stays on its way to `Closed`.
    fn fail(&self, error: &McpError) {
        if let Ok(mut state) = self.state.lock() {
            match *state {
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {}
                _ => {
                    tracing::warn!(server = %self.server, error = %error, "MCP connection failed");
                    *state = ConnectionState::Failed;
                }
            }
        }
        self.dispatcher.fail_all(error);
    }

    async fn handle_inbound(&self, message: RpcMessage, transport: &Transport) {
        match message {
            RpcMessage::Notification(notification) => self.on_notification(&notification),
            RpcMessage::Request(request) => {
                tracing::debug!(server = %self.server, method = %request.method, "answering server request");
                let reply = answer_server_request(&request);
                if let Err(e) = self.dispatcher.send_message(transport, reply.into()).await {
                    tracing::warn!(server = %self.server, error = %e, "failed to answer server request");
                }
            }
            RpcMessage::Response(_) => {}
        }
    }

    fn on_notification(&self, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/tools/list_changed" => {
                tracing::info!(server = %self.server, "server tool list changed");
                self.registry.mark_stale();
            }
            "notifications/message" => {
                let params = notification.params.clone().unwrap_or(Value::Null);
                tracing::info!(server = %self.server, message = %params, "server log message");
            }
            other => {
                tracing::debug!(server = %self.server, method = other, "notification ignored");
            }
        }
    }
}

fn spawn_reader(
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    mut reader: StdioReader,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let error = loop {
            match reader.next_message().await {
                Ok(Some(message)) => match shared.dispatcher.route(message) {
                    Ok(None) => {}
                    Ok(Some(other)) => shared.handle_inbound(other, &transport).await,
                    Err(e) => break e,
                },
                Ok(None) => {
                    let reason = match transport.as_ref() {
                        Transport::Stdio(stdio) => stdio.exit_diagnostics().await,
                        Transport::Http(_) => "stream closed".to_string(),
                    };
                    break McpError::TransportError {
                        server: shared.server.clone(),
                        reason,
                    };
                }
                Err(e) => break e,
            }
        };
        if matches!(error, McpError::ProtocolError { .. }) {
            transport.terminate();
        }
        shared.fail(&error);
    })
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A session with one MCP server. Owned exclusively by its opener.
pub struct Connection {
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    transport: Option<Arc<Transport>>,
    reader: Option<JoinHandle<()>>,
    /// Streams handed to `connect()`. The reader half is `!Sync`, so it sits
    /// behind a mutex to keep `Connection` shareable across tasks.
    prepared: StdMutex<Option<(StdioTransport, StdioReader)>>,
    session: Option<SessionInfo>,
    created_at: DateTime<Utc>,
    last_used: StdMutex<DateTime<Utc>>,
}

impl Connection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let server = settings.server_name.clone();
        let now = Utc::now();
        Self {
            shared: Arc::new(Shared {
                server: server.clone(),
                state: StdMutex::new(ConnectionState::Disconnected),
                dispatcher: Dispatcher::new(server.clone()),
                registry: ToolRegistry::new(server),
            }),
            settings,
            transport: None,
            reader: None,
            prepared: StdMutex::new(None),
            session: None,
            created_at: now,
            last_used: StdMutex::new(now),
        }
    }

    /// A connection over already-open streams, e.g. an in-process server.
    /// `connect()` performs the handshake over them instead of spawning.
    pub fn from_stdio_streams(
        settings: ConnectionSettings,
        transport: StdioTransport,
        reader: StdioReader,
    ) -> Self {
        let mut connection = Self::new(settings);
        connection.prepared = StdMutex::new(Some((transport, reader)));
        connection
    }

    pub fn name(&self) -> &str {
        &self.settings.server_name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.protocol_version.as_str())
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.session.as_ref().map(|s| &s.server_info)
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.session.as_ref().map(|s| &s.capabilities)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.shared.registry
    }

    pub fn in_flight(&self) -> usize {
        self.shared.dispatcher.in_flight()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            server: self.name().to_string(),
            transport: self.settings.entry.transport_name(),
            state: self.state(),
            protocol_version: self.protocol_version().map(str::to_string),
            server_info: self.server_info().cloned(),
            created_at: self.created_at,
            last_used: self.last_used(),
            in_flight: self.in_flight(),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Utc::now();
        }
    }

    fn invalid_state(&self, state: ConnectionState) -> McpError {
        McpError::InvalidState {
            server: self.name().to_string(),
            state,
        }
    }

    // ── connect ──────────────────────────────────────────────────────────

    /// Open the transport and run the `initialize` handshake.
    ///
    /// No-op when already ready. Any failure leaves the connection `Failed`
    /// with its transport released.
    pub async fn connect(&mut self) -> Result<(), McpError> {
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Disconnected => {}
            state => return Err(self.invalid_state(state)),
        }

        self.shared.set_state(ConnectionState::Connecting);
        let timeout = self.settings.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.name().to_string(),
                method: "initialize".into(),
                timeout_ms: timeout.as_millis() as u64,
                sent: true,
            }),
        };

        if let Err(e) = result {
            self.shared.fail(&e);
            self.release_transport(Duration::ZERO).await;
            return Err(e);
        }
        Ok(())
    }

    async fn establish(&mut self) -> Result<(), McpError> {
        let transport = self.open_transport()?;
        self.shared
            .advance(ConnectionState::Connecting, ConnectionState::Handshaking)?;

        let params = json!({
            "protocolVersion": CLIENT_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
        });
        let raw = self
            .shared
            .dispatcher
            .request(&transport, "initialize", Some(params), self.settings.connect_timeout)
            .await
            .map_err(|e| match e {
                McpError::ServerError { code, message, .. } => McpError::HandshakeFailed {
                    name: self.name().to_string(),
                    reason: format!("server rejected initialize [{code}]: {message}"),
                },
                other => other,
            })?;

        let init: InitializeResult =
            serde_json::from_value(raw).map_err(|e| McpError::ProtocolError {
                server: self.name().to_string(),
                reason: format!("invalid initialize result: {e}"),
            })?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(McpError::HandshakeFailed {
                name: self.name().to_string(),
                reason: format!(
                    "unsupported protocol version '{}' (supported: {})",
                    init.protocol_version,
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            });
        }
        if init.capabilities.tools.is_none() {
            return Err(McpError::HandshakeFailed {
                name: self.name().to_string(),
                reason: "server does not advertise the 'tools' capability".into(),
            });
        }
        if let Transport::Http(http) = transport.as_ref() {
            http.set_protocol_version(&init.protocol_version);
        }

        tracing::info!(
            server = %self.name(),
            transport = transport.kind(),
            protocol_version = %init.protocol_version,
            server_name = %init.server_info.name,
            server_version = init.server_info.version.as_deref().unwrap_or("unknown"),
            "MCP connection ready"
        );
        self.session = Some(SessionInfo {
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            server_info: init.server_info,
            instructions: init.instructions,
        });
        self.shared
            .advance(ConnectionState::Handshaking, ConnectionState::Ready)?;

        self.shared
            .dispatcher
            .notify(&transport, "notifications/initialized", None)
            .await?;
        self.process_inbound(&transport).await;
        self.touch();
        Ok(())
    }

    fn open_transport(&mut self) -> Result<Arc<Transport>, McpError> {
        let prepared = self.prepared.get_mut().ok().and_then(Option::take);
        let transport = if let Some((stdio, reader)) = prepared {
            let transport = Arc::new(Transport::Stdio(stdio));
            self.reader = Some(spawn_reader(self.shared.clone(), transport.clone(), reader));
            transport
        } else {
            match &self.settings.entry {
                ServerManifestEntry::Stdio(config) => {
                    let (stdio, reader) =
                        StdioTransport::spawn(self.name(), config, self.settings.log_messages)?;
                    let transport = Arc::new(Transport::Stdio(stdio));
                    self.reader = Some(spawn_reader(self.shared.clone(), transport.clone(), reader));
                    transport
                }
                ServerManifestEntry::Http(config) => Arc::new(Transport::Http(HttpTransport::new(
                    self.name(),
                    config,
                    self.settings.connect_timeout,
                    self.settings.max_concurrent_requests,
                    self.settings.log_messages,
                )?)),
            }
        };
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    async fn process_inbound(&self, transport: &Transport) {
        for message in self.shared.dispatcher.drain_inbound() {
            self.shared.handle_inbound(message, transport).await;
        }
    }

    // ── send ─────────────────────────────────────────────────────────────

    /// Send one request and wait for its result. Requires `Ready`.
    ///
    /// Transport and protocol errors, and timeouts on stdio, take the
    /// connection to `Failed` and kill a stdio child.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(self.invalid_state(state));
        }
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| self.invalid_state(state))?;
        self.touch();

        let timeout = timeout.unwrap_or(self.settings.command_timeout);
        let result = self
            .shared
            .dispatcher
            .request(&transport, method, params, timeout)
            .await;

        if let Err(e) = &result {
            if e.is_fatal_for_connection(transport.is_stdio()) {
                // Other waiters learn about the teardown, not this call's error.
                self.shared.fail(&McpError::TransportError {
                    server: self.name().to_string(),
                    reason: format!("connection torn down after '{method}' failed: {e}"),
                });
                transport.terminate();
                return result;
            }
        }
        self.process_inbound(&transport).await;
        result
    }

    // ── tools ────────────────────────────────────────────────────────────

    /// Discovered tools, fetched once per connection.
    pub async fn tools(&self) -> Result<Arc<ToolSet>, McpError> {
        self.shared.registry.discover(self).await
    }

    /// One tool definition, discovering first if needed.
    pub async fn tool(&self, name: &str) -> Result<ToolDefinition, McpError> {
        self.tools().await?;
        self.shared.registry.lookup(name)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError> {
        dispatcher::call(self, name, args, timeout).await
    }

    // ── close ────────────────────────────────────────────────────────────

    /// Release the transport and clear cached state. Idempotent.
    pub async fn close(&mut self) {
        match self.state() {
            ConnectionState::Closed => return,
            ConnectionState::Disconnected => {
                if let Ok(prepared) = self.prepared.get_mut() {
                    *prepared = None;
                }
                self.shared.set_state(ConnectionState::Closed);
                return;
            }
            _ => {}
        }

        self.shared.set_state(ConnectionState::Closing);
        self.release_transport(self.settings.shutdown_grace).await;
        self.shared
            .dispatcher
            .fail_all(&self.invalid_state(ConnectionState::Closed));
        self.shared.registry.invalidate();
        self.shared.set_state(ConnectionState::Closed);
        tracing::info!(server = %self.name(), "MCP connection closed");
    }

    async fn release_transport(&mut self, grace: Duration) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(transport) = self.transport.take() {
            if grace.is_zero() {
                transport.terminate();
            }
            transport.close(grace).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.terminate();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
