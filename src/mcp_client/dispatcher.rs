//! Request/response correlation and the tool-call pipeline.
//!
//! Every outgoing request gets a fresh numeric id and a [`PendingRequest`]
//! slot. The slot is filled by whichever path delivers the matching
//! response (the stdio reader task or the HTTP reply) and is always removed
//! when the caller stops waiting, whether it got an answer, timed out or was
//! cancelled.
//!
//! Stdio connections carry one request at a time: a per-connection gate is
//! held from the write until the reply arrives. HTTP requests run
//! concurrently, bounded by the transport's semaphore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use super::connection::Connection;
use super::errors::McpError;
use super::transport::Transport;
use super::types::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, RpcMessage,
    ToolCallResult,
};
use super::validator::validate_with_mode;

type Completion = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// An outgoing request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub submitted_at: Instant,
    completion: Completion,
}

/// Per-connection correlation state.
pub struct Dispatcher {
    server: String,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, PendingRequest>>,
    inbound: StdMutex<Vec<RpcMessage>>,
    stdio_gate: Mutex<()>,
    /// Set by `fail_all`; requests still queued on the gate see it instead of writing.
    failure: StdMutex<Option<McpError>>,
}

impl Dispatcher {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            inbound: StdMutex::new(Vec::new()),
            stdio_gate: Mutex::new(()),
            failure: StdMutex::new(None),
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Send a request and wait for its result.
    ///
    /// `timeout` covers the whole exchange, including time spent queued
    /// behind another stdio request.
    pub async fn request(
        &self,
        transport: &Transport,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let started = Instant::now();
        let sent = AtomicBool::new(false);
        let exchange = self.exchange(transport, method, params, &sent);
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                let sent = sent.load(Ordering::SeqCst);
                tracing::warn!(
                    server = %self.server,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    sent,
                    "request timed out"
                );
                return Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                    sent,
                });
            }
        };
        tracing::debug!(
            server = %self.server,
            method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        extract_result(response)
    }

    async fn exchange(
        &self,
        transport: &Transport,
        method: &str,
        params: Option<Value>,
        sent: &AtomicBool,
    ) -> Result<JsonRpcResponse, McpError> {
        let _gate = match transport {
            Transport::Stdio(_) => Some(self.stdio_gate.lock().await),
            Transport::Http(_) => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(error) = self.failure.lock().ok().and_then(|f| f.clone()) {
                return Err(error);
            }
            pending.insert(
                id,
                PendingRequest {
                    id,
                    method: method.to_string(),
                    submitted_at: Instant::now(),
                    completion: tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let message = RpcMessage::from(JsonRpcRequest::new(id, method, params));
        match transport {
            Transport::Stdio(stdio) => {
                // Set before writing: a partial frame is as unrecoverable as a whole one.
                sent.store(true, Ordering::SeqCst);
                stdio.send(&message).await?;
                rx.await.map_err(|_| McpError::TransportError {
                    server: self.server.clone(),
                    reason: format!("connection closed while waiting for '{method}'"),
                })?
            }
            Transport::Http(http) => {
                sent.store(true, Ordering::SeqCst);
                let replies = http.post(&message, Some(&RequestId::Number(id))).await?;
                self.route_all(replies)?;
                rx.try_recv().unwrap_or_else(|_| {
                    Err(McpError::ProtocolError {
                        server: self.server.clone(),
                        reason: format!("HTTP reply carried no response to '{method}' (id {id})"),
                    })
                })
            }
        }
    }

    /// Send a notification. Nothing is correlated.
    pub async fn notify(
        &self,
        transport: &Transport,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        self.send_message(transport, JsonRpcNotification::new(method, params).into())
            .await
    }

    /// Write a message that expects no reply (notifications, answers to
    /// server requests).
    pub async fn send_message(
        &self,
        transport: &Transport,
        message: RpcMessage,
    ) -> Result<(), McpError> {
        match transport {
            Transport::Stdio(stdio) => stdio.send(&message).await,
            Transport::Http(http) => {
                let replies = http.post(&message, None).await?;
                self.route_all(replies)
            }
        }
    }

    fn route_all(&self, messages: Vec<RpcMessage>) -> Result<(), McpError> {
        for message in messages {
            if let Some(other) = self.route(message)? {
                if let Ok(mut inbound) = self.inbound.lock() {
                    inbound.push(other);
                }
            }
        }
        Ok(())
    }

    /// Deliver responses to their waiters and hand everything else back.
    pub fn route(&self, message: RpcMessage) -> Result<Option<RpcMessage>, McpError> {
        match message {
            RpcMessage::Response(response) => self.complete(response).map(|_| None),
            other => Ok(Some(other)),
        }
    }

    /// Fill the pending slot matching `response.id`.
    pub fn complete(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        let entry = response
            .id
            .as_u64()
            .and_then(|id| self.pending.lock().ok()?.remove(&id));
        let Some(entry) = entry else {
            return Err(McpError::ProtocolError {
                server: self.server.clone(),
                reason: format!("response with unexpected id {}", response.id),
            });
        };
        tracing::trace!(
            server = %self.server,
            id = entry.id,
            method = %entry.method,
            waited_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "response matched"
        );
        // The waiter may already have given up.
        let _ = entry.completion.send(Ok(response));
        Ok(())
    }

    /// Fail every pending request with `error`.
    pub fn fail_all(&self, error: &McpError) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| error.clone());
        }
        let drained = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        if !drained.is_empty() {
            tracing::debug!(server = %self.server, count = drained.len(), "failing pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.completion.send(Err(error.clone()));
        }
    }

    /// Messages from HTTP replies that were not responses to our requests.
    pub fn drain_inbound(&self) -> Vec<RpcMessage> {
        self.inbound
            .lock()
            .map(|mut inbound| std::mem::take(&mut *inbound))
            .unwrap_or_default()
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a StdMutex<HashMap<u64, PendingRequest>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Reply to a request initiated by the server.
pub fn answer_server_request(request: &JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "ping" => JsonRpcResponse::success(request.id.clone(), json!({})),
        other => JsonRpcResponse::failure(
            request.id.clone(),
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// Validate and execute one tool call.
///
/// Validation failures return before any I/O. `timeout` defaults to the
/// connection's command timeout.
pub async fn call(
    connection: &Connection,
    tool: &str,
    args: Value,
    timeout: Option<Duration>,
) -> Result<ToolCallResult, McpError> {
    let definition = connection.tool(tool).await?;
    validate_with_mode(&definition, &args, connection.settings().validation_mode)?;

    let arguments = if args.is_null() { json!({}) } else { args };
    let started = Instant::now();
    let raw = connection
        .send(
            "tools/call",
            Some(json!({"name": tool, "arguments": arguments})),
            timeout,
        )
        .await?;

    let result: ToolCallResult =
        serde_json::from_value(raw).map_err(|e| McpError::ProtocolError {
            server: connection.name().to_string(),
            reason: format!("invalid tools/call result: {e}"),
        })?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if result.is_error {
        let text = result.text();
        let message = if text.is_empty() {
            "tool returned an error".to_string()
        } else {
            text
        };
        tracing::info!(server = %connection.name(), tool, elapsed_ms, "tool reported an error");
        return Err(McpError::ToolExecution {
            tool: tool.to_string(),
            message,
            result,
        });
    }

    tracing::info!(server = %connection.name(), tool, elapsed_ms, "tool call completed");
    Ok(result)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
