//! Transports: child-process stdio and streamable HTTP.
//!
//! Stdio is split in two halves. [`StdioTransport`] owns the child, its stdin
//! and the stderr capture task. [`StdioReader`] owns stdout and is consumed by
//! the connection's reader task. HTTP is request-scoped: every outgoing frame
//! is one POST and the reply frames come back from [`HttpTransport::post`].

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use super::codec::{self, CodecError, Framing, SseDecoder, MAX_FRAME_BYTES};
use super::config::{HttpServerConfig, StdioServerConfig};
use super::errors::McpError;
use super::types::{RequestId, RpcMessage, CLIENT_PROTOCOL_VERSION};

/// Bytes of stderr retained for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Upper bound on an HTTP error body quoted in an error message.
const BODY_PREVIEW_BYTES: usize = 512;

/// Timeout for the best-effort session `DELETE` on close.
const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// An open channel to one MCP server.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    pub fn is_stdio(&self) -> bool {
        matches!(self, Transport::Stdio(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Http(_) => "http",
        }
    }

    /// Release the channel: graceful for stdio, session `DELETE` for HTTP.
    pub async fn close(&self, grace: Duration) {
        match self {
            Transport::Stdio(stdio) => stdio.shutdown(grace).await,
            Transport::Http(http) => http.close().await,
        }
    }

    /// Kill a stdio child at once. No-op for HTTP.
    pub fn terminate(&self) {
        if let Transport::Stdio(stdio) = self {
            stdio.terminate();
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// Write half of a stdio connection plus the child process handle.
pub struct StdioTransport {
    server_name: String,
    framing: Framing,
    log_messages: bool,
    writer: Mutex<Option<BoxedWriter>>,
    child: StdMutex<Option<Child>>,
    stderr: Arc<StdMutex<StderrTail>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Read half of a stdio connection.
pub struct StdioReader {
    server_name: String,
    framing: Framing,
    log_messages: bool,
    inner: BufReader<BoxedReader>,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio.
    ///
    /// The manifest env is layered over the inherited environment. The child
    /// is killed if the handle is dropped on any path.
    pub fn spawn(
        server_name: &str,
        config: &StdioServerConfig,
        log_messages: bool,
    ) -> Result<(Self, StdioReader), McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        tracing::debug!(
            server = server_name,
            command = %config.command,
            args = ?config.args,
            "spawning MCP server"
        );

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = Arc::new(StdMutex::new(StderrTail::default()));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture_stderr(server_name.to_string(), pipe, stderr.clone())));

        tracing::info!(
            server = server_name,
            pid = child.id().unwrap_or_default(),
            "MCP server process started"
        );

        let transport = Self {
            server_name: server_name.to_string(),
            framing: config.framing,
            log_messages,
            writer: Mutex::new(Some(Box::new(stdin))),
            child: StdMutex::new(Some(child)),
            stderr,
            stderr_task: StdMutex::new(stderr_task),
        };
        let reader = StdioReader::new(server_name, config.framing, log_messages, Box::new(stdout));
        Ok((transport, reader))
    }

    /// Build a transport over arbitrary streams with no child process.
    pub fn from_streams<W, R>(server_name: &str, framing: Framing, writer: W, reader: R) -> (Self, StdioReader)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let transport = Self {
            server_name: server_name.to_string(),
            framing,
            log_messages: false,
            writer: Mutex::new(Some(Box::new(writer))),
            child: StdMutex::new(None),
            stderr: Arc::new(StdMutex::new(StderrTail::default())),
            stderr_task: StdMutex::new(None),
        };
        let reader = StdioReader::new(server_name, framing, false, Box::new(reader));
        (transport, reader)
    }

    /// Write one framed message to the child's stdin.
    pub async fn send(&self, message: &RpcMessage) -> Result<(), McpError> {
        let frame = codec::encode_frame(message, self.framing).map_err(|e| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: format!("failed to encode message: {e}"),
        })?;
        if self.log_messages {
            tracing::debug!(
                server = %self.server_name,
                frame = %String::from_utf8_lossy(&frame).trim_end(),
                "-> stdio"
            );
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "stdin is closed".into(),
        })?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| self.write_error(e))?;
        writer.flush().await.map_err(|e| self.write_error(e))?;
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to write to stdin: {e}{}", self.stderr_suffix()),
        }
    }

    /// Close stdin, wait `grace` for the child to exit, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let child = self.child.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut child) = child else {
            return;
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "MCP server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = grace.as_millis() as u64,
                    "MCP server did not exit in time, killing"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Kill the child immediately.
    pub fn terminate(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    /// Describe why the server's stdout ended: exit status plus stderr tail.
    pub async fn exit_diagnostics(&self) -> String {
        let task = self.stderr_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
        }

        let status = self
            .child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|child| child.try_wait().ok().flatten()));
        let mut reason = match status {
            Some(status) => format!("server process exited ({status})"),
            None => "server stdout closed".to_string(),
        };
        reason.push_str(&self.stderr_suffix());
        reason
    }

    /// Last captured stderr output, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lock()
            .map(|tail| tail.to_string_lossy())
            .unwrap_or_default()
    }

    fn stderr_suffix(&self) -> String {
        let tail = self.stderr_tail();
        let tail = tail.trim();
        if tail.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {tail}")
        }
    }
}

impl StdioReader {
    fn new(server_name: &str, framing: Framing, log_messages: bool, inner: BoxedReader) -> Self {
        Self {
            server_name: server_name.to_string(),
            framing,
            log_messages,
            inner: BufReader::new(inner),
        }
    }

    /// Next message from stdout. `Ok(None)` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<RpcMessage>, McpError> {
        let frame = codec::read_frame(&mut self.inner, self.framing)
            .await
            .map_err(|e| self.codec_error(e))?;
        let Some(frame) = frame else {
            return Ok(None);
        };
        if self.log_messages {
            tracing::debug!(
                server = %self.server_name,
                frame = %String::from_utf8_lossy(&frame),
                "<- stdio"
            );
        }
        codec::decode_message(&frame)
            .map(Some)
            .map_err(|e| self.codec_error(e))
    }

    fn codec_error(&self, e: CodecError) -> McpError {
        match e {
            CodecError::Io(e) => McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to read from stdout: {e}"),
            },
            other => McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: other.to_string(),
            },
        }
    }
}

/// Ring of the most recent stderr bytes.
#[derive(Debug, Default)]
struct StderrTail {
    buf: Vec<u8>,
}

impl StderrTail {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > STDERR_TAIL_BYTES {
            let excess = self.buf.len() - STDERR_TAIL_BYTES;
            self.buf.drain(..excess);
        }
    }

    fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

async fn capture_stderr<R>(server_name: String, pipe: R, tail: Arc<StdMutex<StderrTail>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                tracing::debug!(
                    server = %server_name,
                    line = %String::from_utf8_lossy(&line).trim_end(),
                    "server stderr"
                );
                if let Ok(mut tail) = tail.lock() {
                    tail.push(&line);
                }
            }
        }
    }
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// POST-per-message transport with session tracking.
pub struct HttpTransport {
    server_name: String,
    url: String,
    client: reqwest::Client,
    log_messages: bool,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<String>,
    permits: Semaphore,
}

impl HttpTransport {
    pub fn new(
        server_name: &str,
        config: &HttpServerConfig,
        connect_timeout: Duration,
        max_concurrent_requests: usize,
        log_messages: bool,
    ) -> Result<Self, McpError> {
        let headers = build_headers(server_name, config)?;
        let validate_certs = config.tls_verify.unwrap_or(true);
        if !validate_certs {
            tracing::warn!(server = server_name, "TLS certificate validation disabled");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(!validate_certs)
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            url: config.url.clone(),
            client,
            log_messages,
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(CLIENT_PROTOCOL_VERSION.to_string()),
            permits: Semaphore::new(max_concurrent_requests.max(1)),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    /// Record the negotiated protocol version sent on later requests.
    pub fn set_protocol_version(&self, version: &str) {
        if let Ok(mut guard) = self.protocol_version.lock() {
            *guard = version.to_string();
        }
    }

    fn protocol_version(&self) -> String {
        self.protocol_version
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| CLIENT_PROTOCOL_VERSION.to_string())
    }

    /// Number of POSTs that may start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// POST one message and collect the reply frames.
    ///
    /// When `expect` is set and the reply is an SSE stream, reading stops as
    /// soon as the response carrying that id arrives.
    pub async fn post(
        &self,
        message: &RpcMessage,
        expect: Option<&RequestId>,
    ) -> Result<Vec<RpcMessage>, McpError> {
        let _permit = self.permits.acquire().await.map_err(|_| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "transport is closed".into(),
        })?;

        let body = serde_json::to_vec(message).map_err(|e| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: format!("failed to encode message: {e}"),
        })?;
        if self.log_messages {
            tracing::debug!(
                server = %self.server_name,
                frame = %String::from_utf8_lossy(&body),
                "-> http"
            );
        }

        let mut req = self
            .client
            .post(&self.url)
            .header(PROTOCOL_VERSION_HEADER, self.protocol_version())
            .body(body);
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await.map_err(|e| self.http_error(&e))?;
        let status = resp.status();
        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                if guard.as_deref() != Some(session) {
                    tracing::debug!(server = %self.server_name, session, "MCP session established");
                    *guard = Some(session.to_string());
                }
            }
        }

        if status == StatusCode::ACCEPTED {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let preview = read_body_preview(resp, BODY_PREVIEW_BYTES).await;
            let reason = match preview {
                Some(body) => format!("HTTP {status}: {body}"),
                None => format!("HTTP {status}"),
            };
            return Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream(&content_type) {
            self.read_sse(resp, expect).await
        } else {
            let body = self.read_body(resp).await?;
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            if self.log_messages {
                tracing::debug!(
                    server = %self.server_name,
                    frame = %String::from_utf8_lossy(&body),
                    "<- http"
                );
            }
            codec::decode_body(&body).map_err(|e| self.protocol_error(e))
        }
    }

    async fn read_body(&self, resp: reqwest::Response) -> Result<Vec<u8>, McpError> {
        let mut out = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.http_error(&e))?;
            if out.len() + chunk.len() > MAX_FRAME_BYTES {
                return Err(self.protocol_error(CodecError::FrameTooLarge {
                    len: out.len() + chunk.len(),
                    max: MAX_FRAME_BYTES,
                }));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn read_sse(
        &self,
        resp: reqwest::Response,
        expect: Option<&RequestId>,
    ) -> Result<Vec<RpcMessage>, McpError> {
        let mut messages = Vec::new();
        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.http_error(&e))?;
            let events = decoder.push(&chunk).map_err(|e| self.protocol_error(e))?;
            for data in events {
                if self.accept_event(&data, expect, &mut messages)? {
                    return Ok(messages);
                }
            }
        }
        if let Some(data) = decoder.finish().map_err(|e| self.protocol_error(e))? {
            self.accept_event(&data, expect, &mut messages)?;
        }
        Ok(messages)
    }

    /// Decode one SSE event; true once the expected response is in hand.
    fn accept_event(
        &self,
        data: &str,
        expect: Option<&RequestId>,
        messages: &mut Vec<RpcMessage>,
    ) -> Result<bool, McpError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(self.protocol_error(CodecError::FrameTooLarge {
                len: data.len(),
                max: MAX_FRAME_BYTES,
            }));
        }
        if self.log_messages {
            tracing::debug!(server = %self.server_name, frame = %data, "<- sse");
        }
        let message = codec::decode_message(data.as_bytes()).map_err(|e| self.protocol_error(e))?;
        let done = matches!(
            (&message, expect),
            (RpcMessage::Response(resp), Some(id)) if &resp.id == id
        );
        messages.push(message);
        Ok(done)
    }

    /// Best-effort `DELETE` to end the server-side session.
    pub async fn close(&self) {
        self.permits.close();
        let session = self.session_id.lock().ok().and_then(|mut guard| guard.take());
        let Some(session) = session else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, &session)
            .header(PROTOCOL_VERSION_HEADER, self.protocol_version())
            .timeout(SESSION_DELETE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => {
                tracing::debug!(server = %self.server_name, status = %resp.status(), "MCP session deleted")
            }
            Err(e) => {
                tracing::debug!(server = %self.server_name, error = %redact_reqwest_error(&e), "MCP session delete failed")
            }
        }
    }

    fn http_error(&self, e: &reqwest::Error) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: redact_reqwest_error(e),
        }
    }

    fn protocol_error(&self, e: CodecError) -> McpError {
        McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: e.to_string(),
        }
    }
}

fn build_headers(server_name: &str, config: &HttpServerConfig) -> Result<HeaderMap, McpError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    if let Some(token) = config.bearer_token.as_deref().filter(|t| !t.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            McpError::ConfigError {
                reason: format!("invalid bearer token for server '{server_name}'"),
            }
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    insert_custom_headers(server_name, &mut headers, &config.headers)?;
    Ok(headers)
}

fn insert_custom_headers(
    server_name: &str,
    headers: &mut HeaderMap,
    custom: &BTreeMap<String, String>,
) -> Result<(), McpError> {
    for (key, value) in custom {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| McpError::ConfigError {
            reason: format!("invalid http header name '{key}' for server '{server_name}'"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| McpError::ConfigError {
            reason: format!("invalid http header value for '{key}' on server '{server_name}'"),
        })?;
        headers.insert(name, value);
    }
    Ok(())
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("text/event-stream")
}

async fn read_body_preview(resp: reqwest::Response, max_bytes: usize) -> Option<String> {
    let mut out = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.ok()?;
        let take = (max_bytes - out.len()).min(chunk.len());
        out.extend_from_slice(&chunk[..take]);
        if out.len() >= max_bytes {
            break;
        }
    }
    let preview = String::from_utf8_lossy(&out).trim().to_string();
    (!preview.is_empty()).then_some(preview)
}

/// Strip credentials, path and query from URLs quoted in reqwest errors.
fn redact_reqwest_error(err: &reqwest::Error) -> String {
    let msg = err.to_string();
    let Some(url) = err.url() else {
        return msg;
    };
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_path("/");
    redacted.set_query(None);
    redacted.set_fragment(None);
    msg.replace(url.as_str(), redacted.as_str())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
