//! Scripted MCP servers for tests: in-memory stdio and loopback HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::codec::{self, Framing};
use super::transport::{StdioReader, StdioTransport};
use super::types::{JsonRpcRequest, JsonRpcResponse, RpcMessage, CLIENT_PROTOCOL_VERSION};

/// Behavior knobs for the fake server.
#[derive(Clone)]
pub(crate) struct FakeServer {
    pub protocol_version: String,
    pub advertise_tools: bool,
    pub tools: Vec<Value>,
    pub page_size: usize,
    pub call_delay: Duration,
    pub silent_methods: Vec<String>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub list_calls: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            protocol_version: CLIENT_PROTOCOL_VERSION.to_string(),
            advertise_tools: true,
            tools: default_tools(),
            page_size: 0,
            call_delay: Duration::ZERO,
            silent_methods: Vec::new(),
            received: Arc::new(Mutex::new(Vec::new())),
            list_calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub(crate) fn default_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "suggest_aws_commands",
            "description": "Suggest AWS CLI commands",
            "inputSchema": {
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }
        }),
        json!({
            "name": "echo",
            "description": "Echo arguments back",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}, "n": {"type": "integer"}},
                "required": ["message"]
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports a tool error",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ]
}

impl FakeServer {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, method: &str) {
        if let Ok(mut received) = self.received.lock() {
            received.push(method.to_string());
        }
    }

    /// Answer one request; `None` means stay silent.
    pub async fn respond(&self, req: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        self.record(&req.method);
        if self.silent_methods.iter().any(|m| m == &req.method) {
            return None;
        }
        let params = req.params.clone().unwrap_or(Value::Null);
        let id = req.id.clone();
        let resp = match req.method.as_str() {
            "initialize" => {
                let mut capabilities = json!({});
                if self.advertise_tools {
                    capabilities["tools"] = json!({"listChanged": true});
                }
                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": self.protocol_version,
                        "capabilities": capabilities,
                        "serverInfo": {"name": "fake-mcp", "version": "0.1.0"}
                    }),
                )
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let size = if self.page_size == 0 { self.tools.len() } else { self.page_size };
                let end = (start + size).min(self.tools.len());
                let mut result = json!({"tools": self.tools[start..end].to_vec()});
                if end < self.tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                JsonRpcResponse::success(id, result)
            }
            "tools/call" => {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(current, Ordering::SeqCst);
                if !self.call_delay.is_zero() {
                    tokio::time::sleep(self.call_delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                match name {
                    "fail" => JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{"type": "text", "text": "bucket not found"}],
                            "isError": true
                        }),
                    ),
                    "suggest_aws_commands" => JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{
                                "type": "text",
                                "text": format!("aws {} help", args["query"].as_str().unwrap_or_default())
                            }]
                        }),
                    ),
                    "echo" => JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{"type": "text", "text": args["message"].clone()}],
                            "structuredContent": args
                        }),
                    ),
                    other => JsonRpcResponse::failure(id, -32602, format!("Unknown tool: {other}")),
                }
            }
            other => JsonRpcResponse::failure(id, -32601, format!("Method not found: {other}")),
        };
        Some(resp)
    }

    /// Serve over an in-memory pipe; returns the client halves.
    pub fn spawn_stdio(self, framing: Framing) -> (StdioTransport, StdioReader, JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (transport, reader) =
            StdioTransport::from_streams("fake", framing, client_write, client_read);

        let server_write = Arc::new(tokio::sync::Mutex::new(server_write));
        let task = tokio::spawn(async move {
            let mut server_read = BufReader::new(server_read);
            while let Ok(Some(frame)) = codec::read_frame(&mut server_read, framing).await {
                let Ok(message) = codec::decode_message(&frame) else {
                    continue;
                };
                match message {
                    RpcMessage::Request(req) => {
                        let server = self.clone();
                        let writer = server_write.clone();
                        tokio::spawn(async move {
                            if let Some(resp) = server.respond(&req).await {
                                let Ok(out) = codec::encode_frame(&RpcMessage::from(resp), framing) else {
                                    return;
                                };
                                let mut writer = writer.lock().await;
                                let _ = writer.write_all(&out).await;
                            }
                        });
                    }
                    RpcMessage::Notification(n) => self.record(&n.method),
                    RpcMessage::Response(_) => self.record("response"),
                }
            }
        });
        (transport, reader, task)
    }

    /// Serve streamable HTTP on a loopback port; returns the endpoint URL.
    pub async fn spawn_http(self) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let server = self.clone();
                tokio::spawn(async move {
                    let Some((method, body)) = read_http_request(&mut socket).await else {
                        return;
                    };
                    if method == "DELETE" {
                        server.record("DELETE");
                        let _ = socket
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                            .await;
                        return;
                    }
                    let reply = match serde_json::from_slice::<Value>(&body)
                        .ok()
                        .and_then(|v| RpcMessage::from_value(v).ok())
                    {
                        Some(RpcMessage::Request(req)) => server.respond(&req).await,
                        Some(RpcMessage::Notification(n)) => {
                            server.record(&n.method);
                            None
                        }
                        _ => None,
                    };
                    let out = match reply {
                        Some(resp) => {
                            let body = serde_json::to_vec(&resp).unwrap_or_default();
                            let mut out = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nMcp-Session-Id: fake-session\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            out.extend_from_slice(&body);
                            out
                        }
                        None => b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
                    };
                    let _ = socket.write_all(&out).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/mcp")
    }
}

async fn read_http_request(socket: &mut tokio::net::TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let method = head.split_whitespace().next()?.to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    Some((method, buf[body_start..body_start + content_length].to_vec()))
}
