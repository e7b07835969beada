//! JSON-RPC frame codec.
//!
//! Exactly one [`RpcMessage`] per frame:
//! - stdio: one JSON document per line (default) or `Content-Length:` headed
//!   frames, chosen per server in the manifest
//! - HTTP: one POST body (a single message or a batch array) or one SSE event
//!
//! Decoding never panics; malformed input surfaces as [`CodecError`], which
//! the connection layer maps to a protocol error.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::types::RpcMessage;

/// Largest frame accepted from a server.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Stdio framing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One JSON object per line.
    #[default]
    NewlineDelimited,
    /// `Content-Length: N\r\n\r\n` followed by N bytes of JSON.
    ContentLength,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Encode a message as a complete stdio frame.
pub fn encode_frame(message: &RpcMessage, framing: Framing) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(message)?;
    Ok(match framing {
        Framing::NewlineDelimited => {
            // serde_json never emits raw newlines in compact output.
            let mut frame = body;
            frame.push(b'\n');
            frame
        }
        Framing::ContentLength => {
            let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
            frame.extend_from_slice(&body);
            frame
        }
    })
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode a single JSON-RPC message.
pub fn decode_message(bytes: &[u8]) -> Result<RpcMessage, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    RpcMessage::from_value(value).map_err(CodecError::Malformed)
}

/// Decode an HTTP JSON body, which may be a single message or a batch.
pub fn decode_body(bytes: &[u8]) -> Result<Vec<RpcMessage>, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| RpcMessage::from_value(item).map_err(CodecError::Malformed))
            .collect(),
        single => Ok(vec![RpcMessage::from_value(single).map_err(CodecError::Malformed)?]),
    }
}

/// Read the next frame from a stdio stream. `Ok(None)` means clean EOF.
pub async fn read_frame<R>(reader: &mut R, framing: Framing) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::NewlineDelimited => read_line_frame(reader).await,
        Framing::ContentLength => read_content_length_frame(reader).await,
    }
}

async fn read_line_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let limit = (MAX_FRAME_BYTES + 1) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') && line.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge {
                len: line.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        let trimmed = trim_ascii(&line);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_vec()));
    }
}

async fn read_content_length_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let n = (&mut *reader).take(8 * 1024).read_line(&mut line).await?;
        if n == 0 {
            if saw_header {
                return Err(CodecError::Malformed("EOF inside frame headers".into()));
            }
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if !saw_header {
                continue;
            }
            break;
        }
        saw_header = true;
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    CodecError::Malformed(format!("invalid Content-Length '{}'", value.trim()))
                })?;
                content_length = Some(len);
            }
        }
    }

    let len = content_length
        .ok_or_else(|| CodecError::Malformed("frame headers missing Content-Length".into()))?;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// Incremental server-sent-events splitter.
///
/// Raw bytes are buffered and only complete lines are decoded, so a UTF-8
/// sequence or a CRLF split across chunks survives. Complete events come out
/// as the joined `data:` payload. Events without data (comments,
/// keep-alives) are dropped.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that rejects events (or unterminated lines) above `max_event_bytes`.
    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            max_event_bytes,
        }
    }

    /// Feed raw bytes and return the data payloads of all completed events.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let end = start + offset;
            let next = if self.buffer[end] == b'\r' {
                match self.buffer.get(end + 1) {
                    Some(b'\n') => end + 2,
                    Some(_) => end + 1,
                    // A trailing CR may be the first half of a CRLF.
                    None => break,
                }
            } else {
                end + 1
            };
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = next;
            if let Some(event) = self.accept_line(&line)? {
                events.push(event);
            }
        }
        self.buffer.drain(..start);

        let pending = self.buffer.len() + self.data_len;
        if pending > self.max_event_bytes {
            return Err(CodecError::FrameTooLarge {
                len: pending,
                max: self.max_event_bytes,
            });
        }
        Ok(events)
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Result<Option<String>, CodecError> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            if let Some(event) = self.accept_line(line)? {
                return Ok(Some(event));
            }
        }
        Ok(self.dispatch())
    }

    fn accept_line(&mut self, line: &str) -> Result<Option<String>, CodecError> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        let value = if line == "data" {
            ""
        } else if let Some(value) = line.strip_prefix("data:") {
            value.strip_prefix(' ').unwrap_or(value)
        } else {
            // Comments and the event/id/retry fields carry nothing we use.
            return Ok(None);
        };
        self.data_len += value.len() + 1;
        if self.data_len > self.max_event_bytes {
            return Err(CodecError::FrameTooLarge {
                len: self.data_len,
                max: self.max_event_bytes,
            });
        }
        self.data.push(value.to_string());
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<String> {
        self.data_len = 0;
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        if data.trim().is_empty() {
            None
        } else {
            Some(data)
        }
    }
}

/// Decode a complete SSE body into its messages.
pub fn decode_sse(body: &[u8]) -> Result<Vec<RpcMessage>, CodecError> {
    let mut decoder = SseDecoder::new();
    let mut payloads = decoder.push(body)?;
    payloads.extend(decoder.finish()?);
    payloads
        .iter()
        .map(|data| decode_message(data.as_bytes()))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::{JsonRpcNotification, JsonRpcRequest, RequestId};

    fn request() -> RpcMessage {
        JsonRpcRequest::new(7, "tools/list", None).into()
    }

    #[test]
    fn test_newline_frame_is_single_line() {
        let frame = encode_frame(&request(), Framing::NewlineDelimited).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(decode_message(&frame).is_ok());
    }

    #[test]
    fn test_content_length_frame_header() {
        let frame = encode_frame(&request(), Framing::ContentLength).unwrap();
        let text = String::from_utf8(frame).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
    }

    #[test]
    fn test_decode_malformed_is_error() {
        assert!(matches!(decode_message(b"not json"), Err(CodecError::Json(_))));
        assert!(matches!(
            decode_message(br#"{"id": 1, "result": {}}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_body_batch() {
        let body = br#"[{"jsonrpc":"2.0","method":"notifications/progress"},{"jsonrpc":"2.0","id":3,"result":{}}]"#;
        let messages = decode_body(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], RpcMessage::Notification(_)));
        assert!(matches!(messages[1], RpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_read_line_frames_skip_blank_lines() {
        let input: &[u8] = b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\r\n\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n";
        let mut reader = input;
        let first = read_frame(&mut reader, Framing::NewlineDelimited).await.unwrap().unwrap();
        assert!(matches!(decode_message(&first).unwrap(), RpcMessage::Response(_)));
        let second = read_frame(&mut reader, Framing::NewlineDelimited).await.unwrap().unwrap();
        assert!(matches!(decode_message(&second).unwrap(), RpcMessage::Notification(_)));
        assert!(read_frame(&mut reader, Framing::NewlineDelimited).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_frame_without_trailing_newline() {
        let mut reader: &[u8] = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        let frame = read_frame(&mut reader, Framing::NewlineDelimited).await.unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn test_read_content_length_frames() {
        let a = encode_frame(&request(), Framing::ContentLength).unwrap();
        let b = encode_frame(
            &JsonRpcNotification::new("notifications/initialized", None).into(),
            Framing::ContentLength,
        )
        .unwrap();
        let joined = [a, b].concat();
        let mut reader: &[u8] = &joined;

        let first = read_frame(&mut reader, Framing::ContentLength).await.unwrap().unwrap();
        match decode_message(&first).unwrap() {
            RpcMessage::Request(req) => assert_eq!(req.id, RequestId::Number(7)),
            other => panic!("expected request, got {other:?}"),
        }
        let second = read_frame(&mut reader, Framing::ContentLength).await.unwrap().unwrap();
        assert!(matches!(decode_message(&second).unwrap(), RpcMessage::Notification(_)));
        assert!(read_frame(&mut reader, Framing::ContentLength).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_length_rejects_oversized_and_missing_header() {
        let mut reader: &[u8] = b"Content-Length: 999999999999\r\n\r\n";
        assert!(matches!(
            read_frame(&mut reader, Framing::ContentLength).await,
            Err(CodecError::FrameTooLarge { .. })
        ));

        let mut reader: &[u8] = b"X-Other: 1\r\n\r\n{}";
        assert!(matches!(
            read_frame(&mut reader, Framing::ContentLength).await,
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: message\r\ndata: {\"jsonrpc\":").unwrap().is_empty());
        let events = decoder
            .push(b"\"2.0\",\"id\":1,\"result\":{}}\r\n\r\n: keep-alive\n\n")
            .unwrap();
        assert_eq!(events, vec![r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()]);
        assert!(decoder.finish().unwrap().is_none());
    }

    #[test]
    fn test_sse_utf8_split_across_chunks() {
        let event = "data: {\"t\":\"é\"}\n\n".as_bytes();
        let split = event.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&event[..split]).unwrap().is_empty());
        let events = decoder.push(&event[split..]).unwrap();
        assert_eq!(events, vec![r#"{"t":"é"}"#.to_string()]);
    }

    #[test]
    fn test_sse_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"jsonrpc\":\"2.0\",\r").unwrap().is_empty());
        let events = decoder
            .push(b"\ndata: \"id\":1,\"result\":{}}\r\n\r\n")
            .unwrap();
        assert_eq!(
            events,
            vec!["{\"jsonrpc\":\"2.0\",\n\"id\":1,\"result\":{}}".to_string()]
        );
        let message = decode_message(events[0].as_bytes()).unwrap();
        assert!(matches!(message, RpcMessage::Response(_)));
    }

    #[test]
    fn test_sse_lone_cr_terminates_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\r\rdata: b\r\r").unwrap();
        // The final CR is held back until the next byte or finish().
        assert_eq!(events, vec!["a".to_string()]);
        assert_eq!(decoder.finish().unwrap(), Some("b".to_string()));
    }

    #[test]
    fn test_sse_oversized_event_rejected() {
        let mut decoder = SseDecoder::with_limit(16);
        // No line terminator yet: the buffer alone crosses the limit.
        let err = decoder.push(&[b'x'; 32]).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 16, .. }));

        let mut decoder = SseDecoder::with_limit(16);
        decoder.push(b"data: 0123456789\n").unwrap();
        let err = decoder.push(b"data: 0123456789\n").unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_sse_multi_line_data_joined() {
        let body = b"data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":2,\"result\":{}}\n\n";
        let messages = decode_sse(body).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_sse_trailing_event_without_terminator() {
        let body = b"data: {\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        let messages = decode_sse(body).unwrap();
        assert_eq!(messages.len(), 2);
    }
}
