//! HTTP/1.x codec over a streaming parser.
//!
//! Decode feeds the buffered bytes into `httparse` each time more data
//! arrives; nothing is consumed until the head and the full body (per
//! `Content-Length` or the chunked terminator) are buffered. The codec
//! also derives a keep-alive duration from the `Connection` header
//! semantics of the most recently decoded message, which overrides the
//! connection-level default.

#![allow(dead_code)] // Response-mode decode serves client-side (peer) connections

use super::{DecodeResult, EncodeResult, Message};
use crate::reactor::buffer::Buffer;
use bytes::Bytes;
use std::time::Duration;

/// Maximum accepted head size; a partial head larger than this is a
/// protocol error, not a wait-for-more.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Maximum number of parsed headers.
const MAX_HEADERS: usize = 64;

/// Upper bound on an accepted body.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Keep-alive applied when the peer asks for a persistent connection
/// without naming an explicit timeout.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Which side of the exchange this codec decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMode {
    Request,
    Response,
}

/// First line of an HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpHead {
    Request {
        method: String,
        path: String,
        minor_version: u8,
    },
    Response {
        code: u16,
        reason: String,
        minor_version: u8,
    },
}

/// One decoded or to-be-encoded HTTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub head: HttpHead,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl HttpMessage {
    /// Build an HTTP/1.1 request.
    pub fn request(method: &str, path: &str, body: Bytes) -> Self {
        Self {
            head: HttpHead::Request {
                method: method.to_string(),
                path: path.to_string(),
                minor_version: 1,
            },
            headers: Vec::new(),
            body,
        }
    }

    /// Build an HTTP/1.1 response.
    pub fn response(code: u16, reason: &str, body: Bytes) -> Self {
        Self {
            head: HttpHead::Response {
                code,
                reason: reason.to_string(),
                minor_version: 1,
            },
            headers: Vec::new(),
            body,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Streaming HTTP codec. Holds the keep-alive derived from the last
/// decoded message.
#[derive(Debug)]
pub struct HttpCodec {
    mode: HttpMode,
    keep_alive: Option<Duration>,
}

enum Parsed {
    Complete {
        msg: HttpMessage,
        consumed: usize,
        keep_alive: Duration,
    },
    Incomplete,
    Error,
}

impl HttpCodec {
    /// Codec for the server side: decodes requests, encodes responses.
    pub fn request_mode() -> Self {
        Self {
            mode: HttpMode::Request,
            keep_alive: None,
        }
    }

    /// Codec for the client side: decodes responses, encodes requests.
    pub fn response_mode() -> Self {
        Self {
            mode: HttpMode::Response,
            keep_alive: None,
        }
    }

    /// Keep-alive derived from the most recently decoded message.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Try to decode one full message from the buffer.
    pub fn decode(&mut self, buf: &mut Buffer) -> DecodeResult {
        let (msg, consumed, keep_alive) = match self.parse(buf.readable()) {
            Parsed::Complete {
                msg,
                consumed,
                keep_alive,
            } => (msg, consumed, keep_alive),
            Parsed::Incomplete => return DecodeResult::Incomplete,
            Parsed::Error => return DecodeResult::Error,
        };
        self.keep_alive = Some(keep_alive);
        buf.advance_read(consumed);
        DecodeResult::Complete(Message::Http(msg))
    }

    fn parse(&self, readable: &[u8]) -> Parsed {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];

        let (head, head_len) = match self.mode {
            HttpMode::Request => {
                let mut req = httparse::Request::new(&mut header_storage);
                match req.parse(readable) {
                    Ok(httparse::Status::Complete(n)) => {
                        let (Some(method), Some(path), Some(version)) =
                            (req.method, req.path, req.version)
                        else {
                            return Parsed::Error;
                        };
                        (
                            HttpHead::Request {
                                method: method.to_string(),
                                path: path.to_string(),
                                minor_version: version,
                            },
                            n,
                        )
                    }
                    Ok(httparse::Status::Partial) => return partial(readable),
                    Err(_) => return Parsed::Error,
                }
            }
            HttpMode::Response => {
                let mut res = httparse::Response::new(&mut header_storage);
                match res.parse(readable) {
                    Ok(httparse::Status::Complete(n)) => {
                        let (Some(code), Some(version)) = (res.code, res.version) else {
                            return Parsed::Error;
                        };
                        (
                            HttpHead::Response {
                                code,
                                reason: res.reason.unwrap_or("").to_string(),
                                minor_version: version,
                            },
                            n,
                        )
                    }
                    Ok(httparse::Status::Partial) => return partial(readable),
                    Err(_) => return Parsed::Error,
                }
            }
        };

        let headers: Vec<(String, Vec<u8>)> = header_storage
            .iter()
            .take_while(|h| !h.name.is_empty())
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect();

        let (body, consumed) = match body_framing(&headers) {
            Some(BodyFraming::Length(len)) => {
                if len > MAX_BODY_LEN {
                    return Parsed::Error;
                }
                if readable.len() < head_len + len {
                    return Parsed::Incomplete;
                }
                (
                    Bytes::copy_from_slice(&readable[head_len..head_len + len]),
                    head_len + len,
                )
            }
            Some(BodyFraming::Chunked) => match decode_chunked(&readable[head_len..]) {
                ChunkedResult::Complete(body, n) => (Bytes::from(body), head_len + n),
                ChunkedResult::Incomplete => return Parsed::Incomplete,
                ChunkedResult::Error => return Parsed::Error,
            },
            // No framing header: the message ends with its head.
            None => (Bytes::new(), head_len),
        };

        let minor_version = match &head {
            HttpHead::Request { minor_version, .. } => *minor_version,
            HttpHead::Response { minor_version, .. } => *minor_version,
        };
        let keep_alive = derive_keep_alive(minor_version, &headers);

        Parsed::Complete {
            msg: HttpMessage {
                head,
                headers,
                body,
            },
            consumed,
            keep_alive,
        }
    }

    /// Append one encoded message: first line, headers, body.
    ///
    /// `Content-Length` is supplied from the actual body; a caller-set
    /// length or transfer-encoding header is dropped rather than trusted.
    pub fn encode(&mut self, msg: &HttpMessage, buf: &mut Buffer) -> EncodeResult {
        let mark = buf.write_mark();

        let first_line = match &msg.head {
            HttpHead::Request {
                method,
                path,
                minor_version,
            } => format!("{} {} HTTP/1.{}\r\n", method, path, minor_version),
            HttpHead::Response {
                code,
                reason,
                minor_version,
            } => format!("HTTP/1.{} {} {}\r\n", minor_version, code, reason),
        };
        // Header injection guard: the first line must be exactly one line.
        if first_line[..first_line.len() - 2].contains(['\r', '\n']) {
            return EncodeResult::Error;
        }
        buf.extend_from_slice(first_line.as_bytes());

        for (name, value) in &msg.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            // Header injection guard.
            if name.contains(['\r', '\n']) || value.contains(&b'\n') {
                buf.rollback_write(mark);
                return EncodeResult::Error;
            }
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }

        let needs_length = !msg.body.is_empty() || matches!(msg.head, HttpHead::Response { .. });
        if needs_length {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", msg.body.len()).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&msg.body);
        EncodeResult::Complete
    }
}

fn partial(readable: &[u8]) -> Parsed {
    if readable.len() > MAX_HEAD_LEN {
        Parsed::Error
    } else {
        Parsed::Incomplete
    }
}

enum BodyFraming {
    Length(usize),
    Chunked,
}

fn body_framing(headers: &[(String, Vec<u8>)]) -> Option<BodyFraming> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            && ascii_contains(value, b"chunked")
        {
            return Some(BodyFraming::Chunked);
        }
        if name.eq_ignore_ascii_case("content-length") {
            let len = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok());
            return Some(BodyFraming::Length(len.unwrap_or(usize::MAX)));
        }
    }
    None
}

enum ChunkedResult {
    /// Assembled body plus total encoded length including the terminator.
    Complete(Vec<u8>, usize),
    Incomplete,
    Error,
}

/// Walk the chunked encoding without consuming: every chunk, the zero
/// terminator, and the final blank line must be buffered before this
/// reports completion.
fn decode_chunked(input: &[u8]) -> ChunkedResult {
    let mut pos = 0;
    let mut body = Vec::new();

    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&input[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return ChunkedResult::Incomplete,
            Err(_) => return ChunkedResult::Error,
        };
        pos += line_len;

        if size == 0 {
            // Optional trailer lines, then one blank line.
            loop {
                match find_crlf(&input[pos..]) {
                    Some(0) => return ChunkedResult::Complete(body, pos + 2),
                    Some(n) => pos += n + 2,
                    None => return ChunkedResult::Incomplete,
                }
            }
        }

        let size = size as usize;
        if size > MAX_BODY_LEN || body.len() + size > MAX_BODY_LEN {
            return ChunkedResult::Error;
        }
        if input.len() < pos + size + 2 {
            return ChunkedResult::Incomplete;
        }
        if &input[pos + size..pos + size + 2] != b"\r\n" {
            return ChunkedResult::Error;
        }
        body.extend_from_slice(&input[pos..pos + size]);
        pos += size + 2;
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    (0..bytes.len().saturating_sub(1)).find(|&i| bytes[i] == b'\r' && bytes[i + 1] == b'\n')
}

/// Derive the effective keep-alive from the Connection header semantics.
///
/// HTTP/1.1 is persistent unless `Connection: close`; HTTP/1.0 is
/// persistent only with `Connection: keep-alive`. An explicit
/// `Keep-Alive: timeout=N` names the duration; otherwise the default
/// applies. A non-persistent message derives a zero keep-alive, closing
/// the connection at the next idle check.
fn derive_keep_alive(minor_version: u8, headers: &[(String, Vec<u8>)]) -> Duration {
    let mut close = false;
    let mut keep_alive = false;
    let mut timeout = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            close = close || ascii_contains(value, b"close");
            keep_alive = keep_alive || ascii_contains(value, b"keep-alive");
        } else if name.eq_ignore_ascii_case("keep-alive") {
            timeout = parse_keep_alive_timeout(value);
        }
    }

    let persistent = !close && (minor_version >= 1 || keep_alive);
    if persistent {
        timeout.unwrap_or(DEFAULT_KEEP_ALIVE)
    } else {
        Duration::ZERO
    }
}

/// Extract `timeout=N` from a `Keep-Alive` header value.
fn parse_keep_alive_timeout(value: &[u8]) -> Option<Duration> {
    let text = std::str::from_utf8(value).ok()?;
    for part in text.split(',') {
        let mut kv = part.splitn(2, '=');
        let key = kv.next()?.trim();
        if key.eq_ignore_ascii_case("timeout") {
            let secs: u64 = kv.next()?.trim().parse().ok()?;
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

fn ascii_contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}
