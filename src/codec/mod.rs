//! Framing layer: turns buffered socket bytes into whole messages.
//!
//! Each connection owns exactly one codec, selected when the connection is
//! created. The two framings are a closed set dispatched by `match`:
//!
//! - `binary`: fixed-size header plus length-declared body
//! - `http`: HTTP/1.x request/response via a streaming parser
//!
//! Decode is idempotent under partial input: no bytes are consumed from
//! the buffer until a full message is available, so the caller may retry
//! the same decode as more bytes arrive. After `Error` the buffer must be
//! discarded (the connection closed), never re-decoded.

pub mod binary;
pub mod http;

pub use binary::BinaryCodec;
pub use http::{HttpCodec, HttpHead, HttpMessage};

use crate::reactor::buffer::Buffer;
use bytes::Bytes;
use std::time::Duration;

/// Wire protocol selected for a connection at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Binary,
    Http,
}

/// One length-framed binary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Command identifier.
    pub command: u32,
    /// Sequence identifier, echoed in responses.
    pub seq: u32,
    /// Message body; empty for heartbeats.
    pub body: Bytes,
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Binary(BinaryFrame),
    Http(HttpMessage),
}

/// Result of a decode attempt.
#[derive(Debug)]
pub enum DecodeResult {
    /// One full message consumed from the buffer.
    Complete(Message),
    /// Insufficient bytes buffered; wait for more I/O.
    Incomplete,
    /// Malformed data; the connection must be closed.
    Error,
}

/// Result of an encode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeResult {
    /// Message appended to the buffer.
    Complete,
    /// Message could not be encoded; the buffer is unchanged.
    Error,
}

/// Codec instance owned by a connection.
#[derive(Debug)]
pub enum Codec {
    Binary(BinaryCodec),
    Http(HttpCodec),
}

impl Codec {
    /// Build the codec for the given wire protocol.
    pub fn new(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Binary => Codec::Binary(BinaryCodec::new()),
            CodecKind::Http => Codec::Http(HttpCodec::request_mode()),
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Binary(_) => CodecKind::Binary,
            Codec::Http(_) => CodecKind::Http,
        }
    }

    /// Try to decode one message from the buffer.
    pub fn decode(&mut self, buf: &mut Buffer) -> DecodeResult {
        match self {
            Codec::Binary(codec) => codec.decode(buf),
            Codec::Http(codec) => codec.decode(buf),
        }
    }

    /// Append one encoded message to the buffer.
    ///
    /// A message of the wrong framing for this codec is an encode error.
    pub fn encode(&mut self, msg: &Message, buf: &mut Buffer) -> EncodeResult {
        match (self, msg) {
            (Codec::Binary(codec), Message::Binary(frame)) => codec.encode(frame, buf),
            (Codec::Http(codec), Message::Http(msg)) => codec.encode(msg, buf),
            _ => EncodeResult::Error,
        }
    }

    /// Keep-alive derived from protocol semantics, if this codec has one.
    ///
    /// The HTTP codec reports a duration based on the most recently decoded
    /// message's `Connection` header; it overrides the connection default.
    pub fn keep_alive(&self) -> Option<Duration> {
        match self {
            Codec::Binary(_) => None,
            Codec::Http(codec) => codec.keep_alive(),
        }
    }
}
