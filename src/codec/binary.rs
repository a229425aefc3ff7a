//! Length-framed binary codec.
//!
//! Wire format: `[header][body]` where the header is 12 bytes, three
//! big-endian `u32` fields in order: command id, sequence id, body
//! length. The body is present iff body length > 0; a zero-length body is
//! a valid complete message (heartbeat).

use super::{BinaryFrame, DecodeResult, EncodeResult, Message};
use crate::reactor::buffer::Buffer;
use bytes::Bytes;

/// Header byte length. The encoder and decoder share this constant with
/// the field layout below; changing one without the other desynchronizes
/// the wire format.
pub const HEADER_LEN: usize = 12;

/// Upper bound on a declared body length. Anything larger is treated as a
/// corrupt frame rather than an allocation request.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Stateless binary framing codec.
#[derive(Debug, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode one frame from the buffer.
    ///
    /// Requires the full header, then `HEADER_LEN + body_len` bytes,
    /// before consuming anything.
    pub fn decode(&mut self, buf: &mut Buffer) -> DecodeResult {
        let readable = buf.readable();
        if readable.len() < HEADER_LEN {
            return DecodeResult::Incomplete;
        }

        let command = read_u32(readable, 0);
        let seq = read_u32(readable, 4);
        let body_len = read_u32(readable, 8) as usize;

        if body_len > MAX_BODY_LEN {
            return DecodeResult::Error;
        }
        if readable.len() < HEADER_LEN + body_len {
            return DecodeResult::Incomplete;
        }

        let body = Bytes::copy_from_slice(&readable[HEADER_LEN..HEADER_LEN + body_len]);
        buf.advance_read(HEADER_LEN + body_len);
        DecodeResult::Complete(Message::Binary(BinaryFrame { command, seq, body }))
    }

    /// Append one frame, header then body, contiguously.
    pub fn encode(&mut self, frame: &BinaryFrame, buf: &mut Buffer) -> EncodeResult {
        let body = frame.body.clone();
        self.encode_with(frame.command, frame.seq, body.len(), buf, |buf| {
            buf.extend_from_slice(&body);
            Ok::<(), ()>(())
        })
    }

    /// Append a frame whose body is produced by `write_body`.
    ///
    /// The header is written first with the declared length. If the body
    /// serializer fails, or produces a different number of bytes than
    /// declared, the write cursor is rolled back to its pre-header
    /// position: readers never observe a partial frame.
    pub fn encode_with<F, E>(
        &mut self,
        command: u32,
        seq: u32,
        body_len: usize,
        buf: &mut Buffer,
        write_body: F,
    ) -> EncodeResult
    where
        F: FnOnce(&mut Buffer) -> Result<(), E>,
    {
        if body_len > MAX_BODY_LEN {
            return EncodeResult::Error;
        }

        let mark = buf.write_mark();
        buf.extend_from_slice(&command.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());

        let expected = buf.readable_len() + body_len;
        match write_body(buf) {
            Ok(()) if buf.readable_len() == expected => EncodeResult::Complete,
            _ => {
                buf.rollback_write(mark);
                EncodeResult::Error
            }
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
