//! Descriptor handoff boundary.
//!
//! The excluded manager/worker topology moves already-open sockets
//! between processes. What crosses the control channel is a small
//! fixed-size record naming the descriptor, its address family, and the
//! codec the connection speaks; the receiving reactor adopts the
//! descriptor and from then on the connection is indistinguishable from
//! a locally accepted one.

#![allow(dead_code)] // The encode side runs in the sending process

use crate::codec::CodecKind;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Encoded record length on the control channel.
pub const RECORD_LEN: usize = 8;

/// Address family of a handed-over socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("record too short: {0} bytes, need {RECORD_LEN}")]
    Truncated(usize),
    #[error("unknown address family {0}")]
    BadFamily(u8),
    #[error("unknown codec kind {0}")]
    BadCodec(u8),
    #[error("descriptor {0} is not open")]
    BadDescriptor(RawFd),
}

/// Control-channel record describing one handed-over descriptor.
///
/// Layout: little-endian `i32` descriptor, one byte address family
/// (4 or 6), one byte codec kind, two reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffRecord {
    pub fd: RawFd,
    pub family: AddressFamily,
    pub codec: CodecKind,
}

const CODEC_BINARY: u8 = 1;
const CODEC_HTTP: u8 = 2;

impl HandoffRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[..4].copy_from_slice(&self.fd.to_le_bytes());
        out[4] = match self.family {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        };
        out[5] = match self.codec {
            CodecKind::Binary => CODEC_BINARY,
            CodecKind::Http => CODEC_HTTP,
        };
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandoffError> {
        if bytes.len() < RECORD_LEN {
            return Err(HandoffError::Truncated(bytes.len()));
        }
        let fd = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let family = match bytes[4] {
            4 => AddressFamily::V4,
            6 => AddressFamily::V6,
            other => return Err(HandoffError::BadFamily(other)),
        };
        let codec = match bytes[5] {
            CODEC_BINARY => CodecKind::Binary,
            CODEC_HTTP => CodecKind::Http,
            other => return Err(HandoffError::BadCodec(other)),
        };
        Ok(Self { fd, family, codec })
    }
}

/// Check that a received descriptor refers to an open file.
///
/// A stale descriptor must be rejected before adoption: wrapping it
/// would otherwise hijack whatever fd number the process reuses next.
pub fn validate_fd(fd: RawFd) -> Result<(), HandoffError> {
    // SAFETY: F_GETFD only inspects the descriptor table entry.
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if rc == -1 {
        Err(HandoffError::BadDescriptor(fd))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let record = HandoffRecord {
            fd: 17,
            family: AddressFamily::V6,
            codec: CodecKind::Http,
        };
        let wire = record.encode();
        assert_eq!(HandoffRecord::decode(&wire).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            HandoffRecord::decode(&[0; 4]),
            Err(HandoffError::Truncated(4))
        ));

        let mut wire = HandoffRecord {
            fd: 3,
            family: AddressFamily::V4,
            codec: CodecKind::Binary,
        }
        .encode();
        wire[4] = 9;
        assert!(matches!(
            HandoffRecord::decode(&wire),
            Err(HandoffError::BadFamily(9))
        ));

        wire[4] = 4;
        wire[5] = 0;
        assert!(matches!(
            HandoffRecord::decode(&wire),
            Err(HandoffError::BadCodec(0))
        ));
    }

    #[test]
    fn test_validate_fd() {
        // stdin exists; a wildly out-of-range fd does not.
        assert!(validate_fd(0).is_ok());
        assert!(validate_fd(1_000_000).is_err());
    }
}
