//! Per-socket connection state.
//!
//! A connection owns one socket, one codec (chosen at creation, immutable
//! afterward), and three buffers: receive, send, and pending-send. It
//! performs socket-level reads and writes and hands whole decoded
//! messages upward; it never interprets business semantics.
//!
//! ## Delivery phases
//!
//! Peer links between server instances complete a handshake before
//! application data may flow. Until the sys layer confirms the peer,
//! writes queue in the pending-send buffer; `promote` is the explicit
//! transition that flushes them into the send buffer and switches the
//! link to direct delivery.

#![allow(dead_code)] // Some accessors exist for the embedding application

use super::buffer::Buffer;
use super::timer::TimerId;
use crate::codec::{Codec, CodecKind, DecodeResult, EncodeResult, Message};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::debug;

/// Connection lifecycle state. Transitions are one-directional toward
/// `Closed`/`Error`, except the initial promotion to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect in flight.
    Connecting,
    /// Accepted, not yet registered with the reactor.
    Accepting,
    Connected,
    Closed,
    Error,
}

/// Result of a read or write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Progress made or nothing to do; not an error.
    Ok,
    /// Partial write; remaining bytes stay buffered for the next
    /// writable event.
    Pause,
    /// Peer closed the socket.
    Closed,
    /// Unrecoverable socket error.
    Error,
}

/// Write-path routing for peer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Ordinary connection; writes go straight to the send buffer.
    Direct,
    /// Peer link awaiting handshake; writes queue in pending-send.
    Queued,
    /// Handshake confirmed; pending-send drains ahead of the send buffer.
    Confirmed,
}

pub struct Connection {
    stream: TcpStream,
    fd: RawFd,
    /// Stable identity, independent of fd and registry-token reuse.
    seq: u64,
    state: ConnState,
    codec: Codec,
    recv: Buffer,
    send: Buffer,
    pending: Buffer,
    phase: DeliveryPhase,
    last_active: Instant,
    keep_alive: Duration,
    pub(crate) idle_timer: Option<TimerId>,
    pub(crate) write_interest: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    fn build(
        stream: TcpStream,
        seq: u64,
        kind: CodecKind,
        keep_alive: Duration,
        high_water: usize,
        now: Instant,
        state: ConnState,
        phase: DeliveryPhase,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            seq,
            state,
            codec: Codec::new(kind),
            recv: Buffer::new(high_water),
            send: Buffer::new(high_water),
            pending: Buffer::new(high_water),
            phase,
            last_active: now,
            keep_alive,
            idle_timer: None,
            write_interest: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Connection produced by the local accept loop.
    pub fn accepted(
        stream: TcpStream,
        seq: u64,
        kind: CodecKind,
        keep_alive: Duration,
        high_water: usize,
        now: Instant,
    ) -> Self {
        Self::build(
            stream,
            seq,
            kind,
            keep_alive,
            high_water,
            now,
            ConnState::Accepting,
            DeliveryPhase::Direct,
        )
    }

    /// Outbound peer link; writes queue until the handshake confirms.
    pub fn connecting(
        stream: TcpStream,
        seq: u64,
        kind: CodecKind,
        keep_alive: Duration,
        high_water: usize,
        now: Instant,
    ) -> Self {
        Self::build(
            stream,
            seq,
            kind,
            keep_alive,
            high_water,
            now,
            ConnState::Connecting,
            DeliveryPhase::Queued,
        )
    }

    /// Connection built around a descriptor handed over from another
    /// process; already established.
    pub fn adopted(
        stream: TcpStream,
        seq: u64,
        kind: CodecKind,
        keep_alive: Duration,
        high_water: usize,
        now: Instant,
    ) -> Self {
        Self::build(
            stream,
            seq,
            kind,
            keep_alive,
            high_water,
            now,
            ConnState::Connected,
            DeliveryPhase::Direct,
        )
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnState::Connecting | ConnState::Accepting | ConnState::Connected
        )
    }

    /// Promote to `Connected` once registered (accept path) or once the
    /// socket reports established (connect path).
    pub fn mark_connected(&mut self) {
        if matches!(self.state, ConnState::Connecting | ConnState::Accepting) {
            self.state = ConnState::Connected;
        }
    }

    pub fn close(&mut self) {
        if self.state != ConnState::Error {
            self.state = ConnState::Closed;
        }
    }

    pub fn mark_error(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Error;
        }
    }

    /// Peer handshake confirmed: flush queued writes into the send
    /// buffer and deliver directly from now on.
    pub fn promote(&mut self) {
        if self.phase == DeliveryPhase::Queued {
            self.phase = DeliveryPhase::Confirmed;
            self.pending.drain_to_buffer(&mut self.send);
            debug!(fd = self.fd, seq = self.seq, "peer link promoted");
        }
    }

    /// Read whatever the socket has into the receive buffer.
    pub fn read_cycle(&mut self) -> IoOutcome {
        let (n, status) = fill_buffer(&mut self.stream, &mut self.recv);
        if n > 0 {
            self.bytes_read += n as u64;
        }
        match status {
            FillStatus::WouldBlock => {
                self.last_active = Instant::now();
                self.recv.compact();
                IoOutcome::Ok
            }
            FillStatus::Eof => {
                self.state = ConnState::Closed;
                IoOutcome::Closed
            }
            FillStatus::Error(e) => {
                debug!(fd = self.fd, error = %e, "read failed");
                self.state = ConnState::Error;
                IoOutcome::Error
            }
        }
    }

    /// Drain buffered writes to the socket.
    ///
    /// A confirmed peer link drains its pre-promotion queue first; that
    /// data was accepted before the handshake completed and must go out
    /// ahead of anything newer.
    pub fn write_cycle(&mut self) -> IoOutcome {
        if self.phase == DeliveryPhase::Confirmed && !self.pending.is_empty() {
            match self.drain(WhichBuffer::Pending) {
                IoOutcome::Ok => {}
                other => return other,
            }
        }
        match self.drain(WhichBuffer::Send) {
            IoOutcome::Ok if self.wants_write() => IoOutcome::Pause,
            other => other,
        }
    }

    fn drain(&mut self, which: WhichBuffer) -> IoOutcome {
        let buf = match which {
            WhichBuffer::Send => &mut self.send,
            WhichBuffer::Pending => &mut self.pending,
        };
        let (n, status) = drain_buffer(&mut self.stream, buf);
        if n > 0 {
            self.bytes_written += n as u64;
            self.last_active = Instant::now();
        }
        match status {
            DrainStatus::Drained => IoOutcome::Ok,
            DrainStatus::WouldBlock => IoOutcome::Pause,
            DrainStatus::Error(e) => {
                debug!(fd = self.fd, error = %e, "write failed");
                self.state = ConnState::Error;
                IoOutcome::Error
            }
        }
    }

    /// Ask the codec for the next whole message in the receive buffer.
    ///
    /// The caller loops on `Complete` (one read can yield several
    /// frames), waits on `Incomplete`, and closes on `Error`.
    pub fn fetch_message(&mut self) -> DecodeResult {
        self.codec.decode(&mut self.recv)
    }

    /// Encode a message for delivery.
    ///
    /// On a `Queued` peer link the bytes land in the pending-send buffer;
    /// otherwise they go to the send buffer.
    pub fn queue_message(&mut self, msg: &Message) -> EncodeResult {
        let target = match self.phase {
            DeliveryPhase::Queued => &mut self.pending,
            _ => &mut self.send,
        };
        self.codec.encode(msg, target)
    }

    /// Whether buffered bytes are waiting for a writable event.
    pub fn wants_write(&self) -> bool {
        !self.send.is_empty()
            || (self.phase == DeliveryPhase::Confirmed && !self.pending.is_empty())
    }

    /// Keep-alive in effect: the codec's derived value (HTTP) overrides
    /// the connection default.
    pub fn effective_keep_alive(&self) -> Duration {
        self.codec.keep_alive().unwrap_or(self.keep_alive)
    }

    pub fn is_idle_timeout(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) >= self.effective_keep_alive()
    }

    /// When the idle timer should next fire if the connection stays quiet.
    pub fn idle_deadline(&self) -> Instant {
        self.last_active + self.effective_keep_alive()
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&mut self, by: Duration) {
        self.last_active -= by;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .finish()
    }
}

enum WhichBuffer {
    Send,
    Pending,
}

enum FillStatus {
    /// Socket drained for now.
    WouldBlock,
    /// Peer closed.
    Eof,
    Error(io::Error),
}

/// Read from `src` until it would block, reports EOF, or fails.
fn fill_buffer<R: Read>(src: &mut R, buf: &mut Buffer) -> (usize, FillStatus) {
    let mut total = 0;
    loop {
        match buf.fill_from(src) {
            Ok(0) => return (total, FillStatus::Eof),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (total, FillStatus::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (total, FillStatus::Error(e)),
        }
    }
}

enum DrainStatus {
    /// Buffer fully written out.
    Drained,
    WouldBlock,
    Error(io::Error),
}

/// Write readable bytes to `dst` until empty or it would block.
fn drain_buffer<W: Write>(dst: &mut W, buf: &mut Buffer) -> (usize, DrainStatus) {
    let mut total = 0;
    while !buf.is_empty() {
        match buf.drain_into(dst) {
            Ok(0) => {
                return (
                    total,
                    DrainStatus::Error(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                )
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (total, DrainStatus::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (total, DrainStatus::Error(e)),
        }
    }
    (total, DrainStatus::Drained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryFrame;
    use bytes::Bytes;
    use std::collections::VecDeque;

    const HIGH_WATER: usize = 16 * 1024;

    /// Reader that yields queued chunks, then would-block, then EOF once
    /// instructed.
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
        then_eof: bool,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    out[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.then_eof => Ok(0),
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
            }
        }
    }

    /// Writer that accepts a bounded number of bytes, then would-block.
    struct ThrottledWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = self.budget.min(data.len());
            self.accepted.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fill_until_would_block() {
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![b"abc".to_vec(), b"def".to_vec()]),
            then_eof: false,
        };
        let mut buf = Buffer::new(HIGH_WATER);

        let (n, status) = fill_buffer(&mut reader, &mut buf);
        assert_eq!(n, 6);
        assert!(matches!(status, FillStatus::WouldBlock));
        assert_eq!(buf.readable(), b"abcdef");
    }

    #[test]
    fn test_fill_reports_eof() {
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![b"tail".to_vec()]),
            then_eof: true,
        };
        let mut buf = Buffer::new(HIGH_WATER);

        let (n, status) = fill_buffer(&mut reader, &mut buf);
        assert_eq!(n, 4);
        assert!(matches!(status, FillStatus::Eof));
    }

    #[test]
    fn test_drain_partial_write() {
        let mut writer = ThrottledWriter {
            accepted: Vec::new(),
            budget: 4,
        };
        let mut buf = Buffer::new(HIGH_WATER);
        buf.extend_from_slice(b"0123456789");

        let (n, status) = drain_buffer(&mut writer, &mut buf);
        assert_eq!(n, 4);
        assert!(matches!(status, DrainStatus::WouldBlock));
        assert_eq!(writer.accepted, b"0123");
        // Remaining bytes stay buffered for the next writable event.
        assert_eq!(buf.readable(), b"456789");

        writer.budget = 100;
        let (n, status) = drain_buffer(&mut writer, &mut buf);
        assert_eq!(n, 6);
        assert!(matches!(status, DrainStatus::Drained));
        assert!(buf.is_empty());
    }

    // Connection-level tests against a real loopback socket pair.

    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (local, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        (TcpStream::from_std(local), peer)
    }

    fn wire_frame(command: u32, seq: u32, body: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&command.to_be_bytes());
        wire.extend_from_slice(&seq.to_be_bytes());
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(body);
        wire
    }

    /// Poll read_cycle + fetch_message until a frame arrives.
    fn read_one_frame(conn: &mut Connection) -> BinaryFrame {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert_ne!(conn.read_cycle(), IoOutcome::Error);
            match conn.fetch_message() {
                DecodeResult::Complete(Message::Binary(frame)) => return frame,
                DecodeResult::Incomplete => {
                    assert!(Instant::now() < deadline, "no frame within deadline");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_read_decode_loop_over_socket() {
        use std::io::Write as _;

        let (stream, mut peer) = socket_pair();
        let mut conn = Connection::accepted(
            stream,
            1,
            CodecKind::Binary,
            Duration::from_secs(30),
            HIGH_WATER,
            Instant::now(),
        );
        conn.mark_connected();

        // Two frames in one peer write: the decode loop yields both.
        let mut wire = wire_frame(7, 42, b"");
        wire.extend_from_slice(&wire_frame(1, 43, b"data"));
        peer.write_all(&wire).unwrap();

        let first = read_one_frame(&mut conn);
        assert_eq!((first.command, first.seq), (7, 42));
        assert!(first.body.is_empty());

        let second = read_one_frame(&mut conn);
        assert_eq!((second.command, second.seq), (1, 43));
        assert_eq!(&second.body[..], b"data");

        assert!(conn.bytes_read() >= wire.len() as u64);
    }

    #[test]
    fn test_peer_close_detected() {
        let (stream, peer) = socket_pair();
        let mut conn = Connection::accepted(
            stream,
            1,
            CodecKind::Binary,
            Duration::from_secs(30),
            HIGH_WATER,
            Instant::now(),
        );
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match conn.read_cycle() {
                IoOutcome::Closed => break,
                IoOutcome::Ok => {
                    assert!(Instant::now() < deadline, "close not seen");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_queued_writes_flush_on_promote() {
        use std::io::Read as _;

        let (stream, mut peer) = socket_pair();
        let mut conn = Connection::connecting(
            stream,
            2,
            CodecKind::Binary,
            Duration::from_secs(30),
            HIGH_WATER,
            Instant::now(),
        );
        conn.mark_connected();
        assert_eq!(conn.phase(), DeliveryPhase::Queued);

        let msg = Message::Binary(BinaryFrame {
            command: 9,
            seq: 1,
            body: Bytes::from_static(b"queued"),
        });
        assert_eq!(conn.queue_message(&msg), EncodeResult::Complete);

        // Still queued: nothing reaches the socket.
        assert!(!conn.wants_write());
        assert_eq!(conn.write_cycle(), IoOutcome::Ok);

        conn.promote();
        assert_eq!(conn.phase(), DeliveryPhase::Confirmed);
        assert!(conn.wants_write());
        assert_eq!(conn.write_cycle(), IoOutcome::Ok);

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = vec![0u8; 12 + 6];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received[12..], b"queued");
    }

    #[test]
    fn test_state_transitions_are_one_directional() {
        let (stream, _peer) = socket_pair();
        let mut conn = Connection::accepted(
            stream,
            3,
            CodecKind::Binary,
            Duration::from_secs(30),
            HIGH_WATER,
            Instant::now(),
        );

        assert_eq!(conn.state(), ConnState::Accepting);
        conn.mark_connected();
        assert_eq!(conn.state(), ConnState::Connected);

        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);
        // Closed is a sink.
        conn.mark_connected();
        assert_eq!(conn.state(), ConnState::Closed);
        conn.mark_error();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_idle_timeout_uses_codec_keep_alive() {
        let (stream, _peer) = socket_pair();
        let mut conn = Connection::accepted(
            stream,
            4,
            CodecKind::Binary,
            Duration::from_secs(10),
            HIGH_WATER,
            Instant::now(),
        );

        let now = Instant::now();
        assert!(!conn.is_idle_timeout(now));
        conn.backdate_activity(Duration::from_secs(11));
        assert!(conn.is_idle_timeout(now));
        assert_eq!(conn.effective_keep_alive(), Duration::from_secs(10));
    }
}
