//! The reactor: one poll loop, two registries, and the routing that ties
//! io readiness, timer expiry, and external async callbacks back to the
//! right connection or command.
//!
//! Strictly single-threaded: one ready event is processed to completion
//! at a time, so connections, commands, and the registries are never
//! mutated concurrently and need no locking. External client pools
//! deliver their completions through the waker-backed queue rather than
//! touching reactor state from a foreign thread.
//!
//! ## Ownership
//!
//! A `Running` command is owned by the command registry and by nothing
//! else; the dispatcher is the only destroyer of a registered command,
//! and destruction always cancels the command's timer first. A command
//! id is present in the registry iff the command's last status was
//! `Running`.

#![allow(dead_code)] // Peer links and descriptor adoption are driven by the sys layer

use super::cmd::{Cmd, ConnRef, Status, TimeoutVerdict};
use super::completion::{
    AsyncClient, ClientKind, ClientSet, Completion, CompletionQueue, CompletionSender, Correlation,
};
use super::connection::{ConnState, Connection, IoOutcome};
use super::handoff::{self, HandoffRecord};
use super::timer::{TimerKind, TimerQueue};
use crate::codec::{CodecKind, DecodeResult, EncodeResult, Message};
use crate::config::Config;
use crate::router::{RouteOutcome, Router};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

/// How a connection entered this process.
enum Intake {
    Accepted,
    Adopted(CodecKind),
    Peer,
}

/// Mutable view of the engine lent to the router and to command step
/// handlers for the duration of one dispatch.
pub struct DispatchCtx<'a> {
    conns: &'a mut Slab<Connection>,
    clients: &'a mut ClientSet,
    next_cmd_id: &'a mut u64,
    now: Instant,
    cmd_timeout: Duration,
    max_timeouts: u32,
    /// Connections whose write path was touched and whose poll interest
    /// the dispatcher must refresh after this dispatch.
    dirty: Vec<usize>,
}

impl<'a> DispatchCtx<'a> {
    pub(crate) fn new(
        conns: &'a mut Slab<Connection>,
        clients: &'a mut ClientSet,
        next_cmd_id: &'a mut u64,
        now: Instant,
    ) -> Self {
        Self {
            conns,
            clients,
            next_cmd_id,
            now,
            cmd_timeout: Duration::from_secs(10),
            max_timeouts: 3,
            dirty: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Ids come from one monotonic counter, making registry collisions
    /// structurally impossible.
    pub fn allocate_cmd_id(&mut self) -> u64 {
        let id = *self.next_cmd_id;
        *self.next_cmd_id += 1;
        id
    }

    /// Build a command with the engine's configured timeout policy.
    pub fn new_cmd(
        &mut self,
        name: &'static str,
        module: u32,
        origin: ConnRef,
        handler: Box<dyn super::cmd::StepHandler>,
    ) -> Cmd {
        let id = self.allocate_cmd_id();
        Cmd::new(
            id,
            name,
            module,
            origin,
            self.cmd_timeout,
            self.max_timeouts,
            self.now,
            handler,
        )
    }

    /// Whether the referenced connection is still the one it was:
    /// same token, same sequence id, still open.
    pub fn conn_alive(&self, origin: ConnRef) -> bool {
        self.conns
            .get(origin.token)
            .is_some_and(|c| c.seq() == origin.seq && c.is_open())
    }

    /// Encode a message onto a connection's write path.
    ///
    /// Returns `false` when the connection is gone, was replaced, or the
    /// message does not fit its codec; the caller treats that as the
    /// response being unroutable, not as a reactor fault.
    pub fn send(&mut self, target: ConnRef, msg: &Message) -> bool {
        let Some(conn) = self.conns.get_mut(target.token) else {
            debug!(token = target.token, "send to missing connection");
            return false;
        };
        if conn.seq() != target.seq || !conn.is_open() {
            debug!(token = target.token, "send to stale connection");
            return false;
        }
        match conn.queue_message(msg) {
            EncodeResult::Complete => {
                self.dirty.push(target.token);
                true
            }
            EncodeResult::Error => {
                debug!(token = target.token, "encode failed");
                false
            }
        }
    }

    /// Submit an operation to an external async client, carrying the
    /// correlation back to a suspended command.
    pub fn submit(&mut self, kind: ClientKind, op: Bytes, correlation: Correlation) -> bool {
        self.clients.submit(kind, op, correlation)
    }

    fn finish(self) -> Vec<usize> {
        self.dirty
    }
}

pub struct Dispatcher {
    poll: Poll,
    listener: Option<TcpListener>,
    conns: Slab<Connection>,
    cmds: HashMap<u64, Cmd>,
    timers: TimerQueue,
    completions: CompletionQueue,
    clients: ClientSet,
    router: Box<dyn Router>,
    next_cmd_id: u64,
    next_conn_seq: u64,
    config: Config,
}

impl Dispatcher {
    pub fn new(config: Config, router: Box<dyn Router>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let completions = CompletionQueue::new(waker);
        Ok(Self {
            poll,
            listener: None,
            conns: Slab::new(),
            cmds: HashMap::new(),
            timers: TimerQueue::new(),
            completions,
            clients: ClientSet::new(),
            router,
            next_cmd_id: 1,
            next_conn_seq: 1,
            config,
        })
    }

    /// Handle external clients use to deliver completions onto this
    /// reactor from any thread.
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions.sender()
    }

    pub fn register_client(&mut self, kind: ClientKind, client: Box<dyn AsyncClient>) {
        self.clients.register(kind, client);
    }

    /// Bind the configured listen address and register it for accepts.
    pub fn listen(&mut self) -> io::Result<SocketAddr> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let std_listener = create_listener_with_reuseport(addr)?;
        let mut listener = TcpListener::from_std(std_listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener.local_addr()?;
        info!(addr = %local, codec = ?self.config.codec_kind(), "Listening");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Run the reactor until it fails.
    pub fn run(&mut self) -> io::Result<()> {
        let now = Instant::now();
        self.timers
            .arm(now + self.config.housekeeping(), TimerKind::Housekeeping);
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            self.poll_once(&mut events, None)?;
        }
    }

    /// One reactor turn: wait for readiness or the next deadline, then
    /// dispatch ready events and fire due timers. `cap` bounds the wait
    /// even when no timer is armed.
    pub fn poll_once(&mut self, events: &mut Events, cap: Option<Duration>) -> io::Result<()> {
        let timer_timeout = self.timers.next_timeout(Instant::now());
        let timeout = match (timer_timeout, cap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.poll.poll(events, timeout)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_ready(),
                WAKER_TOKEN => self.drain_completions(),
                Token(token) => {
                    self.connection_ready(token, event.is_readable(), event.is_writable())
                }
            }
        }

        self.fire_timers(Instant::now());
        Ok(())
    }

    // Intake paths. Local accept and descriptor handoff converge on the
    // same installation steps.

    fn accept_ready(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    if self.conns.len() >= self.config.max_connections {
                        warn!("connection limit reached, dropping accept");
                        continue;
                    }
                    match self.install_connection(stream, Intake::Accepted) {
                        Ok(token) => debug!(token, peer = %peer_addr, "accepted connection"),
                        Err(e) => debug!(error = %e, "failed to install connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    /// Adopt a descriptor handed over from another process.
    pub fn adopt(&mut self, record: HandoffRecord) -> io::Result<usize> {
        handoff::validate_fd(record.fd)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: the control channel transferred ownership of this
        // descriptor to us; nothing else in this process holds it.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(record.fd) };
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream);
        let token = self.install_connection(stream, Intake::Adopted(record.codec))?;
        debug!(token, fd = record.fd, family = ?record.family, "adopted connection");
        Ok(token)
    }

    /// Start an outbound peer link. Writes queue until `promote_peer`.
    pub fn connect_peer(&mut self, addr: SocketAddr) -> io::Result<usize> {
        let stream = TcpStream::connect(addr)?;
        let token = self.install_connection(stream, Intake::Peer)?;
        debug!(token, peer = %addr, "peer connect started");
        Ok(token)
    }

    /// Explicit promotion transition: the sys layer confirmed the peer
    /// handshake, queued writes may flow.
    pub fn promote_peer(&mut self, token: usize) {
        if let Some(conn) = self.conns.get_mut(token) {
            conn.promote();
        }
        self.update_interest(token);
    }

    fn install_connection(&mut self, stream: TcpStream, intake: Intake) -> io::Result<usize> {
        let now = Instant::now();
        let seq = self.next_conn_seq;
        self.next_conn_seq += 1;

        let keep_alive = self.config.keep_alive();
        let high_water = self.config.buffer_high_water;
        let conn = match intake {
            Intake::Accepted => Connection::accepted(
                stream,
                seq,
                self.config.codec_kind(),
                keep_alive,
                high_water,
                now,
            ),
            Intake::Adopted(kind) => {
                Connection::adopted(stream, seq, kind, keep_alive, high_water, now)
            }
            Intake::Peer => Connection::connecting(
                stream,
                seq,
                self.config.codec_kind(),
                keep_alive,
                high_water,
                now,
            ),
        };

        let token = self.conns.insert(conn);
        let is_peer = matches!(intake, Intake::Peer);
        let interest = if is_peer {
            // Watch for writable to learn when the connect lands.
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let registered = self.poll.registry().register(
            self.conns[token].stream_mut(),
            Token(token),
            interest,
        );
        if let Err(e) = registered {
            self.conns.remove(token);
            return Err(e);
        }

        let conn = &mut self.conns[token];
        conn.write_interest = is_peer;
        if !is_peer {
            conn.mark_connected();
        }
        let deadline = conn.idle_deadline();
        let timer = self.timers.arm(deadline, TimerKind::ConnIdle(token));
        conn.idle_timer = Some(timer);
        Ok(token)
    }

    // Readiness routing.

    fn connection_ready(&mut self, token: usize, readable: bool, writable: bool) {
        if !self.conns.contains(token) {
            // Event raced with a close earlier in this turn.
            return;
        }

        if writable && self.conns[token].state() == ConnState::Connecting {
            self.conns[token].mark_connected();
            debug!(token, "peer connect established");
        }

        if readable {
            match self.conns[token].read_cycle() {
                IoOutcome::Ok => self.process_messages(token),
                IoOutcome::Closed => {
                    debug!(token, "peer closed");
                    self.close_connection(token);
                    return;
                }
                IoOutcome::Error | IoOutcome::Pause => {
                    self.close_connection(token);
                    return;
                }
            }
        }

        if writable && self.conns.contains(token) {
            match self.conns[token].write_cycle() {
                // Fully drained: writable interest comes off until the
                // next queued message.
                IoOutcome::Ok => self.update_interest(token),
                IoOutcome::Pause => {}
                IoOutcome::Closed | IoOutcome::Error => self.close_connection(token),
            }
        }
    }

    /// Drain every complete message the receive buffer holds, in arrival
    /// order, before returning to the reactor.
    fn process_messages(&mut self, token: usize) {
        loop {
            if !self.conns.contains(token) {
                return;
            }
            match self.conns[token].fetch_message() {
                DecodeResult::Complete(msg) => self.route_message(token, msg),
                DecodeResult::Incomplete => break,
                DecodeResult::Error => {
                    debug!(token, "protocol error, closing");
                    self.close_connection(token);
                    return;
                }
            }
        }
        // A decoded HTTP message may have changed the effective
        // keep-alive (Connection header semantics), so the idle deadline
        // is recomputed rather than left at its arming-time value.
        self.resync_idle_timer(token);
        self.update_interest(token);
    }

    fn resync_idle_timer(&mut self, token: usize) {
        let Some(conn) = self.conns.get_mut(token) else {
            return;
        };
        if let Some(old) = conn.idle_timer.take() {
            self.timers.cancel(old);
        }
        let deadline = conn.idle_deadline();
        let timer = self.timers.arm(deadline, TimerKind::ConnIdle(token));
        conn.idle_timer = Some(timer);
    }

    fn route_message(&mut self, token: usize, msg: Message) {
        let origin = ConnRef {
            token,
            seq: self.conns[token].seq(),
        };
        let now = Instant::now();

        let (outcome, dirty) = {
            let mut ctx =
                DispatchCtx::new(&mut self.conns, &mut self.clients, &mut self.next_cmd_id, now);
            ctx.cmd_timeout = self.config.cmd_timeout();
            ctx.max_timeouts = self.config.max_timeouts;
            let outcome = self.router.route(&mut ctx, origin, msg);
            (outcome, ctx.finish())
        };
        for touched in dirty {
            self.update_interest(touched);
        }

        match outcome {
            RouteOutcome::Unmatched => debug!(token, "no handler matched"),
            RouteOutcome::Done(status) => {
                if status == Status::Error {
                    debug!(token, "handler finished with error");
                }
            }
            RouteOutcome::Suspended(cmd) => self.register_cmd(cmd, now),
        }
    }

    // Command registry. Registration and timer attachment happen
    // together; so do deregistration and cancellation.

    fn register_cmd(&mut self, mut cmd: Cmd, now: Instant) {
        let id = cmd.id();
        if self.cmds.contains_key(&id) {
            // Cannot happen with counter-allocated ids; refuse rather
            // than clobber the registered command.
            warn!(cmd_id = id, "cmd id already registered, refusing");
            return;
        }
        let timer = self
            .timers
            .arm(now + cmd.timeout(), TimerKind::CmdTimeout(id));
        cmd.set_timer(timer);
        self.cmds.insert(id, cmd);
    }

    fn drain_completions(&mut self) {
        for completion in self.completions.drain() {
            self.deliver_completion(completion, Instant::now());
        }
    }

    /// Route one external completion back to its suspended command.
    ///
    /// A missing command, a module mismatch, or a dead origin connection
    /// are all expected outcomes of racing with timeouts and closes:
    /// logged and dropped, never escalated.
    fn deliver_completion(&mut self, completion: Completion, now: Instant) {
        let Some(mut cmd) = self.cmds.remove(&completion.cmd_id) else {
            debug!(cmd_id = completion.cmd_id, "callback for unknown cmd, dropping");
            return;
        };
        if cmd.module() != completion.module {
            debug!(
                cmd_id = completion.cmd_id,
                module = completion.module,
                "callback module mismatch, dropping"
            );
            // The command is still legitimately waiting; its timer is
            // untouched, so the registry invariant holds.
            self.cmds.insert(completion.cmd_id, cmd);
            return;
        }

        if let Some(timer) = cmd.take_timer() {
            self.timers.cancel(timer);
        }

        if !self.conn_valid(cmd.origin()) {
            debug!(cmd_id = cmd.id(), "origin connection gone, tearing down cmd");
            return;
        }

        let (status, dirty) = {
            let mut ctx =
                DispatchCtx::new(&mut self.conns, &mut self.clients, &mut self.next_cmd_id, now);
            ctx.cmd_timeout = self.config.cmd_timeout();
            ctx.max_timeouts = self.config.max_timeouts;
            let status = cmd.resume(&mut ctx, completion.error, completion.payload, now);
            (status, ctx.finish())
        };
        for touched in dirty {
            self.update_interest(touched);
        }

        if status.is_running() {
            // Suspended again: back into the registry with a fresh timer.
            let timer = self
                .timers
                .arm(now + cmd.timeout(), TimerKind::CmdTimeout(cmd.id()));
            cmd.set_timer(timer);
            self.cmds.insert(cmd.id(), cmd);
        } else {
            debug!(cmd_id = cmd.id(), ?status, "cmd finished");
        }
    }

    // Timer routing.

    fn fire_timers(&mut self, now: Instant) {
        while let Some((_, kind)) = self.timers.pop_expired(now) {
            match kind {
                TimerKind::ConnIdle(token) => self.conn_idle_check(token, now),
                TimerKind::CmdTimeout(cmd_id) => self.cmd_timeout_check(cmd_id, now),
                TimerKind::Housekeeping => self.housekeeping(now),
            }
        }
    }

    fn conn_idle_check(&mut self, token: usize, now: Instant) {
        let Some(conn) = self.conns.get_mut(token) else {
            // Timer outlived its connection close within this turn.
            return;
        };
        conn.idle_timer = None;
        if conn.is_idle_timeout(now) {
            debug!(token, "idle timeout, closing");
            self.close_connection(token);
        } else {
            // Quiet but under budget, or the timer fired coarse-early:
            // re-arm for the remaining delta.
            let deadline = conn.idle_deadline();
            let timer = self.timers.arm(deadline, TimerKind::ConnIdle(token));
            conn.idle_timer = Some(timer);
        }
    }

    fn cmd_timeout_check(&mut self, cmd_id: u64, now: Instant) {
        let Some(mut cmd) = self.cmds.remove(&cmd_id) else {
            // Timer raced with a completion in this turn.
            return;
        };
        cmd.take_timer();

        if !self.conn_valid(cmd.origin()) {
            // Dangling-connection protection, independent of the retry
            // budget.
            debug!(cmd_id, "origin connection gone at timeout check, tearing down");
            return;
        }

        match cmd.check_timeout(now) {
            TimeoutVerdict::Rearm(delta) => {
                let timer = self.timers.arm(now + delta, TimerKind::CmdTimeout(cmd_id));
                cmd.set_timer(timer);
                self.cmds.insert(cmd_id, cmd);
            }
            TimeoutVerdict::Retry => {
                debug!(cmd_id, retries = cmd.timeout_count(), "cmd timeout, retrying");
                let timer = self
                    .timers
                    .arm(now + cmd.timeout(), TimerKind::CmdTimeout(cmd_id));
                cmd.set_timer(timer);
                self.cmds.insert(cmd_id, cmd);
            }
            TimeoutVerdict::Expired => {
                warn!(cmd_id, name = cmd.name(), "cmd exhausted timeout budget");
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let (bytes_read, bytes_written) = self
            .conns
            .iter()
            .fold((0u64, 0u64), |(r, w), (_, conn)| {
                (r + conn.bytes_read(), w + conn.bytes_written())
            });
        debug!(
            connections = self.conns.len(),
            cmds = self.cmds.len(),
            timers = self.timers.len(),
            bytes_read,
            bytes_written,
            "housekeeping"
        );
        self.timers
            .arm(now + self.config.housekeeping(), TimerKind::Housekeeping);
    }

    // Shared plumbing.

    fn conn_valid(&self, origin: ConnRef) -> bool {
        self.conns
            .get(origin.token)
            .is_some_and(|c| c.seq() == origin.seq && c.is_open())
    }

    /// Reconcile a connection's poll registration with its buffered
    /// writes: writable interest while bytes wait, readable-only after
    /// the write fully drains.
    fn update_interest(&mut self, token: usize) {
        let mut failed = false;
        if let Some(conn) = self.conns.get_mut(token) {
            let wants = conn.wants_write();
            if wants != conn.write_interest {
                let interest = if wants {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                match self
                    .poll
                    .registry()
                    .reregister(conn.stream_mut(), Token(token), interest)
                {
                    Ok(()) => conn.write_interest = wants,
                    Err(e) => {
                        debug!(token, error = %e, "reregister failed");
                        failed = true;
                    }
                }
            }
        }
        if failed {
            self.close_connection(token);
        }
    }

    /// Tear down a connection: stop its idle timer, drop its poll
    /// registration and buffers, then let the descriptor close.
    fn close_connection(&mut self, token: usize) {
        let Some(mut conn) = self.conns.try_remove(token) else {
            return;
        };
        if let Some(timer) = conn.idle_timer.take() {
            self.timers.cancel(timer);
        }
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(token, error = %e, "deregister failed");
        }
        conn.close();
        debug!(token, seq = conn.seq(), "connection closed");
    }
}

/// Listener with `SO_REUSEPORT` so several worker processes can share
/// one address under the external manager topology.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
