//! Request routing contract between the engine and the application.
//!
//! The dispatcher hands every decoded message to the router, which
//! either ignores it, handles it synchronously, or creates a command
//! that suspends on an external call. The module/plugin machinery that
//! matches requests to handlers by path lives outside this crate; the
//! built-in router here answers heartbeats and echoes so the binary is
//! runnable and the engine is exercisable without an application.

use crate::codec::{BinaryFrame, HttpMessage, Message};
use crate::reactor::cmd::{ConnRef, Status};
use crate::reactor::{Cmd, DispatchCtx};
use tracing::debug;

/// Heartbeat probe: empty body in, empty body out.
pub const CMD_HEARTBEAT: u32 = 7;

/// Echo: body returned unchanged.
pub const CMD_ECHO: u32 = 1;

/// What the router did with a decoded message.
pub enum RouteOutcome {
    /// No handler matched. Not an error; the message is dropped.
    Unmatched,
    /// Handled synchronously with a terminal status.
    Done(Status),
    /// A command issued an external call and is now suspended; ownership
    /// transfers to the dispatcher's registry.
    Suspended(Cmd),
}

pub trait Router {
    fn route(&mut self, ctx: &mut DispatchCtx<'_>, origin: ConnRef, msg: Message) -> RouteOutcome;
}

/// Built-in router: binary heartbeat/echo and an HTTP echo.
#[derive(Debug, Default)]
pub struct EchoRouter;

impl EchoRouter {
    pub fn new() -> Self {
        Self
    }
}

impl Router for EchoRouter {
    fn route(&mut self, ctx: &mut DispatchCtx<'_>, origin: ConnRef, msg: Message) -> RouteOutcome {
        match msg {
            Message::Binary(frame) => match frame.command {
                CMD_HEARTBEAT | CMD_ECHO => {
                    let reply = Message::Binary(BinaryFrame {
                        command: frame.command,
                        seq: frame.seq,
                        body: frame.body,
                    });
                    if ctx.send(origin, &reply) {
                        RouteOutcome::Done(Status::Ok)
                    } else {
                        RouteOutcome::Done(Status::Error)
                    }
                }
                other => {
                    debug!(command = other, "unhandled binary command");
                    RouteOutcome::Unmatched
                }
            },
            Message::Http(request) => {
                let reply = Message::Http(HttpMessage::response(200, "OK", request.body));
                if ctx.send(origin, &reply) {
                    RouteOutcome::Done(Status::Ok)
                } else {
                    RouteOutcome::Done(Status::Error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::completion::ClientSet;
    use crate::reactor::connection::Connection;
    use bytes::Bytes;
    use slab::Slab;
    use std::time::Instant;

    fn route_one(msg: Message) -> RouteOutcome {
        let mut conns: Slab<Connection> = Slab::new();
        let mut clients = ClientSet::new();
        let mut next_id = 1u64;
        let mut ctx = DispatchCtx::new(&mut conns, &mut clients, &mut next_id, Instant::now());
        // Empty registry: the origin is gone by the time we route.
        EchoRouter::new().route(&mut ctx, ConnRef { token: 0, seq: 1 }, msg)
    }

    #[test]
    fn test_unknown_command_is_unmatched_not_error() {
        let msg = Message::Binary(BinaryFrame {
            command: 999,
            seq: 1,
            body: Bytes::new(),
        });
        assert!(matches!(route_one(msg), RouteOutcome::Unmatched));
    }

    #[test]
    fn test_echo_to_dead_connection_is_error_status() {
        let msg = Message::Binary(BinaryFrame {
            command: CMD_ECHO,
            seq: 1,
            body: Bytes::from_static(b"hi"),
        });
        assert!(matches!(
            route_one(msg),
            RouteOutcome::Done(Status::Error)
        ));
    }
}
