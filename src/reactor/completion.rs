//! Async callback plumbing between external client pools and the reactor.
//!
//! Every outbound call to a cache/database/coordination client carries a
//! correlation record naming the owning module and command. The client
//! delivers its completion through a `CompletionSender`, which enqueues
//! the record and wakes the reactor; the dispatcher drains the queue on
//! its own thread and routes each completion back to the suspended
//! command. Clients running on foreign threads are therefore marshalled
//! onto the reactor thread rather than touching its state directly.

#![allow(dead_code)] // Client kinds beyond the cache are wired by the embedding application

use bytes::Bytes;
use mio::Waker;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use tracing::debug;

/// External async collaborators reachable from command steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Cache,
    Database,
    Coordination,
}

/// Correlation record attached to every outbound async call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    /// Module that owns the suspended command.
    pub module: u32,
    /// The suspended command's id.
    pub cmd_id: u64,
}

/// One completed external operation, delivered back to the reactor.
#[derive(Debug, Clone)]
pub struct Completion {
    pub module: u32,
    pub cmd_id: u64,
    /// Zero means success; anything else is a client-defined error code.
    pub error: i32,
    pub payload: Bytes,
}

/// Contract implemented by external client pools.
///
/// `submit` returning `true` promises that the completion callback fires
/// exactly once for this correlation; `false` means the operation was
/// never accepted and no callback will arrive.
pub trait AsyncClient {
    fn submit(&mut self, op: Bytes, correlation: Correlation) -> bool;
}

/// Cloneable handle external clients use to deliver completions.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
    waker: Arc<Waker>,
}

impl CompletionSender {
    /// Enqueue a completion and wake the reactor.
    ///
    /// Errors are swallowed: a dropped receiver means the reactor is
    /// shutting down and the completion is benignly lost.
    pub fn complete(&self, completion: Completion) {
        if self.tx.send(completion).is_err() {
            debug!("completion dropped, reactor gone");
            return;
        }
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "reactor wake failed");
        }
    }
}

/// Reactor-side end of the completion channel.
pub struct CompletionQueue {
    rx: Receiver<Completion>,
    tx: Sender<Completion>,
    waker: Arc<Waker>,
}

impl CompletionQueue {
    pub fn new(waker: Arc<Waker>) -> Self {
        let (tx, rx) = channel();
        Self { rx, tx, waker }
    }

    /// Hand out a sender for wiring into an external client.
    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Drain everything currently queued, without blocking.
    pub fn drain(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        while let Ok(c) = self.rx.try_recv() {
            out.push(c);
        }
        out
    }
}

/// The set of external clients a command step may submit to.
#[derive(Default)]
pub struct ClientSet {
    cache: Option<Box<dyn AsyncClient>>,
    database: Option<Box<dyn AsyncClient>>,
    coordination: Option<Box<dyn AsyncClient>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ClientKind, client: Box<dyn AsyncClient>) {
        *self.slot(kind) = Some(client);
    }

    /// Submit an operation to the client of the given kind.
    ///
    /// Returns `false` when no such client is registered or the client
    /// refused the operation.
    pub fn submit(&mut self, kind: ClientKind, op: Bytes, correlation: Correlation) -> bool {
        match self.slot(kind) {
            Some(client) => client.submit(op, correlation),
            None => {
                debug!(?kind, "no client registered");
                false
            }
        }
    }

    fn slot(&mut self, kind: ClientKind) -> &mut Option<Box<dyn AsyncClient>> {
        match kind {
            ClientKind::Cache => &mut self.cache,
            ClientKind::Database => &mut self.database,
            ClientKind::Coordination => &mut self.coordination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    struct RecordingClient {
        accepted: Vec<(Bytes, Correlation)>,
        accept: bool,
    }

    impl AsyncClient for RecordingClient {
        fn submit(&mut self, op: Bytes, correlation: Correlation) -> bool {
            if self.accept {
                self.accepted.push((op, correlation));
            }
            self.accept
        }
    }

    #[test]
    fn test_queue_round_trip() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let mut queue = CompletionQueue::new(waker);

        let sender = queue.sender();
        sender.complete(Completion {
            module: 1,
            cmd_id: 7,
            error: 0,
            payload: Bytes::from_static(b"result"),
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].cmd_id, 7);
        assert_eq!(&drained[0].payload[..], b"result");
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_client_set_submit() {
        let mut clients = ClientSet::new();
        let correlation = Correlation { module: 2, cmd_id: 9 };

        // Unregistered kind refuses.
        assert!(!clients.submit(ClientKind::Cache, Bytes::new(), correlation));

        clients.register(
            ClientKind::Cache,
            Box::new(RecordingClient {
                accepted: Vec::new(),
                accept: true,
            }),
        );
        assert!(clients.submit(ClientKind::Cache, Bytes::from_static(b"GET k"), correlation));
    }
}
