//! Resumable command step machines.
//!
//! One `Cmd` is one in-flight logical request. Without native coroutines,
//! every suspend point is an explicit state capture: the step cursor
//! records where execution stopped, and the command's id travels with the
//! external call as correlation data so the later callback can find its
//! way back. The established convention is that an even step issues an
//! external call and the following odd step consumes its result.

#![allow(dead_code)] // Parts of this surface are called only by application step handlers

use super::completion::Correlation;
use super::dispatcher::DispatchCtx;
use super::timer::TimerId;
use crate::codec::Message;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Execution status of a command.
///
/// `Running` is the only non-terminal status and the only one that
/// persists across reactor turns; a command returning anything else is
/// destroyed before the reactor continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Initial status, before any step has run.
    #[default]
    Unknown,
    Ok,
    Running,
    Completed,
    Error,
}

impl Status {
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }
}

/// Identity of the connection a command originated from.
///
/// The token alone is not enough: tokens are reused after close, so the
/// sequence id is checked too before the command touches the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRef {
    pub token: usize,
    pub seq: u64,
}

/// Input handed to a step handler on entry.
#[derive(Debug)]
pub enum StepInput<'a> {
    /// First entry, carrying the decoded request.
    Request(&'a Message),
    /// Synchronous advance from the previous step.
    Continue,
    /// Resumed after an external callback.
    Callback { error: i32, payload: Bytes },
}

/// What a step handler decided.
#[derive(Debug)]
pub enum StepAction {
    /// Finish with a terminal status.
    Done(Status),
    /// Advance to the next step and rerun synchronously (no external
    /// wait needed).
    Next,
    /// An external call was issued; suspend until its callback.
    Suspend,
}

/// Read-only view of the running command, handed to step handlers.
#[derive(Debug, Clone, Copy)]
pub struct CmdMeta {
    pub id: u64,
    pub module: u32,
    pub step: u32,
    pub origin: ConnRef,
}

impl CmdMeta {
    /// Correlation record for outbound async calls from this command.
    pub fn correlation(&self) -> Correlation {
        Correlation {
            module: self.module,
            cmd_id: self.id,
        }
    }
}

/// Per-request-type step logic: a dispatch over the step cursor.
pub trait StepHandler {
    fn run_step(
        &mut self,
        ctx: &mut DispatchCtx<'_>,
        cmd: &CmdMeta,
        input: StepInput<'_>,
    ) -> StepAction;
}

/// Outcome of a timeout-timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// The timer fired early (coarse granularity); re-arm for the
    /// remaining budget.
    Rearm(Duration),
    /// Retry budget remains: the command stays `Running` with a fresh
    /// full-duration timer.
    Retry,
    /// Retry budget exhausted: tear down with `Error`.
    Expired,
}

/// One in-flight logical request as an explicit step machine.
pub struct Cmd {
    id: u64,
    name: &'static str,
    module: u32,
    step: u32,
    timeout: Duration,
    timeouts: u32,
    max_timeouts: u32,
    last_active: Instant,
    origin: ConnRef,
    timer: Option<TimerId>,
    handler: Box<dyn StepHandler>,
}

impl Cmd {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        name: &'static str,
        module: u32,
        origin: ConnRef,
        timeout: Duration,
        max_timeouts: u32,
        now: Instant,
        handler: Box<dyn StepHandler>,
    ) -> Self {
        Self {
            id,
            name,
            module,
            step: 0,
            timeout,
            timeouts: 0,
            max_timeouts,
            last_active: now,
            origin,
            timer: None,
            handler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn module(&self) -> u32 {
        self.module
    }

    pub fn origin(&self) -> ConnRef {
        self.origin
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timer(&mut self, id: TimerId) {
        self.timer = Some(id);
    }

    pub fn take_timer(&mut self) -> Option<TimerId> {
        self.timer.take()
    }

    /// Entry point: run from step zero with the decoded request.
    pub fn execute(&mut self, ctx: &mut DispatchCtx<'_>, request: &Message) -> Status {
        self.step = 0;
        self.run(ctx, StepInput::Request(request))
    }

    /// Re-enter after an external callback.
    ///
    /// Invoked exactly once per callback, while the cursor still holds
    /// the step that issued the call; the cursor advances to the
    /// consuming step before the handler runs.
    pub fn resume(
        &mut self,
        ctx: &mut DispatchCtx<'_>,
        error: i32,
        payload: Bytes,
        now: Instant,
    ) -> Status {
        self.last_active = now;
        self.step += 1;
        self.run(ctx, StepInput::Callback { error, payload })
    }

    /// Dispatch the current step, following synchronous advances until
    /// the handler finishes or suspends.
    fn run(&mut self, ctx: &mut DispatchCtx<'_>, input: StepInput<'_>) -> Status {
        let mut input = input;
        loop {
            let meta = CmdMeta {
                id: self.id,
                module: self.module,
                step: self.step,
                origin: self.origin,
            };
            match self.handler.run_step(ctx, &meta, input) {
                StepAction::Done(status) => return status,
                StepAction::Suspend => return Status::Running,
                StepAction::Next => {
                    self.step += 1;
                    input = StepInput::Continue;
                }
            }
        }
    }

    /// Timeout-timer firing.
    ///
    /// A timer that fired while the command is still inside its budget
    /// (activity since arming, coarse timer coalescing) merely re-arms
    /// for the remaining delta. A genuine expiry consumes one retry;
    /// the command is torn down once `max_timeouts` firings have been
    /// consumed.
    pub fn check_timeout(&mut self, now: Instant) -> TimeoutVerdict {
        let elapsed = now.saturating_duration_since(self.last_active);
        if elapsed < self.timeout {
            return TimeoutVerdict::Rearm(self.timeout - elapsed);
        }
        self.timeouts += 1;
        if self.timeouts < self.max_timeouts {
            self.last_active = now;
            TimeoutVerdict::Retry
        } else {
            TimeoutVerdict::Expired
        }
    }

    /// Retries consumed so far.
    pub fn timeout_count(&self) -> u32 {
        self.timeouts
    }
}

impl std::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmd")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("module", &self.module)
            .field("step", &self.step)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BinaryFrame, Message};
    use crate::reactor::completion::ClientSet;
    use crate::reactor::connection::Connection;
    use slab::Slab;

    fn heartbeat() -> Message {
        Message::Binary(BinaryFrame {
            command: 7,
            seq: 42,
            body: Bytes::new(),
        })
    }

    fn origin() -> ConnRef {
        ConnRef { token: 0, seq: 1 }
    }

    struct Scripted {
        /// Step indices observed across all entries.
        seen: Vec<u32>,
        /// Step at which to suspend; everything before advances.
        suspend_at: u32,
        /// Status returned by the consuming step.
        finish: Status,
    }

    impl StepHandler for Scripted {
        fn run_step(
            &mut self,
            _ctx: &mut DispatchCtx<'_>,
            cmd: &CmdMeta,
            input: StepInput<'_>,
        ) -> StepAction {
            self.seen.push(cmd.step);
            match input {
                StepInput::Callback { error, .. } => {
                    assert_eq!(error, 0);
                    StepAction::Done(self.finish)
                }
                _ if cmd.step == self.suspend_at => StepAction::Suspend,
                _ => StepAction::Next,
            }
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&mut DispatchCtx<'_>) -> R) -> R {
        let mut conns: Slab<Connection> = Slab::new();
        let mut clients = ClientSet::new();
        let mut next_id = 1u64;
        let mut ctx = DispatchCtx::new(&mut conns, &mut clients, &mut next_id, Instant::now());
        f(&mut ctx)
    }

    #[test]
    fn test_suspend_at_even_step_consume_at_odd() {
        // Issues the external call at step 2; the callback is consumed
        // at step 3 and finishes Completed.
        let mut cmd = Cmd::new(
            1,
            "scripted",
            0,
            origin(),
            Duration::from_secs(1),
            1,
            Instant::now(),
            Box::new(Scripted {
                seen: Vec::new(),
                suspend_at: 2,
                finish: Status::Completed,
            }),
        );

        with_ctx(|ctx| {
            let status = cmd.execute(ctx, &heartbeat());
            assert_eq!(status, Status::Running);
            assert_eq!(cmd.step(), 2);

            let status = cmd.resume(ctx, 0, Bytes::from_static(b"payload"), Instant::now());
            assert_eq!(status, Status::Completed);
            assert_eq!(cmd.step(), 3);
        });
    }

    #[test]
    fn test_step_cursor_is_monotonic() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Logging {
            seen: Rc<RefCell<Vec<u32>>>,
        }
        impl StepHandler for Logging {
            fn run_step(
                &mut self,
                _ctx: &mut DispatchCtx<'_>,
                cmd: &CmdMeta,
                input: StepInput<'_>,
            ) -> StepAction {
                self.seen.borrow_mut().push(cmd.step);
                match input {
                    StepInput::Callback { .. } => StepAction::Done(Status::Ok),
                    _ if cmd.step == 4 => StepAction::Suspend,
                    _ => StepAction::Next,
                }
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut cmd = Cmd::new(
            2,
            "logging",
            0,
            origin(),
            Duration::from_secs(1),
            1,
            Instant::now(),
            Box::new(Logging { seen: Rc::clone(&seen) }),
        );

        with_ctx(|ctx| {
            cmd.execute(ctx, &heartbeat());
            cmd.resume(ctx, 0, Bytes::new(), Instant::now());
        });

        let seen = seen.borrow();
        assert_eq!(&*seen, &[0, 1, 2, 3, 4, 5]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_synchronous_completion() {
        struct Immediate;
        impl StepHandler for Immediate {
            fn run_step(
                &mut self,
                _ctx: &mut DispatchCtx<'_>,
                cmd: &CmdMeta,
                _input: StepInput<'_>,
            ) -> StepAction {
                match cmd.step {
                    0 => StepAction::Next,
                    _ => StepAction::Done(Status::Ok),
                }
            }
        }

        let mut cmd = Cmd::new(
            3,
            "immediate",
            0,
            origin(),
            Duration::from_secs(1),
            1,
            Instant::now(),
            Box::new(Immediate),
        );

        with_ctx(|ctx| {
            assert_eq!(cmd.execute(ctx, &heartbeat()), Status::Ok);
        });
        assert_eq!(cmd.step(), 1);
    }

    #[test]
    fn test_timeout_rearm_before_budget() {
        let start = Instant::now();
        let mut cmd = Cmd::new(
            4,
            "t",
            0,
            origin(),
            Duration::from_millis(100),
            3,
            start,
            Box::new(Scripted {
                seen: Vec::new(),
                suspend_at: 0,
                finish: Status::Ok,
            }),
        );

        // Fired at 40ms of a 100ms budget: re-arm for the remaining 60ms.
        match cmd.check_timeout(start + Duration::from_millis(40)) {
            TimeoutVerdict::Rearm(delta) => assert_eq!(delta, Duration::from_millis(60)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(cmd.timeout_count(), 0);
    }

    #[test]
    fn test_timeout_budget_exhausted_on_max_firing() {
        let start = Instant::now();
        let mut cmd = Cmd::new(
            5,
            "t",
            0,
            origin(),
            Duration::from_millis(100),
            3,
            start,
            Box::new(Scripted {
                seen: Vec::new(),
                suspend_at: 0,
                finish: Status::Ok,
            }),
        );

        let mut now = start;
        for expected in 1..3u32 {
            now += Duration::from_millis(150);
            assert_eq!(cmd.check_timeout(now), TimeoutVerdict::Retry);
            assert_eq!(cmd.timeout_count(), expected);
        }
        now += Duration::from_millis(150);
        assert_eq!(cmd.check_timeout(now), TimeoutVerdict::Expired);
        assert_eq!(cmd.timeout_count(), 3);
    }
}
