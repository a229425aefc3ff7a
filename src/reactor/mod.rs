//! The request-processing engine.
//!
//! Leaf to root: `buffer` (cursored byte regions), `timer` (deadline
//! queue), `completion` (async callback marshalling), `connection`
//! (per-socket state and the codec drive), `cmd` (resumable step
//! machines), `handoff` (cross-process descriptor intake), and
//! `dispatcher` (the reactor loop and both registries).

pub mod buffer;
pub mod cmd;
pub mod completion;
pub mod connection;
pub mod dispatcher;
pub mod handoff;
pub mod timer;

pub use cmd::{Cmd, Status};
pub use dispatcher::{DispatchCtx, Dispatcher};
