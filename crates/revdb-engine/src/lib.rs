//! Record/replay engine.
//!
//! A program records a run by routing every nondeterministic value
//! through a [`Session`] ([`Session::emit`]) and marking points of
//! interest with [`Session::stop_point`]. Replaying the log reproduces
//! the same execution, pausing at stop points to serve a debugger
//! over a control socket: it can step forward, collect breakpoint hits,
//! run inspection commands, and fork the process to keep several
//! timelines of the same run.
//!
//! # Module layout
//!
//! - [`session`]: session lifecycle, values, stop points, allocation.
//! - `server` (private): pauses and command dispatch.
//! - [`protocol`]: control socket frames.
//! - [`breakpoints`]: breakpoint modes, hits and watchpoints.
//! - [`gc`]: weak references, destructors and finalizer queues.
//! - [`threads`]: virtual threads.
//! - [`external`]: native calls with callback re-entry.
//! - [`branch`]: process branching for `FORK`.
//! - [`controller`]: controller side of the protocol.
//! - [`launch`]: mode detection and the program entry point.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod address_space;
pub mod branch;
pub mod breakpoints;
pub mod config;
pub mod controller;
pub mod error;
pub mod external;
pub mod gc;
pub mod hooks;
pub mod launch;
pub mod protocol;
mod server;
pub mod session;
pub mod threads;

pub use address_space::{identity_words, DeterministicAddressSpace};
pub use branch::{
    BranchOutcome, BranchRequest, BranchStrategy, ForkBrancher, ProcessBrancher, RespawnBrancher,
};
pub use breakpoints::{
    BreakHit, BreakpointMode, Watchpoint, ALLOCATION_BREAKPOINT_ID, THREAD_BREAKPOINT_ID,
};
pub use config::{ConfigError, FastForward, SessionConfig};
pub use controller::Controller;
pub use error::{EngineError, Result};
pub use external::{CALLBACK_ENTER_TAG, CALLBACK_RETURN_TAG};
pub use gc::{WeakRef, WEAKREF_AFTERWARDS_ALIVE, WEAKREF_AFTERWARDS_DEAD};
pub use hooks::{
    AllocatingHook, CallbackFn, CommandHandler, FinalizerTriggerHook, ThreadLocalsHook,
    WatchEvaluator,
};
pub use launch::LaunchMode;
pub use protocol::{Answer, Command};
pub use session::{IoMode, Session, SessionMode, GIL_ACQUIRE_TAG, GIL_RELEASE_TAG};
pub use threads::{ThreadHandle, THREAD_EXIT_TAG, THREAD_START_TAG};
