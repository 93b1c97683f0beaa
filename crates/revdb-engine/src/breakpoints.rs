//! Breakpoint and watchpoint bookkeeping.
//!
//! Replay pauses when `stop_point_seen` reaches
//! `stop_point_break = min(interactive_break, finalizer_break)`. The
//! controller moves `interactive_break` with `FORWARD`; breakpoint hits
//! in `Break` mode pull it in to the next stop point.

use indexmap::IndexMap;
use revdb_core::Uid;
use smallvec::SmallVec;

/// Breakpoint id reported when an allocation matches `FUTUREIDS`.
pub const ALLOCATION_BREAKPOINT_ID: i64 = -1;

/// Breakpoint id reported when replay switches to the watched thread.
pub const THREAD_BREAKPOINT_ID: i64 = -2;

/// What a breakpoint hit does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointMode {
    /// Hits are discarded.
    Ignore,
    /// Hits are collected and reported at the next pause.
    Record,
    /// The first hit stops replay at the next stop point.
    Break,
}

impl BreakpointMode {
    /// Decode the `FORWARD` mode argument (`'i'`, `'r'` or `'b'`).
    pub fn from_wire(v: i64) -> Option<Self> {
        match u8::try_from(v).ok()? {
            b'i' => Some(Self::Ignore),
            b'r' => Some(Self::Record),
            b'b' => Some(Self::Break),
            _ => None,
        }
    }

    /// The `FORWARD` mode argument for this mode.
    pub fn to_wire(self) -> i64 {
        i64::from(match self {
            Self::Ignore => b'i',
            Self::Record => b'r',
            Self::Break => b'b',
        })
    }
}

/// One recorded breakpoint hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakHit {
    /// Stop point at which the hit happened.
    pub stop_point: u64,
    /// Allocated uid for allocation pauses, otherwise [`Uid::NONE`].
    pub uid: Uid,
    /// Breakpoint or watchpoint id.
    pub id: i64,
}

/// A watched expression and its last value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watchpoint {
    /// Opaque expression handed to the host evaluator.
    pub expression: Vec<u8>,
    /// Value at the last evaluation.
    pub last: Vec<u8>,
}

pub(crate) struct Breakpoints {
    pub(crate) mode: BreakpointMode,
    pub(crate) interactive_break: u64,
    pub(crate) finalizer_break: u64,
    pub(crate) pending_report: bool,
    pub(crate) thread_breakpoint: Option<u32>,
    hits: SmallVec<[BreakHit; 8]>,
    limit: usize,
    watchpoints: IndexMap<i64, Watchpoint>,
}

impl Breakpoints {
    pub(crate) fn new(limit: usize, interactive_break: u64) -> Self {
        Self {
            mode: BreakpointMode::Ignore,
            interactive_break,
            finalizer_break: u64::MAX,
            pending_report: false,
            thread_breakpoint: None,
            hits: SmallVec::new(),
            limit: limit.max(1),
            watchpoints: IndexMap::new(),
        }
    }

    pub(crate) fn stop_point_break(&self) -> u64 {
        self.interactive_break.min(self.finalizer_break)
    }

    /// Apply a hit at `stop_point` according to the current mode.
    pub(crate) fn hit(&mut self, stop_point: u64, uid: Uid, id: i64) {
        match self.mode {
            BreakpointMode::Ignore => {}
            BreakpointMode::Record => self.push(BreakHit { stop_point, uid, id }),
            BreakpointMode::Break => {
                self.interactive_break = self.interactive_break.min(stop_point + 1);
                self.push(BreakHit { stop_point, uid, id });
            }
        }
    }

    /// Record a hit regardless of the mode.
    pub(crate) fn force(&mut self, hit: BreakHit) {
        self.push(hit);
        self.pending_report = true;
    }

    fn push(&mut self, hit: BreakHit) {
        if self.hits.len() >= self.limit {
            self.hits.remove(0);
        }
        self.hits.push(hit);
    }

    pub(crate) fn clear_hits(&mut self) {
        self.hits.clear();
    }

    /// Hits to report at this pause, if a report is due.
    pub(crate) fn take_report(&mut self) -> SmallVec<[BreakHit; 8]> {
        if !self.pending_report {
            return SmallVec::new();
        }
        self.pending_report = false;
        std::mem::take(&mut self.hits)
    }

    // ── Watchpoints ─────────────────────────────────────────────

    pub(crate) fn add_watch(&mut self, id: i64, expression: Vec<u8>, initial: Vec<u8>) {
        self.watchpoints.insert(
            id,
            Watchpoint {
                expression,
                last: initial,
            },
        );
    }

    pub(crate) fn remove_watch(&mut self, id: i64) -> bool {
        self.watchpoints.shift_remove(&id).is_some()
    }

    pub(crate) fn has_watches(&self) -> bool {
        !self.watchpoints.is_empty()
    }

    pub(crate) fn watch_snapshot(&self) -> Vec<(i64, Watchpoint)> {
        self.watchpoints
            .iter()
            .map(|(id, w)| (*id, w.clone()))
            .collect()
    }

    pub(crate) fn update_watch(&mut self, id: i64, value: Vec<u8>) {
        if let Some(w) = self.watchpoints.get_mut(&id) {
            w.last = value;
        }
    }
}
