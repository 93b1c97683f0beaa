//! Strongly-typed identifiers.

use std::fmt;

/// Identity of an allocated host object.
///
/// Uids are handed out by the engine from a monotonically increasing
/// counter that starts at 1. Replay reproduces the exact sequence, so a
/// uid names the same object in every timeline of a recording. `Uid(0)`
/// is never allocated and marks "no object" on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl Uid {
    /// The reserved "no object" value.
    pub const NONE: Uid = Uid(0);

    /// The first uid a fresh session allocates.
    pub const FIRST: Uid = Uid(1);

    /// Returns `true` for [`Uid::NONE`].
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Recorded identity of a host thread.
///
/// Written into `THREAD_SWITCH` markers. The main thread of a recording
/// is always [`ThreadIdent::MAIN`]; threads started through the engine
/// receive sequential identities after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdent(pub u64);

impl ThreadIdent {
    /// Identity of the thread that opened the session.
    pub const MAIN: ThreadIdent = ThreadIdent(1);

    /// The identity following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ThreadIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

impl From<u64> for ThreadIdent {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
