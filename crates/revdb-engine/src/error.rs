//! Engine error type.

use std::io;

use revdb_core::{ThreadIdent, Uid};
use revdb_log::LogError;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by a record or replay session.
///
/// Apart from the two clean exits ([`Quit`](EngineError::Quit) and
/// [`AttemptedIo`](EngineError::AttemptedIo)) every variant ends the
/// session with a failure status. Nothing is retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The log could not be written, read or validated.
    #[error(transparent)]
    Log(#[from] LogError),
    /// File or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The control socket failed or was closed by the controller.
    #[error("control socket error: {0}")]
    Socket(#[source] io::Error),
    /// The configuration or launch arguments are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A tag or flag byte read during replay is not the one the program
    /// produced at the same point while recording.
    #[error("replay desynchronized: expected flag byte {expected:#04x}, log has {found:#04x}")]
    UnexpectedFlag {
        /// Value the running program expects.
        expected: u8,
        /// Value stored in the log.
        found: u8,
    },
    /// The replayed program did not pass the recorded number of stop points.
    #[error("bad number of stop points: log has {recorded}, replay reached {replayed}")]
    StopPointMismatch {
        /// Count stored in the trailer.
        recorded: u64,
        /// Count reached by the replay.
        replayed: u64,
    },
    /// The replay diverged from the log in some other way.
    #[error("replay desynchronized: {detail}")]
    Desync {
        /// What the engine expected.
        detail: String,
    },
    /// Inspection code tried to touch the log or perform I/O.
    #[error("attempted to do I/O or access the log from inspection code")]
    AttemptedIo,
    /// The controller asked the session to quit.
    #[error("quit requested by the controller")]
    Quit,
    /// A command code has no handler.
    #[error("unknown command code {code}")]
    UnknownCommand {
        /// The unrecognized code.
        code: i32,
    },
    /// A recorded callback location has no registered callback.
    #[error("no callback registered for location {loc}")]
    UnknownCallback {
        /// The callback location byte.
        loc: u8,
    },
    /// The log names a thread that was never started.
    #[error("log switches to unknown {thread}")]
    UnknownThread {
        /// The recorded identity.
        thread: ThreadIdent,
    },
    /// A finalization pass names an object with no registered destructor.
    #[error("no destructor registered for object {uid}")]
    MissingDestructor {
        /// The object's uid.
        uid: Uid,
    },
    /// A finalizer queue poll names an object that was never queued.
    #[error("no finalizer-queue object registered for uid {uid}")]
    MissingFinalizerObject {
        /// The object's uid.
        uid: Uid,
    },
    /// The control protocol was violated.
    #[error("protocol error: {detail}")]
    Protocol {
        /// Human-readable description.
        detail: String,
    },
    /// A system call used for branching or setup failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
    /// The log was recorded by a different binary or address layout.
    #[error(
        "log identity {recorded:#x?} does not match this binary ({current:#x?}); \
         was it recorded by another executable or with address randomization?"
    )]
    IdentityMismatch {
        /// Identity words stored in the header.
        recorded: [u64; 2],
        /// Identity words of the running binary.
        current: [u64; 2],
    },
    /// A host callback reported a failure.
    #[error("host callback failed: {detail}")]
    Host {
        /// Message supplied by the host.
        detail: String,
    },
    /// The session was finished or shut down.
    #[error("session closed")]
    SessionClosed,
    /// A virtual thread failed during replay.
    #[error("virtual {thread} failed: {detail}")]
    VirtualThreadFailed {
        /// The failing thread.
        thread: ThreadIdent,
        /// The error it reported.
        detail: String,
    },
}

impl EngineError {
    /// Shorthand for a [`Protocol`](EngineError::Protocol) error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`Host`](EngineError::Host) error.
    pub fn host(detail: impl Into<String>) -> Self {
        Self::Host {
            detail: detail.into(),
        }
    }

    /// `true` for the errors that end a session with status 0.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Quit | Self::AttemptedIo)
    }
}
