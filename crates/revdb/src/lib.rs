//! revdb: deterministic record and replay for reverse debugging.
//!
//! This is the top-level facade crate that re-exports the public API of
//! the revdb sub-crates. A host runtime routes every nondeterministic
//! value through a [`Session`](engine::Session) and marks stop points;
//! a replay then reproduces the run exactly under a debugger's control.
//!
//! # Quick start
//!
//! ```rust
//! use revdb::prelude::*;
//!
//! fn program(session: &Session) -> Result<(), EngineError> {
//!     let seed = session.emit(|| 42u64)?;
//!     let uid = session.allocate_uid()?;
//!     session.stop_point(0)?;
//!     assert_eq!(seed, 42);
//!     assert_eq!(uid, Uid(1));
//!     Ok(())
//! }
//!
//! // Without `REVDB` in the environment, a session just runs the program.
//! let session = Session::disabled(vec!["demo".into()]);
//! program(&session).unwrap();
//! session.finish().unwrap();
//! assert_eq!(session.stop_point_seen(), 1);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `revdb-core` | Uids, thread identities, host object traits |
//! | [`log`] | `revdb-log` | Log file format, recorder and replayer |
//! | [`engine`] | `revdb-engine` | Sessions, control protocol, branching |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identifiers and host object traits (`revdb-core`).
pub use revdb_core as types;

/// Log file format (`revdb-log`).
///
/// Most programs never touch this directly; the [`log::Recorder`] and
/// [`log::Replayer`] are driven by the engine.
pub use revdb_log as log;

/// Record/replay sessions (`revdb-engine`).
///
/// [`engine::Session`] is the host-facing API, [`engine::Controller`]
/// the debugger-facing one.
pub use revdb_engine as engine;

/// Common imports for host runtimes.
///
/// ```rust
/// use revdb::prelude::*;
/// ```
pub mod prelude {
    // Identifiers and host traits
    pub use revdb_core::{HostObject, ObjectIdentity, ThreadIdent, Uid, WeakHandle};

    // Values
    pub use revdb_log::LogValue;

    // Sessions
    pub use revdb_engine::{
        EngineError, IoMode, LaunchMode, Session, SessionConfig, SessionMode, ThreadHandle,
        WeakRef,
    };

    // Control protocol
    pub use revdb_engine::{Answer, BreakpointMode, Command, Controller};
}
