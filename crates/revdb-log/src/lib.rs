//! Binary log format for deterministic record and replay.
//!
//! A recording is a single append-only file. The [`Recorder`] frames
//! fixed-size values into packets and writes them out; the [`Replayer`]
//! reads the same values back in exactly the recorded order and
//! surfaces out-of-band [`AsyncEvent`]s (finalizer triggers and thread
//! switches) as it meets them.
//!
//! # Format
//!
//! ```text
//! "RevDB:" ("\t" arg)* "\n" "\0"
//! [version u64] [identity u64 x2] [main thread u64] [argc u32] [argv...]
//! [packet] [packet] ... [packet holding the u64 trailer]
//! ```
//!
//! Each packet starts with a little-endian `i16`. A positive value is the
//! size of the payload that follows. The reserved negative values
//! [`ASYNC_FINALIZER_TRIGGER`] and [`ASYNC_THREAD_SWITCH`] are followed by
//! an 8-byte payload and carry no sync data. The last eight bytes of the
//! file are the total number of stop points the recording passed.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod format;
pub mod recorder;
pub mod replayer;
pub mod sink;

pub use codec::LogValue;
pub use error::LogError;
pub use format::{
    AsyncEvent, LogHeader, ASYNC_FINALIZER_TRIGGER, ASYNC_PAYLOAD_SIZE, ASYNC_THREAD_SWITCH,
    FORMAT_VERSION, MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE, SIGNATURE, TRAILER_SIZE,
};
pub use recorder::{Recorder, DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
pub use replayer::{Fetched, Replayer};
pub use sink::LogSink;
