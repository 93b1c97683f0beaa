//! Error types for the log codec.

use std::io;

use thiserror::Error;

/// Errors raised while writing or reading a revdb log.
///
/// Every variant other than [`Io`](LogError::Io) means the log and the
/// program disagree; the engine treats all of them as fatal.
#[derive(Debug, Error)]
pub enum LogError {
    /// An I/O error occurred on the log file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The file does not start with the `RevDB:` signature.
    #[error("invalid log signature (expected b\"RevDB:\")")]
    InvalidSignature,
    /// The format version is not supported by this build.
    #[error("unsupported log format version {found:#x}")]
    UnsupportedVersion {
        /// The version found in the file.
        found: u64,
    },
    /// The file ended in the middle of a header, packet or value.
    #[error("log truncated: {detail}")]
    Truncated {
        /// What was being read when the data ran out.
        detail: String,
    },
    /// A packet header or marker could not be decoded.
    #[error("malformed packet: {detail}")]
    MalformedPacket {
        /// Human-readable description of what went wrong.
        detail: String,
    },
    /// Unread bytes remain after the trailer was consumed.
    #[error("corrupted log: {count} unexpected bytes after the trailer")]
    TrailingBytes {
        /// Number of bytes left over.
        count: u64,
    },
    /// A flag byte did not hold the value it was expected to hold.
    #[error("cannot patch log byte at offset {offset}: expected {expected:#04x}, found {found:#04x}")]
    PatchMismatch {
        /// File offset of the byte.
        offset: u64,
        /// The value the caller expected to replace.
        expected: u8,
        /// The value actually present.
        found: u8,
    },
    /// A patch offset lies outside the data written so far.
    #[error("cannot patch log byte at offset {offset}: only {written} bytes written")]
    PatchOutOfRange {
        /// File offset of the byte.
        offset: u64,
        /// Bytes written (flushed or buffered) so far.
        written: u64,
    },
}
