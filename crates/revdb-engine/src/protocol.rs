//! Control socket wire format.
//!
//! Commands (controller to engine) and answers (engine to controller)
//! share one little-endian frame:
//!
//! ```text
//! [code i32] [extra_size u32] [arg1 i64] [arg2 i64] [arg3 i64] [extra bytes]
//! ```
//!
//! Negative codes are reserved for the built-in commands and answers.
//! Positive command codes are dispatched to handlers registered with
//! [`Session::register_command`](crate::Session::register_command).

use std::io::{self, Read, Write};

use crate::error::{EngineError, Result};

/// Size of the fixed part of a frame.
pub const FRAME_SIZE: usize = 32;

/// Largest `extra` payload accepted from the peer.
pub const MAX_EXTRA_SIZE: u32 = 64 << 20;

// ── Command codes ───────────────────────────────────────────────

/// Fork a new timeline; a socket descriptor follows the frame.
pub const CMD_FORK: i32 = -1;
/// End the session (status 0).
pub const CMD_QUIT: i32 = -2;
/// Run `arg1` stop points forward with breakpoint mode `arg2`.
pub const CMD_FORWARD: i32 = -3;
/// Pause when any of the uids in `extra` is allocated.
pub const CMD_FUTUREIDS: i32 = -4;
/// No-op, answered with `READY`.
pub const CMD_PING: i32 = -5;

// ── Answer codes ────────────────────────────────────────────────

/// Sent once when a replay starts: format version, total stop points.
pub const ANSWER_INIT: i32 = -20;
/// Paused: stop point, next uid, thread number.
pub const ANSWER_READY: i32 = -21;
/// A branch was created: child process id.
pub const ANSWER_FORKED: i32 = -22;
/// The end of the log was reached.
pub const ANSWER_AT_END: i32 = -23;
/// A breakpoint was hit: stop point, uid, breakpoint id.
pub const ANSWER_BREAKPOINT: i32 = -24;
/// Inspection code attempted I/O; the session exits next.
pub const ANSWER_ATTEMPT_IO: i32 = -25;

macro_rules! frame_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            /// Command or answer code.
            pub code: i32,
            /// First argument.
            pub arg1: i64,
            /// Second argument.
            pub arg2: i64,
            /// Third argument.
            pub arg3: i64,
            /// Variable-size payload.
            pub extra: Vec<u8>,
        }

        impl $name {
            /// A frame with the given code and zero arguments.
            pub fn new(code: i32) -> Self {
                Self {
                    code,
                    ..Default::default()
                }
            }

            /// A frame with the given code and arguments.
            pub fn with_args(code: i32, arg1: i64, arg2: i64, arg3: i64) -> Self {
                Self {
                    code,
                    arg1,
                    arg2,
                    arg3,
                    extra: Vec::new(),
                }
            }

            /// Attach a payload.
            pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
                self.extra = extra;
                self
            }

            /// Write the frame.
            pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
                write_frame(w, self.code, [self.arg1, self.arg2, self.arg3], &self.extra)
            }

            /// Read one frame.
            pub fn read_from(r: &mut dyn Read) -> io::Result<Self> {
                let (code, [arg1, arg2, arg3], extra) = read_frame(r)?;
                Ok(Self {
                    code,
                    arg1,
                    arg2,
                    arg3,
                    extra,
                })
            }
        }
    };
}

frame_type!(
    /// A request from the controller.
    Command
);

frame_type!(
    /// A reply from the engine.
    Answer
);

fn write_frame(w: &mut dyn Write, code: i32, args: [i64; 3], extra: &[u8]) -> io::Result<()> {
    let extra_size = u32::try_from(extra.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "extra payload too large"))?;
    let mut frame = Vec::with_capacity(FRAME_SIZE + extra.len());
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(&extra_size.to_le_bytes());
    for arg in args {
        frame.extend_from_slice(&arg.to_le_bytes());
    }
    frame.extend_from_slice(extra);
    w.write_all(&frame)?;
    w.flush()
}

fn read_frame(r: &mut dyn Read) -> io::Result<(i32, [i64; 3], Vec<u8>)> {
    let mut fixed = [0u8; FRAME_SIZE];
    r.read_exact(&mut fixed)?;
    let word = |at: usize| -> [u8; 8] {
        let mut b = [0u8; 8];
        b.copy_from_slice(&fixed[at..at + 8]);
        b
    };
    let code = i32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
    let extra_size = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    if extra_size > MAX_EXTRA_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("extra payload of {extra_size} bytes"),
        ));
    }
    let args = [
        i64::from_le_bytes(word(8)),
        i64::from_le_bytes(word(16)),
        i64::from_le_bytes(word(24)),
    ];
    let mut extra = vec![0u8; extra_size as usize];
    r.read_exact(&mut extra)?;
    Ok((code, args, extra))
}

// ── FUTUREIDS payload ───────────────────────────────────────────

/// Encode a uid list for `CMD_FUTUREIDS`.
pub fn encode_future_ids(ids: &[u64]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

/// Decode a `CMD_FUTUREIDS` payload into a sorted, deduplicated list.
pub fn decode_future_ids(extra: &[u8]) -> Result<Vec<u64>> {
    if extra.len() % 8 != 0 {
        return Err(EngineError::protocol(format!(
            "FUTUREIDS payload of {} bytes is not a list of u64",
            extra.len()
        )));
    }
    let mut ids: Vec<u64> = extra
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_layout() {
        let mut buf = Vec::new();
        Command::with_args(CMD_FORWARD, 3, i64::from(b'b'), 0)
            .with_extra(vec![9])
            .write_to(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), FRAME_SIZE + 1);
        assert_eq!(&buf[..4], &(-3i32).to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..16], &3i64.to_le_bytes());
        assert_eq!(buf[32], 9);
    }

    #[test]
    fn answer_round_trip() {
        let a = Answer::with_args(ANSWER_READY, 4, 17, 1);
        let mut buf = Vec::new();
        a.write_to(&mut buf).unwrap();
        assert_eq!(Answer::read_from(&mut buf.as_slice()).unwrap(), a);
    }

    #[test]
    fn short_frame_is_an_error() {
        let mut r: &[u8] = &[0u8; 12];
        assert!(Command::read_from(&mut r).is_err());
    }

    #[test]
    fn oversized_extra_rejected() {
        let mut buf = vec![0u8; FRAME_SIZE];
        buf[4..8].copy_from_slice(&(MAX_EXTRA_SIZE + 1).to_le_bytes());
        let err = Command::read_from(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn ragged_future_ids_rejected() {
        assert!(matches!(
            decode_future_ids(&[1, 2, 3]),
            Err(EngineError::Protocol { .. })
        ));
    }

    proptest! {
        #[test]
        fn future_ids_decode_sorted(ids in prop::collection::vec(any::<u64>(), 0..64)) {
            let decoded = decode_future_ids(&encode_future_ids(&ids)).unwrap();
            let mut expected = ids.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(decoded, expected);
        }
    }
}
