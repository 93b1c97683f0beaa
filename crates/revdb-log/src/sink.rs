//! Destinations a [`Recorder`](crate::Recorder) can write to.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;

use crate::error::LogError;

/// A log destination that also supports patching one already-written byte.
///
/// Patching is the single exception to the append-only rule: a weak
/// reference's liveness flag is flipped from DEAD to ALIVE when the
/// reference is dereferenced again later in the run.
pub trait LogSink: Write {
    /// Replace the byte at `offset` with `value`, checking that it
    /// currently holds `expected`.
    fn patch_byte(&mut self, offset: u64, expected: u8, value: u8) -> Result<(), LogError>;
}

/// Patching reads the byte back first, so the file must be opened for
/// reading as well as writing.
impl LogSink for File {
    fn patch_byte(&mut self, offset: u64, expected: u8, value: u8) -> Result<(), LogError> {
        let mut current = [0u8; 1];
        self.read_exact_at(&mut current, offset)?;
        if current[0] != expected {
            return Err(LogError::PatchMismatch {
                offset,
                expected,
                found: current[0],
            });
        }
        self.write_all_at(&[value], offset)?;
        Ok(())
    }
}

impl LogSink for Vec<u8> {
    fn patch_byte(&mut self, offset: u64, expected: u8, value: u8) -> Result<(), LogError> {
        let written = self.len() as u64;
        let slot = usize::try_from(offset)
            .ok()
            .and_then(|i| self.get_mut(i))
            .ok_or(LogError::PatchOutOfRange { offset, written })?;
        if *slot != expected {
            return Err(LogError::PatchMismatch {
                offset,
                expected,
                found: *slot,
            });
        }
        *slot = value;
        Ok(())
    }
}
