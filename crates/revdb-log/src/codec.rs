//! Value encoding and header primitives.
//!
//! Every value in a packet is a fixed-size little-endian scalar described
//! by [`LogValue`]. Compound data is logged as consecutive values. The
//! header uses the length-prefixed helpers below.

use std::io::{Read, Write};

use crate::error::LogError;

/// A fixed-size scalar that can be written to and read from a packet.
pub trait LogValue: Copy + Send + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode into the first [`SIZE`](LogValue::SIZE) bytes of `out`.
    fn encode(self, out: &mut [u8]);

    /// Decode from the first [`SIZE`](LogValue::SIZE) bytes of `bytes`.
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_log_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl LogValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn encode(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_log_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl LogValue for bool {
    const SIZE: usize = 1;

    fn encode(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

// ── Primitive writers ───────────────────────────────────────────

/// Write a little-endian u32.
pub fn write_u32_le(w: &mut dyn Write, v: u32) -> Result<(), LogError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian u64.
pub fn write_u64_le(w: &mut dyn Write, v: u64) -> Result<(), LogError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a length-prefixed UTF-8 string (u32 length + bytes).
pub fn write_length_prefixed_str(w: &mut dyn Write, s: &str) -> Result<(), LogError> {
    write_u32_le(w, s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

// ── Primitive readers ───────────────────────────────────────────

fn read_exact_or_truncated(r: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<(), LogError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => LogError::Truncated {
            detail: format!("end of file while reading {what}"),
        },
        _ => LogError::Io(e),
    })
}

/// Read a single byte.
pub fn read_u8(r: &mut dyn Read) -> Result<u8, LogError> {
    let mut buf = [0u8; 1];
    read_exact_or_truncated(r, &mut buf, "a byte")?;
    Ok(buf[0])
}

/// Read a little-endian u32.
pub fn read_u32_le(r: &mut dyn Read) -> Result<u32, LogError> {
    let mut buf = [0u8; 4];
    read_exact_or_truncated(r, &mut buf, "a u32")?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64.
pub fn read_u64_le(r: &mut dyn Read) -> Result<u64, LogError> {
    let mut buf = [0u8; 8];
    read_exact_or_truncated(r, &mut buf, "a u64")?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length-prefixed UTF-8 string.
pub fn read_length_prefixed_str(r: &mut dyn Read) -> Result<String, LogError> {
    let len = read_u32_le(r)? as usize;
    let mut buf = vec![0u8; len];
    read_exact_or_truncated(r, &mut buf, "a string")?;
    String::from_utf8(buf).map_err(|e| LogError::MalformedPacket {
        detail: format!("invalid UTF-8 string: {e}"),
    })
}
