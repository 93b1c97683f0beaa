//! Log header, packet constants and async markers.

use std::io::{Read, Write};

use revdb_core::ThreadIdent;

use crate::codec::{
    read_length_prefixed_str, read_u32_le, read_u64_le, read_u8, write_length_prefixed_str,
    write_u32_le, write_u64_le,
};
use crate::error::LogError;

/// Signature at the start of every log file.
pub const SIGNATURE: &[u8] = b"RevDB:";

/// Current binary format version.
pub const FORMAT_VERSION: u64 = 0x00FF_0001;

/// Size of the `i16` packet header.
pub const PACKET_HEADER_SIZE: usize = 2;

/// Largest payload a single packet can carry.
pub const MAX_PACKET_PAYLOAD: usize = i16::MAX as usize;

/// Size of the payload following an async marker.
pub const ASYNC_PAYLOAD_SIZE: usize = 8;

/// Size of the stop-point trailer at the end of the file.
pub const TRAILER_SIZE: usize = 8;

/// Marker announcing a finalization pass at the stop point in its payload.
pub const ASYNC_FINALIZER_TRIGGER: i16 = 0xff46u16 as i16;

/// Marker announcing that the thread named in its payload runs next.
pub const ASYNC_THREAD_SWITCH: i16 = 0xff54u16 as i16;

/// Upper bound on the human-readable argv echo line.
const MAX_ECHO_LEN: usize = 1 << 20;

// ── Header ──────────────────────────────────────────────────────

/// Fixed information written once at the start of a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    /// Format version; [`FORMAT_VERSION`] for logs written by this build.
    pub version: u64,
    /// Two addresses inside the recording binary, compared on replay to
    /// detect a different executable or a randomized address space.
    pub identity: [u64; 2],
    /// Recorded identity of the main thread.
    pub main_thread: ThreadIdent,
    /// Command-line arguments of the recorded run.
    pub argv: Vec<String>,
}

impl LogHeader {
    /// A header for the current format version.
    pub fn new(identity: [u64; 2], argv: Vec<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            identity,
            main_thread: ThreadIdent::MAIN,
            argv,
        }
    }
}

/// Encode the header: signature, argv echo, then the fixed fields.
pub fn encode_header(w: &mut dyn Write, header: &LogHeader) -> Result<(), LogError> {
    w.write_all(SIGNATURE)?;
    for arg in &header.argv {
        w.write_all(b"\t")?;
        let echo: String = arg
            .chars()
            .map(|c| if c == '\n' || c == '\0' { ' ' } else { c })
            .collect();
        w.write_all(echo.as_bytes())?;
    }
    w.write_all(b"\n\0")?;

    write_u64_le(w, header.version)?;
    write_u64_le(w, header.identity[0])?;
    write_u64_le(w, header.identity[1])?;
    write_u64_le(w, header.main_thread.0)?;
    write_u32_le(w, header.argv.len() as u32)?;
    for arg in &header.argv {
        write_length_prefixed_str(w, arg)?;
    }
    Ok(())
}

/// Decode and validate the header.
///
/// Fails with [`LogError::InvalidSignature`] or
/// [`LogError::UnsupportedVersion`] for files this build cannot replay.
pub fn decode_header(r: &mut dyn Read) -> Result<LogHeader, LogError> {
    let mut sig = [0u8; SIGNATURE.len()];
    for b in sig.iter_mut() {
        *b = read_u8(r).map_err(|_| LogError::InvalidSignature)?;
    }
    if sig != SIGNATURE {
        return Err(LogError::InvalidSignature);
    }

    // Skip the echo line up to "\n\0".
    let mut skipped = 0usize;
    loop {
        let b = read_u8(r)?;
        if b == b'\n' {
            break;
        }
        skipped += 1;
        if skipped > MAX_ECHO_LEN {
            return Err(LogError::MalformedPacket {
                detail: "argv echo line is not terminated".into(),
            });
        }
    }
    if read_u8(r)? != 0 {
        return Err(LogError::MalformedPacket {
            detail: "argv echo line is not followed by a NUL byte".into(),
        });
    }

    let version = read_u64_le(r)?;
    if version != FORMAT_VERSION {
        return Err(LogError::UnsupportedVersion { found: version });
    }
    let identity = [read_u64_le(r)?, read_u64_le(r)?];
    let main_thread = ThreadIdent(read_u64_le(r)?);
    let argc = read_u32_le(r)?;
    let mut argv = Vec::with_capacity(argc.min(1024) as usize);
    for _ in 0..argc {
        argv.push(read_length_prefixed_str(r)?);
    }
    Ok(LogHeader {
        version,
        identity,
        main_thread,
        argv,
    })
}

// ── Async markers ───────────────────────────────────────────────

/// An out-of-band event read between sync packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Run a finalization pass when `stop_point` is reached.
    FinalizerTrigger {
        /// Stop point at which the pass runs.
        stop_point: u64,
    },
    /// The named thread produced the events that follow.
    ThreadSwitch {
        /// Recorded identity of the thread.
        thread: ThreadIdent,
    },
}

impl AsyncEvent {
    /// The reserved packet header value for this event.
    pub fn marker(&self) -> i16 {
        match self {
            Self::FinalizerTrigger { .. } => ASYNC_FINALIZER_TRIGGER,
            Self::ThreadSwitch { .. } => ASYNC_THREAD_SWITCH,
        }
    }

    /// The 8-byte payload following the marker.
    pub fn payload(&self) -> u64 {
        match *self {
            Self::FinalizerTrigger { stop_point } => stop_point,
            Self::ThreadSwitch { thread } => thread.0,
        }
    }

    /// Rebuild an event from its marker and payload.
    pub fn from_parts(marker: i16, payload: u64) -> Option<Self> {
        match marker {
            ASYNC_FINALIZER_TRIGGER => Some(Self::FinalizerTrigger {
                stop_point: payload,
            }),
            ASYNC_THREAD_SWITCH => Some(Self::ThreadSwitch {
                thread: ThreadIdent(payload),
            }),
            _ => None,
        }
    }

    /// Encoded marker plus payload.
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE + ASYNC_PAYLOAD_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE + ASYNC_PAYLOAD_SIZE];
        out[..PACKET_HEADER_SIZE].copy_from_slice(&self.marker().to_le_bytes());
        out[PACKET_HEADER_SIZE..].copy_from_slice(&self.payload().to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogHeader {
        LogHeader::new([0x1000, 0x2000], vec!["prog".into(), "a\nb".into()])
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        encode_header(&mut buf, &sample()).unwrap();
        assert!(buf.starts_with(b"RevDB:\tprog\ta b\n\0"));
        let decoded = decode_header(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn wrong_signature_rejected() {
        let mut r: &[u8] = b"NotRevDB";
        assert!(matches!(decode_header(&mut r), Err(LogError::InvalidSignature)));
        let mut empty: &[u8] = b"";
        assert!(matches!(decode_header(&mut empty), Err(LogError::InvalidSignature)));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut header = sample();
        header.version = 7;
        let mut buf = Vec::new();
        encode_header(&mut buf, &header).unwrap();
        assert!(matches!(
            decode_header(&mut buf.as_slice()),
            Err(LogError::UnsupportedVersion { found: 7 })
        ));
    }

    #[test]
    fn async_markers_are_reserved_negatives() {
        assert!(ASYNC_FINALIZER_TRIGGER < 0);
        assert!(ASYNC_THREAD_SWITCH < 0);
        let ev = AsyncEvent::ThreadSwitch {
            thread: ThreadIdent(9),
        };
        let bytes = ev.to_bytes();
        let marker = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(AsyncEvent::from_parts(marker, 9), Some(ev));
        assert_eq!(AsyncEvent::from_parts(-1, 0), None);
    }
}
