//! Record-side packet writer.
//!
//! [`Recorder`] accumulates values in a fixed buffer whose first two
//! bytes are reserved for the packet header. When the next value would
//! not fit, the current packet is framed and written out in one piece.

use log::{debug, trace};

use crate::codec::LogValue;
use crate::error::LogError;
use crate::format::{encode_header, AsyncEvent, LogHeader, MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE};
use crate::sink::LogSink;

/// Default packet buffer size in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16384;

/// Smallest accepted packet buffer size in bytes.
pub const MIN_BUFFER_CAPACITY: usize = 64;

/// Writes framed values to a [`LogSink`].
///
/// Generic over the sink so tests can record into a `Vec<u8>` while the
/// engine records into a `File`.
///
/// # Examples
///
/// ```
/// use revdb_log::{LogHeader, Recorder, Replayer, Fetched};
///
/// let mut rec = Recorder::new(Vec::new(), &LogHeader::new([1, 2], vec![]), 64).unwrap();
/// rec.write(42u32).unwrap();
/// rec.write(7u64).unwrap(); // trailer
/// let bytes = rec.finish().unwrap();
///
/// let mut rep = Replayer::open(std::io::Cursor::new(bytes)).unwrap();
/// assert_eq!(rep.total_stop_points(), 7);
/// assert_eq!(rep.read::<u32>().unwrap(), Fetched::Value(42));
/// ```
pub struct Recorder<W: LogSink> {
    sink: W,
    buf: Box<[u8]>,
    pos: usize,
    flushed: u64,
    packets: u64,
}

impl<W: LogSink> Recorder<W> {
    /// Create a recorder, immediately writing the header.
    ///
    /// `capacity` is clamped into
    /// `MIN_BUFFER_CAPACITY..=PACKET_HEADER_SIZE + MAX_PACKET_PAYLOAD`.
    pub fn new(mut sink: W, header: &LogHeader, capacity: usize) -> Result<Self, LogError> {
        let mut encoded = Vec::new();
        encode_header(&mut encoded, header)?;
        sink.write_all(&encoded)?;
        let capacity = capacity.clamp(MIN_BUFFER_CAPACITY, PACKET_HEADER_SIZE + MAX_PACKET_PAYLOAD);
        debug!(
            "recorder opened: header {} bytes, buffer {} bytes",
            encoded.len(),
            capacity
        );
        Ok(Self {
            sink,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: PACKET_HEADER_SIZE,
            flushed: encoded.len() as u64,
            packets: 0,
        })
    }

    /// Append one value, returning its file offset.
    pub fn write<T: LogValue>(&mut self, value: T) -> Result<u64, LogError> {
        if self.pos + T::SIZE > self.buf.len() {
            self.flush()?;
        }
        let offset = self.flushed + self.pos as u64;
        value.encode(&mut self.buf[self.pos..self.pos + T::SIZE]);
        self.pos += T::SIZE;
        Ok(offset)
    }

    /// Write the pending packet, if any, to the sink.
    pub fn flush(&mut self) -> Result<(), LogError> {
        if self.pos == PACKET_HEADER_SIZE {
            return Ok(());
        }
        let size = (self.pos - PACKET_HEADER_SIZE) as i16;
        self.buf[..PACKET_HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
        // `write_all` retries short writes and `Interrupted`, and fails
        // with `WriteZero` when the sink stops accepting data.
        self.sink.write_all(&self.buf[..self.pos])?;
        trace!("flushed packet #{} ({} bytes)", self.packets, size);
        self.flushed += self.pos as u64;
        self.packets += 1;
        self.pos = PACKET_HEADER_SIZE;
        Ok(())
    }

    /// Close the current packet and write an async marker after it.
    pub fn write_async(&mut self, event: AsyncEvent) -> Result<(), LogError> {
        self.flush()?;
        let bytes = event.to_bytes();
        self.sink.write_all(&bytes)?;
        debug!("async marker {event:?} at offset {}", self.flushed);
        self.flushed += bytes.len() as u64;
        Ok(())
    }

    /// File offset the next value would be written at, ignoring a flush
    /// the value might trigger.
    pub fn offset(&self) -> u64 {
        self.flushed + self.pos as u64
    }

    /// Bytes handed to the sink so far.
    pub fn bytes_flushed(&self) -> u64 {
        self.flushed
    }

    /// Replace an already-written byte, whether still buffered or on disk.
    pub fn patch_byte(&mut self, offset: u64, expected: u8, value: u8) -> Result<(), LogError> {
        if offset < self.flushed {
            return self.sink.patch_byte(offset, expected, value);
        }
        let written = self.offset();
        let idx = (offset - self.flushed) as usize;
        if idx < PACKET_HEADER_SIZE || idx >= self.pos {
            return Err(LogError::PatchOutOfRange { offset, written });
        }
        if self.buf[idx] != expected {
            return Err(LogError::PatchMismatch {
                offset,
                expected,
                found: self.buf[idx],
            });
        }
        self.buf[idx] = value;
        Ok(())
    }

    /// Flush everything and return the sink.
    pub fn finish(mut self) -> Result<W, LogError> {
        self.flush()?;
        self.sink.flush()?;
        debug!(
            "recorder finished: {} packets, {} bytes",
            self.packets, self.flushed
        );
        Ok(self.sink)
    }

    /// Flush and sync the sink without consuming the recorder.
    pub fn sync(&mut self) -> Result<(), LogError> {
        self.flush()?;
        self.sink.flush()?;
        Ok(())
    }
}
