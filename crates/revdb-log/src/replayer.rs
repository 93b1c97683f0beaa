//! Replay-side packet reader.
//!
//! [`Replayer`] keeps a fixed buffer with three cursors: `pos` (next
//! unread byte), `limit` (end of the current sync packet) and `end` (end
//! of the bytes read from the source). Refills slide the unconsumed tail
//! to the front and top the buffer up with one bulk read.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use log::{debug, trace};

use crate::codec::{read_u64_le, LogValue};
use crate::error::LogError;
use crate::format::{
    decode_header, AsyncEvent, LogHeader, ASYNC_PAYLOAD_SIZE, MAX_PACKET_PAYLOAD,
    PACKET_HEADER_SIZE, TRAILER_SIZE,
};

/// Result of reading one value: either the value, or an async event that
/// was found first and must be handled before reading again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fetched<T> {
    /// The next sync value.
    Value(T),
    /// An out-of-band marker preceding the next sync packet.
    Async(AsyncEvent),
}

const BUFFER_SIZE: usize = PACKET_HEADER_SIZE + MAX_PACKET_PAYLOAD + ASYNC_PAYLOAD_SIZE;

/// Reads framed values back from a log.
pub struct Replayer<R: Read + Seek> {
    source: R,
    header: LogHeader,
    total_stop_points: u64,
    buf: Box<[u8]>,
    pos: usize,
    limit: usize,
    end: usize,
    /// File offset of `buf[0]`.
    base: u64,
}

impl<R: Read + Seek> Replayer<R> {
    /// Open a log, validating the header and reading the trailer.
    pub fn open(mut source: R) -> Result<Self, LogError> {
        let header = decode_header(&mut source)?;
        let data_start = source.stream_position()?;
        let file_len = source.seek(SeekFrom::End(0))?;
        if file_len < data_start + TRAILER_SIZE as u64 {
            return Err(LogError::Truncated {
                detail: "no room for the stop-point trailer".into(),
            });
        }
        source.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        let total_stop_points = read_u64_le(&mut source)?;
        source.seek(SeekFrom::Start(data_start))?;
        debug!(
            "replayer opened: {} argv entries, {} stop points, data at {}",
            header.argv.len(),
            total_stop_points,
            data_start
        );
        Ok(Self {
            source,
            header,
            total_stop_points,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            limit: 0,
            end: 0,
            base: data_start,
        })
    }

    /// The decoded header.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Stop-point count stored in the trailer.
    pub fn total_stop_points(&self) -> u64 {
        self.total_stop_points
    }

    /// Read the next value.
    ///
    /// When the current packet is exhausted and the next packet is an
    /// async marker, the marker is consumed and returned instead; the
    /// caller handles it and reads again.
    pub fn read<T: LogValue>(&mut self) -> Result<Fetched<T>, LogError> {
        if self.pos == self.limit {
            if let Some(event) = self.next_packet()? {
                return Ok(Fetched::Async(event));
            }
        }
        if self.pos + T::SIZE > self.limit {
            return Err(LogError::MalformedPacket {
                detail: format!(
                    "{}-byte value straddles the end of a packet at offset {}",
                    T::SIZE,
                    self.offset()
                ),
            });
        }
        let value = T::decode(&self.buf[self.pos..self.pos + T::SIZE]);
        self.pos += T::SIZE;
        Ok(Fetched::Value(value))
    }

    /// Consume an async marker if one is next.
    ///
    /// Only looks ahead when the current packet is exhausted; a sync
    /// packet header is left unread. Returns `None` at end of file.
    pub fn poll_async(&mut self) -> Result<Option<AsyncEvent>, LogError> {
        if self.pos != self.limit || !self.fill(PACKET_HEADER_SIZE)? {
            return Ok(None);
        }
        if self.peek_header() >= 0 {
            return Ok(None);
        }
        self.next_packet()
    }

    /// Consume the next packet, which must be an async marker.
    pub fn next_async(&mut self) -> Result<AsyncEvent, LogError> {
        if self.pos != self.limit {
            return Err(LogError::MalformedPacket {
                detail: format!(
                    "expected an async marker, {} sync bytes remain",
                    self.limit - self.pos
                ),
            });
        }
        match self.next_packet()? {
            Some(event) => Ok(event),
            None => Err(LogError::MalformedPacket {
                detail: "expected an async marker, found a sync packet".into(),
            }),
        }
    }

    /// Fail unless every byte of the log has been consumed.
    pub fn check_at_end(&mut self) -> Result<(), LogError> {
        let mut extra = (self.end - self.pos) as u64;
        let mut probe = [0u8; 256];
        loop {
            match self.source.read(&mut probe) {
                Ok(0) => break,
                Ok(n) => extra += n as u64,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if extra != 0 {
            return Err(LogError::TrailingBytes { count: extra });
        }
        Ok(())
    }

    /// File offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Offset the underlying source is positioned at.
    pub fn source_offset(&self) -> u64 {
        self.base + self.end as u64
    }

    /// Swap in a new source (e.g. a reopened file after a fork),
    /// positioning it where the old one stood.
    pub fn replace_source(&mut self, mut source: R) -> Result<(), LogError> {
        source.seek(SeekFrom::Start(self.source_offset()))?;
        self.source = source;
        Ok(())
    }

    fn peek_header(&self) -> i16 {
        i16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]])
    }

    /// Read the next packet header. Sync packets become the new current
    /// packet; async markers are decoded and returned.
    fn next_packet(&mut self) -> Result<Option<AsyncEvent>, LogError> {
        self.require(PACKET_HEADER_SIZE, "a packet header")?;
        let header = self.peek_header();
        self.pos += PACKET_HEADER_SIZE;
        if header > 0 {
            let size = header as usize;
            self.require(size, "a packet payload")?;
            self.limit = self.pos + size;
            trace!("packet of {size} bytes at offset {}", self.offset());
            return Ok(None);
        }
        self.require(ASYNC_PAYLOAD_SIZE, "an async marker payload")?;
        let payload = u64::decode(&self.buf[self.pos..]);
        self.pos += ASYNC_PAYLOAD_SIZE;
        self.limit = self.pos;
        match AsyncEvent::from_parts(header, payload) {
            Some(event) => {
                trace!("async {event:?}");
                Ok(Some(event))
            }
            None => Err(LogError::MalformedPacket {
                detail: format!("unknown packet header {header}"),
            }),
        }
    }

    fn require(&mut self, n: usize, what: &str) -> Result<(), LogError> {
        if self.fill(n)? {
            Ok(())
        } else {
            Err(LogError::Truncated {
                detail: format!("end of file while reading {what} at offset {}", self.offset()),
            })
        }
    }

    /// Make at least `n` bytes available from `pos`. Returns `false` if
    /// the source ends first.
    fn fill(&mut self, n: usize) -> Result<bool, LogError> {
        if self.end - self.pos >= n {
            return Ok(true);
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.end, 0);
            self.base += self.pos as u64;
            self.end -= self.pos;
            self.limit = self.limit.saturating_sub(self.pos);
            self.pos = 0;
        }
        while self.end < n {
            match self.source.read(&mut self.buf[self.end..]) {
                Ok(0) => return Ok(false),
                Ok(k) => self.end += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_header, ASYNC_THREAD_SWITCH};
    use crate::recorder::Recorder;
    use revdb_core::ThreadIdent;
    use std::io::Cursor;

    fn header() -> LogHeader {
        LogHeader::new([5, 6], vec!["prog".into()])
    }

    fn record(f: impl FnOnce(&mut Recorder<Vec<u8>>)) -> Vec<u8> {
        let mut rec = Recorder::new(Vec::new(), &header(), 64).unwrap();
        f(&mut rec);
        rec.finish().unwrap()
    }

    #[test]
    fn values_come_back_in_order() {
        let bytes = record(|r| {
            for i in 0..30u32 {
                r.write(i).unwrap();
            }
            r.write(3u64).unwrap();
        });
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        assert_eq!(rep.header(), &header());
        assert_eq!(rep.total_stop_points(), 3);
        for i in 0..30u32 {
            assert_eq!(rep.read::<u32>().unwrap(), Fetched::Value(i));
        }
        assert_eq!(rep.read::<u64>().unwrap(), Fetched::Value(3));
        rep.check_at_end().unwrap();
    }

    #[test]
    fn async_marker_is_reported_once() {
        let bytes = record(|r| {
            r.write(1u8).unwrap();
            r.write_async(AsyncEvent::ThreadSwitch {
                thread: ThreadIdent(4),
            })
            .unwrap();
            r.write(2u8).unwrap();
            r.write(0u64).unwrap();
        });
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        assert_eq!(rep.read::<u8>().unwrap(), Fetched::Value(1));
        assert_eq!(
            rep.read::<u8>().unwrap(),
            Fetched::Async(AsyncEvent::ThreadSwitch {
                thread: ThreadIdent(4)
            })
        );
        assert_eq!(rep.read::<u8>().unwrap(), Fetched::Value(2));
    }

    #[test]
    fn poll_async_leaves_sync_packets_alone() {
        let bytes = record(|r| {
            r.write(1u8).unwrap();
            r.write_async(AsyncEvent::FinalizerTrigger { stop_point: 1 })
                .unwrap();
            r.write(0u64).unwrap();
        });
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        // Before the first packet is loaded the next header is sync.
        assert_eq!(rep.poll_async().unwrap(), None);
        assert_eq!(rep.read::<u8>().unwrap(), Fetched::Value(1));
        assert_eq!(
            rep.poll_async().unwrap(),
            Some(AsyncEvent::FinalizerTrigger { stop_point: 1 })
        );
        assert_eq!(rep.poll_async().unwrap(), None);
        assert_eq!(rep.read::<u64>().unwrap(), Fetched::Value(0));
        assert_eq!(rep.poll_async().unwrap(), None);
    }

    #[test]
    fn truncated_packet_is_fatal() {
        let mut bytes = Vec::new();
        encode_header(&mut bytes, &header()).unwrap();
        bytes.extend_from_slice(&20i16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(rep.read::<u8>(), Err(LogError::Truncated { .. })));
    }

    #[test]
    fn missing_trailer_is_fatal() {
        let mut bytes = Vec::new();
        encode_header(&mut bytes, &header()).unwrap();
        bytes.extend_from_slice(&[1, 0, 0]);
        assert!(matches!(
            Replayer::open(Cursor::new(bytes)),
            Err(LogError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_negative_header_is_malformed() {
        let mut bytes = Vec::new();
        encode_header(&mut bytes, &header()).unwrap();
        bytes.extend_from_slice(&(-3i16).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(rep.read::<u8>(), Err(LogError::MalformedPacket { .. })));
        assert_ne!(ASYNC_THREAD_SWITCH, -3);
    }

    #[test]
    fn trailing_bytes_are_detected() {
        let mut bytes = record(|r| {
            r.write(1u64).unwrap();
        });
        bytes.extend_from_slice(&[1, 0, 0]);
        // The trailer is now misread, but the point is that the stream
        // does not end where the last value does.
        let mut rep = Replayer::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(rep.read::<u64>(), Ok(Fetched::Value(1))));
        assert!(matches!(
            rep.check_at_end(),
            Err(LogError::TrailingBytes { count: 3 })
        ));
    }

    #[test]
    fn replaced_source_continues_at_the_same_offset() {
        let bytes = record(|r| {
            for i in 0..40u16 {
                r.write(i).unwrap();
            }
            r.write(0u64).unwrap();
        });
        let mut rep = Replayer::open(Cursor::new(bytes.clone())).unwrap();
        for i in 0..5u16 {
            assert_eq!(rep.read::<u16>().unwrap(), Fetched::Value(i));
        }
        rep.replace_source(Cursor::new(bytes)).unwrap();
        for i in 5..40u16 {
            assert_eq!(rep.read::<u16>().unwrap(), Fetched::Value(i));
        }
    }
}
