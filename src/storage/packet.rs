//! Owned packets and iteration over a read session

use std::time::Duration;

use bytes::Bytes;

use super::format::RecordHeader;
use super::CaptureStorage;
use crate::Result;

/// A stored record with an owned payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Record header in host order
    pub header: RecordHeader,
    /// Exactly `header.caplen` bytes of payload
    pub data: Bytes,
}

impl Packet {
    /// Build a packet whose captured and original lengths match `data`
    #[must_use]
    pub fn new(timestamp: Duration, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len() as u32;
        Self {
            header: RecordHeader::new(timestamp, len, len),
            data,
        }
    }

    /// Capture timestamp
    #[must_use]
    pub fn timestamp(&self) -> Duration {
        Duration::new(
            u64::from(self.header.ts_sec),
            self.header.ts_usec.saturating_mul(1_000),
        )
    }
}

/// Iterator over the remaining records of a read session
///
/// Ends at the clean end of the stream. Any other error is yielded once,
/// after which the iterator is exhausted.
pub struct Packets<'a> {
    storage: &'a dyn CaptureStorage,
    done: bool,
}

impl<'a> Packets<'a> {
    /// Iterate over `storage`, which must be prepared for reading
    pub fn new(storage: &'a dyn CaptureStorage) -> Self {
        Self {
            storage,
            done: false,
        }
    }
}

impl Iterator for Packets<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.storage.read_packet() {
            Ok(packet) => Some(Ok(packet)),
            Err(e) if e.is_end_of_stream() => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MmapStorage, StorageOptions, FILE_HEADER_SIZE, RECORD_HEADER_SIZE};
    use crate::PcapMapError;
    use tempfile::NamedTempFile;

    #[test]
    fn test_packet_new() {
        let packet = Packet::new(Duration::new(5, 250_000_000), vec![1u8, 2, 3]);
        assert_eq!(packet.header.caplen, 3);
        assert_eq!(packet.header.len, 3);
        assert_eq!(packet.header.ts_usec, 250_000);
        assert_eq!(packet.timestamp(), Duration::new(5, 250_000_000));
    }

    #[test]
    fn test_packets_yield_error_once() {
        let file = NamedTempFile::new().unwrap();
        let storage = MmapStorage::create(file.path(), StorageOptions::default()).unwrap();
        for i in 1..=3u8 {
            storage
                .write_record(&RecordHeader::new(Duration::ZERO, 4, 4), &[i; 4])
                .unwrap();
        }
        storage.prepare_close().unwrap();
        drop(storage);

        // Cut the last payload short.
        let full = FILE_HEADER_SIZE + 3 * (RECORD_HEADER_SIZE + 4);
        file.as_file().set_len(full as u64 - 2).unwrap();

        let storage = MmapStorage::open(file.path(), StorageOptions::default()).unwrap();
        let mut packets = Packets::new(&storage);
        assert_eq!(packets.next().unwrap().unwrap().data.as_ref(), &[1u8; 4]);
        assert_eq!(packets.next().unwrap().unwrap().data.as_ref(), &[2u8; 4]);
        assert!(matches!(
            packets.next(),
            Some(Err(PcapMapError::Truncated { .. }))
        ));
        assert!(packets.next().is_none());
    }
}
