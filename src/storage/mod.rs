//! Capture file storage engines

mod codec;
mod format;
mod growth;
mod mmap;
mod packet;
mod region;
mod rw;

pub use codec::{decode_record_header, encode_record_header, read_file_header, write_file_header};
pub use format::{
    ByteOrder, FileHeader, RecordHeader, DEFAULT_SNAPSHOT_LEN, FILE_HEADER_SIZE,
    LINKTYPE_EN10MB, PCAP_MAGIC, PCAP_MAGIC_SWAPPED, RECORD_HEADER_SIZE, VERSION_MAJOR,
    VERSION_MINOR,
};
pub use growth::{page_align, page_size, GrowthPolicy, InitialCapacity, DEFAULT_SLOTS};
pub use mmap::MmapStorage;
pub use packet::{Packet, Packets};
pub use region::{MappedRegion, SessionMode};
pub use rw::ReadWriteStorage;

use crate::Result;

/// Validate capture file magic and version
///
/// Expects a header already converted to host order.
///
/// # Errors
///
/// Returns error if magic or version is invalid
pub fn validate_header(header: &FileHeader) -> Result<()> {
    if header.byte_order().is_none() {
        return Err(crate::PcapMapError::InvalidFormat(format!(
            "Invalid magic number: {:#010x}",
            header.magic
        )));
    }

    if header.version_major != VERSION_MAJOR {
        return Err(crate::PcapMapError::InvalidFormat(format!(
            "Unsupported version: {}.{}, expected {}.x",
            header.version_major, header.version_minor, VERSION_MAJOR
        )));
    }

    Ok(())
}

/// Settings shared by every storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// Link-layer type written into new files
    pub linktype: u32,
    /// Snapshot length written into new files
    pub snaplen: u32,
    /// Initial reservation for write mappings
    pub initial_capacity: InitialCapacity,
    /// Pin read mappings resident
    pub lock_pages: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            linktype: LINKTYPE_EN10MB,
            snaplen: DEFAULT_SNAPSHOT_LEN,
            initial_capacity: InitialCapacity::Standard,
            lock_pages: false,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    /// Mode, once the session is prepared
    pub mode: Option<SessionMode>,
    /// Bytes reserved (mapped) for the session
    pub capacity: usize,
    /// Offset of the next record
    pub cursor: usize,
    /// Grow steps taken
    pub grows: u64,
    /// Whether the session has been closed
    pub closed: bool,
}

/// Operations every storage engine provides to a capture session
///
/// A session is driven as: one of the file header operations, then
/// `prepare_writing` or `prepare_reading`, any number of record operations
/// and syncs, then `prepare_close`. All methods take `&self` and may be
/// called from several threads; record operations are serialized.
pub trait CaptureStorage: Send + Sync {
    /// Stable engine identifier
    fn name(&self) -> &'static str;

    /// Read and validate the file header
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` or `InvalidFormat` for a bad header
    fn read_file_header(&self) -> Result<FileHeader>;

    /// Write a canonical file header
    ///
    /// # Errors
    ///
    /// A failed or short write is fatal
    fn write_file_header(&self) -> Result<FileHeader>;

    /// Enter write mode
    ///
    /// # Errors
    ///
    /// Returns error if the session was already prepared or closed; OS
    /// failures are fatal
    fn prepare_writing(&self) -> Result<()>;

    /// Append one record, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` for a zero captured length or a payload
    /// shorter than it
    fn write_record(&self, header: &RecordHeader, payload: &[u8]) -> Result<usize>;

    /// Enter read mode
    ///
    /// # Errors
    ///
    /// Returns error if the session was already prepared or closed; OS
    /// failures are fatal
    fn prepare_reading(&self) -> Result<()>;

    /// Read the next record, copying its payload into `buf`
    ///
    /// # Errors
    ///
    /// Returns `EndOfStream` at the end of the file, `Truncated` for a
    /// record cut short, `InvalidRecord` for a zero captured length and
    /// `BufferTooSmall` if `buf` cannot hold the payload
    fn read_record(&self, buf: &mut [u8]) -> Result<RecordHeader>;

    /// Read the next record into an owned packet
    ///
    /// # Errors
    ///
    /// Same as [`CaptureStorage::read_record`], minus `BufferTooSmall`
    fn read_packet(&self) -> Result<Packet>;

    /// Start flushing written records to disk without waiting
    ///
    /// # Errors
    ///
    /// Returns error if the session is not prepared or the flush fails
    fn sync(&self) -> Result<()>;

    /// End the session, returning the final file size in bytes
    ///
    /// # Errors
    ///
    /// A failed truncate is fatal
    fn prepare_close(&self) -> Result<u64>;

    /// Current session statistics
    fn stats(&self) -> SessionStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_header() {
        assert!(validate_header(&FileHeader::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_version() {
        let mut header = FileHeader::default();
        header.version_major = 3;
        assert!(validate_header(&header).is_err());
    }

    #[test]
    fn test_validate_rejects_magic() {
        let mut header = FileHeader::default();
        header.magic = 0x0a0d_0d0a;
        assert!(validate_header(&header).is_err());
    }
}
