//! File and record header codec

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use bytemuck::{bytes_of, pod_read_unaligned};
use tracing::debug;

use super::format::{ByteOrder, FileHeader, RecordHeader, FILE_HEADER_SIZE, RECORD_HEADER_SIZE};
use crate::{PcapMapError, Result};

/// Read and validate the file header at offset 0
///
/// The returned header is in host order; its `magic` keeps the value found
/// on disk so [`FileHeader::byte_order`] still reports the file's order.
///
/// # Errors
///
/// Returns `ShortRead` if the file holds fewer than 24 bytes and
/// `InvalidFormat` if the magic or version is not recognized
pub fn read_file_header(file: &File) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    let mut read = 0;

    while read < FILE_HEADER_SIZE {
        match file.read_at(&mut buf[read..], read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    if read != FILE_HEADER_SIZE {
        return Err(PcapMapError::ShortRead {
            expected: FILE_HEADER_SIZE,
            actual: read,
        });
    }

    let raw: FileHeader = pod_read_unaligned(&buf);
    let order = raw.byte_order().ok_or_else(|| {
        PcapMapError::InvalidFormat(format!("Invalid magic number: {:#010x}", raw.magic))
    })?;
    let header = raw.to_host(order);
    super::validate_header(&header)?;

    debug!(
        "Read file header: order {:?}, snaplen {}, linktype {}",
        order, header.snaplen, header.linktype
    );

    Ok(header)
}

/// Write a canonical host-order file header at offset 0
///
/// # Errors
///
/// Returns `ShortWrite` if the file accepts fewer than 24 bytes; both this
/// and an OS write failure are fatal
pub fn write_file_header(file: &File, linktype: u32, snaplen: u32) -> Result<FileHeader> {
    let header = FileHeader::new(linktype, snaplen);
    let bytes = bytes_of(&header);
    let mut written = 0;

    while written < bytes.len() {
        match file.write_at(&bytes[written..], written as u64) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(PcapMapError::fatal("write file header", e)),
        }
    }

    if written != bytes.len() {
        return Err(PcapMapError::ShortWrite {
            expected: bytes.len(),
            actual: written,
        });
    }

    debug!("Wrote file header: snaplen {snaplen}, linktype {linktype}");
    Ok(header)
}

/// Decode a record header from possibly unaligned bytes
///
/// # Panics
///
/// Panics if `bytes` is not exactly 16 bytes long
#[must_use]
pub fn decode_record_header(bytes: &[u8], order: ByteOrder) -> RecordHeader {
    assert_eq!(bytes.len(), RECORD_HEADER_SIZE, "record header slice length");
    pod_read_unaligned::<RecordHeader>(bytes).to_host(order)
}

/// Encode a record header in host order
#[must_use]
pub fn encode_record_header(header: &RecordHeader) -> &[u8] {
    bytes_of(header)
}
