//! On-disk capture format structures

use bytemuck::{Pod, Zeroable};

/// Canonical capture magic (microsecond timestamps), host-native order
pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;

/// Canonical magic as it reads back from a file of opposite byte order
pub const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3_b2a1;

/// Format major version
pub const VERSION_MAJOR: u16 = 2;

/// Format minor version
pub const VERSION_MINOR: u16 = 4;

/// Ethernet link-layer type
pub const LINKTYPE_EN10MB: u32 = 1;

/// Default snapshot length
pub const DEFAULT_SNAPSHOT_LEN: u32 = 65_535;

/// File header size
pub const FILE_HEADER_SIZE: usize = 24;

/// Record header size
pub const RECORD_HEADER_SIZE: usize = 16;

/// Byte order of a capture file relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Same order as the host
    Native,
    /// Opposite order; every field must be swapped
    Swapped,
}

impl ByteOrder {
    /// Detect the byte order from a raw magic value
    #[must_use]
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            PCAP_MAGIC => Some(Self::Native),
            PCAP_MAGIC_SWAPPED => Some(Self::Swapped),
            _ => None,
        }
    }

    #[inline]
    fn u16(self, v: u16) -> u16 {
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }

    #[inline]
    fn u32(self, v: u32) -> u32 {
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }
}

/// Capture file header (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    /// Magic number identifying format and byte order
    pub magic: u32,

    /// Major version
    pub version_major: u16,

    /// Minor version
    pub version_minor: u16,

    /// GMT to local timezone correction, conventionally 0
    pub thiszone: i32,

    /// Timestamp accuracy, conventionally 0
    pub sigfigs: u32,

    /// Maximum captured length per record
    pub snaplen: u32,

    /// Link-layer type of every record
    pub linktype: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);

/// Per-record header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct RecordHeader {
    /// Capture timestamp, seconds
    pub ts_sec: u32,

    /// Capture timestamp, microseconds
    pub ts_usec: u32,

    /// Bytes of payload stored after this header
    pub caplen: u32,

    /// Length of the packet on the wire
    pub len: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RecordHeader>(), RECORD_HEADER_SIZE);

impl FileHeader {
    /// Build a canonical host-order header
    #[must_use]
    pub fn new(linktype: u32, snaplen: u32) -> Self {
        Self {
            magic: PCAP_MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            linktype,
        }
    }

    /// Byte order the header was stored in, if the magic is recognized
    #[must_use]
    pub fn byte_order(&self) -> Option<ByteOrder> {
        ByteOrder::from_magic(self.magic)
    }

    /// Convert every field to host order
    ///
    /// The magic is left untouched so the original order stays visible.
    #[must_use]
    pub fn to_host(self, order: ByteOrder) -> Self {
        Self {
            magic: self.magic,
            version_major: order.u16(self.version_major),
            version_minor: order.u16(self.version_minor),
            thiszone: order.u32(self.thiszone as u32) as i32,
            sigfigs: order.u32(self.sigfigs),
            snaplen: order.u32(self.snaplen),
            linktype: order.u32(self.linktype),
        }
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new(LINKTYPE_EN10MB, DEFAULT_SNAPSHOT_LEN)
    }
}

impl RecordHeader {
    /// Create a record header from a capture timestamp and lengths
    #[must_use]
    pub fn new(timestamp: std::time::Duration, caplen: u32, len: u32) -> Self {
        Self {
            ts_sec: timestamp.as_secs() as u32,
            ts_usec: timestamp.subsec_micros(),
            caplen,
            len,
        }
    }

    /// Convert every field to host order
    #[must_use]
    pub fn to_host(self, order: ByteOrder) -> Self {
        Self {
            ts_sec: order.u32(self.ts_sec),
            ts_usec: order.u32(self.ts_usec),
            caplen: order.u32(self.caplen),
            len: order.u32(self.len),
        }
    }

    /// Size of the record on disk, header included
    #[must_use]
    pub fn record_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.caplen as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 24);
        assert_eq!(std::mem::size_of::<RecordHeader>(), 16);
    }

    #[test]
    fn test_default_header() {
        let header = FileHeader::default();
        assert_eq!(header.magic, PCAP_MAGIC);
        assert_eq!(header.version_major, 2);
        assert_eq!(header.version_minor, 4);
        assert_eq!(header.thiszone, 0);
        assert_eq!(header.sigfigs, 0);
        assert_eq!(header.snaplen, DEFAULT_SNAPSHOT_LEN);
        assert_eq!(header.linktype, LINKTYPE_EN10MB);
        assert_eq!(header.byte_order(), Some(ByteOrder::Native));
    }

    #[test]
    fn test_byte_order_detection() {
        assert_eq!(ByteOrder::from_magic(PCAP_MAGIC), Some(ByteOrder::Native));
        assert_eq!(
            ByteOrder::from_magic(PCAP_MAGIC.swap_bytes()),
            Some(ByteOrder::Swapped)
        );
        assert_eq!(ByteOrder::from_magic(0xdead_beef), None);
    }

    #[test]
    fn test_swapped_header_to_host() {
        let native = FileHeader::new(LINKTYPE_EN10MB, 1518);
        let swapped = FileHeader {
            magic: native.magic.swap_bytes(),
            version_major: native.version_major.swap_bytes(),
            version_minor: native.version_minor.swap_bytes(),
            thiszone: native.thiszone.swap_bytes(),
            sigfigs: native.sigfigs.swap_bytes(),
            snaplen: native.snaplen.swap_bytes(),
            linktype: native.linktype.swap_bytes(),
        };

        let order = swapped.byte_order().unwrap();
        assert_eq!(order, ByteOrder::Swapped);

        let host = swapped.to_host(order);
        assert_eq!(host.version_major, VERSION_MAJOR);
        assert_eq!(host.snaplen, 1518);
        assert_eq!(host.linktype, LINKTYPE_EN10MB);
    }

    #[test]
    fn test_record_header_timestamp() {
        let header = RecordHeader::new(Duration::new(1_700_000_000, 123_456_789), 60, 1514);
        assert_eq!(header.ts_sec, 1_700_000_000);
        assert_eq!(header.ts_usec, 123_456);
        assert_eq!(header.record_size(), 76);
    }
}
