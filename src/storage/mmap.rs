//! Memory-mapped capture storage engine

use std::fs::{File, OpenOptions};
use std::mem;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::codec::{self, decode_record_header, encode_record_header};
use super::format::{ByteOrder, FileHeader, RecordHeader, RECORD_HEADER_SIZE};
use super::growth::GrowthPolicy;
use super::packet::Packet;
use super::region::{MappedRegion, SessionMode};
use super::{CaptureStorage, SessionStats, StorageOptions};
use crate::registry::MMAP_ENGINE;
use crate::spinlock::SpinLock;
use crate::{PcapMapError, Result};

enum Phase {
    Unopened,
    Mapped(MappedRegion),
    Closed,
}

struct Session {
    phase: Phase,
    order: ByteOrder,
}

impl Session {
    fn region(&mut self, mode: SessionMode) -> Result<&mut MappedRegion> {
        match &mut self.phase {
            Phase::Unopened => Err(PcapMapError::NotPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
            Phase::Mapped(region) if region.mode() != mode => Err(PcapMapError::WrongMode {
                expected: mode,
                actual: region.mode(),
            }),
            Phase::Mapped(region) => Ok(region),
        }
    }

    fn check_unopened(&self) -> Result<()> {
        match self.phase {
            Phase::Unopened => Ok(()),
            Phase::Mapped(_) => Err(PcapMapError::AlreadyPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
        }
    }
}

/// Capture storage that reads and writes records through a mapping
///
/// One instance is one capture session over one file. Every record
/// operation, grow step, sync and close runs under a single spin lock, so
/// records from concurrent writers land whole and in lock order.
pub struct MmapStorage {
    file: File,
    options: StorageOptions,
    session: SpinLock<Session>,
}

impl MmapStorage {
    /// Wrap an open file in an unprepared session
    ///
    /// Writing needs the file opened for both reading and writing.
    #[must_use]
    pub fn new(file: File, options: StorageOptions) -> Self {
        Self {
            file,
            options,
            session: SpinLock::new(Session {
                phase: Phase::Unopened,
                order: ByteOrder::Native,
            }),
        }
    }

    /// Create (or truncate) a capture file and prepare it for writing
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created; header and mapping
    /// failures are fatal
    pub fn create(path: &Path, options: StorageOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let storage = Self::new(file, options);
        storage.write_file_header()?;
        storage.prepare_writing()?;
        Ok(storage)
    }

    /// Open a capture file and prepare it for reading
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or its header is invalid;
    /// mapping failures are fatal
    pub fn open(path: &Path, options: StorageOptions) -> Result<Self> {
        let file = File::open(path)?;

        let storage = Self::new(file, options);
        storage.read_file_header()?;
        storage.prepare_reading()?;
        Ok(storage)
    }

    /// Run the bounds and validity checks for the next record, hand its
    /// header and payload to `consume`, then advance past it
    ///
    /// Nothing is copied and the cursor does not move unless every check
    /// passes.
    fn next_record<T>(
        &self,
        consume: impl FnOnce(&RecordHeader, &[u8]) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.session.lock();
        let order = session.order;
        let region = session.region(SessionMode::Read)?;

        let offset = region.cursor();
        let available = region.remaining();
        if available == 0 {
            return Err(PcapMapError::EndOfStream);
        }

        let header_bytes = region.bytes_at(offset, RECORD_HEADER_SIZE).ok_or(
            PcapMapError::Truncated {
                offset: offset as u64,
                needed: RECORD_HEADER_SIZE,
                available,
            },
        )?;
        let header = decode_record_header(header_bytes, order);

        if header.caplen == 0 {
            return Err(PcapMapError::InvalidRecord {
                offset: offset as u64,
                reason: "zero captured length".to_string(),
            });
        }

        let caplen = header.caplen as usize;
        let payload = region
            .bytes_at(offset + RECORD_HEADER_SIZE, caplen)
            .ok_or(PcapMapError::Truncated {
                offset: offset as u64,
                needed: header.record_size(),
                available,
            })?;

        let value = consume(&header, payload)?;
        region.advance(header.record_size());
        Ok(value)
    }
}

impl CaptureStorage for MmapStorage {
    fn name(&self) -> &'static str {
        MMAP_ENGINE
    }

    fn read_file_header(&self) -> Result<FileHeader> {
        let mut session = self.session.lock();
        session.check_unopened()?;

        let header = codec::read_file_header(&self.file)?;
        if let Some(order) = header.byte_order() {
            session.order = order;
        }
        Ok(header)
    }

    fn write_file_header(&self) -> Result<FileHeader> {
        self.session.lock().check_unopened()?;
        codec::write_file_header(&self.file, self.options.linktype, self.options.snaplen)
    }

    fn prepare_writing(&self) -> Result<()> {
        let mut session = self.session.lock();
        session.check_unopened()?;

        let growth = GrowthPolicy::new(self.options.initial_capacity);
        let region = MappedRegion::open_for_write(&self.file, growth)?;
        session.order = ByteOrder::Native;
        session.phase = Phase::Mapped(region);
        Ok(())
    }

    fn write_record(&self, header: &RecordHeader, payload: &[u8]) -> Result<usize> {
        let caplen = header.caplen as usize;

        let mut session = self.session.lock();
        let region = session.region(SessionMode::Write)?;
        let offset = region.cursor() as u64;

        if caplen == 0 {
            return Err(PcapMapError::InvalidRecord {
                offset,
                reason: "zero captured length".to_string(),
            });
        }
        let payload = payload.get(..caplen).ok_or_else(|| PcapMapError::InvalidRecord {
            offset,
            reason: format!(
                "payload of {} bytes is shorter than captured length {caplen}",
                payload.len()
            ),
        })?;

        region.ensure_capacity(&self.file, RECORD_HEADER_SIZE + caplen)?;
        region.append(&[encode_record_header(header), payload])
    }

    fn prepare_reading(&self) -> Result<()> {
        let mut session = self.session.lock();
        session.check_unopened()?;

        let region = MappedRegion::open_for_read(&self.file, self.options.lock_pages)?;
        session.phase = Phase::Mapped(region);
        Ok(())
    }

    fn read_record(&self, buf: &mut [u8]) -> Result<RecordHeader> {
        let capacity = buf.len();
        self.next_record(|header, payload| {
            let dst = buf
                .get_mut(..payload.len())
                .ok_or(PcapMapError::BufferTooSmall {
                    needed: payload.len(),
                    capacity,
                })?;
            dst.copy_from_slice(payload);
            Ok(*header)
        })
    }

    fn read_packet(&self) -> Result<Packet> {
        self.next_record(|header, payload| {
            Ok(Packet {
                header: *header,
                data: Bytes::copy_from_slice(payload),
            })
        })
    }

    fn sync(&self) -> Result<()> {
        let mut session = self.session.lock();
        match &mut session.phase {
            Phase::Unopened => Err(PcapMapError::NotPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
            Phase::Mapped(region) => region.sync(),
        }
    }

    fn prepare_close(&self) -> Result<u64> {
        let mut session = self.session.lock();
        let region = match mem::replace(&mut session.phase, Phase::Closed) {
            Phase::Mapped(region) => region,
            Phase::Unopened => {
                session.phase = Phase::Unopened;
                return Err(PcapMapError::NotPrepared);
            }
            Phase::Closed => return Err(PcapMapError::SessionClosed),
        };

        let mode = region.mode();
        let grows = region.grows();
        let used = region.close(&self.file)?;

        info!("Closed {mode} session: {used} bytes, {grows} grow steps");
        Ok(used)
    }

    fn stats(&self) -> SessionStats {
        let session = self.session.lock();
        match &session.phase {
            Phase::Unopened => SessionStats::default(),
            Phase::Mapped(region) => SessionStats {
                mode: Some(region.mode()),
                capacity: region.capacity(),
                cursor: region.cursor(),
                grows: region.grows(),
                closed: false,
            },
            Phase::Closed => SessionStats {
                closed: true,
                ..SessionStats::default()
            },
        }
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Phase::Mapped(region) = mem::replace(&mut session.phase, Phase::Closed) {
            match region.mode() {
                SessionMode::Write => warn!("Capture session dropped without close, closing now"),
                SessionMode::Read => debug!("Read session dropped without close, unmapping"),
            }
            if let Err(e) = region.close(&self.file) {
                warn!("Failed to close capture session: {e}");
            }
        } else {
            debug!("Capture session released");
        }
    }
}
