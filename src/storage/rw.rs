//! Positional read/write capture storage engine
//!
//! Stores the same format as the mapped engine through `pread`/`pwrite`
//! calls. It needs no address space for the file and suits targets where
//! mapping is undesirable; it shares the record error policy of the
//! mapped engine.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::info;

use super::codec::{self, decode_record_header, encode_record_header};
use super::format::{ByteOrder, FileHeader, RecordHeader, FILE_HEADER_SIZE, RECORD_HEADER_SIZE};
use super::packet::Packet;
use super::region::SessionMode;
use super::{CaptureStorage, SessionStats, StorageOptions};
use crate::registry::RW_ENGINE;
use crate::{PcapMapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unopened,
    Open(SessionMode),
    Closed,
}

struct Session {
    phase: Phase,
    order: ByteOrder,
    offset: u64,
    file_len: u64,
}

impl Session {
    fn require(&self, mode: SessionMode) -> Result<()> {
        match self.phase {
            Phase::Unopened => Err(PcapMapError::NotPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
            Phase::Open(actual) if actual != mode => Err(PcapMapError::WrongMode {
                expected: mode,
                actual,
            }),
            Phase::Open(_) => Ok(()),
        }
    }

    fn check_unopened(&self) -> Result<()> {
        match self.phase {
            Phase::Unopened => Ok(()),
            Phase::Open(_) => Err(PcapMapError::AlreadyPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
        }
    }
}

/// Capture storage backed by plain positional reads and writes
pub struct ReadWriteStorage {
    file: File,
    options: StorageOptions,
    session: Mutex<Session>,
}

fn check_regular_file(file: &File) -> Result<u64> {
    let metadata = file
        .metadata()
        .map_err(|e| PcapMapError::fatal("fstat", e))?;
    if !metadata.file_type().is_file() {
        return Err(PcapMapError::NotRegularFile(format!(
            "{:?}",
            metadata.file_type()
        )));
    }
    Ok(metadata.len())
}

impl ReadWriteStorage {
    /// Wrap an open file in an unprepared session
    #[must_use]
    pub fn new(file: File, options: StorageOptions) -> Self {
        Self {
            file,
            options,
            session: Mutex::new(Session {
                phase: Phase::Unopened,
                order: ByteOrder::Native,
                offset: FILE_HEADER_SIZE as u64,
                file_len: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_record<T>(
        &self,
        consume: impl FnOnce(&RecordHeader, &File, u64) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.lock();
        session.require(SessionMode::Read)?;

        let offset = session.offset;
        let available = (session.file_len - offset) as usize;
        if available == 0 {
            return Err(PcapMapError::EndOfStream);
        }
        if available < RECORD_HEADER_SIZE {
            return Err(PcapMapError::Truncated {
                offset,
                needed: RECORD_HEADER_SIZE,
                available,
            });
        }

        let mut raw = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact_at(&mut raw, offset)?;
        let header = decode_record_header(&raw, session.order);

        if header.caplen == 0 {
            return Err(PcapMapError::InvalidRecord {
                offset,
                reason: "zero captured length".to_string(),
            });
        }
        if header.record_size() > available {
            return Err(PcapMapError::Truncated {
                offset,
                needed: header.record_size(),
                available,
            });
        }

        let value = consume(&header, &self.file, offset + RECORD_HEADER_SIZE as u64)?;
        session.offset += header.record_size() as u64;
        Ok(value)
    }
}

impl CaptureStorage for ReadWriteStorage {
    fn name(&self) -> &'static str {
        RW_ENGINE
    }

    fn read_file_header(&self) -> Result<FileHeader> {
        let mut session = self.lock();
        session.check_unopened()?;

        let header = codec::read_file_header(&self.file)?;
        if let Some(order) = header.byte_order() {
            session.order = order;
        }
        Ok(header)
    }

    fn write_file_header(&self) -> Result<FileHeader> {
        self.lock().check_unopened()?;
        codec::write_file_header(&self.file, self.options.linktype, self.options.snaplen)
    }

    fn prepare_writing(&self) -> Result<()> {
        let mut session = self.lock();
        session.check_unopened()?;
        check_regular_file(&self.file)?;

        session.order = ByteOrder::Native;
        session.offset = FILE_HEADER_SIZE as u64;
        session.phase = Phase::Open(SessionMode::Write);
        Ok(())
    }

    fn write_record(&self, header: &RecordHeader, payload: &[u8]) -> Result<usize> {
        let mut session = self.lock();
        session.require(SessionMode::Write)?;

        let offset = session.offset;
        let caplen = header.caplen as usize;
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

        self.file
            .write_all_at(encode_record_header(header), offset)?;
        self.file
            .write_all_at(payload, offset + RECORD_HEADER_SIZE as u64)?;

        let written = RECORD_HEADER_SIZE + caplen;
        session.offset += written as u64;
        Ok(written)
    }

    fn prepare_reading(&self) -> Result<()> {
        let mut session = self.lock();
        session.check_unopened()?;

        let file_len = check_regular_file(&self.file)?;
        if file_len < FILE_HEADER_SIZE as u64 {
            return Err(PcapMapError::ShortRead {
                expected: FILE_HEADER_SIZE,
                actual: file_len as usize,
            });
        }

        session.file_len = file_len;
        session.offset = FILE_HEADER_SIZE as u64;
        session.phase = Phase::Open(SessionMode::Read);
        Ok(())
    }

    fn read_record(&self, buf: &mut [u8]) -> Result<RecordHeader> {
        let capacity = buf.len();
        self.next_record(|header, file, at| {
            let caplen = header.caplen as usize;
            let dst = buf
                .get_mut(..caplen)
                .ok_or(PcapMapError::BufferTooSmall {
                    needed: caplen,
                    capacity,
                })?;
            file.read_exact_at(dst, at)?;
            Ok(*header)
        })
    }

    fn read_packet(&self) -> Result<Packet> {
        self.next_record(|header, file, at| {
            let mut data = vec![0u8; header.caplen as usize];
            file.read_exact_at(&mut data, at)?;
            Ok(Packet {
                header: *header,
                data: Bytes::from(data),
            })
        })
    }

    fn sync(&self) -> Result<()> {
        let session = self.lock();
        match session.phase {
            Phase::Unopened => Err(PcapMapError::NotPrepared),
            Phase::Closed => Err(PcapMapError::SessionClosed),
            Phase::Open(SessionMode::Write) => Ok(self.file.sync_data()?),
            Phase::Open(SessionMode::Read) => Ok(()),
        }
    }

    fn prepare_close(&self) -> Result<u64> {
        let mut session = self.lock();
        let mode = match session.phase {
            Phase::Unopened => return Err(PcapMapError::NotPrepared),
            Phase::Closed => return Err(PcapMapError::SessionClosed),
            Phase::Open(mode) => mode,
        };
        session.phase = Phase::Closed;

        let used = session.offset;
        if mode == SessionMode::Write {
            self.file
                .set_len(used)
                .map_err(|e| PcapMapError::fatal("truncate capture file", e))?;
        }

        info!("Closed {mode} session: {used} bytes");
        Ok(used)
    }

    fn stats(&self) -> SessionStats {
        let session = self.lock();
        match session.phase {
            Phase::Unopened => SessionStats::default(),
            Phase::Open(mode) => SessionStats {
                mode: Some(mode),
                capacity: match mode {
                    SessionMode::Write => session.offset as usize,
                    SessionMode::Read => session.file_len as usize,
                },
                cursor: session.offset as usize,
                grows: 0,
                closed: false,
            },
            Phase::Closed => SessionStats {
                closed: true,
                ..SessionStats::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn writer(file: &NamedTempFile) -> ReadWriteStorage {
        let storage = ReadWriteStorage::new(file.reopen().unwrap(), StorageOptions::default());
        storage.write_file_header().unwrap();
        storage.prepare_writing().unwrap();
        storage
    }

    fn reader(file: &NamedTempFile) -> ReadWriteStorage {
        let storage = ReadWriteStorage::new(file.reopen().unwrap(), StorageOptions::default());
        storage.read_file_header().unwrap();
        storage.prepare_reading().unwrap();
        storage
    }

    #[test]
    fn test_roundtrip() {
        let file = NamedTempFile::new().unwrap();

        let storage = writer(&file);
        for i in 1..=5u8 {
            let payload = vec![i; usize::from(i)];
            let header = RecordHeader::new(Duration::from_secs(u64::from(i)), u32::from(i), 60);
            storage.write_record(&header, &payload).unwrap();
        }
        assert_eq!(storage.prepare_close().unwrap(), 24 + 5 * 16 + 15);

        let storage = reader(&file);
        let mut buf = [0u8; 16];
        for i in 1..=5u8 {
            let header = storage.read_record(&mut buf).unwrap();
            assert_eq!(header.ts_sec, u32::from(i));
            assert_eq!(header.len, 60);
            assert_eq!(&buf[..usize::from(i)], vec![i; usize::from(i)].as_slice());
        }
        assert!(storage.read_record(&mut buf).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn test_truncated_tail() {
        let file = NamedTempFile::new().unwrap();

        let storage = writer(&file);
        storage
            .write_record(&RecordHeader::new(Duration::ZERO, 8, 8), &[1u8; 8])
            .unwrap();
        storage.prepare_close().unwrap();
        file.as_file().set_len(24 + 16 + 4).unwrap();

        let storage = reader(&file);
        assert!(matches!(
            storage.read_packet(),
            Err(PcapMapError::Truncated {
                offset: 24,
                needed: 24,
                available: 20
            })
        ));
    }

    #[test]
    fn test_buffer_too_small_keeps_offset() {
        let file = NamedTempFile::new().unwrap();

        let storage = writer(&file);
        storage
            .write_record(&RecordHeader::new(Duration::ZERO, 6, 6), b"abcdef")
            .unwrap();
        storage.prepare_close().unwrap();

        let storage = reader(&file);
        let mut small = [0u8; 2];
        assert!(matches!(
            storage.read_record(&mut small),
            Err(PcapMapError::BufferTooSmall {
                needed: 6,
                capacity: 2
            })
        ));
        assert_eq!(storage.stats().cursor, FILE_HEADER_SIZE);

        let mut buf = [0u8; 8];
        assert_eq!(storage.read_record(&mut buf).unwrap().caplen, 6);
        assert_eq!(&buf[..6], b"abcdef");
    }
}
