//! Mapped region of a capture file

use std::fmt;
use std::fs::File;

use memmap2::{Advice, Mmap, MmapMut, MmapOptions};
use tracing::{debug, warn};

use super::format::FILE_HEADER_SIZE;
use super::growth::{self, GrowthPolicy};
use crate::{PcapMapError, Result};

/// Direction of a capture session, fixed once the region is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Records are appended; capacity grows on demand
    Write,
    /// Records are consumed; capacity is the file size
    Read,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::Read => f.write_str("read"),
        }
    }
}

enum Mapping {
    Write(MmapMut),
    Read(Mmap),
}

/// A capture file's bytes mapped into memory, plus the record cursor
///
/// The cursor is an offset from the start of the mapping and always
/// satisfies `cursor <= capacity`. Addresses are never kept across calls,
/// so a remap that moves the mapping leaves the cursor valid.
pub struct MappedRegion {
    mapping: Mapping,
    cursor: usize,
    growth: GrowthPolicy,
    grows: u64,
}

fn check_regular_file(file: &File) -> Result<()> {
    let metadata = file
        .metadata()
        .map_err(|e| PcapMapError::fatal("fstat", e))?;

    if !metadata.file_type().is_file() {
        return Err(PcapMapError::NotRegularFile(format!(
            "{:?}",
            metadata.file_type()
        )));
    }

    Ok(())
}

impl MappedRegion {
    /// Reserve the initial capacity and map it for writing
    ///
    /// The cursor starts just past the file header, which is expected to
    /// have been written already.
    ///
    /// # Errors
    ///
    /// Every failure here is fatal: a non-regular file, or a failed extend,
    /// mmap or madvise
    pub fn open_for_write(file: &File, growth: GrowthPolicy) -> Result<Self> {
        check_regular_file(file)?;

        let capacity = growth.initial_capacity();
        growth::extend_file(file, capacity)?;

        // SAFETY: the session owns the file for writing; no other mapping of
        // it is handed out and the file only ever grows while mapped.
        let map = unsafe { MmapOptions::new().len(capacity).map_mut(file) }
            .map_err(|e| PcapMapError::fatal("mmap", e))?;
        map.advise(Advice::Sequential)
            .map_err(|e| PcapMapError::fatal("madvise", e))?;

        debug!("Mapped {capacity} bytes for writing");

        Ok(Self {
            mapping: Mapping::Write(map),
            cursor: FILE_HEADER_SIZE,
            growth,
            grows: 0,
        })
    }

    /// Map the whole file read-only
    ///
    /// With `lock_pages` the mapping is populated and pinned resident.
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` if the file cannot hold a file header. A
    /// non-regular file, or a failed mmap or madvise, is fatal. A failed
    /// mlock is logged and the region stays unpinned.
    pub fn open_for_read(file: &File, lock_pages: bool) -> Result<Self> {
        check_regular_file(file)?;

        let size = file
            .metadata()
            .map_err(|e| PcapMapError::fatal("fstat", e))?
            .len() as usize;

        if size < FILE_HEADER_SIZE {
            return Err(PcapMapError::ShortRead {
                expected: FILE_HEADER_SIZE,
                actual: size,
            });
        }

        let mut options = MmapOptions::new();
        options.len(size);
        if lock_pages {
            options.populate();
        }

        // SAFETY: read sessions never write the file, and concurrent writers
        // of the same file from other processes are not supported.
        let map = unsafe { options.map(file) }.map_err(|e| PcapMapError::fatal("mmap", e))?;
        // Pinning is best-effort.
        let locked = lock_pages
            && match map.lock() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to lock {size} mapped bytes, reading unpinned: {e}");
                    false
                }
            };
        map.advise(Advice::Sequential)
            .map_err(|e| PcapMapError::fatal("madvise", e))?;

        debug!("Mapped {size} bytes for reading (locked: {locked})");

        Ok(Self {
            mapping: Mapping::Read(map),
            cursor: FILE_HEADER_SIZE,
            growth: GrowthPolicy::default(),
            grows: 0,
        })
    }

    /// Session mode of this region
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        match self.mapping {
            Mapping::Write(_) => SessionMode::Write,
            Mapping::Read(_) => SessionMode::Read,
        }
    }

    /// Mapped size in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.mapping {
            Mapping::Write(map) => map.len(),
            Mapping::Read(map) => map.len(),
        }
    }

    /// Offset of the next record
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of grow steps taken so far
    #[must_use]
    pub fn grows(&self) -> u64 {
        self.grows
    }

    /// Bytes between the cursor and the end of the mapping
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    fn expect_mode(&self, expected: SessionMode) -> Result<()> {
        let actual = self.mode();
        if actual == expected {
            Ok(())
        } else {
            Err(PcapMapError::WrongMode { expected, actual })
        }
    }

    /// Make sure `additional` bytes fit after the cursor, growing if needed
    ///
    /// Returns whether a grow step happened.
    ///
    /// # Errors
    ///
    /// Returns `WrongMode` on a read region; a failed extend or remap is
    /// fatal
    pub fn ensure_capacity(&mut self, file: &File, additional: usize) -> Result<bool> {
        self.expect_mode(SessionMode::Write)?;

        let required = self.cursor.saturating_add(additional);
        let old_capacity = self.capacity();
        if required <= old_capacity {
            return Ok(false);
        }

        let new_capacity = self.growth.next_capacity(old_capacity, required);
        if let Mapping::Write(map) = &mut self.mapping {
            growth::grow_mapping(map, file, new_capacity)?;
        }
        self.grows += 1;

        debug!(
            "Grew mapping from {old_capacity} to {new_capacity} bytes (cursor {})",
            self.cursor
        );

        Ok(true)
    }

    /// Copy `parts` back to back at the cursor and advance past them
    ///
    /// Capacity must have been ensured for the total length.
    pub(crate) fn append(&mut self, parts: &[&[u8]]) -> Result<usize> {
        self.expect_mode(SessionMode::Write)?;

        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.remaining() {
            return Err(PcapMapError::Truncated {
                offset: self.cursor as u64,
                needed: total,
                available: self.remaining(),
            });
        }

        if let Mapping::Write(map) = &mut self.mapping {
            let mut at = self.cursor;
            for part in parts {
                map[at..at + part.len()].copy_from_slice(part);
                at += part.len();
            }
        }
        self.cursor += total;

        Ok(total)
    }

    /// Bytes at `offset..offset + len` of the mapping, if in bounds
    pub(crate) fn bytes_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        let bytes: &[u8] = match &self.mapping {
            Mapping::Write(map) => &map[..],
            Mapping::Read(map) => &map[..],
        };
        bytes.get(offset..end)
    }

    /// Move the cursor forward by `len` bytes
    pub(crate) fn advance(&mut self, len: usize) {
        debug_assert!(len <= self.remaining());
        self.cursor += len;
    }

    /// Start an asynchronous flush of the written range
    ///
    /// Does not wait for the data to reach the disk. A no-op on read
    /// regions.
    ///
    /// # Errors
    ///
    /// Returns error if the kernel rejects the flush request
    pub fn sync(&self) -> Result<()> {
        if let Mapping::Write(map) = &self.mapping {
            map.flush_async_range(0, self.cursor)?;
        }
        Ok(())
    }

    /// Unmap the region, truncating a write session to the bytes used
    ///
    /// Returns the number of bytes used, file header included.
    ///
    /// # Errors
    ///
    /// A failed truncate is fatal
    pub fn close(self, file: &File) -> Result<u64> {
        let used = self.cursor as u64;
        let mode = self.mode();

        drop(self.mapping);

        if mode == SessionMode::Write {
            file.set_len(used)
                .map_err(|e| PcapMapError::fatal("truncate capture file", e))?;
        }

        debug!("Unmapped {mode} region, {used} bytes used");
        Ok(used)
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("mode", &self.mode())
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("grows", &self.grows)
            .finish()
    }
}
