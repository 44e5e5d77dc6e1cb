//! Capacity policy for write mappings
//!
//! A write session reserves more file space than it has used so records can
//! be copied straight into the mapping. When the next record would overrun
//! the reservation, the file is extended and the mapping remapped to
//! `page_align(ceil(capacity * 3 / 2))`, repeating the multiplication until
//! the record fits. Capacity never shrinks while mapped; the slack is cut
//! off by the truncate at close.

use std::fs::File;
use std::sync::OnceLock;

use memmap2::{Advice, MmapMut};

use super::format::FILE_HEADER_SIZE;
use crate::{PcapMapError, Result};

/// Packet slots the initial reservation is sized for
pub const DEFAULT_SLOTS: usize = 1000;

/// Pages reserved per slot for standard frames
const STANDARD_PAGES_PER_SLOT: usize = 3;

/// Pages reserved per slot when jumbo frames are expected
const JUMBO_PAGES_PER_SLOT: usize = 16;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Virtual memory page size of the host
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            FALLBACK_PAGE_SIZE
        }
    })
}

/// Round `size` up to a multiple of the page size
#[must_use]
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page).saturating_mul(page)
}

/// Initial reservation for a write session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialCapacity {
    /// Room for [`DEFAULT_SLOTS`] standard frames
    #[default]
    Standard,
    /// Room for [`DEFAULT_SLOTS`] jumbo frames
    Jumbo,
    /// Explicit size in bytes, rounded up to the page size
    Exact(usize),
}

/// Growth policy for write mappings
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowthPolicy {
    initial: InitialCapacity,
}

impl GrowthPolicy {
    /// Create a policy with the given initial reservation
    #[must_use]
    pub fn new(initial: InitialCapacity) -> Self {
        Self { initial }
    }

    /// Page-aligned size of the first mapping
    #[must_use]
    pub fn initial_capacity(&self) -> usize {
        let slots = |pages: usize| FILE_HEADER_SIZE + page_size() * pages * DEFAULT_SLOTS;

        match self.initial {
            InitialCapacity::Standard => page_align(slots(STANDARD_PAGES_PER_SLOT)),
            InitialCapacity::Jumbo => page_align(slots(JUMBO_PAGES_PER_SLOT)),
            InitialCapacity::Exact(bytes) => page_align(bytes.max(FILE_HEADER_SIZE + 1)),
        }
    }

    /// Capacity after growing from `old` until `required` bytes fit
    ///
    /// The result is page aligned and strictly greater than `old`.
    #[must_use]
    pub fn next_capacity(&self, old: usize, required: usize) -> usize {
        let mut capacity = old;
        loop {
            let grown = page_align(capacity.saturating_mul(3).div_ceil(2));
            capacity = if grown > capacity {
                grown
            } else {
                capacity.saturating_add(page_size())
            };
            if capacity >= required {
                return capacity;
            }
        }
    }
}

/// Reserve `len` bytes of backing file
pub(crate) fn extend_file(file: &File, len: usize) -> Result<()> {
    file.set_len(len as u64)
        .map_err(|e| PcapMapError::fatal("extend capture file", e))
}

/// Extend the backing file and remap `map` to `new_len` bytes
///
/// The kernel may move the mapping; any address derived from the old
/// mapping is invalid afterwards.
pub(crate) fn grow_mapping(map: &mut MmapMut, file: &File, new_len: usize) -> Result<()> {
    extend_file(file, new_len)?;

    #[cfg(target_os = "linux")]
    {
        use memmap2::RemapOptions;

        // SAFETY: the mapping is owned exclusively by the session and no
        // borrow of its bytes outlives the caller's lock.
        unsafe { map.remap(new_len, RemapOptions::new().may_move(true)) }
            .map_err(|e| PcapMapError::fatal("mremap", e))?;
    }

    #[cfg(not(target_os = "linux"))]
    {
        use memmap2::MmapOptions;

        // SAFETY: as above; the old shared mapping is dropped only after the
        // new one covering the same file pages exists.
        *map = unsafe { MmapOptions::new().len(new_len).map_mut(file) }
            .map_err(|e| PcapMapError::fatal("mmap", e))?;
    }

    map.advise(Advice::Sequential)
        .map_err(|e| PcapMapError::fatal("madvise", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_initial_capacity() {
        let page = page_size();

        let standard = GrowthPolicy::new(InitialCapacity::Standard).initial_capacity();
        assert_eq!(standard % page, 0);
        assert!(standard >= FILE_HEADER_SIZE + page * 3 * DEFAULT_SLOTS);

        let jumbo = GrowthPolicy::new(InitialCapacity::Jumbo).initial_capacity();
        assert_eq!(jumbo % page, 0);
        assert!(jumbo > standard);

        let exact = GrowthPolicy::new(InitialCapacity::Exact(100)).initial_capacity();
        assert_eq!(exact, page);
    }

    #[test]
    fn test_next_capacity_single_step() {
        let page = page_size();
        let policy = GrowthPolicy::default();

        let old = 4 * page;
        let next = policy.next_capacity(old, old + 1);
        assert_eq!(next, page_align(6 * page));
        assert_eq!(next % page, 0);
        assert!(next > old);
    }

    #[test]
    fn test_next_capacity_oversized_record() {
        let page = page_size();
        let policy = GrowthPolicy::default();

        let old = page;
        let required = 10 * page + 7;
        let next = policy.next_capacity(old, required);
        assert!(next >= required);
        assert_eq!(next % page, 0);
    }

    #[test]
    fn test_next_capacity_always_grows() {
        let page = page_size();
        let policy = GrowthPolicy::default();

        // Already large enough: still one full step.
        let next = policy.next_capacity(2 * page, page);
        assert_eq!(next, 3 * page);
    }
}
