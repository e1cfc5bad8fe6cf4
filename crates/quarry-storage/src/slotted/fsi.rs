//! Free-space inventory segment.
//!
//! One nibble per data page encodes a conservative lower bound on the
//! page's free bytes, two nibbles a byte, so one inventory page covers
//! `2 · page_size` data pages. The sixteen levels split the usable page
//! space `C = page_size − header` in half: levels 1..=7 are log₂ fractions
//! of `C/2`, levels 8..=15 climb linearly in `C/16` steps up to `C`.
//! Encoding rounds down, so a decoded value never exceeds the real free
//! space.

use super::page::HEADER_SIZE;
use super::TableState;
use quarry_buffer::BufferManager;
use quarry_common::{PageId, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Builds the 16-entry threshold table for a page size.
fn build_lookup_table(page_size: usize) -> [u32; 16] {
    let usable = (page_size - HEADER_SIZE) as u32;
    let half = usable / 2;
    let step = half / 8;

    let mut table = [0u32; 16];
    for level in 1..=7 {
        table[level] = half >> (7 - level);
    }
    for level in 8..=15 {
        table[level] = usable - (15 - level) as u32 * step;
    }
    table
}

/// Free-space inventory for one table.
pub struct FsiSegment {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    table: Arc<TableState>,
    lookup_table: [u32; 16],
}

impl FsiSegment {
    /// Opens the inventory segment of a table, formatting its first page
    /// if the table is brand new.
    pub fn new(segment_id: u16, buffer: Arc<BufferManager>, table: Arc<TableState>) -> Result<Self> {
        debug_assert_eq!(segment_id, table.fsi_segment);
        let lookup_table = build_lookup_table(buffer.page_size());
        let segment = Self {
            segment_id,
            buffer,
            table,
            lookup_table,
        };
        if segment.table.allocated_fsi_pages.load(Ordering::Acquire) == 0 {
            segment.table.allocated_fsi_pages.store(1, Ordering::Release);
            segment.format_page(0)?;
        }
        Ok(segment)
    }

    /// Returns the segment this inventory lives in.
    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Number of data pages covered by one inventory page.
    fn entries_per_page(&self) -> u64 {
        2 * self.buffer.page_size() as u64
    }

    /// Formats a fresh inventory page. Every nibble claims a fully free
    /// page; entries beyond the allocated data page count are never
    /// consulted.
    pub(crate) fn format_page(&self, offset: u64) -> Result<()> {
        let mut guard = self.buffer.fix(PageId::new(self.segment_id, offset), true)?;
        guard.data_mut().fill(0xFF);
        guard.mark_dirty();
        Ok(())
    }

    /// Encodes free bytes as the greatest level whose threshold fits.
    pub fn encode(&self, free_space: u32) -> u8 {
        let mut level = 15;
        while self.lookup_table[level] > free_space {
            level -= 1;
        }
        level as u8
    }

    /// Decodes a nibble to its guaranteed free-byte count.
    pub fn decode(&self, nibble: u8) -> u32 {
        self.lookup_table[(nibble & 0x0F) as usize]
    }

    /// Rewrites the nibble for a data page.
    pub fn update(&self, target: PageId, free_space: u32) -> Result<()> {
        debug_assert_eq!(target.segment, self.table.sp_segment);
        let entries = self.entries_per_page();
        let fsi_offset = target.offset / entries;
        let entry = target.offset % entries;

        let mut guard = self.buffer.fix(PageId::new(self.segment_id, fsi_offset), true)?;
        let byte = &mut guard.data_mut()[(entry / 2) as usize];
        *byte = if entry % 2 == 0 {
            (self.encode(free_space) << 4) | (*byte & 0x0F)
        } else {
            (*byte & 0xF0) | self.encode(free_space)
        };
        guard.mark_dirty();
        Ok(())
    }

    /// Finds a data page with at least `required` free bytes.
    ///
    /// On a hit the nibble is decremented immediately, reserving the space
    /// for the caller, and `(true, page)` is returned. On a miss the result
    /// is `(false, next)` where `next` is the first unallocated data page,
    /// so the caller can extend the segment.
    pub fn find(&self, required: u32) -> Result<(bool, PageId)> {
        let num_pages = self.table.allocated_sp_pages.load(Ordering::Acquire);
        let num_fsi_pages = self.table.allocated_fsi_pages.load(Ordering::Acquire);
        let entries = self.entries_per_page();
        debug_assert!(num_pages > 0 && num_fsi_pages > 0);

        let mut seen = 0u64;
        'scan: for fsi_offset in 0..num_fsi_pages {
            let mut guard = self.buffer.fix(PageId::new(self.segment_id, fsi_offset), true)?;
            for entry in 0..entries {
                if seen == num_pages {
                    break 'scan;
                }
                let index = (entry / 2) as usize;
                let byte = guard.data()[index];
                let nibble = if entry % 2 == 0 { byte >> 4 } else { byte & 0x0F };
                let free = self.decode(nibble);
                if free >= required {
                    let rest = self.encode(free - required);
                    let data = guard.data_mut();
                    data[index] = if entry % 2 == 0 {
                        (rest << 4) | (data[index] & 0x0F)
                    } else {
                        (data[index] & 0xF0) | rest
                    };
                    guard.mark_dirty();
                    let offset = fsi_offset * entries + entry;
                    return Ok((true, PageId::new(self.table.sp_segment, offset)));
                }
                seen += 1;
            }
        }
        Ok((false, PageId::new(self.table.sp_segment, num_pages)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 1024;

    fn test_fsi(allocated_pages: u64) -> (FsiSegment, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(PAGE_SIZE, 16, dir.path()).unwrap());
        let table = Arc::new(TableState {
            sp_segment: 1,
            fsi_segment: 2,
            allocated_sp_pages: AtomicU64::new(allocated_pages),
            allocated_fsi_pages: AtomicU64::new(0),
        });
        let fsi = FsiSegment::new(2, buffer, table).unwrap();
        (fsi, dir)
    }

    #[test]
    fn test_lookup_table_shape() {
        let table = build_lookup_table(PAGE_SIZE);
        let usable = (PAGE_SIZE - HEADER_SIZE) as u32;
        let half = usable / 2;

        assert_eq!(table[0], 0);
        assert_eq!(table[1], half >> 6);
        assert_eq!(table[7], half);
        assert_eq!(table[8], usable - 7 * (half / 8));
        assert_eq!(table[15], usable);

        // Thresholds are monotonically non-decreasing.
        for level in 1..16 {
            assert!(table[level] >= table[level - 1]);
        }
    }

    #[test]
    fn test_encode_rounds_down() {
        let (fsi, _dir) = test_fsi(1);

        for free in (0..=(PAGE_SIZE - HEADER_SIZE) as u32).step_by(13) {
            let decoded = fsi.decode(fsi.encode(free));
            assert!(decoded <= free, "decode({free}) = {decoded}");
        }
    }

    #[test]
    fn test_encode_extremes() {
        let (fsi, _dir) = test_fsi(1);
        let usable = (PAGE_SIZE - HEADER_SIZE) as u32;

        assert_eq!(fsi.encode(0), 0);
        assert_eq!(fsi.decode(0), 0);
        assert_eq!(fsi.encode(usable), 15);
        assert_eq!(fsi.decode(15), usable);
        assert_eq!(fsi.encode(usable - 1), 14);
    }

    #[test]
    fn test_update_then_find() {
        let (fsi, _dir) = test_fsi(3);

        // Pages 0 and 1 are nearly full, page 2 has room.
        fsi.update(PageId::new(1, 0), 4).unwrap();
        fsi.update(PageId::new(1, 1), 4).unwrap();
        fsi.update(PageId::new(1, 2), 600).unwrap();

        let (found, page) = fsi.find(100).unwrap();
        assert!(found);
        assert_eq!(page, PageId::new(1, 2));
    }

    #[test]
    fn test_find_reserves_space() {
        let (fsi, _dir) = test_fsi(1);
        let usable = (PAGE_SIZE - HEADER_SIZE) as u32;
        fsi.update(PageId::new(1, 0), usable).unwrap();

        let (found, page) = fsi.find(usable).unwrap();
        assert!(found);
        assert_eq!(page, PageId::new(1, 0));

        // The nibble was decremented up front; the same request misses now.
        let (found, next) = fsi.find(usable).unwrap();
        assert!(!found);
        assert_eq!(next, PageId::new(1, 1));
    }

    #[test]
    fn test_find_miss_returns_next_page() {
        let (fsi, _dir) = test_fsi(2);
        fsi.update(PageId::new(1, 0), 0).unwrap();
        fsi.update(PageId::new(1, 1), 16).unwrap();

        let (found, next) = fsi.find(512).unwrap();
        assert!(!found);
        assert_eq!(next, PageId::new(1, 2));
    }

    #[test]
    fn test_odd_and_even_entries_are_independent() {
        let (fsi, _dir) = test_fsi(2);

        fsi.update(PageId::new(1, 0), 0).unwrap();
        fsi.update(PageId::new(1, 1), 500).unwrap();

        let (found, page) = fsi.find(200).unwrap();
        assert!(found);
        assert_eq!(page, PageId::new(1, 1));

        // Page 0's nibble is untouched by the update of page 1.
        let (found, _) = fsi.find(400).unwrap();
        assert!(!found);
    }
}
