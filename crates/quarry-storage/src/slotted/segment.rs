//! Slotted-page record segment.
//!
//! Records are addressed by [`Tid`]. A record that outgrows its page moves
//! to a redirect target on another page: the source slot then stores the
//! target TID, and the target payload starts with the original TID so the
//! record can always prove its identity. Targets never chain to further
//! targets.

use super::fsi::FsiSegment;
use super::page::{Slot, SlottedPage, Tid, HEADER_SIZE, SLOT_SIZE, TID_SIZE};
use super::TableState;
use log::trace;
use quarry_buffer::BufferManager;
use quarry_common::{PageId, QuarryError, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Record store over one table's slotted data pages.
pub struct SpSegment {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    fsi: FsiSegment,
    table: Arc<TableState>,
}

impl SpSegment {
    /// Opens the record segment of a table, formatting its first data page
    /// if the table is brand new.
    pub fn new(
        segment_id: u16,
        buffer: Arc<BufferManager>,
        fsi: FsiSegment,
        table: Arc<TableState>,
    ) -> Result<Self> {
        debug_assert_eq!(segment_id, table.sp_segment);
        let segment = Self {
            segment_id,
            buffer,
            fsi,
            table,
        };
        if segment.table.allocated_sp_pages.load(Ordering::Acquire) == 0 {
            segment.table.allocated_sp_pages.store(1, Ordering::Release);
            let mut guard = segment.buffer.fix(PageId::new(segment_id, 0), true)?;
            SlottedPage::init(guard.data_mut());
            guard.mark_dirty();
        }
        Ok(segment)
    }

    /// Returns the segment the data pages live in.
    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Returns the free-space inventory of this table.
    pub fn free_space_inventory(&self) -> &FsiSegment {
        &self.fsi
    }

    /// Largest record payload a single page can hold.
    pub fn max_record_size(&self) -> usize {
        self.buffer.page_size() - HEADER_SIZE - SLOT_SIZE
    }

    /// Allocates space for a record of `size` bytes and returns its TID.
    ///
    /// The free-space inventory picks a page with room; if none has, a
    /// fresh data page is appended (and a fresh inventory page whenever the
    /// data page count crosses a coverage boundary).
    pub fn allocate(&self, size: u32) -> Result<Tid> {
        if size as usize > self.max_record_size() {
            return Err(QuarryError::RecordTooLarge {
                size: size as usize,
                max: self.max_record_size(),
            });
        }
        let (found, target) = self.fsi.find(size + SLOT_SIZE as u32)?;

        if found {
            // The inventory already reserved the space on this page.
            let mut guard = self.buffer.fix(target, true)?;
            let slot_id;
            {
                let mut page = SlottedPage::new(guard.data_mut());
                slot_id = page.allocate(size);
            }
            guard.mark_dirty();
            return Ok(Tid::new(target.offset, slot_id));
        }

        // No page has room: append a fresh data page.
        let offset = self.table.allocated_sp_pages.fetch_add(1, Ordering::AcqRel);
        let target = PageId::new(self.segment_id, offset);
        if (offset + 1) % (2 * self.buffer.page_size() as u64) == 0 {
            // The next data page would fall off the inventory; format the
            // next inventory page ahead of time.
            let fsi_offset = self.table.allocated_fsi_pages.fetch_add(1, Ordering::AcqRel);
            self.fsi.format_page(fsi_offset)?;
        }

        let mut guard = self.buffer.fix(target, true)?;
        SlottedPage::init(guard.data_mut());
        let slot_id;
        let free_space;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            slot_id = page.allocate(size);
            free_space = page.header().free_space;
        }
        guard.mark_dirty();
        drop(guard);
        self.fsi.update(target, free_space)?;
        Ok(Tid::new(target.offset, slot_id))
    }

    /// Reads up to `buf.len()` bytes of the record into `buf`. Returns the
    /// number of bytes copied.
    pub fn read(&self, tid: Tid, buf: &mut [u8]) -> Result<usize> {
        let guard = self.buffer.fix(tid.page_id(self.segment_id), false)?;
        let slot = SlottedPage::read_slot(guard.data(), tid.slot());

        if !slot.is_redirect() {
            let payload = SlottedPage::read_payload(guard.data(), slot);
            let n = buf.len().min(payload.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok(n);
        }

        // Follow the redirect to the target page; targets never chain.
        let target = slot.redirect_tid();
        drop(guard);
        let guard = self.buffer.fix(target.page_id(self.segment_id), false)?;
        let tslot = SlottedPage::read_slot(guard.data(), target.slot());
        debug_assert!(tslot.is_redirect_target());
        let payload = SlottedPage::read_payload(guard.data(), tslot);
        debug_assert!(payload.len() > TID_SIZE);
        debug_assert_eq!(
            u64::from_le_bytes(payload[..TID_SIZE].try_into().unwrap()),
            tid.raw(),
            "redirect target does not belong to this record"
        );
        let payload = &payload[TID_SIZE..];
        let n = buf.len().min(payload.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    /// Writes `buf` into the record. Returns the number of bytes copied.
    pub fn write(&self, tid: Tid, buf: &[u8]) -> Result<usize> {
        let mut guard = self.buffer.fix(tid.page_id(self.segment_id), true)?;
        let slot = SlottedPage::read_slot(guard.data(), tid.slot());

        if !slot.is_redirect() {
            let n;
            {
                let mut page = SlottedPage::new(guard.data_mut());
                let payload = page.payload_mut(slot);
                n = buf.len().min(payload.len());
                payload[..n].copy_from_slice(&buf[..n]);
            }
            guard.mark_dirty();
            return Ok(n);
        }

        let target = slot.redirect_tid();
        drop(guard);
        let mut guard = self.buffer.fix(target.page_id(self.segment_id), true)?;
        let tslot = SlottedPage::read_slot(guard.data(), target.slot());
        debug_assert!(tslot.is_redirect_target());
        let n;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            let payload = page.payload_mut(tslot);
            debug_assert_eq!(
                u64::from_le_bytes(payload[..TID_SIZE].try_into().unwrap()),
                tid.raw()
            );
            let payload = &mut payload[TID_SIZE..];
            n = buf.len().min(payload.len());
            payload[..n].copy_from_slice(&buf[..n]);
        }
        guard.mark_dirty();
        Ok(n)
    }

    /// Resizes a record to `new_size` bytes, preserving a prefix of
    /// `min(old, new)` bytes.
    pub fn resize(&self, tid: Tid, new_size: u32) -> Result<()> {
        let pid = tid.page_id(self.segment_id);
        let mut guard = self.buffer.fix(pid, true)?;
        let slot = SlottedPage::read_slot(guard.data(), tid.slot());

        if !slot.is_redirect() {
            let old_size = slot.size();
            if new_size == old_size {
                return Ok(());
            }

            let header = SlottedPage::read_header(guard.data());
            if new_size < old_size || header.free_space + old_size >= new_size {
                // Shrink, or grow within the page (compacting if needed).
                let free_space;
                {
                    let mut page = SlottedPage::new(guard.data_mut());
                    page.relocate(tid.slot(), new_size);
                    free_space = page.header().free_space;
                }
                guard.mark_dirty();
                drop(guard);
                return self.fsi.update(pid, free_space);
            }

            // The record outgrew its page: move it to a redirect target.
            let stash = SlottedPage::read_payload(guard.data(), slot).to_vec();
            let target = self.allocate(new_size + TID_SIZE as u32)?;
            trace!("record {tid} redirected to {target}");
            debug_assert_ne!(target.page_offset(), tid.page_offset());
            let free_space;
            {
                let mut page = SlottedPage::new(guard.data_mut());
                page.redirect_out(tid.slot(), target);
                free_space = page.header().free_space;
            }
            guard.mark_dirty();
            drop(guard);
            self.fsi.update(pid, free_space)?;
            return self.write_target(target, tid, &stash);
        }

        // The record is already redirected.
        let old_target = slot.redirect_tid();
        let tpid = old_target.page_id(self.segment_id);
        let mut tguard = self.buffer.fix(tpid, true)?;
        let tslot = SlottedPage::read_slot(tguard.data(), old_target.slot());
        debug_assert!(tslot.is_redirect_target());
        debug_assert!(tslot.size() as usize > TID_SIZE);
        let payload_len = tslot.size() as usize - TID_SIZE;

        let origin_header = SlottedPage::read_header(guard.data());
        if origin_header.free_space >= new_size {
            // The record fits its origin page again: undo the redirect.
            trace!("record {tid} pulled back from {old_target}");
            let keep = payload_len.min(new_size as usize);
            let stash =
                SlottedPage::read_payload(tguard.data(), tslot)[TID_SIZE..TID_SIZE + keep].to_vec();
            let target_free;
            {
                let mut tpage = SlottedPage::new(tguard.data_mut());
                tpage.erase(old_target.slot());
                target_free = tpage.header().free_space;
            }
            tguard.mark_dirty();
            drop(tguard);
            self.fsi.update(tpid, target_free)?;

            let free_space;
            {
                let mut page = SlottedPage::new(guard.data_mut());
                page.redirect_back(tid.slot());
                page.relocate(tid.slot(), new_size);
                let slot = page.slot(tid.slot());
                page.payload_mut(slot)[..keep].copy_from_slice(&stash);
                free_space = page.header().free_space;
            }
            guard.mark_dirty();
            drop(guard);
            return self.fsi.update(pid, free_space);
        }

        let target_header = SlottedPage::read_header(tguard.data());
        if target_header.free_space + tslot.size() >= new_size + TID_SIZE as u32 {
            // Resize in place on the target page; the origin is untouched.
            drop(guard);
            let target_free;
            {
                let mut tpage = SlottedPage::new(tguard.data_mut());
                tpage.relocate(old_target.slot(), new_size + TID_SIZE as u32);
                target_free = tpage.header().free_space;
            }
            tguard.mark_dirty();
            drop(tguard);
            return self.fsi.update(tpid, target_free);
        }

        // Neither page has room: move the record to a fresh target. Never
        // chain redirects; the source slot is repointed instead.
        let keep = payload_len.min(new_size as usize);
        let stash =
            SlottedPage::read_payload(tguard.data(), tslot)[TID_SIZE..TID_SIZE + keep].to_vec();
        let target_free;
        {
            let mut tpage = SlottedPage::new(tguard.data_mut());
            tpage.erase(old_target.slot());
            target_free = tpage.header().free_space;
        }
        tguard.mark_dirty();
        drop(tguard);
        self.fsi.update(tpid, target_free)?;

        let new_target = self.allocate(new_size + TID_SIZE as u32)?;
        trace!("record {tid} moved from {old_target} to {new_target}");
        debug_assert_ne!(new_target.page_offset(), tid.page_offset());
        {
            let mut page = SlottedPage::new(guard.data_mut());
            page.set_slot(tid.slot(), Slot::redirect(new_target));
        }
        guard.mark_dirty();
        drop(guard);
        self.write_target(new_target, tid, &stash)
    }

    /// Removes a record, following its redirect if it has one.
    pub fn erase(&self, tid: Tid) -> Result<()> {
        let pid = tid.page_id(self.segment_id);
        let mut guard = self.buffer.fix(pid, true)?;
        let slot = SlottedPage::read_slot(guard.data(), tid.slot());

        let free_space;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            page.erase(tid.slot());
            free_space = page.header().free_space;
        }
        guard.mark_dirty();
        drop(guard);
        self.fsi.update(pid, free_space)?;

        if slot.is_redirect() {
            let target = slot.redirect_tid();
            let tpid = target.page_id(self.segment_id);
            let mut tguard = self.buffer.fix(tpid, true)?;
            debug_assert!(SlottedPage::read_slot(tguard.data(), target.slot()).is_redirect_target());
            let target_free;
            {
                let mut tpage = SlottedPage::new(tguard.data_mut());
                tpage.erase(target.slot());
                target_free = tpage.header().free_space;
            }
            tguard.mark_dirty();
            drop(tguard);
            self.fsi.update(tpid, target_free)?;
        }
        Ok(())
    }

    /// Marks a freshly allocated slot as a redirect target and writes the
    /// original TID followed by the record bytes.
    fn write_target(&self, target: Tid, origin: Tid, bytes: &[u8]) -> Result<()> {
        let mut guard = self.buffer.fix(target.page_id(self.segment_id), true)?;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            let slot = page.slot(target.slot());
            debug_assert!(!slot.is_redirect_target());
            debug_assert!(slot.size() as usize >= bytes.len() + TID_SIZE);
            let slot = slot.with_redirect_target(true);
            page.set_slot(target.slot(), slot);
            let payload = page.payload_mut(slot);
            payload[..TID_SIZE].copy_from_slice(&origin.raw().to_le_bytes());
            payload[TID_SIZE..TID_SIZE + bytes.len()].copy_from_slice(bytes);
        }
        guard.mark_dirty();
        Ok(())
    }
}
