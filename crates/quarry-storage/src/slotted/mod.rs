//! Slotted-page record store.
//!
//! A table is backed by three cooperating segments: the schema catalog
//! (shared by the whole database), a free-space inventory, and the slotted
//! data pages themselves.

pub mod fsi;
pub mod page;
pub mod schema_segment;
pub mod segment;

pub use fsi::FsiSegment;
pub use page::{Header, Slot, SlottedPage, Tid, HEADER_SIZE, SLOT_SIZE, TID_SIZE};
pub use schema_segment::SchemaSegment;
pub use segment::SpSegment;

use crate::schema::Table;
use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime allocation state of one table, shared between its record
/// segment and free-space inventory.
///
/// The serialized [`Table`] value object stays immutable while segments
/// run; the live page counters are copied back into it when the schema is
/// written out.
pub struct TableState {
    /// Segment holding the table's slotted data pages.
    pub sp_segment: u16,
    /// Segment holding the table's free-space inventory.
    pub fsi_segment: u16,
    /// Number of allocated data pages.
    pub allocated_sp_pages: AtomicU64,
    /// Number of allocated FSI pages.
    pub allocated_fsi_pages: AtomicU64,
}

impl TableState {
    /// Builds the runtime state from a schema table.
    pub fn from_table(table: &Table) -> Self {
        Self {
            sp_segment: table.sp_segment,
            fsi_segment: table.fsi_segment,
            allocated_sp_pages: AtomicU64::new(table.allocated_sp_pages),
            allocated_fsi_pages: AtomicU64::new(table.allocated_fsi_pages),
        }
    }

    /// Copies the live counters back into the schema value object.
    pub fn store_into(&self, table: &mut Table) {
        table.allocated_sp_pages = self.allocated_sp_pages.load(Ordering::Acquire);
        table.allocated_fsi_pages = self.allocated_fsi_pages.load(Ordering::Acquire);
    }
}
