//! Schema segment: persists the schema catalog.
//!
//! Page 0 layout: an 8-byte little-endian payload length at offset 0, the
//! JSON payload starting at offset [`PAYLOAD_OFFSET`]. Any following pages
//! are pure payload. The bytes between the length prefix and the payload
//! are a reserved area.

use crate::schema::Schema;
use quarry_buffer::BufferManager;
use quarry_common::{PageId, QuarryError, Result};
use std::sync::Arc;

/// Start of the payload on page 0.
pub const PAYLOAD_OFFSET: usize = 20;

/// Reads and writes the schema catalog of a database.
pub struct SchemaSegment {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    schema: Option<Schema>,
}

impl SchemaSegment {
    /// Creates a handle on the schema segment. No I/O happens until
    /// [`read`](Self::read) or [`write`](Self::write).
    pub fn new(segment_id: u16, buffer: Arc<BufferManager>) -> Self {
        Self {
            segment_id,
            buffer,
            schema: None,
        }
    }

    /// Returns the segment id the catalog lives in.
    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Returns the materialized schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Returns the materialized schema for mutation.
    pub fn schema_mut(&mut self) -> Option<&mut Schema> {
        self.schema.as_mut()
    }

    /// Installs a schema without touching disk.
    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = Some(schema);
    }

    /// Materializes the schema from disk.
    pub fn read(&mut self) -> Result<()> {
        let page_size = self.buffer.page_size();

        let guard = self.buffer.fix(PageId::new(self.segment_id, 0), false)?;
        let total = u64::from_le_bytes(guard.data()[..8].try_into().unwrap()) as usize;
        let mut payload = Vec::with_capacity(total);
        let first = total.min(page_size - PAYLOAD_OFFSET);
        payload.extend_from_slice(&guard.data()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + first]);
        drop(guard);

        let mut offset = 1u64;
        while payload.len() < total {
            let guard = self.buffer.fix(PageId::new(self.segment_id, offset), false)?;
            let chunk = (total - payload.len()).min(page_size);
            payload.extend_from_slice(&guard.data()[..chunk]);
            offset += 1;
        }

        let schema = serde_json::from_slice(&payload)
            .map_err(|e| QuarryError::SchemaCorrupted(e.to_string()))?;
        self.schema = Some(schema);
        Ok(())
    }

    /// Serializes the schema to disk. An unset schema writes a zero
    /// length.
    pub fn write(&mut self) -> Result<()> {
        let page_size = self.buffer.page_size();

        let Some(schema) = &self.schema else {
            let mut guard = self.buffer.fix(PageId::new(self.segment_id, 0), true)?;
            guard.data_mut()[..8].copy_from_slice(&0u64.to_le_bytes());
            guard.mark_dirty();
            return Ok(());
        };
        let payload =
            serde_json::to_vec(schema).map_err(|e| QuarryError::SchemaCorrupted(e.to_string()))?;

        let mut guard = self.buffer.fix(PageId::new(self.segment_id, 0), true)?;
        guard.data_mut()[..8].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        let first = payload.len().min(page_size - PAYLOAD_OFFSET);
        guard.data_mut()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + first].copy_from_slice(&payload[..first]);
        guard.mark_dirty();
        drop(guard);

        let mut written = first;
        let mut offset = 1u64;
        while written < payload.len() {
            let mut guard = self.buffer.fix(PageId::new(self.segment_id, offset), true)?;
            let chunk = (payload.len() - written).min(page_size);
            guard.data_mut()[..chunk].copy_from_slice(&payload[written..written + chunk]);
            guard.mark_dirty();
            written += chunk;
            offset += 1;
        }
        Ok(())
    }
}
