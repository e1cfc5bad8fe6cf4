//! Database: binds a schema catalog to per-table record segments.

use crate::schema::{Schema, Table};
use crate::slotted::{FsiSegment, SchemaSegment, SpSegment, TableState};
use quarry_buffer::BufferManager;
use quarry_common::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Segment id the schema catalog lives in.
pub const SCHEMA_SEGMENT_ID: u16 = 0;

/// A database instance: the schema catalog plus one record segment and one
/// free-space inventory per table.
pub struct Database {
    buffer: Arc<BufferManager>,
    schema_segment: SchemaSegment,
    /// Record segments keyed by their data segment id.
    tables: HashMap<u16, SpSegment>,
    /// Live allocation counters keyed by data segment id.
    states: HashMap<u16, Arc<TableState>>,
}

impl Database {
    /// Creates a database over a buffer manager. No schema is loaded yet.
    pub fn new(buffer: Arc<BufferManager>) -> Self {
        let schema_segment = SchemaSegment::new(SCHEMA_SEGMENT_ID, Arc::clone(&buffer));
        Self {
            buffer,
            schema_segment,
            tables: HashMap::new(),
            states: HashMap::new(),
        }
    }

    /// Returns the buffer manager backing this database.
    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    /// Returns the loaded schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema_segment.schema()
    }

    /// Installs a new schema, creates segments for each table and persists
    /// the catalog.
    pub fn create_schema(&mut self, schema: Schema) -> Result<()> {
        self.schema_segment.set_schema(schema);
        self.open_tables()?;
        self.write_schema()
    }

    /// Loads the schema from disk and opens the table segments.
    pub fn open(&mut self) -> Result<()> {
        self.schema_segment.read()?;
        self.open_tables()
    }

    /// Returns the record segment of the named table.
    pub fn table(&self, name: &str) -> Option<&SpSegment> {
        let schema = self.schema_segment.schema()?;
        let table = schema.tables.iter().find(|t| t.id == name)?;
        self.tables.get(&table.sp_segment)
    }

    /// Persists the schema with the current allocation counters.
    pub fn write_schema(&mut self) -> Result<()> {
        if let Some(schema) = self.schema_segment.schema_mut() {
            for table in &mut schema.tables {
                if let Some(state) = self.states.get(&table.sp_segment) {
                    state.store_into(table);
                }
            }
        }
        self.schema_segment.write()
    }

    fn open_tables(&mut self) -> Result<()> {
        let tables: Vec<Table> = self
            .schema_segment
            .schema()
            .map(|s| s.tables.clone())
            .unwrap_or_default();

        for table in &tables {
            if self.tables.contains_key(&table.sp_segment) {
                continue;
            }
            let state = Arc::new(TableState::from_table(table));
            let fsi = FsiSegment::new(
                table.fsi_segment,
                Arc::clone(&self.buffer),
                Arc::clone(&state),
            )?;
            let sp = SpSegment::new(
                table.sp_segment,
                Arc::clone(&self.buffer),
                fsi,
                Arc::clone(&state),
            )?;
            self.states.insert(table.sp_segment, state);
            self.tables.insert(table.sp_segment, sp);
        }
        Ok(())
    }
}
