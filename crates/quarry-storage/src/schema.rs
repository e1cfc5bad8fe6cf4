//! Schema value objects.
//!
//! These types describe tables and columns and round-trip through the
//! schema segment as JSON. Allocation counters are snapshots; the live
//! values are kept in [`crate::slotted::TableState`] while segments run.

use serde::{Deserialize, Serialize};

/// Column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    /// 32-bit signed integer.
    Integer,
    /// Fixed-length character string.
    Char { length: u32 },
}

impl Type {
    /// Returns the type name.
    pub fn name(&self) -> &'static str {
        match self {
            Type::Integer => "integer",
            Type::Char { .. } => "char",
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Name of the column.
    pub id: String,
    /// Type of the column.
    #[serde(rename = "type")]
    pub column_type: Type,
}

impl Column {
    /// Creates a new column.
    pub fn new(id: impl Into<String>, column_type: Type) -> Self {
        Self {
            id: id.into(),
            column_type,
        }
    }
}

/// A table definition with its segment bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Name of the table.
    pub id: String,
    /// Ordered column list.
    pub columns: Vec<Column>,
    /// Names of the primary-key columns.
    pub primary_key: Vec<String>,
    /// Segment id of the slotted data pages.
    pub sp_segment: u16,
    /// Segment id of the free-space inventory.
    pub fsi_segment: u16,
    /// Number of allocated data pages.
    #[serde(default)]
    pub allocated_sp_pages: u64,
    /// Number of allocated FSI pages.
    #[serde(default)]
    pub allocated_fsi_pages: u64,
}

impl Table {
    /// Creates a table definition with no pages allocated yet.
    pub fn new(
        id: impl Into<String>,
        columns: Vec<Column>,
        primary_key: Vec<String>,
        sp_segment: u16,
        fsi_segment: u16,
    ) -> Self {
        Self {
            id: id.into(),
            columns,
            primary_key,
            sp_segment,
            fsi_segment,
            allocated_sp_pages: 0,
            allocated_fsi_pages: 0,
        }
    }
}

/// An ordered list of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Tables of the database.
    pub tables: Vec<Table>,
}

impl Schema {
    /// Creates a schema from a table list.
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }
}
