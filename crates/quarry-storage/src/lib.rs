//! Storage engine for Quarry.
//!
//! This crate provides:
//! - A concurrent B+-tree index over buffer-managed pages
//! - A slotted-page record store with redirect-based growth
//! - Free-space inventory and schema catalog segments
//! - A database wrapper binding a schema to its table segments

pub mod btree;
pub mod database;
pub mod schema;
pub mod slotted;

pub use btree::node::Storable;
pub use btree::BTree;
pub use database::Database;
pub use schema::{Column, Schema, Table, Type};
pub use slotted::{FsiSegment, SchemaSegment, SlottedPage, SpSegment, TableState, Tid};
