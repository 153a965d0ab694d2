//! Reconciliation of stream schemas with the tables persisted in the warehouse.

mod resolver;
pub mod type_map;

pub use resolver::{ColumnDefinition, SchemaChange, resolve};
