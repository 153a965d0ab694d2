//! Stream schemas: declared column types, JSON Schema parsing and the persisted-table cache.

pub mod cache;
mod definition;
pub mod json_schema;
mod types;

pub use definition::{Column, ColumnSource, StreamSchema};
pub use types::SemanticType;

/// Time the tap extracted the record.
pub const EXTRACTED_AT_COLUMN: &str = "_sdc_extracted_at";

/// Time the record's batch was flushed.
pub const BATCHED_AT_COLUMN: &str = "_sdc_batched_at";

/// Deletion marker. A non-null value marks the row as deleted at the source.
pub const DELETED_AT_COLUMN: &str = "_sdc_deleted_at";
