//! Loading engine for a Singer target writing to Amazon Redshift.
//!
//! The engine reads SCHEMA, RECORD, STATE and ACTIVATE_VERSION messages, buffers records per
//! stream, evolves target tables, stages batches in object storage, merges them by primary key
//! and forwards STATE messages once the data before them is committed.

pub mod batch;
pub mod buffer;
pub mod checkpoint;
pub mod concurrency;
pub mod context;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod evolution;
mod macros;
pub mod merger;
pub mod metrics;
pub mod naming;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod staging;
pub mod types;
pub mod warehouse;
pub mod workers;
