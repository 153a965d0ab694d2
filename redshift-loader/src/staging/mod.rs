//! Staging of flush batches in durable storage before they are loaded.

mod client;
pub mod encoding;
mod memory;
mod writer;

pub use client::{ObjectStoreStagingClient, StagedLocation, StagedObject, StagingClient};
pub use memory::MemoryStagingClient;
pub use writer::{StagingWriter, staging_key};
pub(crate) use writer::key_segment;
