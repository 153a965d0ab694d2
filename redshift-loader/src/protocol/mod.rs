//! Singer protocol messages and their line decoder.

mod decoder;
mod message;

pub use decoder::decode_line;
pub use message::{ActivateVersionMessage, Message, RecordMessage, SchemaMessage, StateMessage};
