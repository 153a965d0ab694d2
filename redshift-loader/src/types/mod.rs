//! Typed record values and their coercion from JSON.

pub mod coercion;
mod sized;
mod value;

pub use sized::SizeHint;
pub use value::{TIMESTAMP_FORMAT, Value};
