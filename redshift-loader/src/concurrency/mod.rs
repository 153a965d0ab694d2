//! Coordination primitives shared by the engine and its workers.

pub mod shutdown;
