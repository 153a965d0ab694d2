//! Flush workers: one per stream, sharing a bounded number of concurrent merges.

mod flush;
mod pool;

pub use flush::{FlushEvent, FlushTask};
pub use pool::FlushWorkerPool;
