//! Configuration sections shared by the loader library and the target binary.

mod batch;
mod loader;
mod retry;
mod staging;
mod target;
mod validation;
mod warehouse;

pub use batch::BatchConfig;
pub use loader::{
    LoaderConfig, SchemaMappingEntry, StreamOverride, UnknownColumnsPolicy, ValidationMode,
};
pub use retry::RetryConfig;
pub use staging::StagingConfig;
pub use target::TargetConfig;
pub use validation::ValidationError;
pub use warehouse::WarehouseConfig;
