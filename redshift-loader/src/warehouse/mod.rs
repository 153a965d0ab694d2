//! Warehouses that tables are evolved in and staged batches are merged into.

mod base;
mod client;
mod memory;
mod postgres;
mod redshift;
pub mod sql;

pub use base::{LoadOutcome, LoadRequest, MergeMode, Warehouse};
pub use client::{SqlClient, Statement};
pub use memory::{MemoryTable, MemoryWarehouse};
pub use postgres::PgSqlClient;
pub use redshift::RedshiftWarehouse;
