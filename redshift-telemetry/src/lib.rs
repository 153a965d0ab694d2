//! Logging setup for the Redshift target.
//!
//! Stdout carries checkpoint messages, so every log line goes to stderr.

pub mod tracing;
