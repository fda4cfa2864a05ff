//! Infrastructure layer: configuration, durable batches, queue runtime.

pub mod config;
pub mod queue;

pub use config::{ConfigError, QueueConfig};
