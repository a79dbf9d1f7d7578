//! KDL configuration parsing for jobrow.
//!
//! This crate handles:
//! - Worker configuration (queues, thread counts, polling, record retention)
//! - The queue-group grammar used to build schedulers

pub mod error;
pub mod groups;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use groups::QueueGroup;
pub use worker::QueueConfig;
