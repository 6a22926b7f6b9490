//! Kafka checkpointer: a partitioned consumer that delivers records to a
//! handler and checkpoints per-partition progress so a restarted or
//! rebalanced consumer resumes where the group left off.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors; they only show the top-level message.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod serve_metrics;
pub mod service;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use error::{BrokerError, CheckpointError, StoreError};
pub use handler::{Delivery, DeliveryHandler, TriggerShape};
