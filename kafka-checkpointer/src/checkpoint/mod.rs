//! Checkpoint Store - durable record of the last committed offset per partition.
//!
//! Entries are created on a partition's first successful commit, overwritten
//! on every later commit, and never deleted here. Writes are monotonic: a
//! persist with an offset lower than the stored one leaves the entry alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::kafka::types::Partition;

pub mod local;
pub mod memory;

pub use local::LocalCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// One persisted checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub topic: String,
    pub partition: i32,
    /// Next offset to consume
    pub offset: i64,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn new(partition: &Partition, offset: i64) -> Self {
        Self {
            topic: partition.topic().to_string(),
            partition: partition.partition_number(),
            offset,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably record `offset` for `partition`. Idempotent, and never moves a
    /// stored offset backwards. Safe to call concurrently for different
    /// partitions.
    async fn persist(&self, partition: &Partition, offset: i64) -> Result<(), StoreError>;

    /// Read the last persisted offset. A value written by another process is
    /// visible once that write has returned.
    async fn read(&self, partition: &Partition) -> Result<Option<i64>, StoreError>;
}
