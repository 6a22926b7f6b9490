use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::error::StoreError;
use crate::kafka::types::Partition;

/// In-memory checkpoint store. Share one instance (behind an `Arc`) between
/// engine instances to model a durable store that outlives any single
/// consumer process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<Partition, CheckpointEntry>,
    unavailable: AtomicBool,
    persist_calls: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until re-enabled
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of persist calls received (successful or not)
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn entry(&self, partition: &Partition) -> Option<CheckpointEntry> {
        self.entries.get(partition).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.entries
            .entry(partition.clone())
            .and_modify(|entry| {
                if offset > entry.offset {
                    *entry = CheckpointEntry::new(partition, offset);
                }
            })
            .or_insert_with(|| CheckpointEntry::new(partition, offset));
        Ok(())
    }

    async fn read(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        self.check_available()?;
        Ok(self.entries.get(partition).map(|e| e.offset))
    }
}
