//! Shared test utilities for the kafka-checkpointer crate.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::error::{BrokerError, StoreError};
use crate::handler::{Delivery, DeliveryHandler};
use crate::kafka::broker::{BrokerClient, BrokerEvent};
use crate::kafka::types::{Partition, PartitionOffset};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Handler that records every delivered value, in delivery order.
#[derive(Default)]
pub struct RecordingHandler {
    delivered: Mutex<Vec<(Partition, i64, String)>>,
    invocations: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.delivered).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<String> {
        lock(&self.delivered)
            .iter()
            .map(|(_, _, value)| value.clone())
            .collect()
    }

    pub fn values_for(&self, partition: &Partition) -> Vec<String> {
        lock(&self.delivered)
            .iter()
            .filter(|(p, _, _)| p == partition)
            .map(|(_, _, value)| value.clone())
            .collect()
    }

    pub fn offsets_for(&self, partition: &Partition) -> Vec<i64> {
        lock(&self.delivered)
            .iter()
            .filter(|(p, _, _)| p == partition)
            .map(|(_, offset, _)| *offset)
            .collect()
    }

    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        lock(&self.delivered)
            .iter()
            .filter(|(_, _, value)| value.starts_with(prefix))
            .count()
    }

    /// Number of times each value was delivered
    pub fn value_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (_, _, value) in lock(&self.delivered).iter() {
            *counts.entry(value.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, delivery: Delivery<'_>) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut delivered = lock(&self.delivered);
        for record in delivery.records() {
            delivered.push((
                record.partition().clone(),
                record.offset(),
                String::from_utf8_lossy(record.value()).into_owned(),
            ));
        }
        Ok(())
    }
}

/// Handler that fails on purpose.
pub struct FlakyHandler {
    fail_first: usize,
    fail_partition: Option<Partition>,
    attempts: AtomicUsize,
}

impl FlakyHandler {
    /// Fail the first `n` invocations, then succeed.
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            fail_partition: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Always fail deliveries for one partition.
    pub fn failing_partition(partition: Partition) -> Self {
        Self {
            fail_first: 0,
            fail_partition: Some(partition),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryHandler for FlakyHandler {
    async fn handle(&self, delivery: Delivery<'_>) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            bail!("injected failure on attempt {attempt}");
        }
        if let Some(partition) = &self.fail_partition {
            if delivery.partition() == Some(partition) {
                bail!("injected failure for {partition}");
            }
        }
        Ok(())
    }
}

/// Broker client whose `seek` fails a set number of times before reaching
/// the wrapped client. Everything else is passed through.
pub struct SeekFailingBroker {
    inner: Arc<dyn BrokerClient>,
    failures_left: AtomicUsize,
    seek_calls: AtomicUsize,
}

impl SeekFailingBroker {
    pub fn failing_first(inner: Arc<dyn BrokerClient>, n: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(n),
            seek_calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(inner: Arc<dyn BrokerClient>) -> Self {
        Self::failing_first(inner, usize::MAX)
    }

    pub fn seek_calls(&self) -> usize {
        self.seek_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for SeekFailingBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.inner.subscribe(topic).await
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerEvent>, BrokerError> {
        self.inner.poll(timeout).await
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        self.seek_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BrokerError::Transient(format!(
                "injected seek failure for {partition} at {offset}"
            )));
        }
        self.inner.seek(partition, offset).await
    }

    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.inner.pause(partitions).await
    }

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.inner.resume(partitions).await
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        self.inner.commit(offsets).await
    }

    async fn committed(&self, partition: &Partition) -> Result<Option<i64>, BrokerError> {
        self.inner.committed(partition).await
    }

    async fn fetch_watermarks(&self, partition: &Partition) -> Result<(i64, i64), BrokerError> {
        self.inner.fetch_watermarks(partition).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

/// Checkpoint store whose writes never complete. Reads find nothing.
#[derive(Default)]
pub struct StallingCheckpointStore {
    persist_calls: AtomicUsize,
}

impl StallingCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for StallingCheckpointStore {
    async fn persist(&self, _partition: &Partition, _offset: i64) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn read(&self, _partition: &Partition) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
/// Returns whether it held.
pub async fn await_condition<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::message::Record;
    use std::time::SystemTime;

    fn record(value: &str) -> Record {
        Record::new(
            Partition::new("events", 0),
            0,
            None,
            value.as_bytes().to_vec(),
            SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn test_recording_handler_counts_prefixes() {
        let handler = RecordingHandler::new();
        let records = vec![record("B1:1"), record("B1:2"), record("B2:1")];
        handler.handle(Delivery::Array(&records)).await.unwrap();

        assert_eq!(handler.invocations(), 1);
        assert_eq!(handler.count_with_prefix("B1:"), 2);
        assert_eq!(handler.count_with_prefix("B2:"), 1);
        assert_eq!(handler.value_counts().get("B1:1"), Some(&1));
    }

    #[tokio::test]
    async fn test_stalling_store_never_completes_a_write() {
        let store = StallingCheckpointStore::new();
        let partition = Partition::new("events", 0);

        let write = tokio::time::timeout(Duration::from_millis(50), store.persist(&partition, 3));
        assert!(write.await.is_err());
        assert_eq!(store.persist_calls(), 1);
        assert_eq!(store.read(&partition).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_await_condition_times_out() {
        assert!(!await_condition(Duration::from_millis(50), || async { false }).await);
        assert!(await_condition(Duration::from_millis(50), || async { true }).await);
    }
}
