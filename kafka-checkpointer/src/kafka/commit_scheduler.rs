//! Commit Scheduler - moves cursor progress to the checkpoint store and the
//! group coordinator.
//!
//! A flush copies the pending offsets out of the assignment tracker under
//! its short lock, then does all I/O without it. Flushes are serialized with
//! an async lock, so a revoke flush always runs after any periodic flush that
//! was already in progress and sees its result.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::CheckpointError;
use crate::kafka::assignment::AssignmentTracker;
use crate::kafka::broker::BrokerClient;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{
    FLUSHES, FLUSH_DURATION_SECONDS, OFFSETS_COMMITTED, PARTITION_LAST_COMMITTED_OFFSET,
};

/// Why a flush ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Interval,
    Count,
    Revoke,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Interval => "interval",
            FlushTrigger::Count => "count",
            FlushTrigger::Revoke => "revoke",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Default)]
pub struct FlushReport {
    pub committed: Vec<PartitionOffset>,
    pub failures: Vec<CheckpointError>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct CommitScheduler {
    tracker: Arc<AssignmentTracker>,
    store: Arc<dyn CheckpointStore>,
    broker: Arc<dyn BrokerClient>,
    commit_interval: Duration,
    // 0 disables the count trigger
    commit_every_records: usize,
    delivered_since_flush: AtomicUsize,
    count_reached: Notify,
    flush_lock: Mutex<()>,
}

impl CommitScheduler {
    pub fn new(
        tracker: Arc<AssignmentTracker>,
        store: Arc<dyn CheckpointStore>,
        broker: Arc<dyn BrokerClient>,
        commit_interval: Duration,
        commit_every_records: usize,
    ) -> Self {
        Self {
            tracker,
            store,
            broker,
            commit_interval,
            commit_every_records,
            delivered_since_flush: AtomicUsize::new(0),
            count_reached: Notify::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// Count delivered records toward the count-based trigger.
    pub fn records_delivered(&self, count: usize) {
        if self.commit_every_records == 0 || count == 0 {
            return;
        }
        let total = self.delivered_since_flush.fetch_add(count, Ordering::Relaxed) + count;
        if total >= self.commit_every_records {
            self.count_reached.notify_one();
        }
    }

    /// Commit every pending offset, or only those of `scope`.
    ///
    /// An offset is marked committed only after both the checkpoint store
    /// and the broker accepted it. Anything that failed stays pending and is
    /// picked up by the next flush.
    pub async fn flush(&self, scope: Option<&[Partition]>, trigger: FlushTrigger) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;
        let start = Instant::now();

        if scope.is_none() {
            self.delivered_since_flush.store(0, Ordering::Relaxed);
        }

        let pending = self.tracker.pending_commits(scope);
        metrics::counter!(FLUSHES, "trigger" => trigger.as_str()).increment(1);
        if pending.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();

        let writes = pending.iter().map(|pending| async move {
            let result = self
                .store
                .persist(pending.partition(), pending.offset())
                .await;
            (pending, result)
        });
        let mut persisted = Vec::with_capacity(pending.len());
        for (pending, result) in join_all(writes).await {
            match result {
                Ok(()) => persisted.push(pending.clone()),
                Err(e) => report.failures.push(CheckpointError::CommitFailure {
                    partition: pending.partition().clone(),
                    offset: pending.offset(),
                    reason: format!("{:#}", anyhow::Error::new(e)),
                }),
            }
        }

        if !persisted.is_empty() {
            match self.broker.commit(&persisted).await {
                Ok(()) => {
                    self.tracker.mark_committed(&persisted);
                    for committed in &persisted {
                        metrics::gauge!(
                            PARTITION_LAST_COMMITTED_OFFSET,
                            "topic" => committed.topic().to_string(),
                            "partition" => committed.partition_number().to_string()
                        )
                        .set(committed.offset() as f64);
                    }
                    report.committed = persisted;
                }
                Err(e) => {
                    let reason = format!("broker commit failed: {e}");
                    report
                        .failures
                        .extend(persisted.into_iter().map(|failed| CheckpointError::CommitFailure {
                            partition: failed.partition().clone(),
                            offset: failed.offset(),
                            reason: reason.clone(),
                        }));
                }
            }
        }

        metrics::counter!(OFFSETS_COMMITTED, "status" => "success")
            .increment(report.committed.len() as u64);
        metrics::counter!(OFFSETS_COMMITTED, "status" => "failure")
            .increment(report.failures.len() as u64);
        metrics::histogram!(FLUSH_DURATION_SECONDS, "trigger" => trigger.as_str())
            .record(start.elapsed().as_secs_f64());

        for failure in &report.failures {
            warn!(trigger = trigger.as_str(), "{failure}");
        }
        debug!(
            trigger = trigger.as_str(),
            committed = report.committed.len(),
            failed = report.failures.len(),
            "Flush complete"
        );
        report
    }

    /// Flush on every interval tick and whenever the record count trigger
    /// fires, until `shutdown` is cancelled. Cancellation also abandons a
    /// flush that is still waiting on the store or the broker.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.commit_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        info!(
            interval = ?self.commit_interval,
            every_records = self.commit_every_records,
            "Commit scheduler started"
        );

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => FlushTrigger::Interval,
                _ = self.count_reached.notified() => FlushTrigger::Count,
            };
            // an abandoned flush marks nothing committed, the final flush redoes it
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(trigger = trigger.as_str(), "Abandoned in-flight flush on shutdown");
                    break;
                }
                _ = self.flush(None, trigger) => {}
            }
        }

        info!("Commit scheduler stopped");
    }
}
