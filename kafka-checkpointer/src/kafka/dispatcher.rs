//! Batch Dispatcher - pulls records, delivers them to the handler and
//! advances cursors only after successful delivery.
//!
//! Partitions are delivered concurrently; records of one partition are
//! delivered strictly in broker order, one delivery at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::CheckpointError;
use crate::handler::{Delivery, DeliveryHandler, TriggerShape};
use crate::kafka::assignment::AssignmentTracker;
use crate::kafka::broker::{BrokerClient, BrokerEvent};
use crate::kafka::commit_scheduler::CommitScheduler;
use crate::kafka::cursor::Realignment;
use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionState};
use crate::metrics_consts::{
    BATCH_COLLECTION_DURATION_MS, DELIVERY_BATCH_SIZE, DELIVERY_DURATION_SECONDS,
    DELIVERY_RETRIES, PARTITIONS_FAILED, RECORDS_DELIVERED, RECORDS_DROPPED,
};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub trigger_shape: TriggerShape,
    pub max_delivery_attempts: u32,
    pub retry_backoff: Duration,
}

impl DispatcherConfig {
    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_BACKOFF)
    }
}

/// Records pulled in one collection round, plus the rebalance event that
/// ended it early, if any. The event must be handled after the records.
#[derive(Debug, Default)]
pub struct PolledBatch {
    pub records: Vec<Record>,
    pub rebalance: Option<BrokerEvent>,
}

/// Per-round delivery outcome
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub failed_partitions: Vec<Partition>,
}

#[derive(Debug, Default)]
struct PartitionOutcome {
    delivered: usize,
    skipped: usize,
    dropped: usize,
    failed: Option<Partition>,
}

pub struct BatchDispatcher {
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<AssignmentTracker>,
    handler: Arc<dyn DeliveryHandler>,
    scheduler: Arc<CommitScheduler>,
    config: DispatcherConfig,
}

impl BatchDispatcher {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        tracker: Arc<AssignmentTracker>,
        handler: Arc<dyn DeliveryHandler>,
        scheduler: Arc<CommitScheduler>,
        mut config: DispatcherConfig,
    ) -> Self {
        // a zero batch size would never poll, zero attempts would never deliver
        config.max_batch_size = config.max_batch_size.max(1);
        config.max_delivery_attempts = config.max_delivery_attempts.max(1);
        Self {
            broker,
            tracker,
            handler,
            scheduler,
            config,
        }
    }

    /// Pull records until the batch is full, `max_wait` elapses or a
    /// rebalance event arrives. Only unrecoverable broker errors are returned.
    pub async fn collect(&self) -> Result<PolledBatch, CheckpointError> {
        let start = Instant::now();
        let deadline = start + self.config.max_wait;
        let mut batch = PolledBatch {
            records: Vec::with_capacity(self.config.max_batch_size),
            rebalance: None,
        };

        while batch.records.len() < self.config.max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.broker.poll(remaining).await {
                Ok(Some(BrokerEvent::Record(record))) => batch.records.push(record),
                Ok(Some(event)) => {
                    batch.rebalance = Some(event);
                    break;
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(CheckpointError::FatalBrokerError(e)),
                Err(e) => debug!("Transient broker error while collecting: {e}"),
            }
        }

        metrics::histogram!(BATCH_COLLECTION_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);
        Ok(batch)
    }

    /// Deliver a round of records. Partitions run concurrently; within a
    /// partition records go out in order and a failure stops that partition.
    pub async fn dispatch(&self, records: Vec<Record>) -> DispatchReport {
        let mut by_partition: BTreeMap<Partition, Vec<Record>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.partition().clone())
                .or_default()
                .push(record);
        }

        let outcomes = join_all(
            by_partition
                .into_iter()
                .map(|(partition, records)| self.dispatch_partition(partition, records)),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            report.delivered += outcome.delivered;
            report.skipped += outcome.skipped;
            report.dropped += outcome.dropped;
            report.failed_partitions.extend(outcome.failed);
        }
        self.scheduler.records_delivered(report.delivered);
        report
    }

    async fn dispatch_partition(&self, partition: Partition, records: Vec<Record>) -> PartitionOutcome {
        let mut outcome = PartitionOutcome::default();

        let cursor = match self.tracker.cursor(&partition) {
            Some(cursor) if cursor.is_active() => cursor,
            _ => {
                debug!(
                    partition = %partition,
                    count = records.len(),
                    "Dropping records for partition that is not active"
                );
                metrics::counter!(RECORDS_DROPPED).increment(records.len() as u64);
                outcome.dropped = records.len();
                return outcome;
            }
        };
        let next_offset = cursor.next_offset();

        let first_offset = records
            .iter()
            .map(Record::offset)
            .filter(|offset| *offset >= next_offset)
            .min()
            .unwrap_or(next_offset);
        if !cursor.accepts_fetch_from(first_offset) {
            // the broker is fetching past records not yet delivered
            warn!(
                partition = %partition,
                first_offset = first_offset,
                next_offset = next_offset,
                "Fetch is ahead of the cursor, seeking back"
            );
            metrics::counter!(RECORDS_DROPPED).increment(records.len() as u64);
            outcome.dropped = records.len();
            match self.broker.seek(&partition, next_offset).await {
                Ok(()) => {
                    self.tracker.set_realignment(
                        &partition,
                        Realignment {
                            seek_target: next_offset,
                            first_seen: first_offset,
                        },
                    );
                }
                Err(source) => {
                    self.fail_partition(
                        &partition,
                        CheckpointError::SeekFailed {
                            partition: partition.clone(),
                            offset: next_offset,
                            source,
                        },
                    )
                    .await;
                    outcome.failed = Some(partition);
                }
            }
            return outcome;
        }

        // a fetch racing a seek can hand back records we already delivered
        let total = records.len();
        let fresh: Vec<Record> = records
            .into_iter()
            .filter(|record| record.offset() >= next_offset)
            .collect();
        outcome.skipped = total - fresh.len();
        if outcome.skipped > 0 {
            debug!(
                partition = %partition,
                skipped = outcome.skipped,
                next_offset = next_offset,
                "Skipped records behind the cursor"
            );
        }

        for chunk in fresh.chunks(self.config.max_batch_size) {
            let result = match self.config.trigger_shape {
                TriggerShape::Array => self.deliver_array(&partition, chunk).await,
                TriggerShape::Single => self.deliver_each(&partition, chunk).await,
            };
            match result {
                Ok(delivered) => outcome.delivered += delivered,
                Err((delivered, e)) => {
                    outcome.delivered += delivered;
                    self.fail_partition(&partition, e).await;
                    outcome.failed = Some(partition);
                    break;
                }
            }
        }
        outcome
    }

    async fn deliver_array(
        &self,
        partition: &Partition,
        chunk: &[Record],
    ) -> Result<usize, (usize, CheckpointError)> {
        let Some(last) = chunk.last() else {
            return Ok(0);
        };
        self.deliver_with_retry(partition, Delivery::Array(chunk))
            .await
            .map_err(|e| (0, e))?;
        self.tracker.advance(last);
        Ok(chunk.len())
    }

    async fn deliver_each(
        &self,
        partition: &Partition,
        chunk: &[Record],
    ) -> Result<usize, (usize, CheckpointError)> {
        for (delivered, record) in chunk.iter().enumerate() {
            self.deliver_with_retry(partition, Delivery::Single(record))
                .await
                .map_err(|e| (delivered, e))?;
            self.tracker.advance(record);
        }
        Ok(chunk.len())
    }

    async fn deliver_with_retry(
        &self,
        partition: &Partition,
        delivery: Delivery<'_>,
    ) -> Result<(), CheckpointError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = self.handler.handle(delivery).await;
            metrics::histogram!(DELIVERY_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

            let source = match result {
                Ok(()) => {
                    metrics::counter!(RECORDS_DELIVERED, "status" => "success")
                        .increment(delivery.len() as u64);
                    metrics::histogram!(DELIVERY_BATCH_SIZE).record(delivery.len() as f64);
                    return Ok(());
                }
                Err(source) => source,
            };

            metrics::counter!(RECORDS_DELIVERED, "status" => "failure")
                .increment(delivery.len() as u64);
            let failure = CheckpointError::TransientDeliveryFailure {
                partition: partition.clone(),
                attempt,
                source,
            };
            if attempt >= self.config.max_delivery_attempts {
                error!("{:#}", anyhow::Error::new(failure));
                return Err(CheckpointError::PartitionFailed {
                    partition: partition.clone(),
                    attempts: attempt,
                });
            }

            let backoff = self.config.backoff(attempt);
            warn!(
                backoff = ?backoff,
                "{:#}",
                anyhow::Error::new(failure)
            );
            metrics::counter!(DELIVERY_RETRIES).increment(1);
            sleep(backoff).await;
        }
    }

    async fn fail_partition(&self, partition: &Partition, e: CheckpointError) {
        error!(partition = %partition, "{:#}", anyhow::Error::new(e));
        metrics::counter!(PARTITIONS_FAILED).increment(1);
        self.tracker.set_state(partition, PartitionState::Failed);
        if let Err(pause_err) = self.broker.pause(std::slice::from_ref(partition)).await {
            warn!(partition = %partition, "Failed to pause failed partition: {pause_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::kafka::cursor::Cursor;
    use crate::kafka::memory_broker::{MemoryBroker, MemoryCluster};
    use crate::kafka::types::StartOffsetPolicy;
    use crate::test_utils::{FlakyHandler, RecordingHandler};
    use std::time::SystemTime;

    const TOPIC: &str = "dispatch-topic";

    fn record(partition: i32, offset: i64) -> Record {
        Record::new(
            Partition::new(TOPIC, partition),
            offset,
            None,
            format!("{partition}-{offset}").into_bytes(),
            SystemTime::now(),
        )
    }

    fn config(shape: TriggerShape) -> DispatcherConfig {
        DispatcherConfig {
            max_batch_size: 4,
            max_wait: Duration::from_millis(50),
            trigger_shape: shape,
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        broker: Arc<MemoryBroker>,
        tracker: Arc<AssignmentTracker>,
    }

    async fn fixture() -> Fixture {
        let cluster = MemoryCluster::new();
        cluster.create_topic(TOPIC, 2);
        let broker = Arc::new(cluster.consumer("dispatch-group", StartOffsetPolicy::Earliest));
        let tracker = Arc::new(AssignmentTracker::new());
        for num in 0..2 {
            tracker.insert(Cursor::from_checkpoint(Partition::new(TOPIC, num), 0));
        }
        Fixture {
            cluster,
            broker,
            tracker,
        }
    }

    fn dispatcher(
        fixture: &Fixture,
        handler: Arc<dyn DeliveryHandler>,
        config: DispatcherConfig,
    ) -> BatchDispatcher {
        let scheduler = Arc::new(CommitScheduler::new(
            fixture.tracker.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            fixture.broker.clone(),
            Duration::from_secs(1),
            0,
        ));
        BatchDispatcher::new(
            fixture.broker.clone(),
            fixture.tracker.clone(),
            handler,
            scheduler,
            config,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DispatcherConfig {
            retry_backoff: Duration::from_millis(100),
            ..config(TriggerShape::Array)
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(30), MAX_RETRY_BACKOFF);
    }

    #[tokio::test]
    async fn test_array_delivery_chunks_per_partition_in_order() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));

        let records = (0..6)
            .flat_map(|offset| [record(0, offset), record(1, offset)])
            .collect();
        let report = dispatcher.dispatch(records).await;

        assert_eq!(report.delivered, 12);
        // 6 records per partition, max 4 per delivery
        assert_eq!(handler.invocations(), 4);
        assert_eq!(
            handler.values_for(&Partition::new(TOPIC, 0)),
            (0..6).map(|o| format!("0-{o}")).collect::<Vec<_>>()
        );
        assert_eq!(fixture.tracker.next_offset(&Partition::new(TOPIC, 1)), Some(6));
    }

    #[tokio::test]
    async fn test_single_delivery_invokes_once_per_record() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Single));

        let report = dispatcher
            .dispatch(vec![record(0, 0), record(0, 1), record(0, 2)])
            .await;

        assert_eq!(report.delivered, 3);
        assert_eq!(handler.invocations(), 3);
        assert_eq!(fixture.tracker.next_offset(&Partition::new(TOPIC, 0)), Some(3));
    }

    #[tokio::test]
    async fn test_stale_and_unowned_records_are_not_delivered() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));
        fixture.tracker.advance(&record(0, 0));
        fixture.tracker.fence(&[Partition::new(TOPIC, 1)]);

        let report = dispatcher
            .dispatch(vec![
                record(0, 0),
                record(0, 1),
                record(1, 0),
                record(5, 0),
            ])
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(handler.values(), vec!["0-1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_without_advancing() {
        let fixture = fixture().await;
        let handler = Arc::new(FlakyHandler::failing_first(2));
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));

        let report = dispatcher.dispatch(vec![record(0, 0), record(0, 1)]).await;

        assert_eq!(report.delivered, 2);
        assert!(report.failed_partitions.is_empty());
        assert_eq!(handler.attempts(), 3);
        assert_eq!(fixture.tracker.next_offset(&Partition::new(TOPIC, 0)), Some(2));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_only_that_partition() {
        let fixture = fixture().await;
        fixture.broker.subscribe(TOPIC).await.unwrap();
        let handler = Arc::new(FlakyHandler::failing_partition(Partition::new(TOPIC, 0)));
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Single));

        let report = dispatcher
            .dispatch(vec![record(0, 0), record(0, 1), record(1, 0)])
            .await;

        assert_eq!(report.failed_partitions, vec![Partition::new(TOPIC, 0)]);
        assert_eq!(report.delivered, 1);
        assert_eq!(
            fixture.tracker.state(&Partition::new(TOPIC, 0)),
            Some(PartitionState::Failed)
        );
        assert_eq!(fixture.tracker.next_offset(&Partition::new(TOPIC, 0)), Some(0));
        assert_eq!(fixture.tracker.next_offset(&Partition::new(TOPIC, 1)), Some(1));

        // nothing more is delivered for a failed partition
        let report = dispatcher.dispatch(vec![record(0, 0)]).await;
        assert_eq!(report.dropped, 1);
    }

    async fn take_assignment(fixture: &Fixture, dispatcher: &BatchDispatcher) -> Vec<Partition> {
        fixture.broker.subscribe(TOPIC).await.unwrap();
        match dispatcher.collect().await.unwrap().rebalance {
            Some(BrokerEvent::Assigned(partitions)) => partitions,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_ahead_of_cursor_seeks_back_before_delivering() {
        let fixture = fixture().await;
        for i in 0..4 {
            fixture.cluster.produce(TOPIC, 0, None, format!("0-{i}")).unwrap();
        }
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));
        let partition = Partition::new(TOPIC, 0);

        let assigned = take_assignment(&fixture, &dispatcher).await;
        fixture.broker.resume(&assigned).await.unwrap();
        // broker position drifts past records the cursor has not delivered
        fixture.broker.seek(&partition, 2).await.unwrap();

        let batch = dispatcher.collect().await.unwrap();
        assert_eq!(batch.records.first().map(Record::offset), Some(2));
        let report = dispatcher.dispatch(batch.records).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, 2);
        assert!(report.failed_partitions.is_empty());
        assert!(handler.is_empty());

        let batch = dispatcher.collect().await.unwrap();
        let report = dispatcher.dispatch(batch.records).await;
        assert_eq!(report.delivered, 4);
        assert_eq!(
            handler.values_for(&partition),
            (0..4).map(|o| format!("0-{o}")).collect::<Vec<_>>()
        );
        assert_eq!(fixture.tracker.next_offset(&partition), Some(4));
    }

    #[tokio::test]
    async fn test_gap_confirmed_after_seek_back_is_delivered() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Single));
        let partition = Partition::new(TOPIC, 0);
        take_assignment(&fixture, &dispatcher).await;

        // offsets 0..3 compacted away: the refetch starts at 3 again
        let report = dispatcher.dispatch(vec![record(0, 3), record(0, 4)]).await;
        assert_eq!(report.dropped, 2);
        assert_eq!(fixture.tracker.next_offset(&partition), Some(0));

        let report = dispatcher.dispatch(vec![record(0, 3), record(0, 4)]).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(handler.values(), vec!["0-3".to_string(), "0-4".to_string()]);
        assert_eq!(fixture.tracker.next_offset(&partition), Some(5));
    }

    #[tokio::test]
    async fn test_stale_records_do_not_hide_a_fetch_ahead() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));
        let partition = Partition::new(TOPIC, 0);
        take_assignment(&fixture, &dispatcher).await;
        fixture.tracker.advance(&record(0, 1));

        let report = dispatcher.dispatch(vec![record(0, 0), record(0, 5)]).await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, 2);
        assert!(handler.is_empty());
        assert_eq!(fixture.tracker.next_offset(&partition), Some(2));
    }

    #[tokio::test]
    async fn test_fetch_ahead_fails_partition_when_seek_back_fails() {
        let fixture = fixture().await;
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler.clone(), config(TriggerShape::Array));

        // never subscribed, so the broker owns nothing to seek
        let report = dispatcher.dispatch(vec![record(1, 3), record(0, 0)]).await;

        assert_eq!(report.failed_partitions, vec![Partition::new(TOPIC, 1)]);
        assert_eq!(report.delivered, 1);
        assert_eq!(
            fixture.tracker.state(&Partition::new(TOPIC, 1)),
            Some(PartitionState::Failed)
        );
        assert_eq!(handler.values(), vec!["0-0".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_batch_size_still_collects() {
        let fixture = fixture().await;
        fixture.cluster.produce(TOPIC, 0, None, "a").unwrap();
        fixture.cluster.produce(TOPIC, 0, None, "b").unwrap();
        let handler = Arc::new(RecordingHandler::new());
        let config = DispatcherConfig {
            max_batch_size: 0,
            max_delivery_attempts: 0,
            ..config(TriggerShape::Array)
        };
        let dispatcher = dispatcher(&fixture, handler.clone(), config);

        let assigned = take_assignment(&fixture, &dispatcher).await;
        fixture.broker.resume(&assigned).await.unwrap();

        let batch = dispatcher.collect().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        let report = dispatcher.dispatch(batch.records).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(handler.invocations(), 1);
    }

    #[tokio::test]
    async fn test_collect_stops_at_rebalance_event() {
        let fixture = fixture().await;
        fixture.cluster.produce(TOPIC, 0, None, "a").unwrap();
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = dispatcher(&fixture, handler, config(TriggerShape::Array));

        fixture.broker.subscribe(TOPIC).await.unwrap();
        let batch = dispatcher.collect().await.unwrap();

        // the assignment arrives before any record can be fetched
        assert!(batch.records.is_empty());
        let assigned = match batch.rebalance {
            Some(BrokerEvent::Assigned(partitions)) => partitions,
            other => panic!("expected assignment, got {other:?}"),
        };
        fixture.broker.resume(&assigned).await.unwrap();

        let batch = dispatcher.collect().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.rebalance.is_none());
    }
}
