//! Rebalance Coordinator - reacts to group membership changes.
//!
//! Revoke: fence the partitions so nothing more is dispatched, flush them
//! (bounded by the revoke flush timeout), release their cursors, then ack the
//! broker client. Assign: seed a cursor per partition from the checkpoint
//! store, falling back to the group's committed offset and then the start
//! policy, seek the broker to it and resume fetching.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{BrokerError, CheckpointError};
use crate::kafka::assignment::AssignmentTracker;
use crate::kafka::broker::{BrokerClient, BrokerEvent, RevokeAck};
use crate::kafka::commit_scheduler::{CommitScheduler, FlushTrigger};
use crate::kafka::cursor::Cursor;
use crate::kafka::types::{Partition, PartitionState, StartOffsetPolicy};
use crate::metrics_consts::{
    ASSIGNMENT_SEED_SOURCE, PARTITIONS_FAILED, REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS,
    REBALANCE_FLUSH_TIMEOUTS,
};

const SEED_ATTEMPTS: u32 = 3;
const SEED_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Unassigned,
    Assigning,
    Active,
    Revoking,
}

/// Where a newly assigned partition's start offset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    CheckpointStore,
    BrokerCommitted,
    StartPolicy,
}

impl SeedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedSource::CheckpointStore => "checkpoint_store",
            SeedSource::BrokerCommitted => "broker_committed",
            SeedSource::StartPolicy => "start_policy",
        }
    }
}

fn format_partitions(partitions: &[Partition]) -> String {
    partitions
        .iter()
        .map(Partition::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct RebalanceCoordinator {
    tracker: Arc<AssignmentTracker>,
    store: Arc<dyn CheckpointStore>,
    broker: Arc<dyn BrokerClient>,
    scheduler: Arc<CommitScheduler>,
    start_policy: StartOffsetPolicy,
    revoke_flush_timeout: Duration,
    state: Mutex<CoordinatorState>,
}

impl RebalanceCoordinator {
    pub fn new(
        tracker: Arc<AssignmentTracker>,
        store: Arc<dyn CheckpointStore>,
        broker: Arc<dyn BrokerClient>,
        scheduler: Arc<CommitScheduler>,
        start_policy: StartOffsetPolicy,
        revoke_flush_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            store,
            broker,
            scheduler,
            start_policy,
            revoke_flush_timeout,
            state: Mutex::new(CoordinatorState::Unassigned),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().unwrap_or_else(|poison| poison.into_inner()) = state;
    }

    fn settle(&self) {
        self.set_state(if self.tracker.is_empty() {
            CoordinatorState::Unassigned
        } else {
            CoordinatorState::Active
        });
    }

    pub async fn handle_event(&self, event: BrokerEvent) -> Result<(), CheckpointError> {
        match event {
            BrokerEvent::Assigned(partitions) => self.on_assigned(partitions).await,
            BrokerEvent::Revoked { partitions, ack } => {
                self.on_revoked(partitions, ack).await;
                Ok(())
            }
            BrokerEvent::Record(record) => {
                debug!(
                    partition = %record.partition(),
                    offset = record.offset(),
                    "Ignoring record handed to the rebalance coordinator"
                );
                Ok(())
            }
        }
    }

    /// Take ownership of `partitions`. A partition the broker cannot be sought
    /// to is marked failed and left paused. Fails if a start offset cannot be
    /// determined for some partition after retries, or the broker is gone.
    pub async fn on_assigned(&self, partitions: Vec<Partition>) -> Result<(), CheckpointError> {
        if partitions.is_empty() {
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            return Ok(());
        }
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
        self.set_state(CoordinatorState::Assigning);

        let seeds = join_all(partitions.iter().map(|partition| self.seed_cursor(partition))).await;

        let mut assigned = Vec::with_capacity(partitions.len());
        let mut first_error = None;
        for (partition, seed) in partitions.iter().zip(seeds) {
            match seed {
                Ok((cursor, source)) => {
                    metrics::counter!(ASSIGNMENT_SEED_SOURCE, "source" => source.as_str())
                        .increment(1);
                    let next_offset = cursor.next_offset();
                    if !self.tracker.insert(cursor) {
                        continue;
                    }
                    if let Err(e) = self.seek_with_retry(partition, next_offset).await {
                        // not resumed: the fetch position is unknown
                        self.tracker.set_state(partition, PartitionState::Failed);
                        metrics::counter!(PARTITIONS_FAILED).increment(1);
                        if e.is_fatal() {
                            first_error.get_or_insert(e);
                        } else {
                            let failure = CheckpointError::SeekFailed {
                                partition: partition.clone(),
                                offset: next_offset,
                                source: e,
                            };
                            error!("{:#}", anyhow::Error::new(failure));
                        }
                        continue;
                    }
                    debug!(
                        partition = %partition,
                        next_offset = next_offset,
                        source = source.as_str(),
                        "Seeded cursor"
                    );
                    assigned.push(partition.clone());
                }
                Err(e) => {
                    error!(partition = %partition, "Could not determine start offset: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.broker.resume(&assigned).await {
            warn!("Failed to resume assigned partitions: {e}");
        }
        info!("Assigned partitions: {}", format_partitions(&assigned));
        self.settle();

        match first_error {
            Some(e) => Err(CheckpointError::FatalBrokerError(e)),
            None => Ok(()),
        }
    }

    /// Flush and release `partitions`, then acknowledge the revoke. The flush
    /// is bounded; on timeout the partitions are released anyway and their
    /// checkpoints may lag.
    pub async fn on_revoked(&self, partitions: Vec<Partition>, ack: RevokeAck) {
        if partitions.is_empty() {
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke").increment(1);
            ack.acknowledge();
            return;
        }
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
        self.set_state(CoordinatorState::Revoking);

        let fenced = self.tracker.fence(&partitions);
        match tokio::time::timeout(
            self.revoke_flush_timeout,
            self.scheduler.flush(Some(&partitions), FlushTrigger::Revoke),
        )
        .await
        {
            Ok(report) if report.is_clean() => {
                debug!(committed = report.committed.len(), "Flushed revoked partitions");
            }
            Ok(report) => warn!(
                failed = report.failures.len(),
                "Revoked partitions released with uncommitted progress"
            ),
            Err(_) => {
                let e = CheckpointError::RebalanceFlushTimeout {
                    partitions: fenced,
                    timeout: self.revoke_flush_timeout,
                };
                error!("{e}");
                metrics::counter!(REBALANCE_FLUSH_TIMEOUTS).increment(1);
            }
        }

        for cursor in self.tracker.remove(&partitions) {
            debug!(
                partition = %cursor.partition(),
                next_offset = cursor.next_offset(),
                last_committed_offset = ?cursor.last_committed_offset(),
                "Released cursor"
            );
        }
        ack.acknowledge();
        info!("Revoked partitions: {}", format_partitions(&partitions));
        self.settle();
    }

    async fn seek_with_retry(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        let mut attempt = 1;
        loop {
            match self.broker.seek(partition, offset).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() || attempt >= SEED_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(partition = %partition, offset = offset, attempt = attempt, "Seek failed: {e}");
                    sleep(SEED_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn seed_cursor(&self, partition: &Partition) -> Result<(Cursor, SeedSource), BrokerError> {
        match self.store.read(partition).await {
            Ok(Some(offset)) => {
                return Ok((
                    Cursor::from_checkpoint(partition.clone(), offset),
                    SeedSource::CheckpointStore,
                ))
            }
            Ok(None) => {}
            Err(e) => warn!(
                partition = %partition,
                "Checkpoint store read failed, falling back to the group offset: {:#}",
                anyhow::Error::new(e)
            ),
        }

        let mut attempt = 1;
        loop {
            match self.seed_from_broker(partition).await {
                Ok(seed) => return Ok(seed),
                Err(e) if e.is_fatal() || attempt >= SEED_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(partition = %partition, attempt = attempt, "Seeding from broker failed: {e}");
                    sleep(SEED_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn seed_from_broker(
        &self,
        partition: &Partition,
    ) -> Result<(Cursor, SeedSource), BrokerError> {
        if let Some(offset) = self.broker.committed(partition).await? {
            return Ok((
                Cursor::from_checkpoint(partition.clone(), offset),
                SeedSource::BrokerCommitted,
            ));
        }

        let (low, high) = self.broker.fetch_watermarks(partition).await?;
        let start = match self.start_policy {
            StartOffsetPolicy::Earliest => low,
            StartOffsetPolicy::Latest => high,
        };
        Ok((
            Cursor::from_start_offset(partition.clone(), start),
            SeedSource::StartPolicy,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::kafka::memory_broker::{MemoryBroker, MemoryCluster};
    use crate::kafka::message::Record;
    use crate::kafka::types::PartitionOffset;
    use crate::test_utils::{SeekFailingBroker, StallingCheckpointStore};
    use std::ops::Range;
    use std::time::SystemTime;

    const TOPIC: &str = "rebalance-topic";
    const GROUP: &str = "rebalance-group";

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        broker: Arc<MemoryBroker>,
        store: Arc<MemoryCheckpointStore>,
        tracker: Arc<AssignmentTracker>,
        coordinator: RebalanceCoordinator,
    }

    async fn fixture(policy: StartOffsetPolicy) -> Fixture {
        let cluster = MemoryCluster::new();
        cluster.create_topic(TOPIC, 3);
        for n in 0..3 {
            for i in 0..5 {
                cluster.produce(TOPIC, n, None, format!("{n}-{i}")).unwrap();
            }
        }
        let broker = Arc::new(cluster.consumer(GROUP, policy));
        let store = Arc::new(MemoryCheckpointStore::new());
        let tracker = Arc::new(AssignmentTracker::new());
        let scheduler = Arc::new(CommitScheduler::new(
            tracker.clone(),
            store.clone(),
            broker.clone(),
            Duration::from_secs(1),
            0,
        ));
        let coordinator = RebalanceCoordinator::new(
            tracker.clone(),
            store.clone(),
            broker.clone(),
            scheduler,
            policy,
            Duration::from_secs(1),
        );

        // join the group and take the broker-side assignment out of the queue
        broker.subscribe(TOPIC).await.unwrap();
        let event = broker.poll(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(event, Some(BrokerEvent::Assigned(_))));

        Fixture {
            cluster,
            broker,
            store,
            tracker,
            coordinator,
        }
    }

    /// A second coordinator over the fixture's tracker, talking to other
    /// broker and store implementations
    fn coordinator_with(
        fixture: &Fixture,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn CheckpointStore>,
        revoke_flush_timeout: Duration,
    ) -> RebalanceCoordinator {
        let scheduler = Arc::new(CommitScheduler::new(
            fixture.tracker.clone(),
            store.clone(),
            broker.clone(),
            Duration::from_secs(1),
            0,
        ));
        RebalanceCoordinator::new(
            fixture.tracker.clone(),
            store,
            broker,
            scheduler,
            StartOffsetPolicy::Earliest,
            revoke_flush_timeout,
        )
    }

    fn delivered(tracker: &AssignmentTracker, partition: &Partition, offsets: Range<i64>) {
        for offset in offsets {
            tracker.advance(&Record::new(
                partition.clone(),
                offset,
                None,
                b"v".to_vec(),
                SystemTime::now(),
            ));
        }
    }

    fn partitions() -> Vec<Partition> {
        (0..3).map(|n| Partition::new(TOPIC, n)).collect()
    }

    #[tokio::test]
    async fn test_assign_seeds_from_store_then_broker_then_policy() {
        let fixture = fixture(StartOffsetPolicy::Latest).await;
        fixture.store.persist(&Partition::new(TOPIC, 0), 3).await.unwrap();
        fixture
            .broker
            .commit(&[PartitionOffset::new(Partition::new(TOPIC, 1), 2)])
            .await
            .unwrap();

        fixture.coordinator.on_assigned(partitions()).await.unwrap();

        assert_eq!(fixture.coordinator.state(), CoordinatorState::Active);
        let p0 = fixture.tracker.cursor(&Partition::new(TOPIC, 0)).unwrap();
        assert_eq!((p0.next_offset(), p0.last_committed_offset()), (3, Some(3)));
        let p1 = fixture.tracker.cursor(&Partition::new(TOPIC, 1)).unwrap();
        assert_eq!((p1.next_offset(), p1.last_committed_offset()), (2, Some(2)));
        let p2 = fixture.tracker.cursor(&Partition::new(TOPIC, 2)).unwrap();
        assert_eq!((p2.next_offset(), p2.last_committed_offset()), (5, None));
    }

    #[tokio::test]
    async fn test_assign_seeks_broker_to_checkpoint() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        let partition = Partition::new(TOPIC, 0);
        fixture.store.persist(&partition, 4).await.unwrap();

        fixture
            .coordinator
            .on_assigned(vec![partition.clone()])
            .await
            .unwrap();

        let event = fixture.broker.poll(Duration::from_secs(5)).await.unwrap();
        match event {
            Some(BrokerEvent::Record(record)) => {
                assert_eq!(record.partition(), &partition);
                assert_eq!(record.offset(), 4);
            }
            other => panic!("expected record at the checkpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revoke_flushes_before_release_and_acks() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        fixture.coordinator.on_assigned(partitions()).await.unwrap();
        let partition = Partition::new(TOPIC, 1);
        delivered(&fixture.tracker, &partition, 0..3);
        let next_at_revoke = fixture.tracker.next_offset(&partition).unwrap();

        let (ack, ack_rx) = RevokeAck::new();
        fixture
            .coordinator
            .on_revoked(vec![partition.clone()], ack)
            .await;

        assert!(ack_rx.await.is_ok());
        assert_eq!(
            fixture.store.read(&partition).await.unwrap(),
            Some(next_at_revoke)
        );
        assert_eq!(
            fixture.cluster.committed_offset(GROUP, &partition),
            Some(next_at_revoke)
        );
        assert!(fixture.tracker.cursor(&partition).is_none());
        assert_eq!(fixture.tracker.len(), 2);
        assert_eq!(fixture.coordinator.state(), CoordinatorState::Active);
    }

    #[tokio::test]
    async fn test_revoke_releases_failed_partition() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        fixture.coordinator.on_assigned(partitions()).await.unwrap();
        fixture
            .tracker
            .set_state(&Partition::new(TOPIC, 2), PartitionState::Failed);

        let (ack, ack_rx) = RevokeAck::new();
        fixture.coordinator.on_revoked(partitions(), ack).await;

        assert!(ack_rx.await.is_ok());
        assert!(fixture.tracker.is_empty());
        assert_eq!(fixture.coordinator.state(), CoordinatorState::Unassigned);
    }

    #[tokio::test]
    async fn test_revoke_proceeds_when_flush_cannot_commit() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        fixture.coordinator.on_assigned(partitions()).await.unwrap();
        let partition = Partition::new(TOPIC, 0);
        delivered(&fixture.tracker, &partition, 0..1);
        fixture.store.set_unavailable(true);

        let (ack, ack_rx) = RevokeAck::new();
        fixture
            .coordinator
            .on_revoked(vec![partition.clone()], ack)
            .await;

        assert!(ack_rx.await.is_ok());
        assert!(fixture.tracker.cursor(&partition).is_none());
        assert_eq!(fixture.cluster.committed_offset(GROUP, &partition), None);
    }

    #[tokio::test]
    async fn test_empty_rebalance_events_are_skipped() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;

        fixture.coordinator.on_assigned(vec![]).await.unwrap();
        assert_eq!(fixture.coordinator.state(), CoordinatorState::Unassigned);

        let (ack, ack_rx) = RevokeAck::new();
        fixture.coordinator.on_revoked(vec![], ack).await;
        assert!(ack_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_partition_fails_assignment() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;

        let result = fixture
            .coordinator
            .on_assigned(vec![Partition::new(TOPIC, 0), Partition::new("missing", 0)])
            .await;

        assert!(matches!(result, Err(CheckpointError::FatalBrokerError(_))));
        // the partitions that could be seeded are still owned
        assert_eq!(fixture.tracker.owned_partitions(), vec![Partition::new(TOPIC, 0)]);
    }

    #[tokio::test]
    async fn test_seek_failure_leaves_partition_paused_and_failed() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        let partition = Partition::new(TOPIC, 0);
        fixture.store.persist(&partition, 2).await.unwrap();
        let broker = Arc::new(SeekFailingBroker::always_failing(fixture.broker.clone()));
        let coordinator = coordinator_with(
            &fixture,
            broker.clone(),
            fixture.store.clone(),
            Duration::from_secs(1),
        );

        coordinator.on_assigned(vec![partition.clone()]).await.unwrap();

        assert_eq!(broker.seek_calls(), SEED_ATTEMPTS as usize);
        assert_eq!(fixture.tracker.state(&partition), Some(PartitionState::Failed));
        assert_eq!(fixture.tracker.next_offset(&partition), Some(2));
        // never resumed, so nothing is fetched from the wrong position
        let event = fixture.broker.poll(Duration::from_millis(100)).await.unwrap();
        assert!(event.is_none(), "unexpected event {event:?}");
        assert_eq!(fixture.store.read(&partition).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_seek_is_retried_until_it_lands() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        let partition = Partition::new(TOPIC, 0);
        fixture.store.persist(&partition, 4).await.unwrap();
        let broker = Arc::new(SeekFailingBroker::failing_first(fixture.broker.clone(), 2));
        let coordinator = coordinator_with(
            &fixture,
            broker.clone(),
            fixture.store.clone(),
            Duration::from_secs(1),
        );

        coordinator.on_assigned(vec![partition.clone()]).await.unwrap();

        assert_eq!(broker.seek_calls(), 3);
        assert_eq!(fixture.tracker.state(&partition), Some(PartitionState::Active));
        match fixture.broker.poll(Duration::from_secs(5)).await.unwrap() {
            Some(BrokerEvent::Record(record)) => assert_eq!(record.offset(), 4),
            other => panic!("expected record at the checkpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revoke_flush_timeout_still_releases_and_acks() {
        let fixture = fixture(StartOffsetPolicy::Earliest).await;
        let store = Arc::new(StallingCheckpointStore::new());
        let coordinator = coordinator_with(
            &fixture,
            fixture.broker.clone(),
            store.clone(),
            Duration::from_millis(100),
        );
        coordinator.on_assigned(partitions()).await.unwrap();
        let partition = Partition::new(TOPIC, 1);
        delivered(&fixture.tracker, &partition, 0..3);

        let (ack, ack_rx) = RevokeAck::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            coordinator.on_revoked(vec![partition.clone()], ack),
        )
        .await
        .expect("revoke was not bounded by the flush timeout");

        assert!(ack_rx.await.is_ok());
        assert_eq!(store.persist_calls(), 1);
        assert!(fixture.tracker.cursor(&partition).is_none());
        // the checkpoint lags: nothing reached the group either
        assert_eq!(fixture.cluster.committed_offset(GROUP, &partition), None);
        assert_eq!(coordinator.state(), CoordinatorState::Active);
    }
}
