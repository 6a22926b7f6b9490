use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::CheckpointError;
use crate::handler::{DeliveryHandler, TriggerShape};
use crate::kafka::assignment::AssignmentTracker;
use crate::kafka::broker::BrokerClient;
use crate::kafka::commit_scheduler::{CommitScheduler, FlushTrigger};
use crate::kafka::dispatcher::{BatchDispatcher, DispatcherConfig};
use crate::kafka::rebalance_coordinator::RebalanceCoordinator;
use crate::kafka::types::StartOffsetPolicy;

/// Runtime settings of one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub topic: String,
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub commit_interval: Duration,
    /// Request a flush after this many delivered records; 0 disables
    pub commit_every_records: usize,
    pub trigger_shape: TriggerShape,
    pub max_delivery_attempts: u32,
    pub retry_backoff: Duration,
    pub revoke_flush_timeout: Duration,
    pub shutdown_flush_timeout: Duration,
    pub start_offset_policy: StartOffsetPolicy,
}

impl EngineConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            max_batch_size: 64,
            max_wait: Duration::from_millis(500),
            commit_interval: Duration::from_secs(1),
            commit_every_records: 0,
            trigger_shape: TriggerShape::Array,
            max_delivery_attempts: 5,
            retry_backoff: Duration::from_millis(100),
            revoke_flush_timeout: Duration::from_secs(10),
            shutdown_flush_timeout: Duration::from_secs(5),
            start_offset_policy: StartOffsetPolicy::Earliest,
        }
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_batch_size: self.max_batch_size,
            max_wait: self.max_wait,
            trigger_shape: self.trigger_shape,
            max_delivery_attempts: self.max_delivery_attempts,
            retry_backoff: self.retry_backoff,
        }
    }
}

/// The checkpoint engine for one consumer-group member: pulls records,
/// delivers them, commits progress and follows rebalances.
pub struct CheckpointConsumer {
    config: EngineConfig,
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<AssignmentTracker>,
    scheduler: Arc<CommitScheduler>,
    dispatcher: BatchDispatcher,
    coordinator: RebalanceCoordinator,
}

impl CheckpointConsumer {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn CheckpointStore>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let tracker = Arc::new(AssignmentTracker::new());
        let scheduler = Arc::new(CommitScheduler::new(
            tracker.clone(),
            store.clone(),
            broker.clone(),
            config.commit_interval,
            config.commit_every_records,
        ));
        let dispatcher = BatchDispatcher::new(
            broker.clone(),
            tracker.clone(),
            handler,
            scheduler.clone(),
            config.dispatcher_config(),
        );
        let coordinator = RebalanceCoordinator::new(
            tracker.clone(),
            store,
            broker.clone(),
            scheduler.clone(),
            config.start_offset_policy,
            config.revoke_flush_timeout,
        );

        Self {
            config,
            broker,
            tracker,
            scheduler,
            dispatcher,
            coordinator,
        }
    }

    pub fn tracker(&self) -> &Arc<AssignmentTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &RebalanceCoordinator {
        &self.coordinator
    }

    /// Consume until `shutdown` is cancelled or the broker fails for good.
    ///
    /// On the way out: stop pulling, stop the periodic commits, run one final
    /// flush bounded by `shutdown_flush_timeout`, then close the broker
    /// client. The final flush also runs when a fatal broker error ends the
    /// loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), CheckpointError> {
        self.broker
            .subscribe(&self.config.topic)
            .await
            .map_err(CheckpointError::FatalBrokerError)?;
        info!(
            topic = self.config.topic.as_str(),
            shape = %self.config.trigger_shape,
            max_batch_size = self.config.max_batch_size,
            "Starting checkpoint consumer"
        );

        let scheduler_shutdown = CancellationToken::new();
        let scheduler_handle =
            tokio::spawn(self.scheduler.clone().run(scheduler_shutdown.clone()));

        let result = self.consume(&shutdown).await;
        if let Err(e) = &result {
            error!(error = ?e, "Consumer loop stopped");
        }

        scheduler_shutdown.cancel();
        if let Err(e) = scheduler_handle.await {
            error!("Commit scheduler task failed: {e}");
        }

        match tokio::time::timeout(
            self.config.shutdown_flush_timeout,
            self.scheduler.flush(None, FlushTrigger::Shutdown),
        )
        .await
        {
            Ok(report) if report.is_clean() => {
                info!(committed = report.committed.len(), "Final flush complete");
            }
            Ok(report) => warn!(
                failed = report.failures.len(),
                "Final flush left uncommitted progress"
            ),
            Err(_) => warn!(
                timeout = ?self.config.shutdown_flush_timeout,
                "Final flush timed out, checkpoints may lag"
            ),
        }

        if let Err(e) = self.broker.close().await {
            warn!("Failed to close broker client: {e}");
        }
        info!("Checkpoint consumer stopped");
        result
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<(), CheckpointError> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping consumption");
                    return Ok(());
                }
                batch = self.dispatcher.collect() => batch?,
            };

            if !batch.records.is_empty() {
                self.dispatcher.dispatch(batch.records).await;
            }
            if let Some(event) = batch.rebalance {
                self.coordinator.handle_event(event).await?;
            }
        }
    }
}
