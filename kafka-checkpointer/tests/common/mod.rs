#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kafka_checkpointer::checkpoint::CheckpointStore;
use kafka_checkpointer::error::CheckpointError;
use kafka_checkpointer::handler::TriggerShape;
use kafka_checkpointer::kafka::{CheckpointConsumer, EngineConfig, MemoryCluster};
use kafka_checkpointer::kafka::types::StartOffsetPolicy;
use kafka_checkpointer::test_utils::{await_condition, RecordingHandler};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "checkpoint-events";
pub const GROUP: &str = "checkpoint-group";

pub fn engine_config(shape: TriggerShape) -> EngineConfig {
    EngineConfig {
        max_batch_size: 16,
        max_wait: Duration::from_millis(20),
        commit_interval: Duration::from_millis(50),
        trigger_shape: shape,
        retry_backoff: Duration::from_millis(5),
        revoke_flush_timeout: Duration::from_secs(2),
        shutdown_flush_timeout: Duration::from_secs(2),
        ..EngineConfig::new(TOPIC)
    }
}

/// Produce `count` records named `<prefix>-<i>`, spread round-robin over
/// `partitions`
pub fn produce_round_robin(cluster: &MemoryCluster, prefix: &str, count: usize, partitions: i32) {
    for (i, partition) in (0..count).zip((0..partitions).cycle()) {
        cluster
            .produce(TOPIC, partition, None, format!("{prefix}-{i}"))
            .unwrap();
    }
}

/// One engine instance running on its own task
pub struct RunningInstance {
    pub consumer: Arc<CheckpointConsumer>,
    pub handler: Arc<RecordingHandler>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), CheckpointError>>,
}

impl RunningInstance {
    pub fn start(
        cluster: &Arc<MemoryCluster>,
        group: &str,
        store: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        let handler = Arc::new(RecordingHandler::new());
        let consumer = Arc::new(CheckpointConsumer::new(
            config,
            Arc::new(cluster.consumer(group, StartOffsetPolicy::Earliest)),
            store,
            handler.clone(),
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        });

        Self {
            consumer,
            handler,
            shutdown,
            handle,
        }
    }

    /// Wait until the instance owns `count` partitions
    pub async fn wait_for_partitions(&self, count: usize) -> bool {
        await_condition(Duration::from_secs(5), || {
            let consumer = self.consumer.clone();
            async move { consumer.tracker().len() == count }
        })
        .await
    }

    /// Wait until the handler has seen at least `count` records
    pub async fn wait_for_deliveries(&self, count: usize) -> bool {
        await_condition(Duration::from_secs(10), || {
            let handler = self.handler.clone();
            async move { handler.len() >= count }
        })
        .await
    }

    pub async fn stop(self) -> Result<(), CheckpointError> {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}
