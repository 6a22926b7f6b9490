use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    checkpoint::LocalCheckpointStore,
    config::Config,
    handler::{DeliveryHandler, LoggingHandler},
    kafka::{CheckpointConsumer, KafkaBroker},
};

/// How much longer the librdkafka rebalance callback waits for the engine's
/// acknowledgement than the engine itself spends on the revoke flush
const REVOKE_ACK_GRACE: Duration = Duration::from_secs(5);

/// Extra time given to the consumer task after its final flush deadline
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The checkpointer service: one engine instance wired to Kafka and a local
/// checkpoint directory
pub struct CheckpointService {
    config: Config,
    handler: Arc<dyn DeliveryHandler>,
}

impl CheckpointService {
    /// Create a new service that logs every delivery
    pub fn new(config: Config) -> Result<Self> {
        Self::with_handler(config, Arc::new(LoggingHandler))
    }

    /// Create a service with a custom delivery handler
    pub fn with_handler(config: Config, handler: Arc<dyn DeliveryHandler>) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        Ok(Self { config, handler })
    }

    fn build_consumer(&self) -> Result<CheckpointConsumer> {
        let engine_config = self.config.to_engine_config()?;
        let client_config = self.config.build_consumer_config()?;

        let broker = KafkaBroker::new(
            &client_config,
            self.config.revoke_flush_timeout() + REVOKE_ACK_GRACE,
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;
        let store = LocalCheckpointStore::new(self.config.checkpoint_dir_buf());

        info!(
            "Initialized consumer for topic '{}', checkpoints in '{}'",
            self.config.kafka_consumer_topic, self.config.checkpoint_dir
        );

        Ok(CheckpointConsumer::new(
            engine_config,
            Arc::new(broker),
            Arc::new(store),
            self.handler.clone(),
        ))
    }

    /// Run the service until ctrl+c
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
            }
        })
        .await
    }

    /// Run the service until `shutdown_signal` resolves or the consumer stops
    /// on its own
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        let consumer = Arc::new(self.build_consumer()?);
        let shutdown = CancellationToken::new();

        info!("Starting Kafka checkpointer service");

        let mut consumer_handle = tokio::spawn({
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        });

        let finished = tokio::select! {
            _ = shutdown_signal => {
                info!("Received shutdown signal, shutting down gracefully...");
                None
            }
            result = &mut consumer_handle => Some(result),
        };

        let result = match finished {
            Some(result) => result,
            None => {
                shutdown.cancel();
                let deadline = self.config.to_engine_config()?.shutdown_flush_timeout
                    + SHUTDOWN_GRACE;
                match tokio::time::timeout(deadline, consumer_handle).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!("Consumer shutdown timed out after {deadline:?}");
                        return Ok(());
                    }
                }
            }
        };

        match result {
            Ok(Ok(())) => info!("Consumer stopped normally"),
            Ok(Err(e)) => {
                return Err(anyhow::Error::new(e).context("Consumer stopped with error"));
            }
            Err(e) => error!("Consumer task panicked: {e:#}"),
        }

        info!("Kafka checkpointer service stopped");
        Ok(())
    }
}
