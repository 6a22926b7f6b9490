use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::handler::TriggerShape;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::consumer::EngineConfig;
use crate::kafka::types::StartOffsetPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "kafka-checkpointer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Dispatch configuration
    #[envconfig(default = "64")]
    pub max_batch_size: usize,

    #[envconfig(default = "500")]
    pub max_wait_ms: u64,

    #[envconfig(default = "array")]
    pub trigger_shape: String,

    #[envconfig(default = "5")]
    pub max_delivery_attempts: u32,

    #[envconfig(default = "100")]
    pub retry_backoff_ms: u64,

    // Commit configuration
    #[envconfig(default = "1000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "0")] // disabled
    pub commit_every_records: usize,

    #[envconfig(default = "10000")]
    pub revoke_flush_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub shutdown_flush_timeout_ms: u64,

    #[envconfig(default = "./checkpoints")]
    pub checkpoint_dir: String,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_batch_size > 0, "MAX_BATCH_SIZE must be greater than 0");
        ensure!(self.max_wait_ms > 0, "MAX_WAIT_MS must be greater than 0");
        ensure!(
            self.commit_interval_ms > 0,
            "COMMIT_INTERVAL_MS must be greater than 0"
        );
        ensure!(
            self.max_delivery_attempts > 0,
            "MAX_DELIVERY_ATTEMPTS must be greater than 0"
        );
        ensure!(
            !self.kafka_consumer_topic.is_empty(),
            "KAFKA_CONSUMER_TOPIC must not be empty"
        );
        self.start_offset_policy()?;
        self.trigger_shape()?;
        Ok(())
    }

    pub fn start_offset_policy(&self) -> Result<StartOffsetPolicy> {
        self.kafka_consumer_offset_reset
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid KAFKA_CONSUMER_OFFSET_RESET")
    }

    pub fn trigger_shape(&self) -> Result<TriggerShape> {
        self.trigger_shape
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid TRIGGER_SHAPE")
    }

    /// Get checkpoint directory as PathBuf
    pub fn checkpoint_dir_buf(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint_dir)
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn revoke_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.revoke_flush_timeout_ms)
    }

    pub fn build_consumer_config(&self) -> Result<ClientConfig> {
        Ok(
            ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_offset_reset(self.start_offset_policy()?)
                .build(),
        )
    }

    /// Settings for the checkpoint engine
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            topic: self.kafka_consumer_topic.clone(),
            max_batch_size: self.max_batch_size,
            max_wait: Duration::from_millis(self.max_wait_ms),
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            commit_every_records: self.commit_every_records,
            trigger_shape: self.trigger_shape()?,
            max_delivery_attempts: self.max_delivery_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            revoke_flush_timeout: self.revoke_flush_timeout(),
            shutdown_flush_timeout: Duration::from_millis(self.shutdown_flush_timeout_ms),
            start_offset_policy: self.start_offset_policy()?,
        })
    }
}
