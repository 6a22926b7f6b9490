// Kafka module - partition cursors, commits and rebalance handling
pub mod assignment;
pub mod broker;
pub mod commit_scheduler;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod dispatcher;
pub mod memory_broker;
pub mod message;
pub mod rdkafka_broker;
pub mod rebalance_coordinator;
pub mod types;

// Public API
pub use broker::{BrokerClient, BrokerEvent, RevokeAck};
pub use config::ConsumerConfigBuilder;
pub use consumer::{CheckpointConsumer, EngineConfig};
pub use memory_broker::{MemoryBroker, MemoryCluster};
pub use rdkafka_broker::KafkaBroker;
