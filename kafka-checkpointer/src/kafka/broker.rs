//! Broker client capability consumed by the checkpoint engine.
//!
//! Group membership changes are not callbacks into the engine. The client
//! turns them into [`BrokerEvent`]s that arrive on the same ordered stream as
//! records, so a revoke is observed strictly after every record the client
//! handed out before it. A revoke carries a [`RevokeAck`]; the client holds
//! the partitions until the engine acknowledges (or its own timeout expires).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::BrokerError;
use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionOffset};

/// Completion handle for a revoke. Dropping it unacknowledged releases the
/// broker client as well, so a lost event cannot wedge the group.
pub struct RevokeAck {
    tx: Option<oneshot::Sender<()>>,
}

impl RevokeAck {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Tell the broker client the revoked partitions may be released.
    pub fn acknowledge(mut self) {
        if let Some(tx) = self.tx.take() {
            if tx.send(()).is_err() {
                debug!("Revoke acknowledged after the broker client stopped waiting");
            }
        }
    }
}

impl fmt::Debug for RevokeAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevokeAck")
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum BrokerEvent {
    Record(Record),
    /// Partitions newly owned by this member. They stay paused at the broker
    /// until the engine seeks and resumes them.
    Assigned(Vec<Partition>),
    /// Partitions about to move to another member.
    Revoked {
        partitions: Vec<Partition>,
        ack: RevokeAck,
    },
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join the consumer group for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Next record or rebalance event, or `None` once `timeout` elapses.
    /// Dropping the future before it resolves loses nothing.
    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerEvent>, BrokerError>;

    /// Move the fetch position of an owned partition.
    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError>;

    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    /// Commit next-to-consume offsets to the group coordinator.
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError>;

    /// Offset the group coordinator holds for a partition, if any.
    async fn committed(&self, partition: &Partition) -> Result<Option<i64>, BrokerError>;

    /// (low, high) watermarks of a partition.
    async fn fetch_watermarks(&self, partition: &Partition) -> Result<(i64, i64), BrokerError>;

    /// Leave the group and release client resources.
    async fn close(&self) -> Result<(), BrokerError>;
}
