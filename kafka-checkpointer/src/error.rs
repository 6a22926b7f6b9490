use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::kafka::types::Partition;

/// Errors surfaced by a broker client implementation.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Recoverable: the caller should back off and try again
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The connection cannot be recovered
    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("broker client is closed")]
    Closed,
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_) | BrokerError::Closed)
    }
}

/// Errors surfaced by a checkpoint store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store I/O failed at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint entry at {path:?} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Error taxonomy of the checkpoint engine.
///
/// Delivery and commit failures are recovered locally (retry); only
/// `FatalBrokerError` escapes the engine's run loop.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("delivery to {partition} failed on attempt {attempt}")]
    TransientDeliveryFailure {
        partition: Partition,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("delivery to {partition} failed {attempts} times, partition consumption stopped")]
    PartitionFailed { partition: Partition, attempts: u32 },

    #[error("commit of offset {offset} for {partition} failed: {reason}")]
    CommitFailure {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    #[error("flush of {partitions} revoked partitions did not finish within {timeout:?}")]
    RebalanceFlushTimeout { partitions: usize, timeout: Duration },

    #[error("unrecoverable broker failure")]
    FatalBrokerError(#[source] BrokerError),

    #[error("could not seek {partition} to offset {offset}, partition consumption stopped")]
    SeekFailed {
        partition: Partition,
        offset: i64,
        #[source]
        source: BrokerError,
    },
}
