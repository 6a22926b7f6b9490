use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::info;

use crate::kafka::message::Record;
use crate::kafka::types::Partition;

/// How records are handed to the consumer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerShape {
    /// One record per invocation
    Single,
    /// An ordered run of records from one partition per invocation
    #[default]
    Array,
}

impl TriggerShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerShape::Single => "single",
            TriggerShape::Array => "array",
        }
    }
}

impl FromStr for TriggerShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "one" => Ok(TriggerShape::Single),
            "array" | "many" | "batch" => Ok(TriggerShape::Array),
            other => Err(format!("unknown trigger shape: {other}")),
        }
    }
}

impl fmt::Display for TriggerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records handed to one callback invocation. An `Array` is never empty and
/// always belongs to a single partition, in broker order.
#[derive(Debug, Clone, Copy)]
pub enum Delivery<'a> {
    Single(&'a Record),
    Array(&'a [Record]),
}

impl<'a> Delivery<'a> {
    pub fn records(&self) -> &'a [Record] {
        match *self {
            Delivery::Single(record) => std::slice::from_ref(record),
            Delivery::Array(records) => records,
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn partition(&self) -> Option<&'a Partition> {
        self.records().first().map(Record::partition)
    }
}

/// Application code invoked for every delivery. Returning an error leaves
/// the partition's cursor where it was, and the same records are retried.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery<'_>) -> anyhow::Result<()>;
}

/// Handler that only logs what it receives
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl DeliveryHandler for LoggingHandler {
    async fn handle(&self, delivery: Delivery<'_>) -> anyhow::Result<()> {
        for record in delivery.records() {
            info!(
                partition = %record.partition(),
                offset = record.offset(),
                value = %String::from_utf8_lossy(record.value()),
                "Delivered record"
            );
        }
        Ok(())
    }
}
