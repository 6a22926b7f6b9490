use std::fmt;
use std::str::FromStr;

use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::{Deserialize, Serialize};

/// Identifies one partition of a topic. Used as the key for cursors,
/// assignments and checkpoint entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A partition paired with the next offset to consume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Where to start reading a partition that has no checkpoint anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffsetPolicy {
    #[default]
    Earliest,
    Latest,
}

impl StartOffsetPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartOffsetPolicy::Earliest => "earliest",
            StartOffsetPolicy::Latest => "latest",
        }
    }
}

impl FromStr for StartOffsetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(StartOffsetPolicy::Earliest),
            "latest" | "largest" | "end" => Ok(StartOffsetPolicy::Latest),
            other => Err(format!("unknown start offset policy: {other}")),
        }
    }
}

/// Per-partition lifecycle inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Cursor seeded, records may be dispatched
    Active,
    /// Revocation started: no new dispatch, pending flush
    Fenced,
    /// Delivery retries exhausted: consumption stopped until released
    Failed,
}
