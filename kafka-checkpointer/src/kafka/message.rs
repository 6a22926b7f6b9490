use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Message};

use crate::kafka::types::Partition;

/// An owned record read from one partition. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    timestamp: SystemTime,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    /// Copy a record out of an rdkafka message. A missing payload (tombstone)
    /// becomes an empty value; a missing timestamp falls back to now.
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
            .unwrap_or_else(SystemTime::now);

        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Get the value as a UTF-8 string if possible
    pub fn value_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }

    /// Get the key as a UTF-8 string if possible
    pub fn key_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.key.as_deref().map(std::str::from_utf8)
    }

    /// Decode a key written by a long serializer (8 bytes, big-endian).
    /// Returns None when there is no key or it is not 8 bytes wide.
    pub fn key_as_i64(&self) -> Option<i64> {
        let key = self.key.as_deref()?;
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(i64::from_be_bytes(bytes))
    }
}
