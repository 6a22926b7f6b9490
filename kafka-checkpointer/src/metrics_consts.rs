// ==== Dispatch metrics ====
/// Counter for records handed to the delivery handler (label: status)
pub const RECORDS_DELIVERED: &str = "checkpointer_records_delivered_total";

/// Counter for delivery attempts that failed and will be retried
pub const DELIVERY_RETRIES: &str = "checkpointer_delivery_retries_total";

/// Counter for partitions that exhausted their retry budget
pub const PARTITIONS_FAILED: &str = "checkpointer_partitions_failed_total";

/// Counter for records dropped because their partition is not active
pub const RECORDS_DROPPED: &str = "checkpointer_records_dropped_total";

/// Histogram for records per delivery
pub const DELIVERY_BATCH_SIZE: &str = "checkpointer_delivery_batch_size";

/// Histogram for time spent collecting a poll batch
pub const BATCH_COLLECTION_DURATION_MS: &str = "checkpointer_batch_collection_duration_ms";

/// Histogram for handler latency per delivery
pub const DELIVERY_DURATION_SECONDS: &str = "checkpointer_delivery_duration_seconds";

// ==== Commit metrics ====
/// Counter for flush attempts (label: trigger = interval|count|revoke|shutdown)
pub const FLUSHES: &str = "checkpointer_flushes_total";

/// Counter for partition offsets committed (label: status)
pub const OFFSETS_COMMITTED: &str = "checkpointer_offsets_committed_total";

/// Histogram for flush duration
pub const FLUSH_DURATION_SECONDS: &str = "checkpointer_flush_duration_seconds";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "checkpointer_partition_last_committed_offset";

// ==== Rebalance metrics ====
/// Counter for rebalance events (label: event_type)
pub const REBALANCE_EVENTS: &str = "checkpointer_rebalance_events_total";

/// Counter for empty rebalance events that were skipped
pub const REBALANCE_EMPTY_SKIPPED: &str = "checkpointer_rebalance_empty_skipped_total";

/// Counter for revoke flushes that hit their timeout
pub const REBALANCE_FLUSH_TIMEOUTS: &str = "checkpointer_rebalance_flush_timeouts_total";

/// Counter for where an assigned partition's start offset came from (label: source)
pub const ASSIGNMENT_SEED_SOURCE: &str = "checkpointer_assignment_seed_source_total";

/// Gauge for number of partitions owned by this process
pub const OWNED_PARTITIONS: &str = "checkpointer_owned_partitions";

// ==== Broker metrics ====
/// Counter for broker errors (labels: level, error)
pub const BROKER_ERRORS: &str = "checkpointer_broker_errors_total";
