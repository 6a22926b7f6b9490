//! Broker client backed by librdkafka.
//!
//! A dedicated thread drives `BaseConsumer::poll`, so librdkafka's rebalance
//! callbacks run there and never on the async runtime. Records, errors and
//! rebalance events share one bounded channel to keep their relative order.
//! The revoke callback blocks the poll thread until the engine acknowledges
//! (bounded by the revoke timeout), which is what lets the engine flush
//! before the partitions move.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::broker::{BrokerClient, BrokerEvent, RevokeAck};
use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{BROKER_ERRORS, REBALANCE_EMPTY_SKIPPED};

// capacity of the poll thread -> engine channel
const EVENT_BUFFER: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

type EventResult = Result<BrokerEvent, KafkaError>;

pub struct RebalanceContext {
    events_tx: mpsc::Sender<EventResult>,
    rt_handle: Handle,
    revoke_timeout: Duration,
}

impl RebalanceContext {
    fn send(&self, event: EventResult) -> bool {
        self.events_tx.blocking_send(event).is_ok()
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                // cooperative-sticky sends these frequently
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }

                let partitions: Vec<Partition> =
                    tpl.elements().into_iter().map(Partition::from).collect();
                info!("Revoking {} partitions", partitions.len());

                let (ack, ack_rx) = RevokeAck::new();
                if !self.send(Ok(BrokerEvent::Revoked { partitions, ack })) {
                    warn!("Engine stopped listening, releasing revoked partitions without flush");
                    return;
                }

                match self
                    .rt_handle
                    .block_on(tokio::time::timeout(self.revoke_timeout, ack_rx))
                {
                    Ok(Ok(())) => debug!("Revoke acknowledged by engine"),
                    Ok(Err(_)) => warn!("Revoke event dropped without acknowledgement"),
                    Err(_) => warn!(
                        "Revoke not acknowledged within {:?}, releasing partitions",
                        self.revoke_timeout
                    ),
                }
            }
            Rebalance::Assign(tpl) => {
                debug!("Pre-rebalance assign event for {} partitions", tpl.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign")
                        .increment(1);
                    return;
                }

                // nothing may be fetched before the engine has seeded and sought
                if let Err(e) = base_consumer.pause(tpl) {
                    error!(
                        "Failed to pause {} newly assigned partitions: {}",
                        tpl.count(),
                        e
                    );
                }

                let partitions: Vec<Partition> =
                    tpl.elements().into_iter().map(Partition::from).collect();
                if !self.send(Ok(BrokerEvent::Assigned(partitions))) {
                    warn!("Engine stopped listening, assignment not forwarded");
                }
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// How the poll side reacts to a consumer error.
#[derive(Debug, PartialEq, Eq)]
struct ErrorDisposition {
    level: &'static str,
    label: &'static str,
    // None means unrecoverable
    backoff: Option<Duration>,
}

fn classify_kafka_error(e: &KafkaError, attempt: u64) -> ErrorDisposition {
    let retry = |level, label, backoff| ErrorDisposition {
        level,
        label,
        backoff: Some(backoff),
    };
    let fatal = |label| ErrorDisposition {
        level: "fatal",
        label,
        backoff: None,
    };

    match e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => retry("info", "partition_eof", Duration::ZERO),
            RDKafkaErrorCode::OperationTimedOut => {
                retry("info", "op_timed_out", Duration::ZERO)
            }
            RDKafkaErrorCode::OffsetOutOfRange => {
                retry("info", "offset_out_of_range", Duration::from_millis(500))
            }
            _ => retry(
                "warn",
                "consumer",
                Duration::from_millis(100 * attempt.min(10)),
            ),
        },
        KafkaError::MessageConsumptionFatal(_) => fatal("consumer"),
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => retry(
                "warn",
                "all_brokers_down",
                Duration::from_secs(attempt.min(5)),
            ),
            RDKafkaErrorCode::BrokerTransportFailure => retry(
                "warn",
                "broker_transport",
                Duration::from_secs(attempt.min(3)),
            ),
            RDKafkaErrorCode::Authentication => fatal("authentication"),
            _ => retry(
                "warn",
                "global",
                Duration::from_millis(500 * attempt.min(6)),
            ),
        },
        KafkaError::Canceled => fatal("canceled"),
        _ => retry(
            "warn",
            "unexpected",
            Duration::from_millis(100 * attempt.min(10)),
        ),
    }
}

async fn handle_kafka_error(e: KafkaError, attempt: u64) -> BrokerError {
    let disposition = classify_kafka_error(&e, attempt);
    metrics::counter!(
        BROKER_ERRORS,
        &[("level", disposition.level), ("error", disposition.label)]
    )
    .increment(1);

    match disposition.backoff {
        Some(backoff) => {
            warn!(
                error = disposition.label,
                attempt = attempt,
                "Kafka consumer error: {e}"
            );
            sleep(backoff).await;
            BrokerError::Transient(e.to_string())
        }
        None => {
            error!(error = disposition.label, "Fatal Kafka consumer error: {e}");
            BrokerError::Fatal(e.to_string())
        }
    }
}

fn transient(action: &str, e: KafkaError) -> BrokerError {
    BrokerError::Transient(format!("{action} failed: {e}"))
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

pub struct KafkaBroker {
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    events_tx: mpsc::Sender<EventResult>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<EventResult>>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    error_count: AtomicU64,
}

impl KafkaBroker {
    /// Create the client. Must be called from within a tokio runtime.
    pub fn new(config: &ClientConfig, revoke_timeout: Duration) -> Result<Self, BrokerError> {
        let rt_handle = Handle::try_current()
            .map_err(|e| BrokerError::Fatal(format!("no tokio runtime available: {e}")))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let context = RebalanceContext {
            events_tx: events_tx.clone(),
            rt_handle,
            revoke_timeout,
        };
        let consumer: BaseConsumer<RebalanceContext> = config
            .create_with_context(context)
            .map_err(|e| BrokerError::Fatal(format!("failed to create Kafka consumer: {e}")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            poll_thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            error_count: AtomicU64::new(0),
        })
    }

    fn start_poll_thread(&self) -> Result<(), BrokerError> {
        let mut poll_thread = self
            .poll_thread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if poll_thread.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let consumer = self.consumer.clone();
        let running = self.running.clone();
        let tx = self.events_tx.clone();

        let handle = std::thread::Builder::new()
            .name("kafka-poll".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let event = match consumer.poll(POLL_INTERVAL) {
                        None => continue,
                        Some(Ok(message)) => {
                            Ok(BrokerEvent::Record(Record::from_borrowed_message(&message)))
                        }
                        Some(Err(e)) => Err(e),
                    };
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                debug!("Kafka poll thread exiting");
            })
            .map_err(|e| BrokerError::Fatal(format!("failed to start poll thread: {e}")))?;

        *poll_thread = Some(handle);
        Ok(())
    }

    async fn blocking<T, F>(&self, action: &'static str, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer<RebalanceContext>) -> KafkaResult<T> + Send + 'static,
    {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || f(&consumer))
            .await
            .map_err(|e| BrokerError::Fatal(format!("{action} task failed: {e}")))?
            .map_err(|e| transient(action, e))
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Fatal(format!("failed to subscribe to {topic}: {e}")))?;
        self.start_poll_thread()?;
        info!(topic = topic, "Subscribed to topic");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerEvent>, BrokerError> {
        let mut events = self.events_rx.lock().await;
        match tokio::time::timeout(timeout, events.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::Closed),
            Ok(Some(Ok(event))) => {
                self.error_count.store(0, Ordering::Relaxed);
                Ok(Some(event))
            }
            Ok(Some(Err(e))) => {
                let attempt = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                Err(handle_kafka_error(e, attempt).await)
            }
        }
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        let partition = partition.clone();
        self.blocking("seek", move |consumer| {
            consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                OPERATION_TIMEOUT,
            )
        })
        .await
    }

    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer
            .pause(&partition_list(partitions))
            .map_err(|e| transient("pause", e))
    }

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(|e| transient("resume", e))
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for offset in offsets {
            tpl.add_partition_offset(
                offset.topic(),
                offset.partition_number(),
                Offset::Offset(offset.offset()),
            )
            .map_err(|e| transient("commit", e))?;
        }
        self.blocking("commit", move |consumer| {
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
    }

    async fn committed(&self, partition: &Partition) -> Result<Option<i64>, BrokerError> {
        let tpl = partition_list(std::slice::from_ref(partition));
        let partition = partition.clone();
        let committed = self
            .blocking("committed", move |consumer| {
                consumer.committed_offsets(tpl, OPERATION_TIMEOUT)
            })
            .await?;
        Ok(committed
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) if offset >= 0 => Some(offset),
                _ => None,
            }))
    }

    async fn fetch_watermarks(&self, partition: &Partition) -> Result<(i64, i64), BrokerError> {
        let partition = partition.clone();
        self.blocking("fetch_watermarks", move |consumer| {
            consumer.fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                OPERATION_TIMEOUT,
            )
        })
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // a revoke fired while leaving must not wait for an engine that stopped
        self.events_rx.lock().await.close();
        self.running.store(false, Ordering::SeqCst);

        let handle = self
            .poll_thread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| BrokerError::Fatal(format!("poll thread join failed: {e}")))?
                .map_err(|_| BrokerError::Fatal("poll thread panicked".to_string()))?;
        }

        self.consumer.unsubscribe();
        info!("Kafka consumer closed");
        Ok(())
    }
}
