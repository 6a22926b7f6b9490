//! In-process broker with consumer groups.
//!
//! Topics are vectors of partition logs. Every group spreads its topic's
//! partitions round-robin over its members (sorted by join order) and runs an
//! eager rebalance whenever a member joins or leaves: revoke what moves, wait
//! for the acks (bounded by `revoke_timeout`), then assign. A member that does
//! not ack in time keeps processing its partitions while the new owner
//! starts, which is the same overlap window a real group has. Assigned
//! partitions start paused, like the librdkafka client leaves them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::kafka::broker::{BrokerClient, BrokerEvent, RevokeAck};
use crate::kafka::message::Record;
use crate::kafka::types::{Partition, PartitionOffset, StartOffsetPolicy};

const DEFAULT_REVOKE_TIMEOUT: Duration = Duration::from_secs(30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Default)]
struct GroupState {
    topic: Option<String>,
    members: BTreeMap<u64, Arc<Member>>,
    committed: HashMap<Partition, i64>,
}

#[derive(Default)]
struct MemberState {
    events: VecDeque<BrokerEvent>,
    // fetch position per owned partition
    positions: BTreeMap<Partition, i64>,
    paused: HashSet<Partition>,
    next_partition: usize,
    closed: bool,
}

struct Member {
    id: u64,
    start_policy: StartOffsetPolicy,
    state: Mutex<MemberState>,
    notify: Notify,
}

impl Member {
    fn push_event(&self, event: BrokerEvent) {
        lock(&self.state).events.push_back(event);
        self.notify.notify_one();
    }

    fn owned(&self) -> BTreeSet<Partition> {
        lock(&self.state).positions.keys().cloned().collect()
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

pub struct MemoryCluster {
    topics: Mutex<HashMap<String, Vec<Vec<Record>>>>,
    groups: Mutex<HashMap<String, GroupState>>,
    // one rebalance at a time across the cluster
    rebalance_lock: tokio::sync::Mutex<()>,
    next_member_id: AtomicU64,
    revoke_timeout: Duration,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Self::with_revoke_timeout(DEFAULT_REVOKE_TIMEOUT)
    }

    /// How long a rebalance waits for members to acknowledge a revoke.
    pub fn with_revoke_timeout(revoke_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            rebalance_lock: tokio::sync::Mutex::new(()),
            next_member_id: AtomicU64::new(0),
            revoke_timeout,
        })
    }

    /// Create a topic. Creating an existing topic is a no-op.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let count = usize::try_from(partitions).unwrap_or_default();
        lock(&self.topics)
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count]);
    }

    /// Append a record and return its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<i64, BrokerError> {
        let offset = {
            let mut topics = lock(&self.topics);
            let log = topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(usize::try_from(partition).ok()?))
                .ok_or_else(|| {
                    BrokerError::Transient(format!("unknown partition {topic}:{partition}"))
                })?;
            let offset = i64::try_from(log.len())
                .map_err(|_| BrokerError::Fatal(format!("{topic}:{partition} is full")))?;
            log.push(Record::new(
                Partition::new(topic, partition),
                offset,
                key,
                value.into(),
                SystemTime::now(),
            ));
            offset
        };

        let groups = lock(&self.groups);
        for group in groups.values() {
            if group.topic.as_deref() == Some(topic) {
                for member in group.members.values() {
                    member.notify.notify_one();
                }
            }
        }
        Ok(offset)
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, Vec::len)
    }

    /// Offset committed by a group, as the group coordinator sees it.
    pub fn committed_offset(&self, group_id: &str, partition: &Partition) -> Option<i64> {
        lock(&self.groups)
            .get(group_id)
            .and_then(|group| group.committed.get(partition).copied())
    }

    pub fn member_count(&self, group_id: &str) -> usize {
        lock(&self.groups)
            .get(group_id)
            .map_or(0, |group| group.members.len())
    }

    /// A new client for `group_id`. It joins the group on `subscribe`.
    pub fn consumer(
        self: &Arc<Self>,
        group_id: &str,
        start_policy: StartOffsetPolicy,
    ) -> MemoryBroker {
        let member = Member {
            id: self.next_member_id.fetch_add(1, Ordering::SeqCst),
            start_policy,
            state: Mutex::new(MemberState::default()),
            notify: Notify::new(),
        };
        MemoryBroker {
            cluster: self.clone(),
            group_id: group_id.to_string(),
            member: Arc::new(member),
        }
    }

    fn watermarks(&self, partition: &Partition) -> Option<(i64, i64)> {
        let topics = lock(&self.topics);
        let log = topics
            .get(partition.topic())?
            .get(usize::try_from(partition.partition_number()).ok()?)?;
        Some((0, i64::try_from(log.len()).ok()?))
    }

    fn next_event(&self, member: &Member) -> Option<BrokerEvent> {
        let mut state = lock(&member.state);
        if let Some(event) = state.events.pop_front() {
            return Some(event);
        }

        let fetchable: Vec<(Partition, i64)> = state
            .positions
            .iter()
            .filter(|(partition, _)| !state.paused.contains(*partition))
            .map(|(partition, position)| (partition.clone(), *position))
            .collect();
        if fetchable.is_empty() {
            return None;
        }

        let topics = lock(&self.topics);
        let start = state.next_partition;
        for step in 0..fetchable.len() {
            let idx = (start + step) % fetchable.len();
            let (partition, position) = &fetchable[idx];
            let record = topics
                .get(partition.topic())
                .and_then(|logs| logs.get(usize::try_from(partition.partition_number()).ok()?))
                .and_then(|log| log.get(usize::try_from(*position).ok()?))
                .cloned();
            if let Some(record) = record {
                state.positions.insert(partition.clone(), position + 1);
                state.next_partition = idx + 1;
                return Some(BrokerEvent::Record(record));
            }
        }
        None
    }

    async fn rebalance(self: Arc<Self>, group_id: String) {
        let _serial = self.rebalance_lock.lock().await;

        let (topic, members) = {
            let groups = lock(&self.groups);
            let Some(group) = groups.get(&group_id) else {
                return;
            };
            let members: Vec<Arc<Member>> = group.members.values().cloned().collect();
            (group.topic.clone(), members)
        };
        let Some(topic) = topic else {
            return;
        };

        let mut target: BTreeMap<u64, BTreeSet<Partition>> =
            members.iter().map(|m| (m.id, BTreeSet::new())).collect();
        if !members.is_empty() {
            let partition_count = self.partition_count(&topic);
            for (idx, member) in (0..partition_count).map(|n| (n, &members[n % members.len()])) {
                if let Ok(number) = i32::try_from(idx) {
                    if let Some(owned) = target.get_mut(&member.id) {
                        owned.insert(Partition::new(topic.as_str(), number));
                    }
                }
            }
        }

        // revoke phase
        let mut pending_acks = Vec::new();
        for member in &members {
            let wanted = target.get(&member.id).cloned().unwrap_or_default();
            let lost: Vec<Partition> = member.owned().difference(&wanted).cloned().collect();
            if lost.is_empty() {
                continue;
            }
            {
                let mut state = lock(&member.state);
                for partition in &lost {
                    state.positions.remove(partition);
                    state.paused.remove(partition);
                }
            }
            debug!(member = member.id, count = lost.len(), "Revoking partitions from member");
            let (ack, rx) = RevokeAck::new();
            member.push_event(BrokerEvent::Revoked {
                partitions: lost,
                ack,
            });
            pending_acks.push(rx);
        }
        if !pending_acks.is_empty()
            && tokio::time::timeout(self.revoke_timeout, join_all(pending_acks))
                .await
                .is_err()
        {
            warn!(
                group = group_id.as_str(),
                timeout = ?self.revoke_timeout,
                "Revoke not acknowledged in time, assigning anyway"
            );
        }

        // assign phase
        let committed = lock(&self.groups)
            .get(&group_id)
            .map(|group| group.committed.clone())
            .unwrap_or_default();
        for member in &members {
            if member.is_closed() {
                continue;
            }
            let wanted = target.remove(&member.id).unwrap_or_default();
            let gained: Vec<Partition> = wanted.difference(&member.owned()).cloned().collect();
            if gained.is_empty() {
                continue;
            }
            {
                let mut state = lock(&member.state);
                for partition in &gained {
                    let position = committed.get(partition).copied().unwrap_or_else(|| {
                        let (low, high) = self.watermarks(partition).unwrap_or((0, 0));
                        match member.start_policy {
                            StartOffsetPolicy::Earliest => low,
                            StartOffsetPolicy::Latest => high,
                        }
                    });
                    state.positions.insert(partition.clone(), position);
                    // fetched only once the owner resumes it
                    state.paused.insert(partition.clone());
                }
            }
            debug!(member = member.id, count = gained.len(), "Assigning partitions to member");
            member.push_event(BrokerEvent::Assigned(gained));
        }

        info!(
            group = group_id.as_str(),
            members = members.len(),
            "Group rebalance complete"
        );
    }
}

/// Consumer-group member backed by a [`MemoryCluster`].
pub struct MemoryBroker {
    cluster: Arc<MemoryCluster>,
    group_id: String,
    member: Arc<Member>,
}

impl MemoryBroker {
    pub fn member_id(&self) -> u64 {
        self.member.id
    }

    /// Partitions this member currently owns
    pub fn assignment(&self) -> Vec<Partition> {
        self.member.owned().into_iter().collect()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.member.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut groups = lock(&self.cluster.groups);
            let group = groups.entry(self.group_id.clone()).or_default();
            match group.topic.as_deref() {
                Some(existing) if existing != topic => {
                    return Err(BrokerError::Fatal(format!(
                        "group {} is subscribed to {existing}, not {topic}",
                        self.group_id
                    )));
                }
                _ => group.topic = Some(topic.to_string()),
            }
            group.members.insert(self.member.id, self.member.clone());
        }
        info!(
            group = self.group_id.as_str(),
            member = self.member.id,
            topic = topic,
            "Member joined group"
        );
        tokio::spawn(self.cluster.clone().rebalance(self.group_id.clone()));
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            if let Some(event) = self.cluster.next_event(&self.member) {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, self.member.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.member.state);
        match state.positions.get_mut(partition) {
            Some(position) => {
                *position = offset;
                Ok(())
            }
            None => Err(BrokerError::Transient(format!(
                "cannot seek {partition}: not assigned to this member"
            ))),
        }
    }

    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.member.state);
        for partition in partitions {
            if state.positions.contains_key(partition) {
                state.paused.insert(partition.clone());
            }
        }
        Ok(())
    }

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut state = lock(&self.member.state);
            for partition in partitions {
                state.paused.remove(partition);
            }
        }
        self.member.notify.notify_one();
        Ok(())
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut groups = lock(&self.cluster.groups);
        let group = groups
            .get_mut(&self.group_id)
            .ok_or_else(|| BrokerError::Transient(format!("unknown group {}", self.group_id)))?;
        for offset in offsets {
            group
                .committed
                .insert(offset.partition().clone(), offset.offset());
        }
        Ok(())
    }

    async fn committed(&self, partition: &Partition) -> Result<Option<i64>, BrokerError> {
        self.ensure_open()?;
        Ok(self.cluster.committed_offset(&self.group_id, partition))
    }

    async fn fetch_watermarks(&self, partition: &Partition) -> Result<(i64, i64), BrokerError> {
        self.ensure_open()?;
        self.cluster
            .watermarks(partition)
            .ok_or_else(|| BrokerError::Transient(format!("unknown partition {partition}")))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = lock(&self.member.state);
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.events.clear();
            state.positions.clear();
            state.paused.clear();
        }
        let remaining = {
            let mut groups = lock(&self.cluster.groups);
            match groups.get_mut(&self.group_id) {
                Some(group) => {
                    group.members.remove(&self.member.id);
                    group.members.len()
                }
                None => 0,
            }
        };
        info!(
            group = self.group_id.as_str(),
            member = self.member.id,
            "Member left group"
        );
        if remaining > 0 {
            tokio::spawn(self.cluster.clone().rebalance(self.group_id.clone()));
        }
        Ok(())
    }
}
