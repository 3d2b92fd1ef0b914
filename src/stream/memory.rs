use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use super::{Commit, Delivery, Envelope, StreamLog, Subscription, partition_for};
use crate::error::StreamError;

const DEFAULT_PARTITIONS: usize = 4;

/// In-process stream log with per-partition ordering and committed offsets
/// per consumer group.
///
/// Uncommitted envelopes are delivered again to the next subscription of
/// the same group, which is how a restart behaves against a real broker.
pub struct MemoryStreamLog {
    partitions: usize,
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
    fail_publishes: AtomicU32,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, TopicLog>,
    closed: bool,
    next_sequence: u64,
}

struct TopicLog {
    partitions: Vec<Vec<Stored>>,
    committed: HashMap<(String, usize), Committed>,
    commit_log: Vec<(String, usize, u64)>,
}

#[derive(Clone)]
struct Stored {
    envelope: Envelope,
    /// Global append order, used to interleave partitions deterministically.
    sequence: u64,
}

/// Committed offsets of one partition for one group. Commits may arrive out
/// of order, so offsets above the first gap are kept aside until it closes.
#[derive(Default, Clone)]
struct Committed {
    /// Every offset below this one is committed.
    watermark: u64,
    above: BTreeSet<u64>,
}

impl Committed {
    fn commit(&mut self, offset: u64) {
        if offset < self.watermark {
            return;
        }
        self.above.insert(offset);
        while self.above.remove(&self.watermark) {
            self.watermark += 1;
        }
    }

    fn contains(&self, offset: u64) -> bool {
        offset < self.watermark || self.above.contains(&offset)
    }
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            committed: HashMap::new(),
            commit_log: Vec::new(),
        }
    }
}

fn lock(state: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(LogState::default())),
            notify: Arc::new(Notify::new()),
            fail_publishes: AtomicU32::new(0),
        }
    }

    /// Makes the next `n` publish calls fail as if the broker were down.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Stops the log: subscriptions drain what is left and then end.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_waiters();
    }

    /// Every envelope appended to `topic`, in append order.
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        let state = lock(&self.state);
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut all: Vec<&Stored> = log.partitions.iter().flatten().collect();
        all.sort_by_key(|s| s.sequence);
        all.into_iter().map(|s| s.envelope.clone()).collect()
    }

    /// Commits recorded for `topic` as (group, partition, offset).
    pub fn commits(&self, topic: &str) -> Vec<(String, usize, u64)> {
        lock(&self.state)
            .topics
            .get(topic)
            .map(|log| log.commit_log.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryStreamLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        _message_id: &str,
        payload: Bytes,
    ) -> Result<u64, StreamError> {
        let injected = self
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StreamError::PublishFailed("injected failure".to_string()));
        }

        let offset = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(StreamError::Closed);
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let partitions = self.partitions;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(partitions));
            let partition = &mut log.partitions[partition_for(partition_key, partitions)];
            let offset = partition.len() as u64;
            partition.push(Stored {
                envelope: Envelope {
                    partition_key: partition_key.to_string(),
                    payload,
                    offset,
                },
                sequence,
            });
            offset
        };

        self.notify.notify_waiters();
        Ok(offset)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, StreamError> {
        let committed: Vec<Committed> = {
            let mut state = lock(&self.state);
            let partitions = self.partitions;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(partitions));
            (0..partitions)
                .map(|p| {
                    log.committed
                        .get(&(group.to_string(), p))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        };

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            group: group.to_string(),
            cursors: committed.iter().map(|c| c.watermark).collect(),
            committed,
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }))
    }
}

struct MemorySubscription {
    topic: String,
    group: String,
    /// Next offset to hand out, per partition.
    cursors: Vec<u64>,
    /// Commits as of subscribing; these offsets are not delivered again.
    committed: Vec<Committed>,
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
}

impl MemorySubscription {
    /// Picks the oldest undelivered envelope across partitions.
    fn poll(&mut self) -> Option<(usize, Envelope)> {
        let state = lock(&self.state);
        let log = state.topics.get(&self.topic)?;
        for (p, entries) in log.partitions.iter().enumerate() {
            let cursor = &mut self.cursors[p];
            while (*cursor as usize) < entries.len() && self.committed[p].contains(*cursor) {
                *cursor += 1;
            }
        }
        let (partition, stored) = log
            .partitions
            .iter()
            .enumerate()
            .filter_map(|(p, entries)| entries.get(self.cursors[p] as usize).map(|s| (p, s)))
            .min_by_key(|(_, s)| s.sequence)?;
        let envelope = stored.envelope.clone();
        drop(state);
        self.cursors[partition] += 1;
        Some((partition, envelope))
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, StreamError> {
        loop {
            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            if let Some((partition, envelope)) = self.poll() {
                let committer = MemoryCommit {
                    state: Arc::clone(&self.state),
                    topic: self.topic.clone(),
                    group: self.group.clone(),
                    partition,
                    offset: envelope.offset,
                };
                return Ok(Some(Delivery::new(envelope, committer)));
            }
            if self.is_closed() {
                return Ok(None);
            }
            notified.await;
        }
    }
}

struct MemoryCommit {
    state: Arc<Mutex<LogState>>,
    topic: String,
    group: String,
    partition: usize,
    offset: u64,
}

#[async_trait]
impl Commit for MemoryCommit {
    async fn commit(&self) -> Result<(), StreamError> {
        let mut state = lock(&self.state);
        let log = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| StreamError::CommitFailed(format!("unknown topic {}", self.topic)))?;
        log.committed
            .entry((self.group.clone(), self.partition))
            .or_default()
            .commit(self.offset);
        log.commit_log
            .push((self.group.clone(), self.partition, self.offset));
        Ok(())
    }
}
