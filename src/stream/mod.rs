//! Durable, partitioned message log between the poller and the upserter.
//!
//! The pipeline only needs three operations from the log: append under a
//! partition key, receive in per-partition order, and commit a received
//! envelope. [`JetStreamLog`] provides them on NATS JetStream;
//! [`MemoryStreamLog`] provides them in-process for tests and single-binary
//! runs.

mod jetstream;
mod memory;

pub use jetstream::JetStreamLog;
pub use memory::MemoryStreamLog;

use async_trait::async_trait;
use bytes::Bytes;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::StreamError;

/// A message as delivered by the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub partition_key: String,
    pub payload: Bytes,
    /// Assigned by the log; increases within a partition.
    pub offset: u64,
}

/// Marks a delivered envelope as processed so it is not delivered again.
#[async_trait]
pub trait Commit: Send + Sync {
    async fn commit(&self) -> Result<(), StreamError>;
}

/// An envelope together with the handle that commits it.
pub struct Delivery {
    pub envelope: Envelope,
    committer: Box<dyn Commit>,
}

impl Delivery {
    pub fn new(envelope: Envelope, committer: impl Commit + 'static) -> Self {
        Self {
            envelope,
            committer: Box::new(committer),
        }
    }

    pub async fn commit(&self) -> Result<(), StreamError> {
        self.committer.commit().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Ordered stream of deliveries for one consumer group.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `Ok(None)` means the log is closed and
    /// nothing is left to deliver.
    async fn next(&mut self) -> Result<Option<Delivery>, StreamError>;
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Appends `payload` to `topic` under `partition_key` and returns the
    /// offset the log assigned. `message_id` lets logs that support it drop
    /// duplicate appends of the same record.
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<u64, StreamError>;

    /// Subscribes `group` to `topic`, resuming after its last committed
    /// envelope in every partition.
    async fn subscribe(&self, topic: &str, group: &str)
    -> Result<Box<dyn Subscription>, StreamError>;
}

/// Stable mapping of a partition key onto `partitions` slots.
pub fn partition_for(partition_key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let mut h = DefaultHasher::new();
    partition_key.hash(&mut h);
    (h.finish() % partitions as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_bounded() {
        for key in ["31", "9999", "M2", "route with spaces"] {
            let p = partition_for(key, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(key, 4));
        }
        assert_eq!(partition_for("31", 1), 0);
        assert_eq!(partition_for("31", 0), 0);
    }
}
