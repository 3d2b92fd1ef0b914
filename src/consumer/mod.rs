//! Reads position envelopes from the stream log and upserts them into the
//! store.
//!
//! One dispatcher task reads the subscription and hands each delivery to the
//! worker owning its partition key. Workers run in parallel but each is
//! sequential, so a route's records are stored in log order while different
//! routes proceed independently.

mod dedup;
mod worker;

pub use worker::Outcome;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::StreamError;
use crate::model::ExcludedRoutes;
use crate::publisher::RetryPolicy;
use crate::stats::{ConsumerSnapshot, ConsumerStats};
use crate::store::PositionStore;
use crate::stream::{StreamLog, partition_for};
use worker::{PartitionWorker, WorkerContext};

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    pub workers: usize,
    /// Deliveries buffered per worker before the dispatcher waits.
    pub channel_capacity: usize,
    pub excluded: ExcludedRoutes,
    pub max_clock_skew: chrono::Duration,
    /// Per-worker dedup working set.
    pub dedup_capacity: usize,
    /// Delays between store retries. Transient failures are retried until
    /// the write succeeds or shutdown, so `max_attempts` is not consulted.
    pub store_backoff: RetryPolicy,
    pub stats_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "vehicle-data".to_string(),
            group: "vehicle-data-group".to_string(),
            workers: 4,
            channel_capacity: 64,
            excluded: ExcludedRoutes::new(["9999"]),
            max_clock_skew: chrono::Duration::hours(1),
            dedup_capacity: 100_000,
            store_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(30),
            },
            stats_interval: Duration::from_secs(60),
        }
    }
}

pub struct Consumer {
    log: Arc<dyn StreamLog>,
    store: Arc<dyn PositionStore>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(log: Arc<dyn StreamLog>, store: Arc<dyn PositionStore>, config: ConsumerConfig) -> Self {
        Self {
            log,
            store,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes until `shutdown` is signalled or the log closes the
    /// subscription, then waits for the workers and returns the final counts.
    #[tracing::instrument(skip_all, fields(topic = %self.config.topic, group = %self.config.group))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ConsumerSnapshot, StreamError> {
        let mut subscription = self
            .log
            .subscribe(&self.config.topic, &self.config.group)
            .await?;

        let workers = self.config.workers.max(1);
        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            excluded: Arc::new(self.config.excluded.clone()),
            max_clock_skew: self.config.max_clock_skew,
            store_backoff: self.config.store_backoff,
            stats: Arc::clone(&self.stats),
        };

        let mut senders = Vec::with_capacity(workers);
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
            senders.push(tx);
            let worker = PartitionWorker::new(id, ctx.clone(), self.config.dedup_capacity);
            tasks.spawn(worker.run(rx, shutdown.clone()));
        }

        info!(
            workers,
            excluded_routes = self.config.excluded.len(),
            "Consumer started"
        );

        let mut stats_tick = tokio::time::interval(self.config.stats_interval);
        stats_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = stats_tick.tick() => {
                    info!(stats = ?self.stats.snapshot(), "Consumer progress");
                }
                next = subscription.next() => match next {
                    Ok(Some(delivery)) => {
                        let slot = partition_for(&delivery.envelope.partition_key, workers);
                        if senders[slot].send(delivery).await.is_err() {
                            error!(worker = slot, "Partition worker exited, stopping consumer");
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Subscription closed");
                        break;
                    }
                    Err(StreamError::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "Receiving from stream log failed");
                        tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                    }
                },
            }
        }

        drop(senders);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Partition worker panicked");
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            stats = ?snapshot,
            uncommitted = snapshot.received.saturating_sub(snapshot.settled()),
            "Consumer stopped"
        );
        Ok(snapshot)
    }
}
