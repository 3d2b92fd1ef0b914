use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::dedup::DedupCache;
use crate::error::{StoreError, ValidationError};
use crate::model::{ExcludedRoutes, StoredRecord};
use crate::publisher::RetryPolicy;
use crate::stats::{ConsumerStats, incr};
use crate::store::{PositionStore, UpsertOutcome};
use crate::stream::{Delivery, Envelope};
use crate::wire::PositionMessage;

/// Terminal result of handling one envelope. Every outcome is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stored(UpsertOutcome),
    Excluded,
    Duplicate,
    Rejected(ValidationError),
    /// The store refused the record for good.
    Refused(StoreError),
    Poison(String),
}

/// Settings shared by every partition worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn PositionStore>,
    pub excluded: Arc<ExcludedRoutes>,
    pub max_clock_skew: chrono::Duration,
    pub store_backoff: RetryPolicy,
    pub stats: Arc<ConsumerStats>,
}

/// Handles the envelopes of the partitions mapped to it, strictly one at a
/// time, so records of one route are stored in log order.
pub(crate) struct PartitionWorker {
    id: usize,
    ctx: WorkerContext,
    dedup: DedupCache,
}

impl PartitionWorker {
    pub fn new(id: usize, ctx: WorkerContext, dedup_capacity: usize) -> Self {
        Self {
            id,
            ctx,
            dedup: DedupCache::new(dedup_capacity),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Delivery>, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.id, "Partition worker started");
        while let Some(delivery) = rx.recv().await {
            if *shutdown.borrow() {
                break;
            }
            if !self.handle(delivery, &mut shutdown).await {
                break;
            }
        }
        debug!(worker = self.id, "Partition worker stopped");
    }

    /// Processes and commits one delivery. Returns false when shutdown
    /// interrupted a store retry; the delivery is then left uncommitted.
    pub async fn handle(&mut self, delivery: Delivery, shutdown: &mut watch::Receiver<bool>) -> bool {
        incr(&self.ctx.stats.received);

        let outcome = match self.prepare(&delivery.envelope) {
            Err(terminal) => terminal,
            Ok(record) => match self.store_until_done(&record, shutdown).await {
                Some(Ok(outcome)) => {
                    self.dedup.remember(&record.position);
                    Outcome::Stored(outcome)
                }
                Some(Err(refused)) => Outcome::Refused(refused),
                None => {
                    info!(
                        worker = self.id,
                        offset = delivery.envelope.offset,
                        "Shutdown during store retry, leaving envelope uncommitted"
                    );
                    return false;
                }
            },
        };

        self.count(&outcome, &delivery.envelope);

        if let Err(e) = delivery.commit().await {
            incr(&self.ctx.stats.commit_failures);
            warn!(
                worker = self.id,
                offset = delivery.envelope.offset,
                error = %e,
                "Commit failed, envelope may be redelivered"
            );
        }
        true
    }

    /// Runs the stages that do not touch the store. `Err` carries the
    /// terminal outcome for envelopes that stop here.
    fn prepare(&mut self, envelope: &Envelope) -> Result<StoredRecord, Outcome> {
        let message =
            PositionMessage::parse(&envelope.payload).map_err(|e| Outcome::Poison(e.to_string()))?;
        let position = message.into_position(Utc::now());

        if self.ctx.excluded.contains(&position.route_id) {
            return Err(Outcome::Excluded);
        }

        let position = position
            .validate(self.ctx.max_clock_skew)
            .map_err(Outcome::Rejected)?;

        if self.dedup.seen(&position) {
            return Err(Outcome::Duplicate);
        }

        Ok(StoredRecord {
            position,
            source_sequence: Some(envelope.offset),
        })
    }

    /// Retries the upsert with capped backoff until it succeeds or the store
    /// refuses the record permanently. Returns `None` if shutdown is
    /// signalled first.
    async fn store_until_done(
        &self,
        record: &StoredRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<UpsertOutcome, StoreError>> {
        let mut attempt = 1;
        loop {
            match self.ctx.store.upsert(record).await {
                Ok(outcome) => return Some(Ok(outcome)),
                Err(e) if e.is_permanent() => return Some(Err(e)),
                Err(e) => {
                    incr(&self.ctx.stats.store_failures);
                    let wait = self.ctx.store_backoff.backoff(attempt);
                    log_store_failure(self.id, record, &e, attempt, wait);

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        return None;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn count(&self, outcome: &Outcome, envelope: &Envelope) {
        let stats = &self.ctx.stats;
        match outcome {
            Outcome::Stored(UpsertOutcome::Stale) => incr(&stats.stale),
            Outcome::Stored(_) => incr(&stats.stored),
            Outcome::Excluded => incr(&stats.excluded),
            Outcome::Duplicate => incr(&stats.duplicates),
            Outcome::Rejected(e) => {
                incr(&stats.rejected);
                warn!(worker = self.id, offset = envelope.offset, error = %e, "Rejected record");
            }
            Outcome::Refused(e) => {
                incr(&stats.rejected);
                error!(
                    worker = self.id,
                    offset = envelope.offset,
                    partition_key = %envelope.partition_key,
                    error = %e,
                    "Store refused record, dropping it"
                );
            }
            Outcome::Poison(reason) => {
                incr(&stats.poison);
                error!(
                    worker = self.id,
                    offset = envelope.offset,
                    partition_key = %envelope.partition_key,
                    reason = %reason,
                    "Skipping undecodable envelope"
                );
            }
        }
    }
}

fn log_store_failure(
    worker: usize,
    record: &StoredRecord,
    e: &StoreError,
    attempt: u32,
    wait: std::time::Duration,
) {
    warn!(
        worker,
        key = %record.key(),
        error = %e,
        attempt,
        wait_ms = wait.as_millis() as u64,
        "Store write failed, retrying"
    );
}
