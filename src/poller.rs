//! Periodic fetch-decode-publish loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{StreamExt, stream};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::codec::FeedCodec;
use crate::error::{DecodeError, FetchError};
use crate::fetch::{HttpClient, fetch_bytes};
use crate::model::VehiclePosition;
use crate::publisher::Publisher;
use crate::stats::{PollerStats, add, incr};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub feed_url: String,
    pub interval: Duration,
    /// How many routes are published at the same time.
    pub publish_concurrency: usize,
}

/// Why a tick produced nothing.
#[derive(Error, Debug)]
pub enum TickError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Outcome of one successful tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched_bytes: usize,
    pub decoded: usize,
    pub entity_errors: usize,
    pub ignored: usize,
    pub routes: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct FeedPoller {
    client: Box<dyn HttpClient>,
    codec: Box<dyn FeedCodec>,
    publisher: Arc<Publisher>,
    config: PollerConfig,
    stats: Arc<PollerStats>,
}

impl FeedPoller {
    pub fn new(
        client: Box<dyn HttpClient>,
        codec: Box<dyn FeedCodec>,
        publisher: Arc<Publisher>,
        config: PollerConfig,
    ) -> Self {
        Self {
            client,
            codec,
            publisher,
            config,
            stats: Arc::new(PollerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs one fetch-decode-publish cycle.
    #[tracing::instrument(skip(self), fields(url = %self.config.feed_url))]
    pub async fn tick(&self) -> Result<TickReport, TickError> {
        incr(&self.stats.ticks);
        let ingested_at = Utc::now();

        let bytes = fetch_bytes(self.client.as_ref(), &self.config.feed_url)
            .await
            .inspect_err(|_| incr(&self.stats.fetch_failures))?;

        let decoded = self
            .codec
            .decode(&bytes, ingested_at)
            .inspect_err(|_| incr(&self.stats.decode_failures))?;

        for e in &decoded.errors {
            warn!(error = %e, "Skipped feed entity");
        }
        add(&self.stats.entity_errors, decoded.errors.len() as u64);
        add(&self.stats.decoded, decoded.positions.len() as u64);

        let mut report = TickReport {
            fetched_bytes: bytes.len(),
            decoded: decoded.positions.len(),
            entity_errors: decoded.errors.len(),
            ignored: decoded.ignored,
            ..Default::default()
        };

        let routes = group_by_route(decoded.positions);
        report.routes = routes.len();

        let publisher = &self.publisher;
        let results: Vec<(usize, usize)> = stream::iter(routes)
            .map(|batch| async move {
                let mut published = 0;
                let mut failed = 0;
                for position in &batch {
                    match publisher.publish(position).await {
                        Ok(_) => published += 1,
                        Err(_) => failed += 1,
                    }
                }
                (published, failed)
            })
            .buffer_unordered(self.config.publish_concurrency.max(1))
            .collect()
            .await;

        for (published, failed) in results {
            report.published += published;
            report.failed += failed;
        }
        add(&self.stats.published, report.published as u64);
        add(&self.stats.publish_failures, report.failed as u64);

        Ok(report)
    }

    /// Ticks every `interval` until `shutdown` flips to true. A tick that
    /// overruns the interval delays the next one rather than overlapping it.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            url = %self.config.feed_url,
            interval_secs = self.config.interval.as_secs(),
            schema = self.codec.schema().as_str(),
            "Feed poller started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) => info!(
                    fetched_bytes = report.fetched_bytes,
                    decoded = report.decoded,
                    entity_errors = report.entity_errors,
                    routes = report.routes,
                    published = report.published,
                    failed = report.failed,
                    "Tick complete"
                ),
                Err(e) => warn!(error = %e, "Tick skipped"),
            }
        }

        info!(
            poller = ?self.stats.snapshot(),
            publisher = ?self.publisher.stats().snapshot(),
            "Feed poller stopped"
        );
    }
}

/// Splits positions into per-route batches, keeping feed order inside each
/// batch and ordering batches by first appearance.
fn group_by_route(positions: Vec<VehiclePosition>) -> Vec<Vec<VehiclePosition>> {
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut batches: Vec<Vec<VehiclePosition>> = Vec::new();
    for p in positions {
        match index.get(&p.route_id) {
            Some(&i) => batches[i].push(p),
            None => {
                index.insert(p.route_id.clone(), batches.len());
                batches.push(vec![p]);
            }
        }
    }
    batches
}
