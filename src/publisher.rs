use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{PublishError, StreamError};
use crate::model::VehiclePosition;
use crate::stats::{PublisherStats, incr};
use crate::stream::StreamLog;
use crate::wire;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    pub retry: RetryPolicy,
}

/// Appends position records to the stream log, partitioned by route.
///
/// Shared by reference between concurrent route tasks; a single route must
/// be published from one task at a time to keep its order.
pub struct Publisher {
    log: Arc<dyn StreamLog>,
    config: PublisherConfig,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    pub fn new(log: Arc<dyn StreamLog>, config: PublisherConfig) -> Self {
        Self {
            log,
            config,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        Arc::clone(&self.stats)
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Publishes one record, retrying transient failures. On exhaustion the
    /// record is counted as dropped and the error returned for reporting.
    #[tracing::instrument(
        skip(self, position),
        fields(route_id = %position.route_id, vehicle_id = %position.vehicle_id)
    )]
    pub async fn publish(&self, position: &VehiclePosition) -> Result<u64, PublishError> {
        let payload = wire::encode(position).map_err(|source| {
            incr(&self.stats.dropped);
            PublishError::Serialize {
                route_id: position.route_id.clone(),
                source,
            }
        })?;
        let message_id = position.identity_key().to_string();
        let retry = self.config.retry;

        let mut attempt = 1;
        loop {
            match self
                .log
                .publish(
                    &self.config.topic,
                    &position.route_id,
                    &message_id,
                    payload.clone(),
                )
                .await
            {
                Ok(offset) => {
                    incr(&self.stats.published);
                    debug!(offset, attempt, "Published position");
                    return Ok(offset);
                }
                Err(e) if attempt < retry.max_attempts && is_transient(&e) => {
                    let wait = retry.backoff(attempt);
                    warn!(error = %e, attempt, wait_ms = wait.as_millis() as u64, "Publish failed, retrying");
                    incr(&self.stats.retries);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    incr(&self.stats.dropped);
                    error!(error = %e, attempt, "Dropping position after failed publish");
                    return Err(PublishError::Exhausted {
                        route_id: position.route_id.clone(),
                        attempts: attempt,
                        last: e,
                    });
                }
            }
        }
    }
}

fn is_transient(e: &StreamError) -> bool {
    !matches!(e, StreamError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::position;
    use crate::stream::MemoryStreamLog;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn publisher(log: Arc<MemoryStreamLog>, max_attempts: u32) -> Publisher {
        Publisher::new(
            log,
            PublisherConfig {
                topic: "positions".to_string(),
                retry: fast_retry(max_attempts),
            },
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_publish_uses_route_as_partition_key() {
        let log = Arc::new(MemoryStreamLog::new());
        let publisher = publisher(Arc::clone(&log), 3);

        publisher
            .publish(&position("31", "V1", "T1", 1_700_000_000))
            .await
            .unwrap();

        let envelopes = log.envelopes("positions");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].partition_key, "31");
        assert_eq!(publisher.stats().snapshot().published, 1);
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let log = Arc::new(MemoryStreamLog::new());
        log.fail_next_publishes(2);
        let publisher = publisher(Arc::clone(&log), 3);

        publisher
            .publish(&position("31", "V1", "T1", 1_700_000_000))
            .await
            .unwrap();

        let snap = publisher.stats().snapshot();
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.published, 1);
        assert_eq!(log.envelopes("positions").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_drops_after_exhausting_retries() {
        let log = Arc::new(MemoryStreamLog::new());
        log.fail_next_publishes(5);
        let publisher = publisher(Arc::clone(&log), 3);

        let err = publisher
            .publish(&position("31", "V1", "T1", 1_700_000_000))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Exhausted { attempts: 3, .. }));
        assert_eq!(publisher.stats().snapshot().dropped, 1);
        assert!(log.envelopes("positions").is_empty());
    }
}
