//! Command-line and environment settings, and their conversion into the
//! typed configs each component is built from.

use std::time::Duration;

use clap::Args;

use crate::codec::SchemaVersion;
use crate::consumer::ConsumerConfig;
use crate::error::ConfigError;
use crate::fetch::FeedAuth;
use crate::model::ExcludedRoutes;
use crate::poller::PollerConfig;
use crate::publisher::{PublisherConfig, RetryPolicy};
use crate::store::StoreConfig;

#[derive(Args, Debug, Clone)]
pub struct FeedArgs {
    /// GTFS-Realtime vehicle positions endpoint
    #[arg(long, env = "FEED_URL")]
    pub feed_url: Option<String>,

    /// API key for the feed endpoint
    #[arg(long, env = "FEED_API_KEY", hide_env_values = true)]
    pub feed_api_key: Option<String>,

    /// Query parameter that carries the API key
    #[arg(long, env = "FEED_API_KEY_PARAM", default_value = "key")]
    pub feed_api_key_param: String,

    /// Send the API key in this header instead of the query string
    #[arg(long, env = "FEED_API_KEY_HEADER")]
    pub feed_api_key_header: Option<String>,

    #[arg(long, env = "FEED_SCHEMA", value_enum, default_value_t = SchemaVersion::V2)]
    pub feed_schema: SchemaVersion,

    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 10)]
    pub poll_interval_seconds: u64,

    #[arg(long, env = "FETCH_TIMEOUT_SECONDS", default_value_t = 15)]
    pub fetch_timeout_seconds: u64,

    /// Routes published at the same time within one tick
    #[arg(long, env = "PUBLISH_CONCURRENCY", default_value_t = 8)]
    pub publish_concurrency: usize,

    #[arg(long, env = "PUBLISH_MAX_RETRIES", default_value_t = 5)]
    pub publish_max_retries: u32,
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[arg(long, env = "TOPIC_NAME", default_value = "vehicle-data")]
    pub topic_name: String,

    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Hours the stream log keeps records
    #[arg(long, env = "RETENTION_HOURS", default_value_t = 24)]
    pub retention_hours: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "STORE_DSN", hide_env_values = true)]
    pub store_dsn: Option<String>,

    #[arg(long, env = "STORE_POOL_SIZE", default_value_t = 8)]
    pub store_pool_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ConsumerArgs {
    /// Consumer group; restarts resume from its committed position
    #[arg(long, env = "CONSUMER_NAME", default_value = "vehicle-data-group")]
    pub consumer_name: String,

    /// Comma-separated route ids that are never stored
    #[arg(long, env = "EXCLUDED_ROUTES", value_delimiter = ',', default_value = "9999")]
    pub excluded_routes: Vec<String>,

    #[arg(long, env = "CONSUMER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "DEDUP_CAPACITY", default_value_t = 100_000)]
    pub dedup_capacity: usize,

    #[arg(long, env = "MAX_CLOCK_SKEW_SECONDS", default_value_t = 3600)]
    pub max_clock_skew_seconds: u64,
}

impl FeedArgs {
    pub fn feed_url(&self) -> Result<String, ConfigError> {
        let url = self
            .feed_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("FEED_URL"))?;
        reqwest::Url::parse(url).map_err(|e| ConfigError::Invalid {
            name: "feed-url",
            reason: e.to_string(),
        })?;
        Ok(url.to_string())
    }

    pub fn auth(&self) -> FeedAuth {
        let Some(key) = self.feed_api_key.clone().filter(|k| !k.is_empty()) else {
            return FeedAuth::None;
        };
        match &self.feed_api_key_header {
            Some(header) if !header.is_empty() => FeedAuth::Header {
                name: header.clone(),
                key,
            },
            _ => FeedAuth::UrlParam {
                name: self.feed_api_key_param.clone(),
                key,
            },
        }
    }

    pub fn fetch_timeout(&self) -> Result<Duration, ConfigError> {
        positive_secs("fetch-timeout-seconds", self.fetch_timeout_seconds)
    }

    pub fn poller_config(&self) -> Result<PollerConfig, ConfigError> {
        if self.publish_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "publish-concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(PollerConfig {
            feed_url: self.feed_url()?,
            interval: positive_secs("poll-interval-seconds", self.poll_interval_seconds)?,
            publish_concurrency: self.publish_concurrency,
        })
    }

    pub fn publisher_config(&self, stream: &StreamArgs) -> Result<PublisherConfig, ConfigError> {
        Ok(PublisherConfig {
            topic: stream.topic()?,
            retry: RetryPolicy {
                max_attempts: self.publish_max_retries.saturating_add(1),
                ..RetryPolicy::default()
            },
        })
    }
}

impl StreamArgs {
    pub fn topic(&self) -> Result<String, ConfigError> {
        let topic = self.topic_name.trim();
        if topic.is_empty() || topic.contains(&['*', '>', ' '][..]) {
            return Err(ConfigError::Invalid {
                name: "topic-name",
                reason: format!("{topic:?} is not a usable topic name"),
            });
        }
        Ok(topic.to_string())
    }

    pub fn retention(&self) -> Result<Duration, ConfigError> {
        positive_secs("retention-hours", self.retention_hours.saturating_mul(3600))
    }
}

impl StoreArgs {
    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        let dsn = self
            .store_dsn
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(ConfigError::Missing("STORE_DSN"))?;
        if self.store_pool_size == 0 {
            return Err(ConfigError::Invalid {
                name: "store-pool-size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(StoreConfig {
            dsn: dsn.to_string(),
            pool_size: self.store_pool_size,
        })
    }
}

impl ConsumerArgs {
    pub fn consumer_config(&self, stream: &StreamArgs) -> Result<ConsumerConfig, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        let group = self.consumer_name.trim();
        if group.is_empty() || group.contains(&['.', '*', '>', ' '][..]) {
            return Err(ConfigError::Invalid {
                name: "consumer-name",
                reason: format!("{group:?} is not a usable consumer name"),
            });
        }
        let max_clock_skew = i64::try_from(self.max_clock_skew_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| ConfigError::Invalid {
                name: "max-clock-skew-seconds",
                reason: "too large".to_string(),
            })?;

        Ok(ConsumerConfig {
            topic: stream.topic()?,
            group: group.to_string(),
            workers: self.workers,
            excluded: ExcludedRoutes::new(self.excluded_routes.iter().map(String::as_str)),
            max_clock_skew,
            dedup_capacity: self.dedup_capacity.max(1),
            ..ConsumerConfig::default()
        })
    }
}

fn positive_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        consumer: ConsumerArgs,
    }

    fn parse(args: &[&str]) -> TestCli {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--feed-url", "https://example.com/vehicles.pb"]);
        let poller = cli.feed.poller_config().unwrap();
        assert_eq!(poller.interval, Duration::from_secs(10));
        assert_eq!(cli.feed.feed_schema, SchemaVersion::V2);

        let publisher = cli.feed.publisher_config(&cli.stream).unwrap();
        assert_eq!(publisher.topic, "vehicle-data");
        assert_eq!(publisher.retry.max_attempts, 6);

        let consumer = cli.consumer.consumer_config(&cli.stream).unwrap();
        assert_eq!(consumer.group, "vehicle-data-group");
        assert!(consumer.excluded.contains("9999"));
        assert_eq!(consumer.max_clock_skew, chrono::Duration::hours(1));
    }

    #[test]
    fn test_excluded_routes_list() {
        let cli = parse(&["--excluded-routes", "9999, 0000,"]);
        let consumer = cli.consumer.consumer_config(&cli.stream).unwrap();
        assert_eq!(consumer.excluded.len(), 2);
        assert!(consumer.excluded.contains("0000"));
    }

    #[test]
    fn test_missing_feed_url() {
        let cli = parse(&[]);
        assert!(matches!(
            cli.feed.poller_config(),
            Err(ConfigError::Missing("FEED_URL"))
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cli = parse(&["--feed-url", "not a url"]);
        assert!(matches!(
            cli.feed.feed_url(),
            Err(ConfigError::Invalid { name: "feed-url", .. })
        ));

        let cli = parse(&["--feed-url", "https://x.test/", "--poll-interval-seconds", "0"]);
        assert!(cli.feed.poller_config().is_err());

        let cli = parse(&["--workers", "0"]);
        assert!(cli.consumer.consumer_config(&cli.stream).is_err());

        let cli = parse(&["--topic-name", "a>b"]);
        assert!(cli.stream.topic().is_err());

        let cli = parse(&["--store-dsn", "postgres://localhost/db", "--store-pool-size", "0"]);
        assert!(cli.store.store_config().is_err());
    }

    #[test]
    fn test_auth_selection() {
        let cli = parse(&["--feed-api-key", "secret"]);
        assert_eq!(
            cli.feed.auth(),
            FeedAuth::UrlParam {
                name: "key".to_string(),
                key: "secret".to_string()
            }
        );

        let cli = parse(&["--feed-api-key", "secret", "--feed-api-key-header", "x-api-key"]);
        assert!(matches!(cli.feed.auth(), FeedAuth::Header { .. }));

        let cli = parse(&[]);
        assert_eq!(cli.feed.auth(), FeedAuth::None);
    }
}
