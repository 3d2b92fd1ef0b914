//! Error taxonomy of the pipeline.
//!
//! Only [`ConfigError`] is fatal; every other class is handled by the
//! component that raises it (skip the tick, skip the entity, drop the
//! record, or hold the offset and retry).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Fetching the raw feed failed; the poller skips this tick.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid feed url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("feed request timed out")]
    Timeout,
    #[error("feed endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("feed request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("reading feed file failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status)
        } else {
            FetchError::Http(e)
        }
    }
}

/// The feed payload could not be decoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The envelope itself is unreadable; the whole batch is lost.
    #[error("feed header unreadable: {0}")]
    Header(String),
    #[error("unsupported feed version {found:?} for schema {schema}")]
    UnsupportedVersion { found: String, schema: &'static str },
    /// A single entity is corrupt or incomplete; the rest of the batch survives.
    #[error("entity {entity} rejected: {reason}")]
    Entity { entity: String, reason: String },
}

/// Appending to the stream log failed after the retry budget was spent.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("serializing record for route {route_id} failed: {source}")]
    Serialize {
        route_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("gave up on route {route_id} after {attempts} attempts: {last}")]
    Exhausted {
        route_id: String,
        attempts: u32,
        #[source]
        last: StreamError,
    },
}

/// Transport-level failure talking to the stream log.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("subscription closed")]
    Closed,
}

/// A record violates a permanent invariant; it is dropped and its offset
/// committed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("record for vehicle {vehicle_id:?} is missing {field}")]
    MissingField {
        field: &'static str,
        vehicle_id: String,
    },
    #[error("record for vehicle {vehicle_id:?} has a NUL byte in {field}")]
    InvalidText {
        field: &'static str,
        vehicle_id: String,
    },
    #[error("vehicle {vehicle_id} has invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates {
        vehicle_id: String,
        latitude: f64,
        longitude: f64,
    },
    #[error(
        "vehicle {vehicle_id} timestamp {timestamp} is {skew_seconds}s away from ingestion at {ingested_at}"
    )]
    ClockSkew {
        vehicle_id: String,
        timestamp: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
        skew_seconds: i64,
    },
}

/// The store could not be written. Transient failures hold the offset and
/// the envelope is retried; a [`StoreError::Rejected`] record never fits
/// and is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store pool error: {0}")]
    Pool(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected record ({code}): {reason}")]
    Rejected { code: String, reason: String },
}

impl StoreError {
    /// True when retrying the same record cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::Rejected { .. })
    }
}

/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint
/// violation) depend only on the row being written.
fn is_data_error(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.code() {
            Some(state) if is_data_error(state.code()) => StoreError::Rejected {
                code: state.code().to_string(),
                reason: e.to_string(),
            },
            _ => StoreError::Query(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Invalid start-up configuration. Fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
