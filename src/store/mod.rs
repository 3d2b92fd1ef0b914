//! Persistent store of vehicle positions.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, StoreConfig, create_pool};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;
use crate::model::StoredRecord;

/// What an upsert did to the row for the record's identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row came from a fresher ingestion and was left as is.
    Stale,
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts the record, or overwrites the row with the same identity key
    /// when the record is at least as fresh (by `ingested_at`). Also records
    /// the route as seen. Every call is one transaction.
    async fn upsert(&self, record: &StoredRecord) -> Result<UpsertOutcome, StoreError>;
}
