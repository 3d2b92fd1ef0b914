use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{PositionStore, UpsertOutcome};
use crate::error::StoreError;
use crate::model::{IdentityKey, StoredRecord};

/// In-process [`PositionStore`] with the same freshness rule as the
/// PostgreSQL store, plus hooks for fault injection and inspection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<IdentityKey, StoredRecord>,
    routes: HashMap<String, (DateTime<Utc>, DateTime<Utc>)>,
    writes: Vec<StoredRecord>,
    attempts: usize,
    fail_next: u32,
    refuse_next: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `n` upserts fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Makes the next `n` upserts fail with [`StoreError::Rejected`], as a
    /// database does for a row it can never accept.
    pub fn refuse_next(&self, n: u32) {
        self.lock().refuse_next = n;
    }

    /// Every row, ordered by identity key.
    pub fn rows(&self) -> Vec<StoredRecord> {
        let state = self.lock();
        let mut rows: Vec<_> = state.rows.values().cloned().collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    pub fn get(&self, key: &IdentityKey) -> Option<StoredRecord> {
        self.lock().rows.get(key).cloned()
    }

    /// Successful inserts and updates, in the order they happened.
    pub fn writes(&self) -> Vec<StoredRecord> {
        self.lock().writes.clone()
    }

    /// Upsert calls, including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// (first_seen, last_seen) of a route.
    pub fn route(&self, route_id: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.lock().routes.get(route_id).copied()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn upsert(&self, record: &StoredRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(StoreError::Rejected {
                code: "22021".to_string(),
                reason: "injected refusal".to_string(),
            });
        }

        let position = &record.position;
        let seen = position.timestamp;
        state
            .routes
            .entry(position.route_id.clone())
            .and_modify(|(first, last)| {
                *first = (*first).min(seen);
                *last = (*last).max(seen);
            })
            .or_insert((seen, seen));

        let key = record.key();
        let outcome = match state.rows.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.position.ingested_at <= position.ingested_at => {
                UpsertOutcome::Updated
            }
            Some(_) => return Ok(UpsertOutcome::Stale),
        };
        state.rows.insert(key, record.clone());
        state.writes.push(record.clone());
        Ok(outcome)
    }
}
