//! Vehicle-position records as they move through the pipeline.
//!
//! A [`VehiclePosition`] is produced by the codec, carried on the stream
//! log as JSON, validated and normalized by the consumer, and finally
//! persisted as a [`StoredRecord`].

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::ValidationError;

/// Where a vehicle is relative to its current stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopStatus {
    IncomingAt,
    StoppedAt,
    InTransitTo,
}

impl StopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopStatus::IncomingAt => "INCOMING_AT",
            StopStatus::StoppedAt => "STOPPED_AT",
            StopStatus::InTransitTo => "IN_TRANSIT_TO",
        }
    }
}

/// A single observed position of a transit vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f32>,
    /// Metres per second, as reported by the feed.
    pub speed: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<StopStatus>,
    pub stop_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub license_plate: Option<String>,
    pub wheelchair_accessible: Option<bool>,
    /// When the poller fetched the batch this record came from.
    pub ingested_at: DateTime<Utc>,
}

impl VehiclePosition {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            vehicle_id: self.vehicle_id.clone(),
            trip_id: self.trip_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Hash of everything except `ingested_at`, so that a re-fetch of an
    /// unchanged report fingerprints the same as the original.
    pub fn content_fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.vehicle_id.hash(&mut h);
        self.trip_id.hash(&mut h);
        self.route_id.hash(&mut h);
        self.latitude.to_bits().hash(&mut h);
        self.longitude.to_bits().hash(&mut h);
        self.bearing.map(f32::to_bits).hash(&mut h);
        self.speed.map(f32::to_bits).hash(&mut h);
        self.timestamp.hash(&mut h);
        self.current_stop_sequence.hash(&mut h);
        self.current_status.hash(&mut h);
        self.stop_id.hash(&mut h);
        self.vehicle_label.hash(&mut h);
        self.license_plate.hash(&mut h);
        self.wheelchair_accessible.hash(&mut h);
        h.finish()
    }

    /// First text field holding a NUL byte, which the store cannot keep.
    fn field_with_nul(&self) -> Option<&'static str> {
        let fields = [
            ("vehicle_id", Some(&self.vehicle_id)),
            ("trip_id", Some(&self.trip_id)),
            ("route_id", Some(&self.route_id)),
            ("stop_id", self.stop_id.as_ref()),
            ("vehicle_label", self.vehicle_label.as_ref()),
            ("license_plate", self.license_plate.as_ref()),
        ];
        fields
            .into_iter()
            .find(|(_, value)| value.is_some_and(|v| v.contains('\0')))
            .map(|(name, _)| name)
    }

    /// Enforces the record invariants and brings the timestamp into its
    /// canonical form (UTC, whole seconds).
    pub fn validate(mut self, max_skew: Duration) -> Result<Self, ValidationError> {
        if self.route_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "route_id",
                vehicle_id: self.vehicle_id,
            });
        }
        if self.vehicle_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "vehicle_id",
                vehicle_id: self.vehicle_id,
            });
        }
        if self.trip_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "trip_id",
                vehicle_id: self.vehicle_id,
            });
        }
        if let Some(field) = self.field_with_nul() {
            return Err(ValidationError::InvalidText {
                field,
                vehicle_id: self.vehicle_id,
            });
        }
        if !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || !(-90.0..=90.0).contains(&self.latitude)
            || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(ValidationError::InvalidCoordinates {
                vehicle_id: self.vehicle_id,
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }

        self.timestamp = normalize_timestamp(self.timestamp);
        let skew = (self.timestamp - self.ingested_at).abs();
        if skew > max_skew {
            return Err(ValidationError::ClockSkew {
                vehicle_id: self.vehicle_id,
                timestamp: self.timestamp,
                ingested_at: self.ingested_at,
                skew_seconds: skew.num_seconds(),
            });
        }

        Ok(self)
    }
}

/// Canonical time representation for stored records: UTC, truncated to
/// whole seconds (the feed's own resolution).
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Dedup and upsert identity of a position report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub vehicle_id: String,
    pub trip_id: String,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.vehicle_id,
            self.trip_id,
            self.timestamp.timestamp()
        )
    }
}

/// Route identifiers whose records never reach the store.
///
/// Fixed at start-up and shared read-only by every consumer worker.
#[derive(Debug, Clone, Default)]
pub struct ExcludedRoutes(HashSet<String>);

impl ExcludedRoutes {
    pub fn new<I, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            routes
                .into_iter()
                .map(Into::into)
                .map(|r: String| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, route_id: &str) -> bool {
        self.0.contains(route_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The row written by the upserter.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub position: VehiclePosition,
    /// Stream log offset of the envelope that produced this write.
    pub source_sequence: Option<u64>,
}

impl StoredRecord {
    pub fn key(&self) -> IdentityKey {
        self.position.identity_key()
    }
}
