//! CSV export of decoded positions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use tracing::debug;

use crate::model::VehiclePosition;

/// Flat CSV row for a [`VehiclePosition`].
#[derive(Debug, Serialize)]
struct PositionRow<'a> {
    route_id: &'a str,
    vehicle_id: &'a str,
    trip_id: &'a str,
    timestamp: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    bearing: Option<f32>,
    speed: Option<f32>,
    current_stop_sequence: Option<u32>,
    current_status: Option<&'static str>,
    stop_id: Option<&'a str>,
    vehicle_label: Option<&'a str>,
    license_plate: Option<&'a str>,
    wheelchair_accessible: Option<bool>,
    ingested_at: DateTime<Utc>,
}

impl<'a> From<&'a VehiclePosition> for PositionRow<'a> {
    fn from(p: &'a VehiclePosition) -> Self {
        Self {
            route_id: &p.route_id,
            vehicle_id: &p.vehicle_id,
            trip_id: &p.trip_id,
            timestamp: p.timestamp,
            latitude: p.latitude,
            longitude: p.longitude,
            bearing: p.bearing,
            speed: p.speed,
            current_stop_sequence: p.current_stop_sequence,
            current_status: p.current_status.map(|s| s.as_str()),
            stop_id: p.stop_id.as_deref(),
            vehicle_label: p.vehicle_label.as_deref(),
            license_plate: p.license_plate.as_deref(),
            wheelchair_accessible: p.wheelchair_accessible,
            ingested_at: p.ingested_at,
        }
    }
}

/// Appends positions as rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_positions(path: &str, positions: &[VehiclePosition]) -> Result<()> {
    // An empty file has no header yet.
    let file_exists = std::fs::metadata(path).is_ok_and(|m| m.len() > 0);
    debug!(path, file_exists, rows = positions.len(), "Appending CSV rows");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for p in positions {
        writer.serialize(PositionRow::from(p))?;
    }
    writer.flush()?;

    Ok(())
}
