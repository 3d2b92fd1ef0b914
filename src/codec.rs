//! Protobuf codec for GTFS Realtime vehicle-position feeds.
//!
//! The `FeedMessage` envelope is walked one field at a time instead of being
//! decoded in one shot, so a corrupt entity costs only that entity. Only an
//! unreadable header (or framing broken before the header is read) loses
//! the whole batch.

use bytes::Buf;
use chrono::{DateTime, Utc};
use prost::Message;
use prost::encoding::{WireType, decode_key, decode_varint};

use crate::error::DecodeError;
use crate::gtfs_rt::{FeedEntity, FeedHeader, vehicle_descriptor, vehicle_position};
use crate::model::{StopStatus, VehiclePosition};

const HEADER_TAG: u32 = 1;
const ENTITY_TAG: u32 = 2;

/// Which revision of the feed schema the decoder enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SchemaVersion {
    /// GTFS-Realtime 1.x feeds only.
    V1,
    /// GTFS-Realtime 2.x, backwards compatible with 1.x headers.
    #[default]
    V2,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "v1",
            SchemaVersion::V2 => "v2",
        }
    }

    fn accepts(&self, header_version: &str) -> bool {
        let major = header_version.split('.').next().unwrap_or("");
        match self {
            SchemaVersion::V1 => major == "1",
            SchemaVersion::V2 => header_version.is_empty() || major == "1" || major == "2",
        }
    }
}

/// Result of decoding one feed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFeed {
    pub header_version: String,
    pub feed_timestamp: Option<DateTime<Utc>>,
    pub positions: Vec<VehiclePosition>,
    /// Entities that were skipped, one error each.
    pub errors: Vec<DecodeError>,
    /// Entities that carry no vehicle position (trip updates, alerts, deletions).
    pub ignored: usize,
}

/// Turns raw feed bytes into vehicle positions.
///
/// Implementations are pure: the same bytes and ingestion time always give
/// the same [`DecodedFeed`].
pub trait FeedCodec: Send + Sync {
    fn schema(&self) -> SchemaVersion;

    fn decode(&self, bytes: &[u8], ingested_at: DateTime<Utc>)
    -> Result<DecodedFeed, DecodeError>;
}

/// Returns the decoder for the configured schema version.
pub fn codec_for(version: SchemaVersion) -> Box<dyn FeedCodec> {
    Box::new(GtfsRealtimeCodec::new(version))
}

#[derive(Debug, Clone, Copy)]
pub struct GtfsRealtimeCodec {
    version: SchemaVersion,
}

impl GtfsRealtimeCodec {
    pub fn new(version: SchemaVersion) -> Self {
        Self { version }
    }
}

impl FeedCodec for GtfsRealtimeCodec {
    fn schema(&self) -> SchemaVersion {
        self.version
    }

    fn decode(
        &self,
        bytes: &[u8],
        ingested_at: DateTime<Utc>,
    ) -> Result<DecodedFeed, DecodeError> {
        let envelope = split_envelope(bytes)?;
        let header = envelope.header;

        if !self.version.accepts(&header.gtfs_realtime_version) {
            return Err(DecodeError::UnsupportedVersion {
                found: header.gtfs_realtime_version,
                schema: self.version.as_str(),
            });
        }

        let feed_timestamp = header
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(i64::try_from(ts).ok()?, 0));

        let mut decoded = DecodedFeed {
            header_version: header.gtfs_realtime_version.clone(),
            feed_timestamp,
            positions: Vec::with_capacity(envelope.entities.len()),
            errors: envelope.trailing_error.into_iter().collect(),
            ignored: 0,
        };

        for (ordinal, raw) in envelope.entities.into_iter().enumerate() {
            let entity = match FeedEntity::decode(raw) {
                Ok(entity) => entity,
                Err(e) => {
                    decoded.errors.push(DecodeError::Entity {
                        entity: format!("#{ordinal}"),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self.to_position(&entity, feed_timestamp, ingested_at) {
                Ok(Some(position)) => decoded.positions.push(position),
                Ok(None) => decoded.ignored += 1,
                Err(reason) => decoded.errors.push(DecodeError::Entity {
                    entity: if entity.id.is_empty() {
                        format!("#{ordinal}")
                    } else {
                        entity.id.clone()
                    },
                    reason,
                }),
            }
        }

        Ok(decoded)
    }
}

impl GtfsRealtimeCodec {
    fn to_position(
        &self,
        entity: &FeedEntity,
        feed_timestamp: Option<DateTime<Utc>>,
        ingested_at: DateTime<Utc>,
    ) -> Result<Option<VehiclePosition>, String> {
        if entity.is_deleted() {
            return Ok(None);
        }
        let Some(vehicle) = &entity.vehicle else {
            return Ok(None);
        };

        let trip = vehicle.trip.as_ref();
        let trip_id = trip
            .and_then(|t| t.trip_id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "missing trip_id".to_string())?;
        let route_id = trip
            .and_then(|t| t.route_id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "missing route_id".to_string())?;

        let descriptor = vehicle.vehicle.as_ref();
        let vehicle_id = descriptor
            .and_then(|d| d.id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| (!entity.id.is_empty()).then(|| entity.id.clone()))
            .ok_or_else(|| "missing vehicle id".to_string())?;

        let position = vehicle
            .position
            .as_ref()
            .ok_or_else(|| "missing position".to_string())?;
        if !position.latitude.is_finite() || !position.longitude.is_finite() {
            return Err(format!(
                "non-finite coordinates ({}, {})",
                position.latitude, position.longitude
            ));
        }

        let timestamp = match vehicle.timestamp {
            Some(ts) => i64::try_from(ts)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| format!("timestamp {ts} out of range"))?,
            None => feed_timestamp.ok_or_else(|| "missing timestamp".to_string())?,
        };

        let current_status = vehicle.current_status.map(|_| match vehicle.current_status() {
            vehicle_position::VehicleStopStatus::IncomingAt => StopStatus::IncomingAt,
            vehicle_position::VehicleStopStatus::StoppedAt => StopStatus::StoppedAt,
            vehicle_position::VehicleStopStatus::InTransitTo => StopStatus::InTransitTo,
        });

        let wheelchair_accessible = descriptor
            .filter(|d| d.wheelchair_accessible.is_some())
            .and_then(|d| match d.wheelchair_accessible() {
                vehicle_descriptor::WheelchairAccessible::WheelchairAccessible => Some(true),
                vehicle_descriptor::WheelchairAccessible::WheelchairInaccessible => Some(false),
                _ => None,
            });

        Ok(Some(VehiclePosition {
            vehicle_id,
            trip_id,
            route_id,
            latitude: f64::from(position.latitude),
            longitude: f64::from(position.longitude),
            bearing: position.bearing.filter(|b| b.is_finite()),
            speed: position.speed.filter(|v| v.is_finite()),
            timestamp,
            current_stop_sequence: vehicle.current_stop_sequence,
            current_status,
            stop_id: vehicle.stop_id.clone().filter(|s| !s.is_empty()),
            vehicle_label: descriptor.and_then(|d| d.label.clone()).filter(|s| !s.is_empty()),
            license_plate: descriptor
                .and_then(|d| d.license_plate.clone())
                .filter(|s| !s.is_empty()),
            wheelchair_accessible,
            ingested_at,
        }))
    }
}

struct Envelope<'a> {
    header: FeedHeader,
    entities: Vec<&'a [u8]>,
    /// Set when framing broke after the header was read; earlier entities survive.
    trailing_error: Option<DecodeError>,
}

fn split_envelope(bytes: &[u8]) -> Result<Envelope<'_>, DecodeError> {
    let mut buf = bytes;
    let mut header: Option<FeedHeader> = None;
    let mut entities = Vec::new();

    while buf.has_remaining() {
        let field = next_field(&mut buf);
        let (tag, body) = match field {
            Ok(f) => f,
            Err(reason) if header.is_some() => {
                let ordinal = entities.len();
                return Ok(Envelope {
                    header: header.unwrap_or_default(),
                    entities,
                    trailing_error: Some(DecodeError::Entity {
                        entity: format!("#{ordinal}"),
                        reason,
                    }),
                });
            }
            Err(reason) => return Err(DecodeError::Header(reason)),
        };

        match (tag, body) {
            (HEADER_TAG, Some(body)) => {
                let h = header.get_or_insert_with(FeedHeader::default);
                h.merge(body).map_err(|e| DecodeError::Header(e.to_string()))?;
            }
            (ENTITY_TAG, Some(body)) => entities.push(body),
            _ => {}
        }
    }

    let header = header.ok_or_else(|| DecodeError::Header("missing feed header".to_string()))?;
    Ok(Envelope {
        header,
        entities,
        trailing_error: None,
    })
}

/// Reads one top-level field, returning its tag and, for length-delimited
/// fields, the body. Other wire types are skipped.
fn next_field<'a>(buf: &mut &'a [u8]) -> Result<(u32, Option<&'a [u8]>), String> {
    let (tag, wire_type) = decode_key(buf).map_err(|e| e.to_string())?;
    match wire_type {
        WireType::LengthDelimited => {
            let len = decode_varint(buf).map_err(|e| e.to_string())?;
            let len = usize::try_from(len).map_err(|_| "field length overflow".to_string())?;
            if len > buf.len() {
                return Err(format!(
                    "field {tag} truncated: {len} bytes declared, {} available",
                    buf.len()
                ));
            }
            let (body, rest) = buf.split_at(len);
            *buf = rest;
            Ok((tag, Some(body)))
        }
        WireType::Varint => {
            decode_varint(buf).map_err(|e| e.to_string())?;
            Ok((tag, None))
        }
        WireType::SixtyFourBit => skip_fixed(buf, tag, 8),
        WireType::ThirtyTwoBit => skip_fixed(buf, tag, 4),
        WireType::StartGroup | WireType::EndGroup => {
            Err(format!("field {tag} uses unsupported group encoding"))
        }
    }
}

fn skip_fixed<'a>(
    buf: &mut &'a [u8],
    tag: u32,
    width: usize,
) -> Result<(u32, Option<&'a [u8]>), String> {
    if buf.len() < width {
        return Err(format!("field {tag} truncated"));
    }
    buf.advance(width);
    Ok((tag, None))
}
