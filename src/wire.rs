//! JSON representation of a position record on the stream log.
//!
//! Producers always write RFC 3339 timestamps and named enum values.
//! Readers are lenient: older producers wrote `YYYY-MM-DD HH:MM:SS` without
//! an offset (taken as UTC) or plain epoch seconds, stop status and
//! wheelchair access as raw GTFS-Realtime enum numbers, and no
//! `ingested_at`, which then falls back to the time the record was received.
//! Their `speed` is in km/h and is read as is.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

use crate::model::{StopStatus, VehiclePosition};

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A position record as found on the log, before validation.
///
/// Identity fields are optional here so that a record missing one still
/// parses and can be rejected by validation rather than treated as poison.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionMessage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub vehicle_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub trip_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub bearing: Option<f32>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_stop_sequence: Option<u32>,
    #[serde(default, deserialize_with = "lenient_stop_status")]
    pub current_status: Option<StopStatus>,
    #[serde(default)]
    pub stop_id: Option<String>,
    #[serde(default)]
    pub vehicle_label: Option<String>,
    #[serde(default)]
    pub license_plate: Option<String>,
    #[serde(default, deserialize_with = "lenient_wheelchair")]
    pub wheelchair_accessible: Option<bool>,
    #[serde(default, deserialize_with = "lenient_optional_timestamp")]
    pub ingested_at: Option<DateTime<Utc>>,
}

impl PositionMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn into_position(self, received_at: DateTime<Utc>) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: self.vehicle_id,
            trip_id: self.trip_id,
            route_id: self.route_id,
            latitude: self.latitude,
            longitude: self.longitude,
            bearing: self.bearing,
            speed: self.speed,
            timestamp: self.timestamp,
            current_stop_sequence: self.current_stop_sequence,
            current_status: self.current_status,
            stop_id: self.stop_id,
            vehicle_label: self.vehicle_label,
            license_plate: self.license_plate,
            wheelchair_accessible: self.wheelchair_accessible,
            ingested_at: self.ingested_at.unwrap_or(received_at),
        }
    }
}

/// Serializes a record for the stream log.
pub fn encode(position: &VehiclePosition) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(position).map(Bytes::from)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

fn parse_timestamp<E: serde::de::Error>(raw: RawTimestamp) -> Result<DateTime<Utc>, E> {
    match raw {
        RawTimestamp::Epoch(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| E::custom(format!("epoch seconds out of range: {secs}"))),
        RawTimestamp::Text(text) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
                return Ok(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(&text, NAIVE_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(|_| E::custom(format!("unrecognized timestamp {text:?}")))
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    parse_timestamp(RawTimestamp::deserialize(deserializer)?)
}

fn lenient_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawTimestamp>::deserialize(deserializer)?
        .map(parse_timestamp)
        .transpose()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStopStatus {
    Named(StopStatus),
    Number(i64),
}

fn lenient_stop_status<'de, D>(deserializer: D) -> Result<Option<StopStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<RawStopStatus>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawStopStatus::Named(status)) => Ok(Some(status)),
        Some(RawStopStatus::Number(0)) => Ok(Some(StopStatus::IncomingAt)),
        Some(RawStopStatus::Number(1)) => Ok(Some(StopStatus::StoppedAt)),
        Some(RawStopStatus::Number(2)) => Ok(Some(StopStatus::InTransitTo)),
        Some(RawStopStatus::Number(n)) => Err(D::Error::custom(format!("unknown stop status {n}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWheelchair {
    Flag(bool),
    Number(i64),
}

/// GTFS-Realtime numbers: 2 is accessible, 3 inaccessible, 0 and 1 unknown.
fn lenient_wheelchair<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawWheelchair>::deserialize(deserializer)? {
        Some(RawWheelchair::Flag(flag)) => Some(flag),
        Some(RawWheelchair::Number(2)) => Some(true),
        Some(RawWheelchair::Number(3)) => Some(false),
        Some(RawWheelchair::Number(_)) | None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::position;

    #[test]
    fn test_encoded_record_parses_back() {
        let p = position("31", "V1", "T1", 1_700_000_000);
        let bytes = encode(&p).unwrap();
        let parsed = PositionMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.into_position(Utc::now()), p);
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let json = r#"{"vehicle_id":"V1","trip_id":"T1","route_id":"31",
            "latitude":47.5,"longitude":19.0,"timestamp":"2023-11-14 22:13:20"}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
        assert!(msg.ingested_at.is_none());
    }

    #[test]
    fn test_epoch_timestamp_and_missing_ingestion_time() {
        let json = r#"{"vehicle_id":"V1","trip_id":"T1","route_id":"31",
            "latitude":47.5,"longitude":19.0,"timestamp":1700000000}"#;
        let received = Utc.timestamp_opt(1_700_000_030, 0).unwrap();
        let p = PositionMessage::parse(json.as_bytes())
            .unwrap()
            .into_position(received);
        assert_eq!(p.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(p.ingested_at, received);
        assert_eq!(p.current_status, None);
    }

    #[test]
    fn test_missing_route_still_parses() {
        let json = r#"{"vehicle_id":"V1","trip_id":"T1",
            "latitude":47.5,"longitude":19.0,"timestamp":"2023-11-14T22:13:20Z"}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.route_id, "");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(PositionMessage::parse(b"not json").is_err());
        let bad_ts = r#"{"latitude":1.0,"longitude":1.0,"timestamp":"yesterday"}"#;
        assert!(PositionMessage::parse(bad_ts.as_bytes()).is_err());
    }

    #[test]
    fn test_legacy_collector_record() {
        // json.dumps output of the Python collector.
        let json = r#"{"trip_id": "C01234567", "route_id": "3040", "latitude": 47.49790954589844, "longitude": 19.040199279785156, "bearing": 270.0, "speed": 30.600000381469727, "current_stop_sequence": 12, "current_status": 2, "timestamp": "2023-11-14 22:13:20", "stop_id": "F02297", "vehicle_id": "BKV_4021", "vehicle_label": "4021", "license_plate": "NLE-435", "wheelchair_accessible": 2}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        let received = Utc.timestamp_opt(1_700_000_030, 0).unwrap();
        let p = msg.into_position(received);

        assert_eq!(p.route_id, "3040");
        assert_eq!(p.current_status, Some(StopStatus::InTransitTo));
        assert_eq!(p.wheelchair_accessible, Some(true));
        assert_eq!(p.current_stop_sequence, Some(12));
        assert_eq!(p.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(p.ingested_at, received);
    }

    #[test]
    fn test_numeric_enum_edges() {
        let json = r#"{"vehicle_id":"V1","trip_id":"T1","route_id":"31",
            "latitude":47.5,"longitude":19.0,"timestamp":1700000000,
            "current_status":0,"wheelchair_accessible":3}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.current_status, Some(StopStatus::IncomingAt));
        assert_eq!(msg.wheelchair_accessible, Some(false));

        let json = r#"{"vehicle_id":"V1","trip_id":"T1","route_id":"31",
            "latitude":47.5,"longitude":19.0,"timestamp":1700000000,
            "current_status":"STOPPED_AT","wheelchair_accessible":1}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.current_status, Some(StopStatus::StoppedAt));
        assert_eq!(msg.wheelchair_accessible, None);
    }

    #[test]
    fn test_null_identity_fields_reach_validation() {
        let json = r#"{"vehicle_id":"V1","trip_id":"T1","route_id":null,
            "latitude":47.5,"longitude":19.0,"timestamp":1700000000}"#;
        let msg = PositionMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.route_id, "");
        let p = msg.into_position(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert!(matches!(
            p.validate(chrono::Duration::hours(1)),
            Err(crate::error::ValidationError::MissingField { field: "route_id", .. })
        ));
    }
}
