//! # telemetry-types
//!
//! Shared wire and domain structures for the telemetry ingestion platform.
//!
//! These types are used by:
//! - `backend`: ingestion pipeline, detectors, persistence, HTTP/MQTT edges
//! - any future consumer that needs to decode `metric:new` / `anomaly:new`
//!   events off the Socket.IO fanout without re-deriving the wire shape.
//!
//! ## Conventions
//!
//! - All timestamps are UTC, millisecond precision, represented as
//!   `chrono::DateTime<Utc>` in-process and as epoch milliseconds or
//!   RFC 3339 strings on the wire (serde handles both via `chrono`'s serde
//!   feature for struct fields, with explicit epoch-ms conversions where a
//!   transport requires them).
//! - Device location is carried end-to-end as the legacy `"lat:<n>,lng:<n>"`
//!   string for wire compatibility, but stored as two numeric columns — see
//!   [`Location`].

use serde::{Deserialize, Serialize, Serializer};

// ─── Device ────────────────────────────────────────────────────────────────

/// Numeric lat/lng pair. The wire/legacy representation is the single
/// string `"lat:<lat>,lng:<lng>"`; see [`Location::to_legacy_string`] and
/// [`Location::parse_legacy_string`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn to_legacy_string(&self) -> String {
        format!("lat:{},lng:{}", self.lat, self.lng)
    }

    /// Parse the legacy `"lat:<n>,lng:<n>"` wire format. Returns `None` if
    /// the string doesn't match — callers fall back to treating the value
    /// as free-text.
    pub fn parse_legacy_string(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("lat:")?;
        let (lat_str, rest) = rest.split_once(",lng:")?;
        let lat = lat_str.parse().ok()?;
        let lng = rest.parse().ok()?;
        Some(Self { lat, lng })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Rendered on the wire as the legacy `"lat:<n>,lng:<n>"` string (spec
    /// §9) even though it's stored and carried in-process as two numeric
    /// fields.
    #[serde(
        serialize_with = "serialize_location_legacy",
        skip_serializing_if = "Option::is_none"
    )]
    pub location: Option<Location>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "_count", skip_serializing_if = "Option::is_none")]
    pub counts: Option<DeviceCounts>,
}

fn serialize_location_legacy<S: Serializer>(
    location: &Option<Location>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match location {
        Some(location) => serializer.serialize_str(&location.to_legacy_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceCounts {
    pub metrics: i64,
    pub anomalies: i64,
}

// ─── Point ─────────────────────────────────────────────────────────────────

/// The four scalar measurements carried by every point.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature_c: f64,
    pub vibration_g: f64,
    pub humidity_pct: f64,
    pub voltage_v: f64,
}

impl Measurements {
    /// Iterate the four metrics in a fixed, stable order — used by detectors
    /// that treat the measurement as a 4-vector.
    pub fn as_array(&self) -> [f64; 4] {
        [self.temperature_c, self.vibration_g, self.humidity_pct, self.voltage_v]
    }

    pub fn has_non_finite(&self) -> bool {
        self.as_array().iter().any(|v| !v.is_finite())
    }
}

/// A point as submitted by an edge, before the pipeline assigns it an
/// arrival order or a server timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct PointInput {
    /// Client-supplied timestamp; filled with the accept-time server clock
    /// if absent.
    #[serde(default)]
    pub ts: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

/// A point after the pipeline has accepted and ordered it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub id: uuid::Uuid,
    pub device_id: String,
    /// Monotonic arrival order assigned by the per-device pipeline worker.
    pub arrival_seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

// ─── Anomaly ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorTag {
    Zscore,
    MedianDeviation,
    External,
}

impl DetectorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zscore => "zscore",
            Self::MedianDeviation => "median-deviation",
            Self::External => "external",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "zscore" => Some(Self::Zscore),
            "median-deviation" => Some(Self::MedianDeviation),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub id: uuid::Uuid,
    pub device_id: String,
    /// Null if the referenced point had already been dropped before the
    /// anomaly record was committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_id: Option<uuid::Uuid>,
    pub score: f64,
    #[serde(rename = "type")]
    pub detector: DetectorTag,
    pub flagged: bool,
    pub ts: chrono::DateTime<chrono::Utc>,
}

// ─── Scoring ───────────────────────────────────────────────────────────────

/// One detector result, positionally aligned to the batch it scored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreResult {
    pub point_index: usize,
    pub score: f64,
    pub is_anomaly: bool,
}

// ─── Pub/sub events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BusEvent {
    #[serde(rename = "metric:new")]
    MetricNew { device_id: String, metric: Point },
    #[serde(rename = "anomaly:new")]
    AnomalyNew { device_id: String, anomaly: Anomaly },
    #[serde(rename = "device:update")]
    DeviceUpdate { device_id: String, device: Device },
}

impl BusEvent {
    /// The per-device topic this event belongs to, in addition to the
    /// always-subscribed firehose.
    pub fn device_id(&self) -> &str {
        match self {
            Self::MetricNew { device_id, .. } => device_id,
            Self::AnomalyNew { device_id, .. } => device_id,
            Self::DeviceUpdate { device_id, .. } => device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MetricNew { .. } => "metric:new",
            Self::AnomalyNew { .. } => "anomaly:new",
            Self::DeviceUpdate { .. } => "device:update",
        }
    }
}

// ─── Pagination ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    1000
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_location_round_trips() {
        let loc = Location { lat: 37.3, lng: -121.9 };
        let s = loc.to_legacy_string();
        assert_eq!(s, "lat:37.3,lng:-121.9");
        let parsed = Location::parse_legacy_string(&s).unwrap();
        assert_eq!(parsed.lat, loc.lat);
        assert_eq!(parsed.lng, loc.lng);
    }

    #[test]
    fn legacy_location_rejects_garbage() {
        assert!(Location::parse_legacy_string("San Jose warehouse").is_none());
    }

    #[test]
    fn device_wire_format_renders_legacy_location_string() {
        let device = Device {
            id: "dev42".to_string(),
            name: "dev42".to_string(),
            location: Some(Location { lat: 37.3, lng: -121.9 }),
            created_at: chrono::Utc::now(),
            counts: None,
        };
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["location"], serde_json::json!("lat:37.3,lng:-121.9"));
    }

    #[test]
    fn device_wire_format_omits_missing_location() {
        let device = Device {
            id: "dev42".to_string(),
            name: "dev42".to_string(),
            location: None,
            created_at: chrono::Utc::now(),
            counts: None,
        };
        let value = serde_json::to_value(&device).unwrap();
        assert!(value.get("location").is_none());
    }

    #[test]
    fn device_wire_format_uses_camel_case_keys() {
        let device = Device {
            id: "dev42".to_string(),
            name: "dev42".to_string(),
            location: None,
            created_at: chrono::Utc::now(),
            counts: Some(DeviceCounts { metrics: 3, anomalies: 1 }),
        };
        let value = serde_json::to_value(&device).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(value.get("created_at").is_none());
        assert_eq!(value["_count"]["metrics"], 3);
        assert_eq!(value["_count"]["anomalies"], 1);
    }

    #[test]
    fn point_wire_format_uses_camel_case_keys() {
        let point = Point {
            id: uuid::Uuid::new_v4(),
            device_id: "dev42".to_string(),
            arrival_seq: 7,
            ts: chrono::Utc::now(),
            measurements: Measurements::default(),
        };
        let value = serde_json::to_value(&point).unwrap();
        assert!(value.get("deviceId").is_some());
        assert!(value.get("arrivalSeq").is_some());
        assert!(value.get("device_id").is_none());
        // Measurements are flattened in and keep their own snake_case names.
        assert!(value.get("temperature_c").is_some());
    }

    #[test]
    fn anomaly_wire_format_uses_camel_case_keys() {
        let anomaly = Anomaly {
            id: uuid::Uuid::new_v4(),
            device_id: "dev42".to_string(),
            point_id: Some(uuid::Uuid::new_v4()),
            score: 4.2,
            detector: DetectorTag::Zscore,
            flagged: true,
            ts: chrono::Utc::now(),
        };
        let value = serde_json::to_value(&anomaly).unwrap();
        assert!(value.get("deviceId").is_some());
        assert!(value.get("pointId").is_some());
        assert_eq!(value["type"], "zscore");
    }

    #[test]
    fn bus_event_wire_format_uses_camel_case_device_id() {
        let event = BusEvent::DeviceUpdate {
            device_id: "dev42".to_string(),
            device: Device {
                id: "dev42".to_string(),
                name: "dev42".to_string(),
                location: None,
                created_at: chrono::Utc::now(),
                counts: None,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "device:update");
        assert!(value.get("deviceId").is_some());
    }

    #[test]
    fn measurements_detect_non_finite() {
        let mut m = Measurements::default();
        assert!(!m.has_non_finite());
        m.vibration_g = f64::NAN;
        assert!(m.has_non_finite());
    }

    #[test]
    fn detector_tag_wire_names() {
        assert_eq!(DetectorTag::Zscore.as_str(), "zscore");
        assert_eq!(DetectorTag::MedianDeviation.as_str(), "median-deviation");
        assert_eq!(DetectorTag::External.as_str(), "external");
    }

    #[test]
    fn detector_tag_round_trips_through_str() {
        for tag in [DetectorTag::Zscore, DetectorTag::MedianDeviation, DetectorTag::External] {
            assert_eq!(DetectorTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(DetectorTag::parse("bogus"), None);
    }
}
