//! DataPoint - the universal telemetry record
//!
//! Every component of the gateway exchanges `DataPoint` values: adapters
//! produce them, the rule engine evaluates them, actions re-publish them and
//! sinks consume them. A point carries a typed payload (`Value`), a quality
//! flag and a concurrent tag container.
//!
//! Composite payloads (vectors, matrices, geo locations, colours,
//! time-series) validate their shape on construction and materialise derived
//! values (magnitude, HSV, elevation class, ...) as tags so downstream
//! consumers never recompute them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tags::TagMap;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PointError {
    #[error("Point key must not be empty")]
    EmptyKey,

    #[error("Point device_id must not be empty")]
    EmptyDeviceId,

    #[error("Non-finite number in {0} payload")]
    NonFinite(&'static str),

    #[error("Latitude {0} outside [-90, 90]")]
    LatitudeRange(f64),

    #[error("Longitude {0} outside [-180, 180]")]
    LongitudeRange(f64),

    #[error("Matrix rows have unequal lengths ({0} vs {1})")]
    RaggedMatrix(usize, usize),

    #[error("Time-series timestamp/value length mismatch ({0} vs {1})")]
    SeriesLengthMismatch(usize, usize),

    #[error("Empty {0} payload")]
    EmptyComposite(&'static str),
}

// ============================================================================
// Data Types
// ============================================================================

/// Type tag for a point payload. Rules may filter on this before any
/// condition evaluation happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    Bool,
    String,
    Binary,
    Location,
    Vector3d,
    Color,
    Vector,
    Array,
    Matrix,
    TimeSeries,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Binary => "binary",
            DataType::Location => "location",
            DataType::Vector3d => "vector3d",
            DataType::Color => "color",
            DataType::Vector => "vector",
            DataType::Array => "array",
            DataType::Matrix => "matrix",
            DataType::TimeSeries => "timeseries",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Composite payloads
// ============================================================================

/// Geographic location (WGS-84 degrees, optional elevation in metres).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

impl Location {
    /// Coarse elevation classification, exposed as a derived tag.
    pub fn elevation_category(&self) -> &'static str {
        match self.elevation {
            None => "unknown",
            Some(e) if e < 0.0 => "below_sea_level",
            Some(e) if e < 500.0 => "lowland",
            Some(e) if e < 2000.0 => "highland",
            Some(_) => "mountain",
        }
    }
}

/// Three-component spatial vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3d {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// 8-bit RGB colour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Hue (deg), saturation and value, each as fractions except hue.
    pub fn to_hsv(&self) -> (f64, f64, f64) {
        let r = f64::from(self.r) / 255.0;
        let g = f64::from(self.g) / 255.0;
        let b = f64::from(self.b) / 255.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let hue = if delta.abs() < f64::EPSILON {
            0.0
        } else if (max - r).abs() < f64::EPSILON {
            60.0 * (((g - b) / delta).rem_euclid(6.0))
        } else if (max - g).abs() < f64::EPSILON {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };
        let saturation = if max.abs() < f64::EPSILON { 0.0 } else { delta / max };

        (hue, saturation, max)
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Aligned timestamp/value series carried as a single payload.
///
/// Note: the aggregate action rejects points whose value is itself a series;
/// this type exists for pass-through and sink delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl TimeSeries {
    /// Covered time span in milliseconds (0 for a single sample).
    pub fn span_ms(&self) -> i64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) => (*last - *first).num_milliseconds(),
            _ => 0,
        }
    }
}

// ============================================================================
// Value
// ============================================================================

/// Typed point payload.
///
/// Serialises as a `type` discriminant plus a `value` body, matching the
/// gateway wire contract: `{"type": "float", "value": 21.5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Binary(Vec<u8>),
    Location(Location),
    Vector3d(Vector3d),
    Color(Color),
    Vector(Vec<f64>),
    Array(Vec<serde_json::Value>),
    Matrix(Vec<Vec<f64>>),
    TimeSeries(TimeSeries),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Bool(_) => DataType::Bool,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
            Value::Location(_) => DataType::Location,
            Value::Vector3d(_) => DataType::Vector3d,
            Value::Color(_) => DataType::Color,
            Value::Vector(_) => DataType::Vector,
            Value::Array(_) => DataType::Array,
            Value::Matrix(_) => DataType::Matrix,
            Value::TimeSeries(_) => DataType::TimeSeries,
        }
    }

    /// Scalar numeric view of the payload, if one exists.
    ///
    /// Conditions and the expression engine compare on this; composite
    /// payloads expose their dominant scalar (magnitude, mean, ...).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Vector3d(v) => Some(v.magnitude()),
            Value::Vector(v) if !v.is_empty() => {
                Some(v.iter().map(|x| x * x).sum::<f64>().sqrt())
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for payloads that are themselves sequences. The aggregate action
    /// refuses these.
    pub fn is_sequence(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Matrix(_) | Value::TimeSeries(_)
        )
    }

    /// Validate payload shape. Called from `DataPoint::new`; deserialized
    /// points coming off the wire are re-validated by the bus decoder.
    pub fn validate(&self) -> Result<(), PointError> {
        match self {
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(PointError::NonFinite("float"));
                }
            }
            Value::Location(loc) => {
                if !loc.latitude.is_finite() || !loc.longitude.is_finite() {
                    return Err(PointError::NonFinite("location"));
                }
                if !(-90.0..=90.0).contains(&loc.latitude) {
                    return Err(PointError::LatitudeRange(loc.latitude));
                }
                if !(-180.0..=180.0).contains(&loc.longitude) {
                    return Err(PointError::LongitudeRange(loc.longitude));
                }
                if let Some(e) = loc.elevation {
                    if !e.is_finite() {
                        return Err(PointError::NonFinite("location"));
                    }
                }
            }
            Value::Vector3d(v) => {
                if !v.x.is_finite() || !v.y.is_finite() || !v.z.is_finite() {
                    return Err(PointError::NonFinite("vector3d"));
                }
            }
            Value::Vector(v) => {
                if v.is_empty() {
                    return Err(PointError::EmptyComposite("vector"));
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(PointError::NonFinite("vector"));
                }
            }
            Value::Matrix(rows) => {
                if rows.is_empty() || rows[0].is_empty() {
                    return Err(PointError::EmptyComposite("matrix"));
                }
                let width = rows[0].len();
                for row in rows {
                    if row.len() != width {
                        return Err(PointError::RaggedMatrix(width, row.len()));
                    }
                    if row.iter().any(|x| !x.is_finite()) {
                        return Err(PointError::NonFinite("matrix"));
                    }
                }
            }
            Value::TimeSeries(ts) => {
                if ts.timestamps.len() != ts.values.len() {
                    return Err(PointError::SeriesLengthMismatch(
                        ts.timestamps.len(),
                        ts.values.len(),
                    ));
                }
                if ts.values.is_empty() {
                    return Err(PointError::EmptyComposite("timeseries"));
                }
                if ts.values.iter().any(|x| !x.is_finite()) {
                    return Err(PointError::NonFinite("timeseries"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// DataPoint
// ============================================================================

/// One telemetry record.
///
/// Wire shape: `{key, device_id, timestamp (RFC 3339), type, value, quality,
/// tags?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    /// Metric name within the device
    pub key: String,
    /// Originating device
    pub device_id: String,
    /// UTC acquisition time
    pub timestamp: DateTime<Utc>,
    /// Typed payload (`type` + `value` on the wire)
    #[serde(flatten)]
    pub value: Value,
    /// 0 = good; non-zero degraded. Degraded points still flow.
    #[serde(default)]
    pub quality: i32,
    /// Concurrent tag container, safe under concurrent append/read
    #[serde(default, skip_serializing_if = "TagMap::is_empty")]
    pub tags: TagMap,
}

impl DataPoint {
    /// Build a validated point and materialise derived values as tags.
    pub fn new(
        device_id: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Self, PointError> {
        let key = key.into();
        let device_id = device_id.into();
        if key.is_empty() {
            return Err(PointError::EmptyKey);
        }
        if device_id.is_empty() {
            return Err(PointError::EmptyDeviceId);
        }
        value.validate()?;

        let point = Self {
            key,
            device_id,
            timestamp: Utc::now(),
            value,
            quality: 0,
            tags: TagMap::new(),
        };
        point.materialize_derived_tags();
        Ok(point)
    }

    /// Same as `new` but with an explicit acquisition timestamp.
    pub fn with_timestamp(
        device_id: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, PointError> {
        let mut point = Self::new(device_id, key, value)?;
        point.timestamp = timestamp;
        Ok(point)
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    /// The bus subject this point publishes on.
    pub fn subject(&self) -> String {
        format!("iot.data.{}.{}", self.device_id, self.key)
    }

    /// Compute derived values for composite payloads and store them as tags.
    ///
    /// Derived tags survive the publish/subscribe round-trip because they
    /// travel inside `tags`.
    fn materialize_derived_tags(&self) {
        match &self.value {
            Value::Vector3d(v) => {
                self.tags
                    .insert("derived.magnitude", format!("{:.6}", v.magnitude()));
            }
            Value::Vector(v) => {
                let magnitude = v.iter().map(|x| x * x).sum::<f64>().sqrt();
                self.tags
                    .insert("derived.magnitude", format!("{:.6}", magnitude));
                self.tags.insert("derived.dim", v.len().to_string());
            }
            Value::Color(c) => {
                let (h, s, v) = c.to_hsv();
                self.tags
                    .insert("derived.hsv", format!("{:.1},{:.3},{:.3}", h, s, v));
                self.tags.insert("derived.hex", c.to_hex());
            }
            Value::Location(loc) => {
                self.tags
                    .insert("derived.elevation_category", loc.elevation_category());
            }
            Value::Matrix(rows) => {
                self.tags.insert(
                    "derived.shape",
                    format!("{}x{}", rows.len(), rows[0].len()),
                );
                if let Some(det) = matrix_determinant(rows) {
                    self.tags.insert("derived.determinant", format!("{:.6}", det));
                }
            }
            Value::TimeSeries(ts) => {
                self.tags.insert("derived.samples", ts.values.len().to_string());
                self.tags.insert("derived.span_ms", ts.span_ms().to_string());
            }
            _ => {}
        }
    }
}

/// Determinant for square matrices up to 3x3 (the common sensor shapes).
fn matrix_determinant(rows: &[Vec<f64>]) -> Option<f64> {
    if rows.len() != rows[0].len() {
        return None;
    }
    match rows.len() {
        1 => Some(rows[0][0]),
        2 => Some(rows[0][0] * rows[1][1] - rows[0][1] * rows[1][0]),
        3 => {
            let m = rows;
            Some(
                m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                    - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                    + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]),
            )
        }
        _ => None,
    }
}
