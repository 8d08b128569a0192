//! The `Point` data model (§3).
//!
//! A `Point` is created by an adapter, handed off by value through channels,
//! and is read-only after publication except for its tag map, which is the
//! only concurrent-write surface (see [`crate::tagmap::ShardedTagMap`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tagmap::ShardedTagMap;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),
}

/// Shared contract for composite values: dimensions agree, ranges hold.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub heading: f64,
}

impl Validate for Location {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::Invalid(format!(
                "latitude {} out of range [-90, 90]",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::Invalid(format!(
                "longitude {} out of range [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Vector3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Validate for Vector3D {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.x.is_nan() || self.y.is_nan() || self.z.is_nan() {
            return Err(ValidationError::Invalid("vector3d contains NaN".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Validate for Color {
    fn validate(&self) -> Result<(), ValidationError> {
        for (name, v) in [("r", self.r), ("g", self.g), ("b", self.b), ("a", self.a)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ValidationError::Invalid(format!(
                    "color component {name}={v} out of range [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Validate for Matrix {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.data.len() != self.rows * self.cols {
            return Err(ValidationError::Invalid(format!(
                "matrix dimensions {}x{} don't match data length {}",
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(())
    }
}

impl Matrix {
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeries {
    pub values: Vec<f64>,
    /// Seconds between samples.
    pub interval_secs: f64,
}

impl Validate for TimeSeries {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_secs < 0.0 {
            return Err(ValidationError::Invalid("negative timeseries interval".into()));
        }
        Ok(())
    }
}

/// The typed union of everything a `Point`'s value can hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Location(Location),
    Vector3D(Vector3D),
    Vector(Vec<f64>),
    Color(Color),
    Array(Vec<Value>),
    Matrix(Matrix),
    TimeSeries(TimeSeries),
}

impl Value {
    pub fn point_type(&self) -> PointType {
        match self {
            Value::Int(_) => PointType::Int,
            Value::Float(_) => PointType::Float,
            Value::Bool(_) => PointType::Bool,
            Value::String(_) => PointType::String,
            Value::Location(_) => PointType::Location,
            Value::Vector3D(_) => PointType::Vector3D,
            Value::Vector(_) => PointType::Vector,
            Value::Color(_) => PointType::Color,
            Value::Array(_) => PointType::Array,
            Value::Matrix(_) => PointType::Matrix,
            Value::TimeSeries(_) => PointType::TimeSeries,
        }
    }

    /// Best-effort numeric coercion, used throughout the expression engine
    /// and operator comparisons (§4.G).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
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

    /// Validates composite shapes; scalar types are always valid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Value::Location(l) => l.validate(),
            Value::Vector3D(v) => v.validate(),
            Value::Color(c) => c.validate(),
            Value::Matrix(m) => m.validate(),
            Value::TimeSeries(t) => t.validate(),
            Value::Array(items) => items.iter().try_for_each(Value::validate),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::String(_) | Value::Vector(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Int,
    Float,
    Bool,
    String,
    Location,
    Vector3D,
    Vector,
    Color,
    Array,
    Matrix,
    TimeSeries,
}

impl std::fmt::Display for PointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PointType::Int => "int",
            PointType::Float => "float",
            PointType::Bool => "bool",
            PointType::String => "string",
            PointType::Location => "location",
            PointType::Vector3D => "vector3d",
            PointType::Vector => "vector",
            PointType::Color => "color",
            PointType::Array => "array",
            PointType::Matrix => "matrix",
            PointType::TimeSeries => "timeseries",
        };
        f.write_str(s)
    }
}

/// A single timestamped device sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub device_id: String,
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub quality: i32,
    pub tags: ShardedTagMap,
}

impl Point {
    pub fn new(device_id: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            device_id: device_id.into(),
            key: key.into(),
            value,
            timestamp: Utc::now(),
            quality: 100,
            tags: ShardedTagMap::new(),
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = quality;
        self
    }

    pub fn point_type(&self) -> PointType {
        self.value.point_type()
    }

    /// `type` invariant check: the runtime shape of `value` validates, per
    /// each composite type's own `Validate` contract.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.value.validate()
    }

    /// Bus subject for per-sample routing: `iot.data.<device>.<key>`.
    pub fn data_subject(&self) -> String {
        format!("iot.data.{}.{}", self.device_id, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_location_range() {
        let bad = Location {
            latitude: 200.0,
            longitude: 0.0,
            altitude: 0.0,
            accuracy: 0.0,
            speed: 0.0,
            heading: 0.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn matrix_dimension_mismatch_rejected() {
        let m = Matrix {
            rows: 2,
            cols: 2,
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn point_type_matches_value() {
        let p = Point::new("d1", "temp", Value::Float(35.0));
        assert_eq!(p.point_type(), PointType::Float);
        assert_eq!(p.data_subject(), "iot.data.d1.temp");
    }

    #[test]
    fn point_tags_roundtrip_json() {
        let p = Point::new("d1", "temp", Value::Float(1.0));
        p.tags.add_tag("site", "A");
        let json = serde_json::to_string(&p).unwrap();
        let back: Point = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tags.get_tag("site").as_deref(), Some("A"));
    }
}
