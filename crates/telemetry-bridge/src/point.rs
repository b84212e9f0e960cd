// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point model.
//!
//! A [`Point`] is one measurement ready for persistence: a measurement name,
//! a non-empty set of fields, optional tags and a receipt timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A value that can be stored in a time-series field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit unsigned integer.
    UInteger(u64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl FieldValue {
    /// Returns the value as `f64` when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::UInteger(v) => Some(*v as f64),
            FieldValue::String(_) | FieldValue::Boolean(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::UInteger(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInteger(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// Point construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointError {
    #[error("measurement name is empty")]
    EmptyMeasurement,

    #[error("point for '{0}' has no fields")]
    NoFields(String),

    #[error("point for '{0}' has an empty field or tag name")]
    EmptyKey(String),
}

/// One time-stamped measurement.
///
/// Fields and tags are kept in sorted maps, so keys are unique and the
/// encoded form is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    measurement: String,
    fields: BTreeMap<String, FieldValue>,
    tags: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl Point {
    /// Start building a point for `measurement` stamped with `timestamp`.
    pub fn builder(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> PointBuilder {
        PointBuilder {
            measurement: measurement.into(),
            fields: BTreeMap::new(),
            tags: BTreeMap::new(),
            timestamp,
        }
    }

    /// Create a point, validating its invariants.
    pub fn new(
        measurement: impl Into<String>,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, PointError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }
        if fields.is_empty() {
            return Err(PointError::NoFields(measurement));
        }
        if fields.keys().chain(tags.keys()).any(|k| k.is_empty()) {
            return Err(PointError::EmptyKey(measurement));
        }
        Ok(Self {
            measurement,
            fields,
            tags,
            timestamp,
        })
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Timestamp in nanoseconds since the Unix epoch.
    ///
    /// Saturates outside the representable range (years 1677..2262).
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or_else(|| {
            if self.timestamp.timestamp() < 0 {
                i64::MIN
            } else {
                i64::MAX
            }
        })
    }

    /// Rough in-memory size, used for batch window accounting.
    pub fn size_estimate(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        FieldValue::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum();
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.measurement.len() + fields + tags + 8
    }
}

/// Incremental [`Point`] constructor.
#[derive(Debug, Clone)]
pub struct PointBuilder {
    measurement: String,
    fields: BTreeMap<String, FieldValue>,
    tags: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl PointBuilder {
    /// Add (or replace) a field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add (or replace) a tag.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Point, PointError> {
        Point::new(self.measurement, self.fields, self.tags, self.timestamp)
    }
}
