// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 Line Protocol encoding.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use crate::point::{FieldValue, Point};

/// Format a field value for Line Protocol.
///
/// - Float: written as-is (e.g., `3.14`)
/// - Integer: suffixed with `i` (e.g., `42i`)
/// - UInteger: suffixed with `u` (e.g., `42u`)
/// - String: quoted with double quotes, inner quotes escaped (e.g., `"hello"`)
/// - Boolean: `true` or `false`
pub fn encode_field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::UInteger(v) => format!("{}u", v),
        FieldValue::String(v) => {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\"", escaped)
        }
        FieldValue::Boolean(v) => v.to_string(),
    }
}

/// Encode one point as a single Line Protocol line (no trailing newline).
///
/// Tags and fields come out sorted by key since [`Point`] stores them in
/// ordered maps.
pub fn encode_point(point: &Point) -> String {
    let mut line = escape_measurement(point.measurement());

    for (key, value) in point.tags() {
        // Empty tag values are not representable.
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    for (i, (key, value)) in point.fields().iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&encode_field_value(value));
    }

    line.push(' ');
    line.push_str(&point.timestamp_nanos().to_string());
    line
}

/// Encode a batch as a newline-separated request body.
pub fn encode_batch(points: &[Point]) -> String {
    let mut body = String::with_capacity(points.len() * 64);
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            body.push('\n');
        }
        body.push_str(&encode_point(point));
    }
    body
}

/// Measurement names escape backslashes, commas and spaces.
fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys escape backslashes, commas, equals
/// signs and spaces. Backslashes go first so a trailing one cannot escape
/// the following separator.
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
