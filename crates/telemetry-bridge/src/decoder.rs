// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message decoding.
//!
//! Turns a [`RawMessage`] into points using per-topic rules. A rule names one
//! or more measurement templates; every template yields one point carrying
//! the same extracted fields, so fan-out is always declared, never implied.
//!
//! ```text
//! RawMessage --> rule lookup --> FieldExtractor --> N x MeasurementTemplate --> Vec<Point>
//! ```

use crate::config::{ConfigError, ExtractorConfig, NumberKind, TopicRuleConfig};
use crate::message::RawMessage;
use crate::point::{FieldValue, Point};
use crate::topic::TopicFilter;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Decoding failures. Both are per-message and never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no decoding rule for topic '{0}'")]
    NoRuleForTopic(String),

    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
}

/// A measurement produced by a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTemplate {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

/// Fields (and payload-derived tags) pulled out of one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub fields: BTreeMap<String, FieldValue>,
    pub tags: BTreeMap<String, String>,
}

/// Payload-to-fields extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldExtractor {
    /// Whole payload is a single number stored under `field`.
    Scalar { field: String, number: NumberKind },
    /// JSON object payload; dotted paths select fields and tags.
    Json {
        fields: Vec<String>,
        tags: Vec<String>,
    },
}

impl FieldExtractor {
    /// Extract fields from a payload.
    pub fn extract(&self, payload: &[u8]) -> Result<Extracted, String> {
        match self {
            FieldExtractor::Scalar { field, number } => {
                let text = std::str::from_utf8(payload)
                    .map_err(|_| "payload is not valid UTF-8".to_string())?
                    .trim();
                let value = parse_number(text, *number)?;
                let mut fields = BTreeMap::new();
                fields.insert(field.clone(), value);
                Ok(Extracted {
                    fields,
                    tags: BTreeMap::new(),
                })
            }
            FieldExtractor::Json { fields, tags } => {
                let json: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| format!("invalid JSON: {}", e))?;
                if !json.is_object() {
                    return Err("JSON payload is not an object".to_string());
                }

                let mut out = Extracted::default();
                for tag_name in tags {
                    if let Some(s) = resolve_field(&json, tag_name).and_then(json_to_string) {
                        out.tags.insert(tag_name.clone(), s);
                    }
                }
                for field_name in fields {
                    if let Some(fv) = resolve_field(&json, field_name).and_then(json_to_field_value)
                    {
                        out.fields.insert(field_name.clone(), fv);
                    }
                }

                if out.fields.is_empty() {
                    return Err("none of the configured fields is present".to_string());
                }
                Ok(out)
            }
        }
    }
}

impl From<&ExtractorConfig> for FieldExtractor {
    fn from(config: &ExtractorConfig) -> Self {
        match config {
            ExtractorConfig::Scalar { field, number } => FieldExtractor::Scalar {
                field: field.clone(),
                number: *number,
            },
            ExtractorConfig::Json { fields, tags } => FieldExtractor::Json {
                fields: fields.clone(),
                tags: tags.clone(),
            },
        }
    }
}

fn parse_number(text: &str, kind: NumberKind) -> Result<FieldValue, String> {
    let parse_float = |t: &str| -> Result<FieldValue, String> {
        match t.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(FieldValue::Float(v)),
            Ok(_) => Err(format!("'{}' is not a finite number", t)),
            Err(_) => Err(format!("'{}' is not a number", t)),
        }
    };

    match kind {
        NumberKind::Integer => text
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| format!("'{}' is not an integer", text)),
        NumberKind::Float => parse_float(text),
        NumberKind::Auto => match text.parse::<i64>() {
            Ok(v) => Ok(FieldValue::Integer(v)),
            Err(_) => parse_float(text),
        },
    }
}

/// Resolve a potentially dot-separated field path in a JSON value.
///
/// For example, `"location.lat"` resolves `json["location"]["lat"]`.
fn resolve_field<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Tag values are strings; arrays, objects and null are not valid tags.
fn json_to_string(val: &serde_json::Value) -> Option<String> {
    match val {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\n', '\r'])
}

/// Line Protocol has no escape for line breaks in tags or string fields.
fn line_break_in(extracted: &Extracted) -> Option<&str> {
    let tag = extracted
        .tags
        .iter()
        .find(|(_, v)| has_line_break(v))
        .map(|(k, _)| k.as_str());
    tag.or_else(|| {
        extracted
            .fields
            .iter()
            .find(|(_, v)| matches!(v, FieldValue::String(s) if has_line_break(s)))
            .map(|(k, _)| k.as_str())
    })
}

fn json_to_field_value(val: &serde_json::Value) -> Option<FieldValue> {
    match val {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else if let Some(u) = n.as_u64() {
                Some(FieldValue::UInteger(u))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        serde_json::Value::String(s) => Some(FieldValue::String(s.clone())),
        serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        _ => None,
    }
}

/// One topic's decoding rule.
#[derive(Debug, Clone)]
pub struct TopicDecodingRule {
    pub filter: TopicFilter,
    pub measurements: Vec<MeasurementTemplate>,
    pub extractor: FieldExtractor,
    pub topic_tag: Option<String>,
}

impl TopicDecodingRule {
    /// Build a rule from configuration.
    pub fn from_config(config: &TopicRuleConfig) -> Result<Self, ConfigError> {
        let filter = TopicFilter::new(&config.topic)
            .map_err(|e| ConfigError::Invalid(format!("topic '{}': {}", config.topic, e)))?;
        if config.measurements.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "topic '{}' has no measurements",
                config.topic
            )));
        }
        Ok(Self {
            filter,
            measurements: config
                .measurements
                .iter()
                .map(|m| MeasurementTemplate {
                    name: m.name.clone(),
                    tags: m.tags.clone(),
                })
                .collect(),
            extractor: FieldExtractor::from(&config.extractor),
            topic_tag: config.topic_tag.clone(),
        })
    }

    /// Apply this rule to a message already known to match it.
    fn apply(&self, msg: &RawMessage) -> Result<Vec<Point>, DecodeError> {
        let malformed = |reason: String| DecodeError::MalformedPayload {
            topic: msg.topic.clone(),
            reason,
        };

        let extracted = self.extractor.extract(&msg.payload).map_err(malformed)?;
        if let Some(name) = line_break_in(&extracted) {
            return Err(malformed(format!("'{}' contains a line break", name)));
        }
        if self.topic_tag.is_some() && has_line_break(&msg.topic) {
            return Err(malformed("topic contains a line break".to_string()));
        }

        let mut points = Vec::with_capacity(self.measurements.len());
        for template in &self.measurements {
            let mut tags = template.tags.clone();
            tags.extend(extracted.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(ref tag) = self.topic_tag {
                tags.insert(tag.clone(), msg.topic.clone());
            }
            let point = Point::new(
                template.name.clone(),
                extracted.fields.clone(),
                tags,
                msg.received_at,
            )
            .map_err(|e| malformed(e.to_string()))?;
            points.push(point);
        }
        Ok(points)
    }
}

/// Routes messages to their decoding rule.
///
/// Exact topics are looked up directly; wildcard rules are tried in
/// configuration order afterwards.
#[derive(Debug, Clone)]
pub struct Decoder {
    rules: Vec<TopicDecodingRule>,
    exact: HashMap<String, usize>,
    wildcard: Vec<usize>,
}

impl Decoder {
    /// Create a decoder from rules.
    pub fn new(rules: Vec<TopicDecodingRule>) -> Self {
        let mut exact = HashMap::new();
        let mut wildcard = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            if rule.filter.is_wildcard() {
                wildcard.push(i);
            } else {
                exact.entry(rule.filter.as_str().to_string()).or_insert(i);
            }
        }
        Self {
            rules,
            exact,
            wildcard,
        }
    }

    /// Create a decoder from topic rule configuration.
    pub fn from_config(rules: &[TopicRuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(TopicDecodingRule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Filters to subscribe to, one per rule.
    pub fn filters(&self) -> Vec<TopicFilter> {
        self.rules.iter().map(|r| r.filter.clone()).collect()
    }

    /// Find the rule for a concrete topic.
    pub fn rule_for(&self, topic: &str) -> Option<&TopicDecodingRule> {
        if let Some(&i) = self.exact.get(topic) {
            return Some(&self.rules[i]);
        }
        self.wildcard
            .iter()
            .map(|&i| &self.rules[i])
            .find(|r| r.filter.matches(topic))
    }

    /// Decode a message into points.
    pub fn decode(&self, msg: &RawMessage) -> Result<Vec<Point>, DecodeError> {
        let rule = self
            .rule_for(&msg.topic)
            .ok_or_else(|| DecodeError::NoRuleForTopic(msg.topic.clone()))?;
        rule.apply(msg)
    }
}
