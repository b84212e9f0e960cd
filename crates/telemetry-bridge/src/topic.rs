// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT topic filters.
//!
//! Supports the MQTT 3.1.1 wildcards: `+` matches exactly one level and `#`
//! matches any number of trailing levels (including none). Topics starting
//! with `$` are never matched by a leading wildcard.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invalid topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicFilterError {
    #[error("topic filter is empty")]
    Empty,

    #[error("'#' must be the last level of '{0}'")]
    MultiLevelNotLast(String),

    #[error("wildcard must occupy a whole level in '{0}'")]
    PartialWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
    Multi,
}

/// A parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter {
    raw: String,
    #[serde(skip)]
    levels: Vec<Level>,
}

impl TopicFilter {
    /// Parse and validate a filter.
    pub fn new(filter: &str) -> Result<Self, TopicFilterError> {
        if filter.is_empty() {
            return Err(TopicFilterError::Empty);
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" if i + 1 == parts.len() => Level::Multi,
                "#" => return Err(TopicFilterError::MultiLevelNotLast(filter.to_string())),
                "+" => Level::Single,
                p if p.contains('#') || p.contains('+') => {
                    return Err(TopicFilterError::PartialWildcard(filter.to_string()))
                }
                p => Level::Exact(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: filter.to_string(),
            levels,
        })
    }

    /// The filter as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the filter contains `+` or `#`.
    pub fn is_wildcard(&self) -> bool {
        self.levels
            .iter()
            .any(|l| matches!(l, Level::Single | Level::Multi))
    }

    /// Check whether a concrete topic name matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && !matches!(self.levels.first(), Some(Level::Exact(_))) {
            return false;
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = TopicFilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.raw
    }
}
