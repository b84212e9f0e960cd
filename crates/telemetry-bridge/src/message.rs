// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw broker messages.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message as delivered by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Payload bytes, uninterpreted.
    pub payload: Bytes,
    /// Time of receipt; becomes the timestamp of every decoded point.
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Create a message stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    /// Create a message with an explicit receipt time.
    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}
