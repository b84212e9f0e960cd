// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store client adapter.
//!
//! The batcher needs exactly one thing from the time-series store: write a
//! batch of points, and say whether a failure is worth retrying.

pub mod influx;

pub use influx::InfluxStore;

use crate::point::Point;
use crate::BoxFuture;
use std::fmt;

/// A failed batch write, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWriteError {
    /// Transient failure (network, timeout, 429, 5xx): retry with backoff.
    pub retryable: bool,
    /// HTTP status, when the store answered.
    pub status: Option<u16>,
    pub message: String,
}

impl StoreWriteError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            status: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for StoreWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "retryable" } else { "fatal" };
        match self.status {
            Some(status) => write!(f, "store write failed ({}, HTTP {}): {}", kind, status, self.message),
            None => write!(f, "store write failed ({}): {}", kind, self.message),
        }
    }
}

impl std::error::Error for StoreWriteError {}

/// Batched write capability of the time-series store.
///
/// `points` is the complete, ordered batch window. The batcher keeps the
/// window untouched across retries, so implementations only borrow it.
pub trait PointStore: Send + Sync {
    fn write_batch<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), StoreWriteError>>;
}
