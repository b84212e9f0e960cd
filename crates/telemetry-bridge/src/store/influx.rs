// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 HTTP writer.
//!
//! Posts Line Protocol to `/api/v2/write` with nanosecond precision.

use super::{PointStore, StoreWriteError};
use crate::config::{ConfigError, InfluxDbConfig};
use crate::line_protocol;
use crate::point::Point;
use crate::BoxFuture;
use std::time::Duration;

/// InfluxDB v2 store adapter.
pub struct InfluxStore {
    http: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxStore {
    /// Create a store from configuration.
    pub fn new(config: &InfluxDbConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            write_url: write_url(&config.url),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    /// Full write endpoint URL.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }

    async fn post(&self, body: String) -> Result<(), StoreWriteError> {
        let mut request = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }

        let resp = request.send().await.map_err(classify_transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        let err = if is_retryable_status(status.as_u16()) {
            StoreWriteError::retryable(message)
        } else {
            StoreWriteError::fatal(message)
        };
        Err(err.with_status(status.as_u16()))
    }
}

impl PointStore for InfluxStore {
    fn write_batch<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), StoreWriteError>> {
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            self.post(line_protocol::encode_batch(points)).await
        })
    }
}

fn write_url(base: &str) -> String {
    format!("{}/api/v2/write", base.trim_end_matches('/'))
}

/// Request timeout, throttling and server errors are transient; any other
/// client error means the batch itself (or the credentials) is wrong.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

fn classify_transport_error(err: reqwest::Error) -> StoreWriteError {
    if err.is_builder() {
        StoreWriteError::fatal(format!("request build: {}", err))
    } else {
        StoreWriteError::retryable(format!("request: {}", err))
    }
}
