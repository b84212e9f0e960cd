// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the pipeline to its owner.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker connection failed: {0}")]
    BrokerConnection(String),

    #[error("write queue overflowing for {0:?}")]
    SustainedOverflow(Duration),

    #[error("shutdown timed out, {points_in_flight} points possibly lost")]
    ShutdownTimeout { points_in_flight: u64 },
}
