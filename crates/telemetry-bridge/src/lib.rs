// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Bridge
//!
//! Subscribes to MQTT sensor topics, decodes each message into one or more
//! time-series points and writes them to InfluxDB v2 in batches.
//!
//! # Features
//!
//! - **Per-topic decoding**: scalar or JSON payloads, explicit fan-out to
//!   several measurements, wildcard topic filters
//! - **Batching**: size and time flush triggers behind a bounded queue
//! - **Delivery**: retry with exponential backoff, durable dead-letter file
//! - **Resilience**: broker reconnect with resubscribe, bounded shutdown
//!
//! # Quick Start
//!
//! ```bash
//! # Write an example configuration
//! telemetry-bridge gen-config --output bridge.yaml
//!
//! # Check it
//! telemetry-bridge validate --config bridge.yaml
//!
//! # Run
//! INFLUXDB_TOKEN=... telemetry-bridge run --config bridge.yaml
//! ```
//!
//! # Embedding
//!
//! ```no_run
//! use std::sync::Arc;
//! use telemetry_bridge::{BridgeConfig, FileDeadLetterSink, InfluxStore, MqttConnector, Pipeline};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::from_file("bridge.yaml")?;
//! let handle = Pipeline::start(
//!     &config,
//!     Arc::new(MqttConnector::new(config.broker.clone())),
//!     Arc::new(InfluxStore::new(&config.influxdb)?),
//!     Arc::new(FileDeadLetterSink::new(&config.dead_letter.path)),
//! )?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown(config.shutdown_timeout()).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod backoff;
pub mod batcher;
pub mod config;
pub mod dead_letter;
pub mod decoder;
pub mod error;
pub mod line_protocol;
pub mod message;
pub mod mqtt;
pub mod pipeline;
pub mod point;
pub mod stats;
pub mod store;
pub mod topic;

/// Boxed future returned by the object-safe async traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use batcher::{Batcher, BatcherConfig, SubmitError, Submitter};
pub use config::{BridgeConfig, ConfigError};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink, FileDeadLetterSink};
pub use decoder::{DecodeError, Decoder};
pub use error::BridgeError;
pub use message::RawMessage;
pub use mqtt::{BrokerConnector, BrokerError, BrokerSession, MqttConnector, SubscriptionState};
pub use pipeline::{FatalCondition, Pipeline, PipelineHandle, ShutdownReport};
pub use point::{FieldValue, Point};
pub use stats::{BridgeStats, StatsSnapshot};
pub use store::{InfluxStore, PointStore, StoreWriteError};
pub use topic::TopicFilter;
