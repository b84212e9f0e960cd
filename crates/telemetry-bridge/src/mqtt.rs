// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker side of the bridge.
//!
//! [`BrokerConnector`] and [`BrokerSession`] are the seam to the message
//! broker; [`MqttConnector`] implements them over MQTT 3.1.1 / TCP and
//! [`SubscriptionManager`] drives a session through connect, subscribe,
//! delivery and reconnect.

pub mod client;
pub mod codec;
pub mod subscription;

pub use client::{MqttConnector, MqttSession};
pub use subscription::{
    MessageHandler, SubscriptionError, SubscriptionHandle, SubscriptionManager, SubscriptionState,
};

use crate::message::RawMessage;
use crate::topic::TopicFilter;
use crate::BoxFuture;
use thiserror::Error;

/// Broker transport errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection refused by broker: {reason} (code {code})")]
    Refused { code: u8, reason: &'static str },

    #[error("subscription to '{0}' refused by broker")]
    SubscribeRefused(String),

    #[error("invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("connection closed by broker")]
    Closed,

    #[error("no PINGRESP within keep-alive")]
    KeepAliveTimeout,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl From<codec::CodecError> for BrokerError {
    fn from(e: codec::CodecError) -> Self {
        BrokerError::Protocol(e.to_string())
    }
}

/// A delivered application message.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub message: RawMessage,
    /// Set for QoS 1 deliveries, which must be acknowledged.
    pub packet_id: Option<u16>,
}

/// Opens broker sessions.
pub trait BrokerConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn BrokerSession>, BrokerError>>;
}

/// One live broker connection.
pub trait BrokerSession: Send {
    /// Subscribe to every filter at `qos`.
    fn subscribe<'a>(
        &'a mut self,
        filters: &'a [TopicFilter],
        qos: u8,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Wait for the next application message.
    ///
    /// Must be cancel-safe: dropping the future loses no data.
    fn next_message(&mut self) -> BoxFuture<'_, Result<Incoming, BrokerError>>;

    /// Acknowledge a QoS 1 delivery.
    fn ack(&mut self, packet_id: u16) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Close the session cleanly.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), BrokerError>>;
}
