// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription manager.
//!
//! Owns the broker session and drives it through its lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Subscribing -> Active
//!                     ^                                        |
//!                     +------------- Reconnecting <------------+
//!
//! any state -> Stopped (stop handle, or reconnect attempts exhausted)
//! ```
//!
//! Deliveries are handed to the registered [`MessageHandler`] one at a time.
//! A QoS 1 message is acknowledged only once the handler has returned.

use super::{BrokerConnector, BrokerError, BrokerSession};
use crate::backoff::{sleep_cancellable, Backoff};
use crate::config::ReconnectConfig;
use crate::message::RawMessage;
use crate::stats::BridgeStats;
use crate::topic::TopicFilter;
use crate::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Active,
    Reconnecting,
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Disconnected => "disconnected",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Connected => "connected",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Active => "active",
            SubscriptionState::Reconnecting => "reconnecting",
            SubscriptionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Subscription errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("no message handler registered")]
    NoHandler,

    #[error("broker unreachable after {attempts} attempts: {source}")]
    ConnectionExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// Receives every delivered message.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: RawMessage) -> BoxFuture<'_, ()>;
}

/// Remote control for a running [`SubscriptionManager`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    stop: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// Request a stop; `run` disconnects and returns.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait until the manager reaches `target`.
    ///
    /// Returns `false` if the manager was dropped first.
    pub async fn wait_for(&mut self, target: SubscriptionState) -> bool {
        self.state.wait_for(|s| *s == target).await.is_ok()
    }
}

/// Drives one broker session with reconnect and resubscribe.
pub struct SubscriptionManager {
    connector: Arc<dyn BrokerConnector>,
    filters: Vec<TopicFilter>,
    qos: u8,
    backoff: Backoff,
    max_attempts: u32,
    handler: Option<Arc<dyn MessageHandler>>,
    session: Option<Box<dyn BrokerSession>>,
    state: watch::Sender<SubscriptionState>,
    stop: CancellationToken,
    stats: Arc<BridgeStats>,
}

impl SubscriptionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        filters: Vec<TopicFilter>,
        qos: u8,
        reconnect: &ReconnectConfig,
        stats: Arc<BridgeStats>,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            connector,
            filters,
            qos,
            backoff: Backoff::from_millis(reconnect.initial_backoff_ms, reconnect.max_backoff_ms),
            max_attempts: reconnect.max_attempts,
            handler: None,
            session: None,
            state,
            stop: CancellationToken::new(),
            stats,
        }
    }

    /// Register the delivery handler.
    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            stop: self.stop.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    fn set_state(&self, next: SubscriptionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "subscription state");
        }
    }

    /// Open a broker session.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.set_state(SubscriptionState::Connecting);
        match self.connector.connect().await {
            Ok(session) => {
                self.session = Some(session);
                BridgeStats::incr(&self.stats.connections);
                self.set_state(SubscriptionState::Connected);
                Ok(())
            }
            Err(e) => {
                BridgeStats::incr(&self.stats.connection_errors);
                self.set_state(SubscriptionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Subscribe the open session to every configured filter.
    pub async fn subscribe(&mut self) -> Result<(), BrokerError> {
        if self.session.is_none() {
            return Err(BrokerError::Closed);
        }
        self.set_state(SubscriptionState::Subscribing);
        let Some(session) = self.session.as_mut() else {
            return Err(BrokerError::Closed);
        };

        let result = session.subscribe(&self.filters, self.qos).await;
        match result {
            Ok(()) => {
                debug!(filters = self.filters.len(), qos = self.qos, "subscribed");
                self.set_state(SubscriptionState::Active);
                Ok(())
            }
            Err(e) => {
                self.session = None;
                BridgeStats::incr(&self.stats.connection_errors);
                self.set_state(SubscriptionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), BrokerError> {
        self.connect().await?;
        self.subscribe().await
    }

    fn session_lost(&mut self, err: BrokerError) {
        warn!("broker session lost: {}", err);
        BridgeStats::incr(&self.stats.connection_errors);
        self.session = None;
        self.set_state(SubscriptionState::Reconnecting);
    }

    /// Deliver messages until stopped.
    ///
    /// Returns an error only when no handler is registered or when
    /// `max_attempts` consecutive connection attempts failed.
    ///
    /// A session lost after reaching `Active` is re-established after a
    /// backoff that keeps growing until a session delivers a message.
    pub async fn run(mut self) -> Result<(), SubscriptionError> {
        let handler = self.handler.clone().ok_or(SubscriptionError::NoHandler)?;
        let stop = self.stop.clone();
        let mut failures = 0u32;
        let mut drops = 0u32;

        loop {
            if self.session.is_none() {
                let result = tokio::select! {
                    r = self.establish() => r,
                    _ = stop.cancelled() => break,
                };
                match result {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        if self.max_attempts != 0 && failures >= self.max_attempts {
                            self.set_state(SubscriptionState::Stopped);
                            return Err(SubscriptionError::ConnectionExhausted {
                                attempts: failures,
                                source: e,
                            });
                        }
                        let delay = self.backoff.delay(failures);
                        warn!(attempt = failures, ?delay, "broker connection failed: {}", e);
                        self.set_state(SubscriptionState::Reconnecting);
                        if !sleep_cancellable(delay, &stop).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(session) = self.session.as_mut() else {
                continue;
            };
            let received = tokio::select! {
                r = session.next_message() => r,
                _ = stop.cancelled() => break,
            };

            match received {
                Ok(incoming) => {
                    drops = 0;
                    BridgeStats::incr(&self.stats.messages_received);
                    handler.on_message(incoming.message).await;
                    if let Some(packet_id) = incoming.packet_id {
                        if let Err(e) = session.ack(packet_id).await {
                            self.session_lost(e);
                        }
                    }
                }
                Err(e) => self.session_lost(e),
            }

            if self.session.is_none() {
                drops = drops.saturating_add(1);
                let delay = self.backoff.delay(drops);
                debug!(drops, ?delay, "waiting before reconnect");
                if !sleep_cancellable(delay, &stop).await {
                    break;
                }
            }
        }

        if let Some(mut session) = self.session.take() {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect()).await {
                Ok(Ok(())) => debug!("disconnected from broker"),
                Ok(Err(e)) => debug!("disconnect failed: {}", e),
                Err(_) => debug!("disconnect timed out"),
            }
        }
        self.set_state(SubscriptionState::Stopped);
        Ok(())
    }
}
