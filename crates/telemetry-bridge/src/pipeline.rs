// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pipeline coordinator.
//!
//! Wires broker, decoder, batcher and store together:
//!
//! ```text
//! SubscriptionManager --RawMessage--> IntakeHandler --Point--> Batcher --> PointStore
//!        (task 1)                      (decode+submit)         (task 2)
//! ```
//!
//! The intake handler runs on the delivery task; the only handoff to the
//! batcher task is the bounded queue behind [`Submitter`].

use crate::batcher::{Batcher, BatcherConfig, SubmitError, Submitter};
use crate::config::BridgeConfig;
use crate::dead_letter::DeadLetterSink;
use crate::decoder::{DecodeError, Decoder};
use crate::error::BridgeError;
use crate::message::RawMessage;
use crate::mqtt::{
    BrokerConnector, MessageHandler, SubscriptionHandle, SubscriptionManager, SubscriptionState,
};
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::store::PointStore;
use crate::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time the batcher gets to dead-letter its pending points after an abort.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// A condition that stops the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    /// The broker could not be reached within the configured attempts.
    ConnectionExhausted(String),
    /// The write queue has been full for longer than allowed.
    SustainedOverflow(Duration),
}

impl From<FatalCondition> for BridgeError {
    fn from(condition: FatalCondition) -> Self {
        match condition {
            FatalCondition::ConnectionExhausted(reason) => BridgeError::BrokerConnection(reason),
            FatalCondition::SustainedOverflow(d) => BridgeError::SustainedOverflow(d),
        }
    }
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCondition::ConnectionExhausted(reason) => write!(f, "{}", reason),
            FatalCondition::SustainedOverflow(d) => write!(f, "write queue overflowing for {:?}", d),
        }
    }
}

/// Outcome of a clean shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

/// Decodes each delivered message and queues its points.
struct IntakeHandler {
    decoder: Decoder,
    submitter: Submitter,
    stats: Arc<BridgeStats>,
    fatal: Arc<watch::Sender<Option<FatalCondition>>>,
}

impl IntakeHandler {
    async fn intake(&self, message: RawMessage) {
        let points = match self.decoder.decode(&message) {
            Ok(points) => points,
            Err(DecodeError::NoRuleForTopic(topic)) => {
                BridgeStats::incr(&self.stats.no_rule);
                debug!(%topic, "no decoding rule, message dropped");
                return;
            }
            Err(e) => {
                BridgeStats::incr(&self.stats.malformed);
                warn!("{}", e);
                return;
            }
        };
        BridgeStats::add(&self.stats.points_decoded, points.len() as u64);

        for point in points {
            match self.submitter.submit(point).await {
                Ok(()) => {}
                Err(SubmitError::QueueOverflow(waited)) => {
                    warn!(topic = %message.topic, ?waited, "write queue full, point dropped");
                }
                Err(SubmitError::SustainedOverflow(overflowing)) => {
                    error!(?overflowing, "write queue overflow is sustained");
                    self.fatal
                        .send_replace(Some(FatalCondition::SustainedOverflow(overflowing)));
                }
                Err(SubmitError::Closed) => {
                    debug!("write queue closed, dropping remaining points");
                    return;
                }
            }
        }
    }
}

impl MessageHandler for IntakeHandler {
    fn on_message(&self, message: RawMessage) -> BoxFuture<'_, ()> {
        Box::pin(self.intake(message))
    }
}

/// Entry point for starting the bridge.
pub struct Pipeline;

impl Pipeline {
    /// Build every component and spawn the delivery and batcher tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &BridgeConfig,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn PointStore>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Result<PipelineHandle, BridgeError> {
        config.validate()?;
        let decoder = Decoder::from_config(&config.topics)?;
        let filters = decoder.filters();
        let stats = Arc::new(BridgeStats::new());
        let abort = CancellationToken::new();
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let fatal_tx = Arc::new(fatal_tx);

        let (batcher, submitter) = Batcher::new(
            BatcherConfig::from_config(&config.batch, &config.retry),
            store,
            dead_letter,
            stats.clone(),
            abort.clone(),
        );

        let mut manager = SubscriptionManager::new(
            connector,
            filters,
            config.broker.qos,
            &config.reconnect,
            stats.clone(),
        );
        manager.on_message(Arc::new(IntakeHandler {
            decoder,
            submitter,
            stats: stats.clone(),
            fatal: fatal_tx.clone(),
        }));
        let subscription = manager.handle();

        info!(
            topics = manager.filters().len(),
            qos = config.broker.qos,
            "starting pipeline"
        );

        let batcher_task = tokio::spawn(batcher.run());
        let subscription_task = tokio::spawn(async move {
            // The intake handler, and with it the last submitter, is dropped
            // when `run` returns; that lets the batcher drain and stop.
            if let Err(e) = manager.run().await {
                error!("subscription stopped: {}", e);
                fatal_tx.send_replace(Some(FatalCondition::ConnectionExhausted(e.to_string())));
            }
        });

        Ok(PipelineHandle {
            subscription,
            subscription_task,
            batcher_task,
            abort,
            stats,
            fatal: fatal_rx,
        })
    }
}

/// Running pipeline.
pub struct PipelineHandle {
    subscription: SubscriptionHandle,
    subscription_task: JoinHandle<()>,
    batcher_task: JoinHandle<()>,
    abort: CancellationToken,
    stats: Arc<BridgeStats>,
    fatal: watch::Receiver<Option<FatalCondition>>,
}

impl PipelineHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, for periodic reporting.
    pub fn stats_source(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// Wait for a subscription state, e.g. `Active` before publishing.
    pub async fn wait_for_state(&mut self, state: SubscriptionState) -> bool {
        self.subscription.wait_for(state).await
    }

    /// Resolves once a fatal condition is raised.
    ///
    /// Returns `None` if the pipeline stopped without one.
    pub async fn fatal(&mut self) -> Option<FatalCondition> {
        match self.fatal.wait_for(Option::is_some).await {
            Ok(condition) => condition.clone(),
            Err(_) => None,
        }
    }

    /// Stop intake, drain the queue, flush the last window and release the
    /// broker connection, all within `timeout`.
    ///
    /// On timeout, pending points are dead-lettered where possible and
    /// `ShutdownTimeout` reports how many may be lost.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<ShutdownReport, BridgeError> {
        let started = Instant::now();
        info!(?timeout, "shutting down pipeline");
        self.subscription.stop();

        let drained = tokio::time::timeout(timeout, async {
            if let Err(e) = (&mut self.subscription_task).await {
                warn!("subscription task failed: {}", e);
            }
            if let Err(e) = (&mut self.batcher_task).await {
                warn!("batcher task failed: {}", e);
            }
        })
        .await;

        if drained.is_ok() {
            let stats = self.stats.snapshot();
            info!(
                points_written = stats.points_written,
                points_dead_lettered = stats.points_dead_lettered,
                "pipeline stopped"
            );
            return Ok(ShutdownReport {
                stats,
                elapsed: started.elapsed(),
            });
        }

        self.abort.cancel();
        if tokio::time::timeout(ABORT_GRACE, &mut self.batcher_task)
            .await
            .is_err()
        {
            self.batcher_task.abort();
        }
        self.subscription_task.abort();

        let points_in_flight = self.stats.snapshot().points_in_flight();
        error!(points_in_flight, "shutdown timed out");
        Err(BridgeError::ShutdownTimeout { points_in_flight })
    }
}
