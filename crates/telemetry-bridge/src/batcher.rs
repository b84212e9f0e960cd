// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write buffer and batcher.
//!
//! Points enter through a bounded queue ([`Submitter::submit`]) and are
//! collected into a [`BatchWindow`] owned by the batcher task. A window is
//! flushed when it holds `max_batch_size` points or when
//! `max_batch_interval` has passed since its first point, whichever comes
//! first. Failed writes are retried with exponential backoff; batches that
//! cannot be written go to the dead-letter sink.
//!
//! ```text
//! submit() --> [bounded queue] --> BatchWindow --> flush() --> PointStore
//!                                                     |
//!                                                     +--> DeadLetterSink
//! ```

use crate::backoff::{sleep_cancellable, Backoff};
use crate::config::{BatchConfig, OverflowPolicy, RetryConfig};
use crate::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::point::Point;
use crate::stats::BridgeStats;
use crate::store::{PointStore, StoreWriteError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Batcher tuning, resolved from configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_interval: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub enqueue_timeout: Duration,
    pub fatal_overflow_after: Duration,
    /// Total write attempts per batch.
    pub max_attempts: u32,
    pub retry_backoff: Backoff,
    pub attempt_timeout: Duration,
}

impl BatcherConfig {
    pub fn from_config(batch: &BatchConfig, retry: &RetryConfig) -> Self {
        Self {
            max_batch_size: batch.max_batch_size.max(1),
            max_batch_interval: batch.max_batch_interval(),
            queue_capacity: batch.queue_capacity.max(1),
            overflow_policy: batch.overflow_policy,
            enqueue_timeout: batch.enqueue_timeout(),
            fatal_overflow_after: batch.fatal_overflow_after(),
            max_attempts: retry.max_attempts.max(1),
            retry_backoff: Backoff::from_millis(retry.base_backoff_ms, retry.max_backoff_ms),
            attempt_timeout: retry.attempt_timeout(),
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default(), &RetryConfig::default())
    }
}

/// Submission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// No slot freed up within the enqueue timeout; the point was dropped.
    #[error("write queue full for {0:?}, point dropped")]
    QueueOverflow(Duration),

    /// The queue has been overflowing continuously for this long.
    #[error("write queue overflowing for {0:?}")]
    SustainedOverflow(Duration),

    /// The batcher is gone or shutting down.
    #[error("write queue closed")]
    Closed,
}

/// Sending half of the write queue.
///
/// Cheap to clone; the batcher drains and stops once every clone is gone.
#[derive(Clone)]
pub struct Submitter {
    tx: flume::Sender<Point>,
    /// Receiver clone used to evict the oldest point (drop-oldest only).
    evict: Option<flume::Receiver<Point>>,
    enqueue_timeout: Duration,
    fatal_overflow_after: Duration,
    overflow_since: Arc<Mutex<Option<Instant>>>,
    cancel: CancellationToken,
    stats: Arc<BridgeStats>,
}

impl Submitter {
    /// Hand a point to the batcher.
    ///
    /// Never waits longer than the enqueue timeout.
    pub async fn submit(&self, point: Point) -> Result<(), SubmitError> {
        match self.evict {
            Some(ref evict) => self.submit_drop_oldest(point, evict),
            None => self.submit_blocking(point).await,
        }
    }

    fn submit_drop_oldest(
        &self,
        mut point: Point,
        evict: &flume::Receiver<Point>,
    ) -> Result<(), SubmitError> {
        loop {
            match self.tx.try_send(point) {
                Ok(()) => {
                    BridgeStats::incr(&self.stats.points_queued);
                    return Ok(());
                }
                Err(flume::TrySendError::Full(p)) => {
                    point = p;
                    if let Ok(old) = evict.try_recv() {
                        BridgeStats::incr(&self.stats.queue_evicted);
                        tracing::warn!(
                            measurement = old.measurement(),
                            "write queue full, evicted oldest point"
                        );
                    }
                }
                Err(flume::TrySendError::Disconnected(_)) => return Err(SubmitError::Closed),
            }
        }
    }

    async fn submit_blocking(&self, point: Point) -> Result<(), SubmitError> {
        let point = match self.tx.try_send(point) {
            Ok(()) => {
                self.accepted();
                return Ok(());
            }
            Err(flume::TrySendError::Full(p)) => p,
            Err(flume::TrySendError::Disconnected(_)) => return Err(SubmitError::Closed),
        };
        // The overflow clock starts when the queue is first found full.
        let since = *self.overflow_since.lock().get_or_insert_with(Instant::now);

        let wait = tokio::time::timeout(self.enqueue_timeout, self.tx.send_async(point));
        let outcome = tokio::select! {
            r = wait => r,
            _ = self.cancel.cancelled() => return Err(SubmitError::Closed),
        };

        match outcome {
            Ok(Ok(())) => {
                self.accepted();
                Ok(())
            }
            Ok(Err(_)) => Err(SubmitError::Closed),
            Err(_) => {
                BridgeStats::incr(&self.stats.queue_overflow);
                let overflowing = since.elapsed();
                if overflowing >= self.fatal_overflow_after {
                    Err(SubmitError::SustainedOverflow(overflowing))
                } else {
                    Err(SubmitError::QueueOverflow(self.enqueue_timeout))
                }
            }
        }
    }

    fn accepted(&self) {
        BridgeStats::incr(&self.stats.points_queued);
        let mut since = self.overflow_since.lock();
        if since.is_some() {
            *since = None;
        }
    }

    /// Points currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// Points accumulated between two flushes.
#[derive(Debug, Default)]
pub struct BatchWindow {
    points: Vec<Point>,
    opened_at: Option<Instant>,
    size_bytes_estimate: usize,
}

impl BatchWindow {
    /// Add a point; the first point opens the window.
    pub fn push(&mut self, point: Point) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.size_bytes_estimate += point.size_estimate();
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn size_bytes_estimate(&self) -> usize {
        self.size_bytes_estimate
    }

    /// When the time trigger fires, if the window is open.
    pub fn deadline(&self, interval: Duration) -> Option<Instant> {
        self.opened_at.map(|t| t + interval)
    }

    /// Swap in a fresh window and return the current one.
    pub fn take(&mut self) -> BatchWindow {
        std::mem::take(self)
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }
}

/// Owns the batch window, its flush timer, and all store writes.
pub struct Batcher {
    config: BatcherConfig,
    rx: flume::Receiver<Point>,
    store: Arc<dyn PointStore>,
    dead_letter: Arc<dyn DeadLetterSink>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
}

impl Batcher {
    /// Create a batcher and the submitter feeding it.
    ///
    /// `cancel` aborts waits: the queue wait in `submit`, the retry backoff
    /// and in-flight writes. Anything pending is dead-lettered on abort.
    pub fn new(
        config: BatcherConfig,
        store: Arc<dyn PointStore>,
        dead_letter: Arc<dyn DeadLetterSink>,
        stats: Arc<BridgeStats>,
        cancel: CancellationToken,
    ) -> (Self, Submitter) {
        let (tx, rx) = flume::bounded(config.queue_capacity);
        let evict = match config.overflow_policy {
            OverflowPolicy::DropOldest => Some(rx.clone()),
            OverflowPolicy::Block => None,
        };
        let submitter = Submitter {
            tx,
            evict,
            enqueue_timeout: config.enqueue_timeout,
            fatal_overflow_after: config.fatal_overflow_after,
            overflow_since: Arc::new(Mutex::new(None)),
            cancel: cancel.clone(),
            stats: stats.clone(),
        };
        let batcher = Self {
            config,
            rx,
            store,
            dead_letter,
            stats,
            cancel,
        };
        (batcher, submitter)
    }

    /// Run until every submitter is dropped (then drain and final-flush) or
    /// until cancelled (then dead-letter whatever is pending).
    pub async fn run(self) {
        let mut window = BatchWindow::default();
        // Far-future placeholder while no window is open.
        let idle = Duration::from_secs(24 * 3600);

        loop {
            let deadline = window.deadline(self.config.max_batch_interval);
            let timer = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + idle));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    while let Ok(point) = self.rx.try_recv() {
                        window.push(point);
                    }
                    if !window.is_empty() {
                        let count = window.len();
                        tracing::warn!(count, "batcher cancelled with pending points");
                        self.dead_letter(window.take().into_points(), "shutdown aborted before flush", 0)
                            .await;
                    }
                    break;
                }
                // Ahead of `recv` so a backlog cannot hold an expired window open.
                _ = timer, if deadline.is_some() => {
                    self.flush(window.take()).await;
                }
                received = self.rx.recv_async() => match received {
                    Ok(point) => {
                        if deadline.is_some_and(|d| Instant::now() >= d) {
                            self.flush(window.take()).await;
                        }
                        window.push(point);
                        if window.len() >= self.config.max_batch_size {
                            self.flush(window.take()).await;
                        }
                    }
                    Err(_) => {
                        if !window.is_empty() {
                            tracing::debug!(count = window.len(), "final flush");
                            self.flush(window.take()).await;
                        }
                        break;
                    }
                },
            }
        }

        tracing::debug!("batcher stopped");
    }

    /// Write one window, retrying transient failures.
    async fn flush(&self, window: BatchWindow) {
        if window.is_empty() {
            return;
        }
        let bytes = window.size_bytes_estimate();
        let points = window.into_points();
        let count = points.len();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let write = tokio::time::timeout(self.config.attempt_timeout, self.store.write_batch(&points));
            let result = tokio::select! {
                r = write => r.unwrap_or_else(|_| {
                    Err(StoreWriteError::retryable(format!(
                        "write timed out after {:?}",
                        self.config.attempt_timeout
                    )))
                }),
                _ = self.cancel.cancelled() => {
                    self.dead_letter(points, "write interrupted by shutdown", attempt).await;
                    return;
                }
            };

            match result {
                Ok(()) => {
                    BridgeStats::incr(&self.stats.batches_written);
                    BridgeStats::add(&self.stats.points_written, count as u64);
                    tracing::debug!(count, bytes, attempt, "batch written");
                    return;
                }
                Err(err) if err.retryable && attempt < self.config.max_attempts => {
                    BridgeStats::incr(&self.stats.write_retries);
                    let delay = self.config.retry_backoff.delay(attempt);
                    tracing::warn!(
                        count,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        ?delay,
                        "batch write failed, retrying: {}",
                        err
                    );
                    if !sleep_cancellable(delay, &self.cancel).await {
                        self.dead_letter(points, format!("shutdown during retry: {}", err), attempt)
                            .await;
                        return;
                    }
                }
                Err(err) => {
                    let reason = if err.retryable {
                        format!("retries exhausted: {}", err)
                    } else {
                        err.to_string()
                    };
                    self.dead_letter(points, reason, attempt).await;
                    return;
                }
            }
        }
    }

    async fn dead_letter(&self, points: Vec<Point>, reason: impl Into<String>, attempts: u32) {
        let count = points.len() as u64;
        let record = DeadLetterRecord::new(points, reason, attempts);
        tracing::error!(
            count,
            attempts,
            reason = %record.reason,
            lines = ?record.lines,
            "dead-lettering batch"
        );

        BridgeStats::incr(&self.stats.batches_dead_lettered);
        BridgeStats::add(&self.stats.points_dead_lettered, count);
        if let Err(e) = self.dead_letter.record(&record).await {
            BridgeStats::incr(&self.stats.dead_letter_errors);
            tracing::error!("dead-letter sink failed, batch only in log: {}", e);
        }
    }
}
