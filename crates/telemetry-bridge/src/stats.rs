// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge statistics.
//!
//! Every error class in the pipeline has a counter here, so nothing is
//! dropped silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters shared between the pipeline tasks.
#[derive(Debug)]
pub struct BridgeStats {
    /// Messages delivered by the broker.
    pub messages_received: AtomicU64,
    /// Points produced by the decoder.
    pub points_decoded: AtomicU64,
    /// Messages with no decoding rule.
    pub no_rule: AtomicU64,
    /// Messages whose payload failed to parse.
    pub malformed: AtomicU64,
    /// Points accepted into the write queue.
    pub points_queued: AtomicU64,
    /// Points dropped because the queue stayed full past the enqueue timeout.
    pub queue_overflow: AtomicU64,
    /// Points evicted by the drop-oldest policy.
    pub queue_evicted: AtomicU64,
    /// Batches written successfully.
    pub batches_written: AtomicU64,
    /// Points written successfully.
    pub points_written: AtomicU64,
    /// Store write attempts that were retried.
    pub write_retries: AtomicU64,
    /// Batches moved to the dead-letter sink.
    pub batches_dead_lettered: AtomicU64,
    /// Points moved to the dead-letter sink.
    pub points_dead_lettered: AtomicU64,
    /// Dead-letter writes that themselves failed.
    pub dead_letter_errors: AtomicU64,
    /// Successful broker (re)connections.
    pub connections: AtomicU64,
    /// Broker connection failures and transport errors.
    pub connection_errors: AtomicU64,
    created: Instant,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            points_decoded: AtomicU64::new(0),
            no_rule: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            points_queued: AtomicU64::new(0),
            queue_overflow: AtomicU64::new(0),
            queue_evicted: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            batches_dead_lettered: AtomicU64::new(0),
            points_dead_lettered: AtomicU64::new(0),
            dead_letter_errors: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter.
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_received: load(&self.messages_received),
            points_decoded: load(&self.points_decoded),
            no_rule: load(&self.no_rule),
            malformed: load(&self.malformed),
            points_queued: load(&self.points_queued),
            queue_overflow: load(&self.queue_overflow),
            queue_evicted: load(&self.queue_evicted),
            batches_written: load(&self.batches_written),
            points_written: load(&self.points_written),
            write_retries: load(&self.write_retries),
            batches_dead_lettered: load(&self.batches_dead_lettered),
            points_dead_lettered: load(&self.points_dead_lettered),
            dead_letter_errors: load(&self.dead_letter_errors),
            connections: load(&self.connections),
            connection_errors: load(&self.connection_errors),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of bridge statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub points_decoded: u64,
    pub no_rule: u64,
    pub malformed: u64,
    pub points_queued: u64,
    pub queue_overflow: u64,
    pub queue_evicted: u64,
    pub batches_written: u64,
    pub points_written: u64,
    pub write_retries: u64,
    pub batches_dead_lettered: u64,
    pub points_dead_lettered: u64,
    pub dead_letter_errors: u64,
    pub connections: u64,
    pub connection_errors: u64,
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_received as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }

    /// Points accepted but neither written nor dead-lettered yet.
    pub fn points_in_flight(&self) -> u64 {
        self.points_queued
            .saturating_sub(self.points_written)
            .saturating_sub(self.points_dead_lettered)
            .saturating_sub(self.queue_evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = BridgeStats::new();
        BridgeStats::incr(&stats.messages_received);
        BridgeStats::incr(&stats.messages_received);
        BridgeStats::add(&stats.points_queued, 10);
        BridgeStats::add(&stats.points_written, 6);
        BridgeStats::add(&stats.points_dead_lettered, 1);
        BridgeStats::incr(&stats.malformed);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.points_in_flight(), 3);
    }

    #[test]
    fn test_messages_per_second_zero_uptime() {
        let snap = StatsSnapshot {
            messages_received: 10,
            ..Default::default()
        };
        assert_eq!(snap.messages_per_second(), 0.0);
    }
}
