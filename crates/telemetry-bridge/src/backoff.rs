// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential backoff shared by store retries and broker reconnects.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` if the wait was cancelled.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let b = Backoff::from_millis(100, 1000);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(400));
        assert_eq!(b.delay(4), Duration::from_millis(800));
        assert_eq!(b.delay(5), Duration::from_millis(1000));
        assert_eq!(b.delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        let b = Backoff::from_millis(50, 500);
        assert_eq!(b.delay(0), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_sleep_cancellable_returns_early() {
        let token = CancellationToken::new();
        token.cancel();
        let completed = sleep_cancellable(Duration::from_secs(3600), &token).await;
        assert!(!completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancellable_completes() {
        let token = CancellationToken::new();
        assert!(sleep_cancellable(Duration::from_millis(10), &token).await);
    }
}
