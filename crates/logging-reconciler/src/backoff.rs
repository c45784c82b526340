// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff shared by the queue, the informer relist loop and the
//! controller's initial sync.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration values for the exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Maximum backoff duration.
    pub max: Duration,
    /// Exponential factor applied on each further failure.
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5 * 60),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    /// Delay for the `failures`-th consecutive failure: `base * factor^(failures - 1)`, capped at `max`.
    pub fn delay_for(&self, failures: usize) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // powi takes an i32; past a few dozen doublings the cap applies anyway
        let exponent = failures.saturating_sub(1).min(100) as i32;
        let delay = self.base.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Tracks consecutive failures of a single retried operation.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: usize,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    /// Registers a failure and returns the recommended delay before retrying.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        self.config.delay_for(self.error_count)
    }

    pub fn register_success(&mut self) {
        self.error_count = 0;
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }
}

/// Sleeps for `delay`. Returns false if `cancel` fires first.
pub async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut state = BackoffState::new(BackoffConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));
        assert_eq!(state.register_error(), Duration::from_secs(1));
        assert_eq!(state.register_error(), Duration::from_secs(2));
        assert_eq!(state.register_error(), Duration::from_secs(4));
        assert_eq!(state.register_error(), Duration::from_secs(5));
        assert_eq!(state.error_count(), 4);

        state.register_success();
        assert_eq!(state.register_error(), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_for_large_failure_counts() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for(0), Duration::ZERO);
        assert_eq!(config.delay_for(usize::MAX), config.max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause() {
        let cancel = CancellationToken::new();
        assert!(pause(&cancel, Duration::from_secs(1)).await);
        cancel.cancel();
        assert!(!pause(&cancel, Duration::from_secs(1)).await);
    }
}
