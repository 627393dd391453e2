// Copyright 2024 The Icevault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capped exponential backoff with jitter for retryable failures.

use std::time::Duration;

use rand::Rng as _;

/// Retry budget and delay bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt afterwards.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
        }
    }
}

/// Iterator-style state for one retried operation.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    attempts: u32,
}

impl Backoff {
    /// Starts a fresh sequence; the first attempt is considered taken.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 1,
        }
    }

    /// Returns the delay to wait before the next attempt, or `None` when the
    /// attempt budget is exhausted. Delays are jittered to half their nominal
    /// value to spread out competing retriers.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let exponent = self.attempts - 1;
        self.attempts += 1;
        let nominal = self
            .config
            .initial_delay
            .checked_mul(1 << exponent.min(16))
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);
        let jittered = nominal.mul_f64(rand::rng().random_range(0.5..=1.0));
        Some(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_budget() {
        let mut backoff = Backoff::new(RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let mut backoff = Backoff::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(8),
            max_delay: Duration::from_millis(100),
        };
        let mut backoff = Backoff::new(config.clone());
        let mut previous_nominal = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= config.max_delay);
            // Jitter stays within [nominal/2, nominal], so the upper bound
            // still grows monotonically until the cap.
            assert!(delay >= config.initial_delay / 2 || previous_nominal >= config.max_delay);
            previous_nominal = delay;
        }
    }
}
