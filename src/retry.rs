// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Retry
//!
//! Fixed-delay retry used to open a listener's session. An operation is retried until
//! it succeeds, the attempt cap is reached, or the next attempt would start after the
//! elapsed-time window has closed.

use crate::settings::millis;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-delay retry policy.
///
/// Defaults: 3 s between attempts, 5 attempts, 30 s window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "millis")]
    pub delay: Duration,
    pub max_attempts: usize,
    #[serde(with = "millis")]
    pub max_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay: Duration::from_secs(3),
            max_attempts: 5,
            max_duration: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: usize, max_duration: Duration) -> Self {
        RetryPolicy {
            delay,
            max_attempts,
            max_duration,
        }
    }

    /// Starts counting attempts against this policy; the window opens now.
    pub fn attempts(&self) -> Attempts {
        Attempts {
            delay: self.delay,
            max_attempts: self.max_attempts.max(1),
            max_duration: self.max_duration,
            started: Instant::now(),
            made: 0,
        }
    }
}

/// Attempt bookkeeping for one retry sequence.
#[derive(Debug)]
pub struct Attempts {
    delay: Duration,
    max_attempts: usize,
    max_duration: Duration,
    started: Instant,
    made: usize,
}

impl Attempts {
    /// Records a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when the policy is
    /// exhausted.
    pub fn failed(&mut self) -> Option<Duration> {
        self.made += 1;
        let next_start = self.started.elapsed() + self.delay;
        if self.made >= self.max_attempts || next_start > self.max_duration {
            return None;
        }
        Some(self.delay)
    }

    pub fn made(&self) -> usize {
        self.made
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    async fn exhaust(policy: &RetryPolicy) -> usize {
        let mut attempts = policy.attempts();
        while let Some(delay) = attempts.failed() {
            sleep(delay).await;
        }
        attempts.made()
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        assert_eq!(exhaust(&RetryPolicy::default()).await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_window_closes() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 5, Duration::from_secs(25));

        // attempts at 0s, 10s, 20s; a fourth would start at 30s
        assert_eq!(exhaust(&policy).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(Duration::from_millis(1), 0, Duration::from_secs(1));
        let mut attempts = policy.attempts();

        assert_eq!(attempts.failed(), None);
        assert_eq!(attempts.made(), 1);
    }

    #[test]
    fn deserializes_from_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{ "delay": 500, "max_duration": 2000 }"#).unwrap();

        assert_eq!(policy.delay, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.max_duration, Duration::from_secs(2));
    }
}
