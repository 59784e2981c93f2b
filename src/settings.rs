// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Activation Settings
//!
//! Timing knobs shared by every listener worker. Values can be built in code or
//! deserialized from any serde source; durations are expressed in milliseconds.

use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Settings applied to every worker started by an `ActivationCoordinator`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ActivationSettings {
    /// Retry policy used to open sessions
    pub retry: RetryPolicy,
    /// Longest single wait for the next message
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    /// Longest wait for a worker to answer a connectivity probe
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    /// Longest wait for a worker task to stop before it is aborted
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        ActivationSettings {
            retry: RetryPolicy::default(),
            receive_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ActivationSettings {
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
