// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Health
//!
//! Builds a health snapshot by probing every listener independently. Probes run
//! concurrently; a probe that hangs or panics marks only its own listener as down.

use async_trait::async_trait;
use futures_util::{future::join_all, FutureExt};
use serde::Serialize;
use std::{collections::BTreeMap, panic::AssertUnwindSafe, time::Duration};
use tokio::time::timeout;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Something whose broker connectivity can be checked.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Connectivity of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListenerStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Ko,
}

impl From<bool> for ListenerStatus {
    fn from(connected: bool) -> Self {
        if connected {
            ListenerStatus::Ok
        } else {
            ListenerStatus::Ko
        }
    }
}

/// Point-in-time health of all listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    #[serde(rename = "perListener")]
    pub per_listener: BTreeMap<String, ListenerStatus>,
    pub healthy: bool,
}

impl HealthSnapshot {
    pub fn status(&self, listener: &str) -> Option<ListenerStatus> {
        self.per_listener.get(listener).copied()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "perListener": self.per_listener,
            "healthy": self.healthy,
        })
    }
}

/// Collects health snapshots.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    probe_timeout: Duration,
}

impl HealthReporter {
    pub fn new(probe_timeout: Duration) -> Self {
        HealthReporter { probe_timeout }
    }

    /// Probes every `(name, probe)` pair; the snapshot is healthy when all are connected.
    pub async fn check<'a, I>(&self, probes: I) -> HealthSnapshot
    where
        I: IntoIterator<Item = (&'a str, &'a dyn ConnectivityProbe)>,
    {
        let checks = probes.into_iter().map(|(name, probe)| async move {
            let connected = match timeout(
                self.probe_timeout,
                AssertUnwindSafe(probe.is_connected()).catch_unwind(),
            )
            .await
            {
                Ok(Ok(connected)) => connected,
                Ok(Err(_)) => {
                    warn!(listener = name, "health probe panicked");
                    false
                }
                Err(_) => {
                    warn!(listener = name, "health probe timed out");
                    false
                }
            };
            (name.to_owned(), ListenerStatus::from(connected))
        });

        let per_listener: BTreeMap<String, ListenerStatus> =
            join_all(checks).await.into_iter().collect();
        let healthy = per_listener.values().all(|s| *s == ListenerStatus::Ok);

        HealthSnapshot {
            per_listener,
            healthy,
        }
    }
}
