// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Activation
//!
//! The `ActivationCoordinator` turns a `ListenerRegistry` into running workers. It
//! activates every registered listener once, keeps the name → worker map for the rest
//! of its life, closes every worker on shutdown and answers health queries.
//!
//! A listener that cannot be activated is logged and reported in the
//! `ActivationSummary`; it never stops the others from starting.

use crate::{
    errors::ActivationError,
    health::{ConnectivityProbe, HealthReporter, HealthSnapshot},
    registry::ListenerRegistry,
    settings::ActivationSettings,
    worker::{BrokerContext, ListenerWorker, WorkerState},
};
use futures_util::future::join_all;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};
use tracing::{error, info};

/// Outcome of `ActivationCoordinator::init`.
#[derive(Debug, Default)]
pub struct ActivationSummary {
    pub activated: Vec<String>,
    pub failed: Vec<(String, ActivationError)>,
}

/// Starts, supervises and stops the listeners of a registry.
pub struct ActivationCoordinator {
    registry: ListenerRegistry,
    context: BrokerContext,
    settings: ActivationSettings,
    health: HealthReporter,
    workers: OnceLock<BTreeMap<String, ListenerWorker>>,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl ActivationCoordinator {
    pub fn new(
        registry: ListenerRegistry,
        context: BrokerContext,
        settings: ActivationSettings,
    ) -> Self {
        ActivationCoordinator {
            registry,
            context,
            health: HealthReporter::new(settings.probe_timeout),
            settings,
            workers: OnceLock::new(),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts one worker per registered listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `ActivationError::Stopped` after `shutdown`, `ActivationError::AlreadyInitialized`
    /// on a second call. Per-listener failures are returned in the summary instead.
    pub fn init(&self) -> Result<ActivationSummary, ActivationError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ActivationError::Stopped);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(ActivationError::AlreadyInitialized);
        }

        let mut summary = ActivationSummary::default();
        let mut workers = BTreeMap::new();

        for entry in self.registry.entries() {
            let name = entry.definition.name();
            info!(listener = name, "initializing message listener");

            match ListenerWorker::start(
                &entry.definition,
                entry.handler.clone(),
                &self.context,
                &self.settings,
            ) {
                Ok(worker) => {
                    workers.insert(name.to_owned(), worker);
                    summary.activated.push(name.to_owned());
                }
                Err(err) => {
                    error!(
                        listener = name,
                        error = err.to_string(),
                        "failure to activate listener"
                    );
                    summary.failed.push((name.to_owned(), err));
                }
            }
        }

        if self.workers.set(workers).is_err() {
            return Err(ActivationError::AlreadyInitialized);
        }

        info!(
            activated = summary.activated.len(),
            failed = summary.failed.len(),
            "listeners activated"
        );
        Ok(summary)
    }

    /// Closes every worker. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("shutting down listeners");
        if let Some(workers) = self.workers.get() {
            join_all(workers.values().map(ListenerWorker::close)).await;
        }
        info!("listeners shut down");
    }

    /// Probes every worker and aggregates the result.
    pub async fn health_check(&self) -> HealthSnapshot {
        let workers = self.workers.get();
        let probes = workers
            .into_iter()
            .flatten()
            .map(|(name, worker)| (name.as_str(), worker as &dyn ConnectivityProbe));

        self.health.check(probes).await
    }

    pub fn listener_names(&self) -> Vec<&str> {
        self.workers
            .get()
            .map(|w| w.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn worker(&self, name: &str) -> Option<&ListenerWorker> {
        self.workers.get().and_then(|w| w.get(name))
    }

    pub fn worker_state(&self, name: &str) -> Option<WorkerState> {
        self.worker(name).map(ListenerWorker::state)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
