// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Worker
//!
//! One `ListenerWorker` runs per activated listener. It spawns a tokio task that owns
//! the listener's `ConsumerSession` and drives the receive loop: every message is
//! processed inside its own transaction (begin, enlist the session resource, run the
//! handler, acknowledge, commit) and is rolled back when anything but a lost connection
//! fails.
//!
//! The task is the only place where session state changes. Connection loss and failed
//! probes are acted on inside the task; `close` and `is_connected` only send it
//! requests.

use crate::{
    broker::{ConnectionFactory, InboundMessage},
    definition::{AcknowledgeMode, ListenerDefinition},
    errors::{ActivationError, BrokerError, HandlerError, TransactionError},
    health::ConnectivityProbe,
    policy::{consumer_config, ConsumerConfig},
    registry::MessageHandler,
    resolver::DestinationResolver,
    retry::RetryPolicy,
    session::{ConsumerSession, SessionState},
    settings::ActivationSettings,
    transaction::{Transaction, TransactionCoordinator},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{ops::ControlFlow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// External collaborators shared by every worker.
#[derive(Clone)]
pub struct BrokerContext {
    pub factory: Arc<dyn ConnectionFactory>,
    pub resolver: Arc<dyn DestinationResolver>,
    pub transactions: Arc<dyn TransactionCoordinator>,
}

impl BrokerContext {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        resolver: Arc<dyn DestinationResolver>,
        transactions: Arc<dyn TransactionCoordinator>,
    ) -> Self {
        BrokerContext {
            factory,
            resolver,
            transactions,
        }
    }
}

/// Externally visible state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Listening,
    Closed,
}

enum Command {
    Probe(oneshot::Sender<bool>),
}

/// Handle to a running listener.
pub struct ListenerWorker {
    name: String,
    config: ConsumerConfig,
    commands: mpsc::Sender<Command>,
    stop: watch::Sender<bool>,
    state: watch::Receiver<WorkerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
    probe_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ListenerWorker {
    /// Resolves the consumer configuration and spawns the receive loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `ActivationError::Configuration` when the definition cannot be mapped to a
    /// consumer. Broker failures are not reported here; the loop retries them.
    pub fn start(
        def: &ListenerDefinition,
        handler: Arc<dyn MessageHandler>,
        ctx: &BrokerContext,
        settings: &ActivationSettings,
    ) -> Result<ListenerWorker, ActivationError> {
        info!(listener = def.name(), "activating listener");

        let config = consumer_config(def, ctx.resolver.as_ref())?;

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

        let receive_loop = ReceiveLoop {
            listener: def.name().to_owned(),
            config: config.clone(),
            ack_mode: def.ack_mode(),
            handler,
            factory: ctx.factory.clone(),
            transactions: ctx.transactions.clone(),
            retry: settings.retry.clone(),
            receive_timeout: settings.receive_timeout,
            session: ConsumerSession::new(),
            state: state_tx,
            commands: commands_rx,
            stop: stop_rx,
        };

        let handle = tokio::spawn(receive_loop.run());

        Ok(ListenerWorker {
            name: def.name().to_owned(),
            config,
            commands: commands_tx,
            stop: stop_tx,
            state: state_rx,
            handle: Mutex::new(Some(handle)),
            probe_timeout: settings.probe_timeout,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Last state published by the worker task.
    pub fn state(&self) -> WorkerState {
        match self.state.has_changed() {
            // sender gone: the task has ended
            Err(_) => WorkerState::Closed,
            Ok(_) => *self.state.borrow(),
        }
    }

    /// Waits until the worker reaches `expected` or `limit` elapses.
    pub async fn wait_for(&self, expected: WorkerState, limit: Duration) -> bool {
        let mut state = self.state.clone();
        timeout(limit, state.wait_for(|s| *s == expected))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Asks the worker task to check its session.
    ///
    /// The task confirms delivery on the live session. A failed check marks the worker
    /// as not started so the loop reconnects; the probe itself never reconnects. When
    /// the task is busy longer than the probe timeout, the last published state
    /// answers instead.
    pub async fn is_connected(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();

        let probe = async {
            if self.commands.send(Command::Probe(reply_tx)).await.is_err() {
                return false;
            }
            reply_rx.await.unwrap_or(false)
        };

        match timeout(self.probe_timeout, probe).await {
            Ok(connected) => connected,
            Err(_) => {
                let state = self.state();
                debug!(listener = %self.name, ?state, "probe timed out, using last state");
                state == WorkerState::Listening
            }
        }
    }

    /// Stops the receive loop and releases the session. A second call is a no-op.
    ///
    /// A message being dispatched is finished first; the task is aborted if it does not
    /// stop within the shutdown timeout.
    pub async fn close(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        info!(listener = %self.name, "shutting down listener");
        // the task may already be gone; nothing to signal then
        let _ = self.stop.send(true);

        let abort = handle.abort_handle();
        match timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(listener = %self.name, error = err.to_string(), "listener task failed")
            }
            Err(_) => {
                warn!(listener = %self.name, "listener did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl ConnectivityProbe for ListenerWorker {
    async fn is_connected(&self) -> bool {
        ListenerWorker::is_connected(self).await
    }
}

#[derive(Error, Debug)]
enum DispatchError {
    #[error("handler failure: {0}")]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl DispatchError {
    fn is_connection_lost(&self) -> bool {
        match self {
            DispatchError::Handler(_) => false,
            DispatchError::Broker(e) => e.is_connection_lost(),
            DispatchError::Transaction(e) => e.is_connection_lost(),
        }
    }
}

struct ReceiveLoop {
    listener: String,
    config: ConsumerConfig,
    ack_mode: AcknowledgeMode,
    handler: Arc<dyn MessageHandler>,
    factory: Arc<dyn ConnectionFactory>,
    transactions: Arc<dyn TransactionCoordinator>,
    retry: RetryPolicy,
    receive_timeout: Duration,
    session: ConsumerSession,
    state: watch::Sender<WorkerState>,
    commands: mpsc::Receiver<Command>,
    stop: watch::Receiver<bool>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            if !self.is_started() {
                let mut stop = self.stop.clone();
                let started = tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    started = self.ensure_started() => started,
                };

                if !started {
                    // startup exhausted; stay reachable and try again after one delay
                    if self.idle(self.retry.delay).await.is_break() {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                Some(cmd) = self.commands.recv() => self.handle_command(cmd).await,
                received = self.session.receive(self.receive_timeout) => match received {
                    Ok(None) => {}
                    Ok(Some(msg)) => self.dispatch(msg).await,
                    Err(err) if err.is_connection_lost() => self.connection_lost(&err).await,
                    Err(err) => warn!(
                        listener = %self.listener,
                        error = err.to_string(),
                        "failure to receive message"
                    ),
                },
            }
        }

        self.session.close().await;
        self.publish(WorkerState::Closed);
        info!(listener = %self.listener, "listener stopped");
    }

    /// Opens the session and consumer unless already started.
    async fn ensure_started(&mut self) -> bool {
        if self.is_started() {
            return true;
        }

        self.publish(WorkerState::Connecting);
        let mut attempts = self.retry.attempts();

        loop {
            match self.session.open(self.factory.as_ref(), &self.config).await {
                Ok(()) => {
                    info!(
                        listener = %self.listener,
                        destination = %self.config.destination,
                        topic = self.config.is_topic(),
                        durable = self.config.is_durable(),
                        selector = self.config.selector.as_deref().unwrap_or_default(),
                        "consumer {} is connected to {}",
                        self.listener,
                        self.config
                    );
                    self.publish(WorkerState::Listening);
                    return true;
                }
                Err(err) => match attempts.failed() {
                    Some(delay) => {
                        warn!(
                            listener = %self.listener,
                            attempt = attempts.made(),
                            error = err.to_string(),
                            "failure to start consumer, retrying"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        error!(
                            listener = %self.listener,
                            attempts = attempts.made(),
                            error = err.to_string(),
                            "giving up starting consumer"
                        );
                        return false;
                    }
                },
            }
        }
    }

    /// Waits `delay` while still answering probes; breaks on stop.
    async fn idle(&mut self, delay: Duration) -> ControlFlow<()> {
        let pause = sleep(delay);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.changed() => return ControlFlow::Break(()),
                Some(cmd) = self.commands.recv() => self.handle_command(cmd).await,
                _ = &mut pause => return ControlFlow::Continue(()),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Probe(reply) => {
                let connected = self.probe().await;
                // the caller may have given up waiting
                let _ = reply.send(connected);
            }
        }
    }

    async fn probe(&mut self) -> bool {
        if !self.is_started() {
            return false;
        }

        match self.session.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(listener = %self.listener, error = err.to_string(), "session probe failed");
                self.session.fail().await;
                self.publish(WorkerState::Connecting);
                false
            }
        }
    }

    async fn connection_lost(&mut self, err: &BrokerError) {
        warn!(listener = %self.listener, error = err.to_string(), "connection lost, reconnecting");
        self.session.fail().await;
        self.publish(WorkerState::Connecting);
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        let span = info_span!("message", listener = %self.listener, message_id = %msg.id());
        self.dispatch_in_transaction(msg).instrument(span).await
    }

    async fn dispatch_in_transaction(&mut self, msg: InboundMessage) {
        debug!("processing message");

        let mut tx = match self.transactions.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                error!(
                    message_id = msg.id(),
                    error = err.to_string(),
                    "failure to begin transaction"
                );
                self.discard(&msg).await;
                return;
            }
        };

        match self.process(tx.as_mut(), &msg).await {
            Ok(()) => debug!("done processing message"),
            Err(err) if err.is_connection_lost() => {
                // no rollback: the session that would roll back is gone
                let cause = BrokerError::ConnectionLost(err.to_string());
                self.connection_lost(&cause).await;
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(message_id = msg.id(), error = e.to_string(), "failure to rollback");
                }
                error!(
                    message_id = msg.id(),
                    error = err.to_string(),
                    "exception processing message, rolled back"
                );
            }
        }
    }

    /// Settles a delivery that never got a transaction, so the next one does not
    /// commit it.
    async fn discard(&mut self, msg: &InboundMessage) {
        let Some(resource) = self.session.resource() else {
            return;
        };
        match resource.rollback().await {
            Ok(()) => warn!(
                message_id = msg.id(),
                "message rolled back without a transaction"
            ),
            Err(err) if err.is_connection_lost() => self.connection_lost(&err).await,
            Err(err) => warn!(
                message_id = msg.id(),
                error = err.to_string(),
                "failure to rollback"
            ),
        }
    }

    async fn process(
        &self,
        tx: &mut dyn Transaction,
        msg: &InboundMessage,
    ) -> Result<(), DispatchError> {
        let resource = self
            .session
            .resource()
            .ok_or_else(|| BrokerError::ConnectionLost("no active session".to_owned()))?;
        tx.enlist(resource).await?;

        AssertUnwindSafe(self.handler.on_message(msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::from("handler panicked")))?;

        if self.ack_mode == AcknowledgeMode::Auto {
            msg.acknowledge().await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.session.state() == SessionState::Active
    }

    fn publish(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}
