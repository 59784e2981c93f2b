// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Session
//!
//! Holds the broker session and the consumer of one listener. Only the worker task that
//! owns a `ConsumerSession` ever touches it; opening a new session always releases the
//! previous one first, so a listener never has two live consumers.

use crate::{
    broker::{ConnectionFactory, InboundMessage, MessageConsumer, Session},
    errors::BrokerError,
    policy::ConsumerConfig,
    transaction::TransactionalResource,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Lifecycle of a consumer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Active,
    Failed,
    Closed,
}

pub(crate) struct ConsumerSession {
    state: SessionState,
    session: Option<Box<dyn Session>>,
    consumer: Option<Box<dyn MessageConsumer>>,
}

impl ConsumerSession {
    pub(crate) fn new() -> Self {
        ConsumerSession {
            state: SessionState::Uninitialized,
            session: None,
            consumer: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Opens a session and creates the consumer described by `cfg`.
    pub(crate) async fn open(
        &mut self,
        factory: &dyn ConnectionFactory,
        cfg: &ConsumerConfig,
    ) -> Result<(), BrokerError> {
        if self.state == SessionState::Closed {
            return Err(BrokerError::SessionCreation("session is closed".to_owned()));
        }

        self.release().await;
        self.state = SessionState::Connecting;

        let session = match factory.create_session().await {
            Ok(s) => s,
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(err);
            }
        };

        let consumer = match session.create_consumer(cfg).await {
            Ok(c) => c,
            Err(err) => {
                if let Err(e) = session.close().await {
                    debug!(error = e.to_string(), "failure to close session");
                }
                self.state = SessionState::Failed;
                return Err(err);
            }
        };

        self.session = Some(session);
        self.consumer = Some(consumer);

        if let Err(err) = self.probe().await {
            self.fail().await;
            return Err(err);
        }

        self.state = SessionState::Active;
        Ok(())
    }

    /// Waits for the next message on the active consumer.
    pub(crate) async fn receive(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>, BrokerError> {
        match self.consumer.as_mut() {
            Some(consumer) => consumer.receive(timeout).await,
            None => Err(BrokerError::ConnectionLost("no active consumer".to_owned())),
        }
    }

    pub(crate) fn resource(&self) -> Option<Arc<dyn TransactionalResource>> {
        self.session.as_ref().map(|s| s.transactional_resource())
    }

    /// Confirms the session still delivers.
    pub(crate) async fn probe(&self) -> Result<(), BrokerError> {
        match self.session.as_ref() {
            Some(session) => session.start().await,
            None => Err(BrokerError::ConnectionLost("no active session".to_owned())),
        }
    }

    /// Drops the current handles after a failure; the session may be opened again.
    pub(crate) async fn fail(&mut self) {
        self.release().await;
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
    }

    /// Releases the handles for good. Calling it again does nothing.
    pub(crate) async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.release().await;
        self.state = SessionState::Closed;
    }

    async fn release(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(err) = consumer.close().await {
                warn!(error = err.to_string(), "failure to close consumer");
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "failure to close session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::InMemoryBroker, policy::ConsumerKind};

    fn queue_config(destination: &str) -> ConsumerConfig {
        ConsumerConfig {
            listener: "Audit".into(),
            destination: destination.into(),
            kind: ConsumerKind::Queue,
            selector: None,
        }
    }

    #[tokio::test]
    async fn open_creates_one_consumer() {
        let broker = InMemoryBroker::new();
        let mut session = ConsumerSession::new();
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.open(&broker, &queue_config("audit")).await.unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(broker.active_consumers(), 1);
        assert!(session.probe().await.is_ok());
    }

    #[tokio::test]
    async fn reopening_releases_the_previous_consumer() {
        let broker = InMemoryBroker::new();
        let mut session = ConsumerSession::new();
        let cfg = queue_config("audit");

        session.open(&broker, &cfg).await.unwrap();
        session.open(&broker, &cfg).await.unwrap();

        assert_eq!(broker.sessions_opened(), 2);
        assert_eq!(broker.active_consumers(), 1);
    }

    #[tokio::test]
    async fn refused_consumer_leaves_session_failed() {
        let broker = InMemoryBroker::new();
        broker.fail_destination("audit");
        let mut session = ConsumerSession::new();

        let err = session.open(&broker, &queue_config("audit")).await.unwrap_err();

        assert!(matches!(err, BrokerError::ConsumerCreation { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(broker.active_consumers(), 0);
        assert!(session.resource().is_none());
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_connection_loss() {
        let broker = InMemoryBroker::new();
        let mut session = ConsumerSession::new();
        session.open(&broker, &queue_config("audit")).await.unwrap();

        broker.disconnect();

        assert!(session.probe().await.unwrap_err().is_connection_lost());
        let err = session
            .receive(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());

        session.fail().await;
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(broker.active_consumers(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let broker = InMemoryBroker::new();
        let mut session = ConsumerSession::new();
        let cfg = queue_config("audit");
        session.open(&broker, &cfg).await.unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(broker.active_consumers(), 0);
        assert!(session.open(&broker, &cfg).await.is_err());
        assert!(session
            .receive(Duration::from_millis(10))
            .await
            .unwrap_err()
            .is_connection_lost());
    }
}
