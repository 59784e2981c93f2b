// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The traits a broker binding implements so listeners can be activated against it:
//! a `ConnectionFactory` opening transactional sessions, the `Session` creating
//! consumers and exposing its transactional resource, and the `MessageConsumer`
//! pulling messages. `InboundMessage` is the payload handed to handlers.

use crate::{errors::BrokerError, policy::ConsumerConfig, transaction::TransactionalResource};
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Produces new transactional sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn Session>, BrokerError>;
}

/// A transactional broker session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Creates the consumer described by `cfg`.
    async fn create_consumer(
        &self,
        cfg: &ConsumerConfig,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    /// The resource to enlist in the per-message transaction.
    fn transactional_resource(&self) -> Arc<dyn TransactionalResource>;

    /// Starts (or confirms) message delivery; fails when the session is no longer usable.
    async fn start(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Pulls messages for one consumer.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Waits at most `timeout` for the next message; `Ok(None)` means nothing arrived.
    ///
    /// Implementations must be cancel-safe: dropping the future before it completes
    /// must not lose a message.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Acknowledges one delivered message.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self) -> Result<(), BrokerError>;
}

/// A message delivered to a listener.
#[derive(Clone)]
pub struct InboundMessage {
    id: String,
    destination: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        id: &str,
        destination: &str,
        payload: &[u8],
        headers: BTreeMap<String, String>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        InboundMessage {
            id: id.to_owned(),
            destination: destination.to_owned(),
            payload: payload.to_vec(),
            headers,
            acker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Acknowledges the message within the current transaction.
    pub async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.acker.acknowledge().await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}
