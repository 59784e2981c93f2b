// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Binding
//!
//! Implements the broker traits on top of lapin. Each session owns a connection and a
//! channel in transaction mode, so the acknowledgement of a delivery is only applied
//! when the per-message transaction commits the channel.
//!
//! Topics are modelled as durable topic exchanges:
//! * a plain topic subscription is a server-named, exclusive, auto-delete queue;
//! * a durable subscription is a durable queue named `{topic}.{subscription}`, consumed
//!   exclusively so at most one consumer holds it.
//!
//! Deliveries stay pending on the session until the transaction settles them. A
//! rollback only discards the acknowledgements made inside it, so every delivery of a
//! rolled-back transaction is rejected afterwards, and a commit rejects the deliveries
//! the handler never acknowledged. Nothing is left unsettled to hold the prefetch
//! window.
//!
//! AMQP has no message selectors. On a topic the selector is used as the binding
//! routing key; on a queue it is rejected.

use crate::{
    broker::{Acknowledger, ConnectionFactory, InboundMessage, MessageConsumer, Session},
    channel::{new_transactional_channel, AmqpSettings},
    errors::BrokerError,
    policy::{ConsumerConfig, ConsumerKind},
    transaction::TransactionalResource,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    Channel, Connection, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, warn};
use uuid::Uuid;

const ALL_ROUTING_KEYS: &str = "#";

/// Opens lapin sessions against one RabbitMQ server.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnectionFactory {
    settings: AmqpSettings,
}

impl AmqpConnectionFactory {
    pub fn new(settings: AmqpSettings) -> Self {
        AmqpConnectionFactory { settings }
    }
}

#[async_trait]
impl ConnectionFactory for AmqpConnectionFactory {
    async fn create_session(&self) -> Result<Box<dyn Session>, BrokerError> {
        let (connection, channel) = new_transactional_channel(&self.settings).await?;
        let resource = Arc::new(AmqpResource {
            channel: channel.clone(),
            pending: PendingDeliveries::default(),
        });
        Ok(Box::new(AmqpSession {
            connection,
            channel,
            resource,
        }))
    }
}

struct AmqpSession {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    resource: Arc<AmqpResource>,
}

impl AmqpSession {
    async fn subscription_queue(&self, cfg: &ConsumerConfig) -> Result<String, lapin::Error> {
        self.channel
            .exchange_declare(
                &cfg.destination,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (name, options) = match &cfg.kind {
            ConsumerKind::DurableTopic { .. } => (
                cfg.subscription_identity().unwrap_or_default(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            ),
            _ => (
                String::new(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            ),
        };

        let queue = self
            .channel
            .queue_declare(&name, options, FieldTable::default())
            .await?;
        let queue = queue.name().as_str().to_owned();

        self.channel
            .queue_bind(
                &queue,
                &cfg.destination,
                binding_key(cfg),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(queue)
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_consumer(
        &self,
        cfg: &ConsumerConfig,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        let creation_error = |err: lapin::Error| BrokerError::ConsumerCreation {
            destination: cfg.destination.clone(),
            reason: err.to_string(),
        };

        let queue = match cfg.kind {
            ConsumerKind::Queue => {
                if let Some(selector) = &cfg.selector {
                    return Err(BrokerError::InvalidSelector {
                        selector: selector.clone(),
                        reason: "amqp queues do not support selectors".to_owned(),
                    });
                }
                cfg.destination.clone()
            }
            _ => self.subscription_queue(cfg).await.map_err(creation_error)?,
        };

        let tag = format!("{}-{}", cfg.listener, Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    exclusive: cfg.is_durable(),
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(creation_error)?;

        debug!(queue = queue, tag = tag, "amqp consumer created");

        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            consumer,
            tag,
            destination: cfg.destination.clone(),
            resource: self.resource.clone(),
        }))
    }

    fn transactional_resource(&self) -> Arc<dyn TransactionalResource> {
        self.resource.clone()
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.connection.status().connected() && self.channel.status().connected() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost(
                "amqp channel is not connected".to_owned(),
            ))
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "listener closed").await {
                warn!(error = err.to_string(), "error to close the channel");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "listener closed")
                .await
                .map_err(|err| BrokerError::Resource(err.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpConsumer {
    channel: Arc<Channel>,
    consumer: lapin::Consumer,
    tag: String,
    destination: String,
    resource: Arc<AmqpResource>,
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::ConnectionLost(
                "amqp consumer was cancelled".to_owned(),
            )),
            Ok(Some(Err(err))) => Err(receive_error(err)),
            Ok(Some(Ok(delivery))) => Ok(Some(inbound_message(
                &self.destination,
                delivery,
                &self.resource,
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|err| BrokerError::Resource(err.to_string()))
    }
}

/// Channel transaction plus the deliveries it has to settle.
struct AmqpResource {
    channel: Arc<Channel>,
    pending: PendingDeliveries,
}

#[async_trait]
impl TransactionalResource for AmqpResource {
    async fn commit(&self) -> Result<(), BrokerError> {
        self.pending.settle(Outcome::Commit).await?;
        self.channel.tx_commit().await.map_err(receive_error)
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.channel.tx_rollback().await.map_err(receive_error)?;
        // the rejections are transactional too
        self.pending.settle(Outcome::Rollback).await?;
        self.channel.tx_commit().await.map_err(receive_error)
    }
}

/// Settles one delivery on its channel.
#[async_trait]
trait Settlement: Send + Sync {
    async fn accept(&self) -> Result<(), BrokerError>;

    /// Rejects without requeue, so the broker dead-letters or drops it.
    async fn reject(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl Settlement for Acker {
    async fn accept(&self) -> Result<(), BrokerError> {
        self.ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| BrokerError::Acknowledge(err.to_string()))
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await
        .map_err(receive_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

struct Pending {
    tag: u64,
    delivery: Arc<dyn Settlement>,
    acked: bool,
}

#[derive(Default)]
struct PendingDeliveries {
    entries: Mutex<Vec<Pending>>,
}

impl PendingDeliveries {
    fn entries(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivered(&self, tag: u64, delivery: Arc<dyn Settlement>) {
        self.entries().push(Pending {
            tag,
            delivery,
            acked: false,
        });
    }

    async fn acknowledge(&self, tag: u64) -> Result<(), BrokerError> {
        let delivery = self
            .entries()
            .iter()
            .find(|p| p.tag == tag)
            .map(|p| p.delivery.clone());
        let Some(delivery) = delivery else {
            return Err(BrokerError::Acknowledge(format!(
                "delivery {tag} is already settled"
            )));
        };

        delivery.accept().await?;
        if let Some(entry) = self.entries().iter_mut().find(|p| p.tag == tag) {
            entry.acked = true;
        }
        Ok(())
    }

    /// Rejects what the outcome leaves unsettled: every delivery on rollback, the
    /// unacknowledged ones on commit.
    async fn settle(&self, outcome: Outcome) -> Result<(), BrokerError> {
        let pending: Vec<Pending> = self.entries().drain(..).collect();
        for entry in pending {
            if outcome == Outcome::Rollback || !entry.acked {
                debug!(tag = entry.tag, ?outcome, "rejecting delivery");
                entry.delivery.reject().await?;
            }
        }
        Ok(())
    }
}

struct AmqpAcker {
    resource: Arc<AmqpResource>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.resource.pending.acknowledge(self.tag).await
    }
}

fn binding_key(cfg: &ConsumerConfig) -> &str {
    cfg.selector.as_deref().unwrap_or(ALL_ROUTING_KEYS)
}

fn receive_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannel(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => BrokerError::ConnectionLost(err.to_string()),
        _ => BrokerError::Receive(err.to_string()),
    }
}

fn inbound_message(
    destination: &str,
    delivery: Delivery,
    resource: &Arc<AmqpResource>,
) -> InboundMessage {
    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_owned())
        .unwrap_or_else(|| delivery.delivery_tag.to_string());

    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_map)
        .unwrap_or_default();

    let tag = delivery.delivery_tag;
    resource.pending.delivered(tag, Arc::new(delivery.acker));

    InboundMessage::new(
        &id,
        destination,
        &delivery.data,
        headers,
        Arc::new(AmqpAcker {
            resource: resource.clone(),
            tag,
        }),
    )
}

fn header_map(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_owned(),
                AMQPValue::Boolean(b) => b.to_string(),
                AMQPValue::LongInt(i) => i.to_string(),
                AMQPValue::LongLongInt(i) => i.to_string(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
