// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process, implementing the same traits as the AMQP
//! binding. It supports queues, topics with ephemeral and durable subscriptions,
//! equality selectors and transactional acknowledgement, and lets tests inject faults:
//! dropping every live session, refusing new sessions, or refusing consumers on a
//! destination.
//!
//! Rolled-back messages are recorded and not redelivered.

use crate::{
    broker::{Acknowledger, ConnectionFactory, InboundMessage, MessageConsumer, Session},
    errors::BrokerError,
    policy::{ConsumerConfig, ConsumerKind},
    transaction::TransactionalResource,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::timeout_at};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Subscription {
    topic: String,
    selector: Option<Selector>,
    durable: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    generation: u64,
    available: bool,
    failing_sessions: usize,
    failing_destinations: HashSet<String>,
    next_id: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    subscriptions: BTreeMap<String, Subscription>,
    active_consumers: usize,
    sessions_opened: usize,
    acknowledged: Vec<String>,
    released: Vec<String>,
    rolled_back: Vec<String>,
}

impl BrokerState {
    fn check_generation(&self, generation: u64) -> Result<(), BrokerError> {
        if generation != self.generation {
            return Err(BrokerError::ConnectionLost(
                "broker connection was reset".to_owned(),
            ));
        }
        Ok(())
    }
}

/// In-process broker; clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a message on a queue and returns its id.
    pub fn send(&self, queue: &str, payload: &[u8], headers: &[(&str, &str)]) -> String {
        let msg = {
            let mut state = self.lock();
            let msg = new_message(&mut state, payload, headers);
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(msg.clone());
            msg
        };
        self.notify.notify_waiters();
        msg.id
    }

    /// Publishes a message to every matching subscription of a topic.
    pub fn publish(&self, topic: &str, payload: &[u8], headers: &[(&str, &str)]) -> String {
        let id = {
            let mut state = self.lock();
            let msg = new_message(&mut state, payload, headers);
            let targets: Vec<String> = state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.topic == topic)
                .filter(|(_, sub)| {
                    sub.selector
                        .as_ref()
                        .map_or(true, |s| s.matches(&msg.headers))
                })
                .map(|(queue, _)| queue.clone())
                .collect();
            for queue in targets {
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .push_back(msg.clone());
            }
            msg.id
        };
        self.notify.notify_waiters();
        id
    }

    /// Invalidates every open session, as a dropped broker connection would.
    pub fn disconnect(&self) {
        self.lock().generation += 1;
        self.notify.notify_waiters();
    }

    /// Refuses (false) or accepts (true) new sessions.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Makes the next `n` session creations fail.
    pub fn fail_next_sessions(&self, n: usize) {
        self.lock().failing_sessions = n;
    }

    /// Refuses consumers on `destination` until `restore_destination` is called.
    pub fn fail_destination(&self, destination: &str) {
        self.lock().failing_destinations.insert(destination.to_owned());
    }

    pub fn restore_destination(&self, destination: &str) {
        self.lock().failing_destinations.remove(destination);
    }

    /// Ids of messages whose acknowledgement was committed, in commit order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Ids of messages delivered inside a rolled-back transaction.
    pub fn rolled_back(&self) -> Vec<String> {
        self.lock().rolled_back.clone()
    }

    /// Ids of messages committed without an acknowledgement.
    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    pub fn active_consumers(&self) -> usize {
        self.lock().active_consumers
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Identities of the durable subscriptions, `{topic}.{subscription}`.
    pub fn durable_subscriptions(&self) -> Vec<String> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|(_, s)| s.durable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }
}

fn new_message(
    state: &mut BrokerState,
    payload: &[u8],
    headers: &[(&str, &str)],
) -> StoredMessage {
    state.next_id += 1;
    StoredMessage {
        id: format!("ID:{}", state.next_id),
        payload: payload.to_vec(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_session(&self) -> Result<Box<dyn Session>, BrokerError> {
        let generation = {
            let mut state = self.lock();
            if !state.available {
                return Err(BrokerError::SessionCreation(
                    "broker unavailable".to_owned(),
                ));
            }
            if state.failing_sessions > 0 {
                state.failing_sessions -= 1;
                return Err(BrokerError::SessionCreation(
                    "broker refused session".to_owned(),
                ));
            }
            state.sessions_opened += 1;
            state.generation
        };

        Ok(Box::new(MemorySession {
            broker: self.clone(),
            generation,
            closed: AtomicBool::new(false),
            resource: Arc::new(MemoryResource {
                broker: self.clone(),
                generation,
                in_flight: Mutex::new(vec![]),
            }),
        }))
    }
}

struct MemorySession {
    broker: InMemoryBroker,
    generation: u64,
    closed: AtomicBool,
    resource: Arc<MemoryResource>,
}

impl MemorySession {
    fn check(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost("session is closed".to_owned()));
        }
        state.check_generation(self.generation)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_consumer(
        &self,
        cfg: &ConsumerConfig,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        let selector = match cfg.selector.as_deref() {
            Some(expr) => Some(Selector::parse(expr)?),
            None => None,
        };

        let mut state = self.broker.lock();
        self.check(&state)?;

        if state.failing_destinations.contains(&cfg.destination) {
            return Err(BrokerError::ConsumerCreation {
                destination: cfg.destination.clone(),
                reason: "destination refused consumer".to_owned(),
            });
        }

        let (queue, queue_selector, ephemeral) = match &cfg.kind {
            ConsumerKind::Queue => (cfg.destination.clone(), selector, false),
            ConsumerKind::Topic => {
                let queue = format!("{}.~{}", cfg.destination, Uuid::new_v4());
                state.subscriptions.insert(
                    queue.clone(),
                    Subscription {
                        topic: cfg.destination.clone(),
                        selector,
                        durable: false,
                    },
                );
                (queue, None, true)
            }
            ConsumerKind::DurableTopic { .. } => {
                let queue = cfg.subscription_identity().unwrap_or_default();
                let reuse = state
                    .subscriptions
                    .get(&queue)
                    .is_some_and(|s| s.topic == cfg.destination && s.selector == selector);
                if !reuse {
                    // a changed subscription starts over
                    state.queues.remove(&queue);
                    state.subscriptions.insert(
                        queue.clone(),
                        Subscription {
                            topic: cfg.destination.clone(),
                            selector,
                            durable: true,
                        },
                    );
                }
                (queue, None, false)
            }
        };

        state.queues.entry(queue.clone()).or_default();
        state.active_consumers += 1;
        debug!(queue = %queue, "memory consumer created");

        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            generation: self.generation,
            destination: cfg.destination.clone(),
            queue,
            selector: queue_selector,
            ephemeral,
            resource: self.resource.clone(),
            closed: false,
        }))
    }

    fn transactional_resource(&self) -> Arc<dyn TransactionalResource> {
        self.resource.clone()
    }

    async fn start(&self) -> Result<(), BrokerError> {
        let state = self.broker.lock();
        self.check(&state)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    broker: InMemoryBroker,
    generation: u64,
    destination: String,
    queue: String,
    selector: Option<Selector>,
    ephemeral: bool,
    resource: Arc<MemoryResource>,
    closed: bool,
}

impl MemoryConsumer {
    fn take_next(&self) -> Result<Option<InboundMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::ConnectionLost("consumer is closed".to_owned()));
        }

        let mut state = self.broker.lock();
        state.check_generation(self.generation)?;

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Ok(None);
        };
        let position = queue
            .iter()
            .position(|m| self.selector.as_ref().map_or(true, |s| s.matches(&m.headers)));
        let Some(stored) = position.and_then(|idx| queue.remove(idx)) else {
            return Ok(None);
        };
        drop(state);

        self.resource.delivered(&stored.id);
        let acker = Arc::new(MemoryAcker {
            resource: self.resource.clone(),
            id: stored.id.clone(),
        });

        Ok(Some(InboundMessage::new(
            &stored.id,
            &self.destination,
            &stored.payload,
            stored.headers,
            acker,
        )))
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            // register before checking so a publish in between is not missed
            notified.as_mut().enable();

            if let Some(msg) = self.take_next()? {
                return Ok(Some(msg));
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.broker.lock();
        state.active_consumers = state.active_consumers.saturating_sub(1);
        if self.ephemeral {
            state.subscriptions.remove(&self.queue);
            state.queues.remove(&self.queue);
        }
        Ok(())
    }
}

struct InFlight {
    id: String,
    acked: bool,
}

struct MemoryResource {
    broker: InMemoryBroker,
    generation: u64,
    in_flight: Mutex<Vec<InFlight>>,
}

impl MemoryResource {
    fn in_flight(&self) -> MutexGuard<'_, Vec<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivered(&self, id: &str) {
        self.in_flight().push(InFlight {
            id: id.to_owned(),
            acked: false,
        });
    }

    fn ack(&self, id: &str) -> Result<(), BrokerError> {
        self.broker.lock().check_generation(self.generation)?;
        let mut in_flight = self.in_flight();
        match in_flight.iter_mut().find(|m| m.id == id) {
            Some(entry) => {
                entry.acked = true;
                Ok(())
            }
            None => Err(BrokerError::Acknowledge(id.to_owned())),
        }
    }
}

#[async_trait]
impl TransactionalResource for MemoryResource {
    async fn commit(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.check_generation(self.generation)?;
        for entry in self.in_flight().drain(..) {
            if entry.acked {
                state.acknowledged.push(entry.id);
            } else {
                state.released.push(entry.id);
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.check_generation(self.generation)?;
        state
            .rolled_back
            .extend(self.in_flight().drain(..).map(|entry| entry.id));
        Ok(())
    }
}

struct MemoryAcker {
    resource: Arc<MemoryResource>,
    id: String,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.resource.ack(&self.id)
    }
}

/// Conjunction of header comparisons: `key = 'value' AND other <> 'value'`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selector {
    terms: Vec<(String, bool, String)>,
}

impl Selector {
    fn parse(expr: &str) -> Result<Selector, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidSelector {
            selector: expr.to_owned(),
            reason: reason.to_owned(),
        };

        let mut terms = vec![];
        for term in split_and(expr) {
            let (key, equal, value) = if let Some((k, v)) = term.split_once("<>") {
                (k, false, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, true, v)
            } else {
                return Err(invalid("expected `key = 'value'`"));
            };

            let key = key.trim();
            let value = value.trim();
            let valid_key = key
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
            if key.is_empty() || !valid_key {
                return Err(invalid("invalid header name"));
            }
            let Some(value) = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
            else {
                return Err(invalid("values must be quoted"));
            };
            terms.push((key.to_owned(), equal, value.to_owned()));
        }

        if terms.is_empty() {
            return Err(invalid("empty selector"));
        }
        Ok(Selector { terms })
    }

    fn matches(&self, headers: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(key, equal, value)| {
            let actual = headers.get(key);
            if *equal {
                actual == Some(value)
            } else {
                actual.is_some_and(|a| a != value)
            }
        })
    }
}

/// Splits on ` AND ` (any case) outside quoted values.
fn split_and(expr: &str) -> Vec<&str> {
    const SEPARATOR: &[u8] = b" AND ";

    let bytes = expr.as_bytes();
    let mut parts = vec![];
    let mut start = 0;
    let mut quoted = false;
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\'' {
            quoted = !quoted;
        } else if !quoted
            && bytes.len() - idx >= SEPARATOR.len()
            && bytes[idx..idx + SEPARATOR.len()].eq_ignore_ascii_case(SEPARATOR)
        {
            parts.push(&expr[start..idx]);
            idx += SEPARATOR.len();
            start = idx;
            continue;
        }
        idx += 1;
    }

    if !expr[start..].trim().is_empty() {
        parts.push(&expr[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(kind: ConsumerKind, destination: &str, selector: Option<&str>) -> ConsumerConfig {
        ConsumerConfig {
            listener: "test".into(),
            destination: destination.into(),
            kind,
            selector: selector.map(str::to_owned),
        }
    }

    async fn consumer(broker: &InMemoryBroker, cfg: &ConsumerConfig) -> Box<dyn MessageConsumer> {
        let session = broker.create_session().await.unwrap();
        session.create_consumer(cfg).await.unwrap()
    }

    #[test]
    fn selector_parsing() {
        let sel = Selector::parse("region = 'eu' and kind <> 'test'").unwrap();
        let headers = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        assert!(sel.matches(&headers(&[("region", "eu"), ("kind", "prod")])));
        assert!(!sel.matches(&headers(&[("region", "eu"), ("kind", "test")])));
        assert!(!sel.matches(&headers(&[("kind", "prod")])));

        assert!(Selector::parse("region = eu").is_err());
        assert!(Selector::parse("region LIKE 'e%'").is_err());
        assert!(Selector::parse("  ").is_err());
    }

    #[test]
    fn selector_values_may_contain_and() {
        let sel = Selector::parse("name = 'salt AND pepper' AND kind = 'spice'").unwrap();
        let headers: BTreeMap<String, String> = [("name", "salt AND pepper"), ("kind", "spice")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert_eq!(sel.terms.len(), 2);
        assert!(sel.matches(&headers));
        assert_eq!(
            split_and("a = 'x and y' and b = 'z'"),
            vec!["a = 'x and y'", "b = 'z'"]
        );
    }

    #[tokio::test]
    async fn queue_selector_skips_non_matching_messages() {
        let broker = InMemoryBroker::new();
        broker.send("orders", b"1", &[("kind", "a")]);
        let wanted = broker.send("orders", b"2", &[("kind", "b")]);

        let mut consumer = consumer(
            &broker,
            &cfg(ConsumerKind::Queue, "orders", Some("kind = 'b'")),
        )
        .await;
        let msg = consumer
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(msg.id(), wanted);
        assert_eq!(msg.text(), Some("2"));
        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn receive_times_out_with_none() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, &cfg(ConsumerKind::Queue, "empty", None)).await;

        assert!(consumer
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn receive_wakes_on_send() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, &cfg(ConsumerKind::Queue, "late", None)).await;

        let sender = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send("late", b"hello", &[]);
        });

        let msg = consumer.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.and_then(|m| m.text().map(str::to_owned)), Some("hello".into()));
    }

    #[tokio::test]
    async fn ephemeral_subscription_goes_away_on_close() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, &cfg(ConsumerKind::Topic, "audit", None)).await;
        broker.publish("audit", b"x", &[]);

        assert_eq!(broker.subscription_count("audit"), 1);
        assert!(consumer
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        assert_eq!(broker.subscription_count("audit"), 0);
        assert_eq!(broker.active_consumers(), 0);
    }

    #[tokio::test]
    async fn durable_subscription_keeps_messages_across_consumers() {
        let broker = InMemoryBroker::new();
        let durable = cfg(
            ConsumerKind::DurableTopic {
                subscription: "Audit".into(),
            },
            "audit",
            None,
        );

        let mut first = consumer(&broker, &durable).await;
        first.close().await.unwrap();
        broker.publish("audit", b"while away", &[]);

        let mut second = consumer(&broker, &durable).await;
        let msg = second.receive(Duration::from_millis(10)).await.unwrap();

        assert_eq!(msg.and_then(|m| m.text().map(str::to_owned)), Some("while away".into()));
        assert_eq!(broker.durable_subscriptions(), vec!["audit.Audit".to_owned()]);
    }

    #[tokio::test]
    async fn commit_and_rollback_settle_in_flight_messages() {
        let broker = InMemoryBroker::new();
        let acked = broker.send("q", b"a", &[]);
        let dropped = broker.send("q", b"b", &[]);

        let session = broker.create_session().await.unwrap();
        let mut consumer = session
            .create_consumer(&cfg(ConsumerKind::Queue, "q", None))
            .await
            .unwrap();
        let resource = session.transactional_resource();

        let msg = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        msg.acknowledge().await.unwrap();
        resource.commit().await.unwrap();

        consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        resource.rollback().await.unwrap();

        assert_eq!(broker.acknowledged(), vec![acked]);
        assert_eq!(broker.rolled_back(), vec![dropped]);
    }

    #[tokio::test]
    async fn disconnect_invalidates_sessions() {
        let broker = InMemoryBroker::new();
        let session = broker.create_session().await.unwrap();
        let mut consumer = session
            .create_consumer(&cfg(ConsumerKind::Queue, "q", None))
            .await
            .unwrap();

        broker.disconnect();

        let err = consumer.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(session.start().await.unwrap_err().is_connection_lost());
        assert!(broker.create_session().await.is_ok());
    }
}
