// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Creation Policy
//!
//! Maps a listener's activation attributes to the consumer the broker binding must
//! create. The decision is pure: given the same definition and the same resolved
//! destination it always yields the same `ConsumerConfig`, which is what makes durable
//! resubscription idempotent.

use crate::{
    definition::{DestinationType, ListenerDefinition},
    errors::ActivationError,
    resolver::DestinationResolver,
};
use std::fmt;

/// The shape of consumer to create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    /// Point-to-point consumer on a queue
    Queue,
    /// Ephemeral subscription, gone when the consumer closes
    Topic,
    /// Named, non-shared subscription that survives disconnects
    DurableTopic { subscription: String },
}

/// Everything a broker binding needs to create one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub listener: String,
    pub destination: String,
    pub kind: ConsumerKind,
    pub selector: Option<String>,
}

impl ConsumerConfig {
    pub fn is_topic(&self) -> bool {
        !matches!(self.kind, ConsumerKind::Queue)
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.kind, ConsumerKind::DurableTopic { .. })
    }

    /// Stable identity of a durable subscription: `{topic}.{subscription}`.
    pub fn subscription_identity(&self) -> Option<String> {
        match &self.kind {
            ConsumerKind::DurableTopic { subscription } => {
                Some(format!("{}.{}", self.destination, subscription))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConsumerKind::Queue => write!(f, "queue {}", self.destination)?,
            ConsumerKind::Topic => write!(f, "topic {}", self.destination)?,
            ConsumerKind::DurableTopic { subscription } => write!(
                f,
                "topic {} with durable subscription {}",
                self.destination, subscription
            )?,
        }
        if let Some(selector) = &self.selector {
            write!(f, " with selector {selector}")?;
        }
        Ok(())
    }
}

/// Resolves the consumer configuration for `def`.
///
/// Rows are evaluated top to bottom:
/// 1. queue: direct consumer
/// 2. topic, non-durable: ephemeral subscription
/// 3. topic, durable: named subscription keyed by the subscription name
///
/// Every row applies the selector when one is set.
///
/// # Errors
/// `ActivationError::Configuration` for an unknown destination type, an unresolved
/// lookup key or a durable subscription without a name.
pub fn consumer_config(
    def: &ListenerDefinition,
    resolver: &dyn DestinationResolver,
) -> Result<ConsumerConfig, ActivationError> {
    let destination_type = def.resolved_type()?;

    let kind = match (destination_type, def.is_durable()) {
        (DestinationType::Queue, _) => ConsumerKind::Queue,
        (DestinationType::Topic, false) => ConsumerKind::Topic,
        (DestinationType::Topic, true) => {
            let subscription = def.durable_subscription().unwrap_or_default().trim();
            if subscription.is_empty() {
                return Err(ActivationError::configuration(
                    def.name(),
                    "durable subscription requires a subscription name",
                ));
            }
            ConsumerKind::DurableTopic {
                subscription: subscription.to_owned(),
            }
        }
    };

    let destination = resolver
        .resolve(def.lookup())
        .map_err(|err| ActivationError::configuration(def.name(), err.to_string()))?;

    Ok(ConsumerConfig {
        listener: def.name().to_owned(),
        destination,
        kind,
        selector: def.selector_expr().map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ResolveError, resolver::MockDestinationResolver};
    use mockall::predicate::eq;

    fn resolver(key: &'static str, destination: &'static str) -> MockDestinationResolver {
        let mut resolver = MockDestinationResolver::new();
        resolver
            .expect_resolve()
            .with(eq(key))
            .returning(move |_| Ok(destination.to_owned()));
        resolver
    }

    #[test]
    fn queue_ignores_durability() {
        let def = ListenerDefinition::new("Foo")
            .queue("queue.foo")
            .durable()
            .selector("kind = 'a'");

        let cfg = consumer_config(&def, &resolver("queue.foo", "foo")).unwrap();

        assert_eq!(cfg.kind, ConsumerKind::Queue);
        assert_eq!(cfg.destination, "foo");
        assert_eq!(cfg.selector.as_deref(), Some("kind = 'a'"));
        assert_eq!(cfg.subscription_identity(), None);
        assert_eq!(cfg.to_string(), "queue foo with selector kind = 'a'");
    }

    #[test]
    fn non_durable_topic_is_ephemeral() {
        let def = ListenerDefinition::new("Audit").topic("topic.audit");

        let cfg = consumer_config(&def, &resolver("topic.audit", "audit")).unwrap();

        assert_eq!(cfg.kind, ConsumerKind::Topic);
        assert!(cfg.is_topic());
        assert!(!cfg.is_durable());
        assert_eq!(cfg.selector, None);
    }

    #[test]
    fn durable_topic_is_keyed_by_listener_name() {
        let def = ListenerDefinition::new("Audit")
            .topic("topic.audit")
            .durable()
            .selector("region = 'eu'");
        let resolver = resolver("topic.audit", "audit");

        let first = consumer_config(&def, &resolver).unwrap();
        let second = consumer_config(&def, &resolver).unwrap();

        assert_eq!(
            first.kind,
            ConsumerKind::DurableTopic {
                subscription: "Audit".into()
            }
        );
        assert_eq!(first.subscription_identity(), Some("audit.Audit".into()));
        assert_eq!(first, second);
    }

    #[test]
    fn blank_subscription_name_is_rejected() {
        let def = ListenerDefinition::new("Audit")
            .topic("topic.audit")
            .durable()
            .subscription_name(" ");

        let err = consumer_config(&def, &MockDestinationResolver::new()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_type_fails_before_resolution() {
        let def = ListenerDefinition::new("Bad")
            .destination_type("Exchange")
            .destination_lookup("queue.bad");

        // no expectation: the resolver must not be called
        let err = consumer_config(&def, &MockDestinationResolver::new()).unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Configuration { listener, .. } if listener == "Bad"
        ));
    }

    #[test]
    fn unresolved_lookup_is_a_configuration_error() {
        let mut resolver = MockDestinationResolver::new();
        resolver
            .expect_resolve()
            .returning(|key| Err(ResolveError::NotFound(key.to_owned())));

        let def = ListenerDefinition::new("Foo").queue("queue.unset");
        let err = consumer_config(&def, &resolver).unwrap_err();

        assert_eq!(
            err,
            ActivationError::Configuration {
                listener: "Foo".into(),
                reason: "no destination configured for lookup key `queue.unset`".into(),
            }
        );
    }
}
