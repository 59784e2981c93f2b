// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Definitions
//!
//! A `ListenerDefinition` carries the activation attributes of one listener: where it
//! consumes from, whether the destination is a queue or a topic, the optional selector,
//! durability and acknowledge mode. Definitions are built once at startup, either with
//! the builder methods or from an activation property map, and are never mutated after
//! registration.

use crate::errors::ActivationError;
use std::{collections::HashMap, fmt, str::FromStr};

/// Activation property holding the destination type
pub const DESTINATION_TYPE: &str = "destinationType";
/// Activation property holding the destination lookup key
pub const DESTINATION_LOOKUP: &str = "destinationLookup";
/// Activation property holding the message selector
pub const MESSAGE_SELECTOR: &str = "messageSelector";
/// Activation property holding the subscription durability
pub const SUBSCRIPTION_DURABILITY: &str = "subscriptionDurability";
/// Activation property overriding the durable subscription name
pub const SUBSCRIPTION_NAME: &str = "subscriptionName";
/// Activation property holding the acknowledge mode
pub const ACKNOWLEDGE_MODE: &str = "acknowledgeMode";

/// The kind of destination a listener consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    Queue,
    Topic,
}

impl FromStr for DestinationType {
    type Err = String;

    /// Accepts `Queue` or `Topic` in any case, optionally qualified with a
    /// dotted prefix such as `org.broker.Queue`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let simple = value.rsplit('.').next().unwrap_or(value).trim();
        if simple.eq_ignore_ascii_case("queue") {
            Ok(DestinationType::Queue)
        } else if simple.eq_ignore_ascii_case("topic") {
            Ok(DestinationType::Topic)
        } else {
            Err(format!("unknown destination type `{value}`"))
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Queue => f.write_str("queue"),
            DestinationType::Topic => f.write_str("topic"),
        }
    }
}

/// Who acknowledges a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgeMode {
    /// The worker acknowledges after the handler returns
    #[default]
    Auto,
    /// The handler acknowledges through `InboundMessage::acknowledge`
    Manual,
}

/// Activation attributes of a single listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDefinition {
    pub(crate) name: String,
    pub(crate) destination_lookup: String,
    pub(crate) destination_type: Option<String>,
    pub(crate) selector: Option<String>,
    pub(crate) durable: bool,
    pub(crate) subscription_name: Option<String>,
    pub(crate) acknowledge_mode: AcknowledgeMode,
}

impl ListenerDefinition {
    /// Creates a definition with no destination set.
    ///
    /// Activation fails until one of `queue`, `topic` or `destination_type` is called.
    pub fn new(name: &str) -> ListenerDefinition {
        ListenerDefinition {
            name: name.to_owned(),
            destination_lookup: String::new(),
            destination_type: None,
            selector: None,
            durable: false,
            subscription_name: None,
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }

    /// Consumes from the queue found under `lookup`.
    pub fn queue(mut self, lookup: &str) -> Self {
        self.destination_lookup = lookup.to_owned();
        self.destination_type = Some("Queue".to_owned());
        self
    }

    /// Subscribes to the topic found under `lookup`.
    pub fn topic(mut self, lookup: &str) -> Self {
        self.destination_lookup = lookup.to_owned();
        self.destination_type = Some("Topic".to_owned());
        self
    }

    /// Sets the raw destination type; it is validated at activation.
    pub fn destination_type(mut self, kind: &str) -> Self {
        self.destination_type = Some(kind.to_owned());
        self
    }

    pub fn destination_lookup(mut self, lookup: &str) -> Self {
        self.destination_lookup = lookup.to_owned();
        self
    }

    /// Restricts delivery to messages matching the selector expression.
    pub fn selector(mut self, selector: &str) -> Self {
        self.selector = Some(selector.to_owned());
        self
    }

    /// Makes a topic subscription durable, named after the listener unless
    /// `subscription_name` overrides it.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn subscription_name(mut self, name: &str) -> Self {
        self.subscription_name = Some(name.to_owned());
        self
    }

    pub fn acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    /// Builds a definition from an activation property map.
    ///
    /// Unknown keys are ignored. Missing `destinationType` is not rejected here; it
    /// surfaces as a configuration error when the listener is activated.
    pub fn from_properties(name: &str, props: &HashMap<String, String>) -> ListenerDefinition {
        let mut def = ListenerDefinition::new(name);

        def.destination_type = props.get(DESTINATION_TYPE).cloned();
        if let Some(lookup) = props.get(DESTINATION_LOOKUP) {
            def.destination_lookup = lookup.clone();
        }
        def.selector = props
            .get(MESSAGE_SELECTOR)
            .filter(|s| !s.trim().is_empty())
            .cloned();
        def.durable = props
            .get(SUBSCRIPTION_DURABILITY)
            .is_some_and(|d| d.eq_ignore_ascii_case("durable"));
        def.subscription_name = props.get(SUBSCRIPTION_NAME).cloned();
        def.acknowledge_mode = match props.get(ACKNOWLEDGE_MODE) {
            None => AcknowledgeMode::Auto,
            Some(mode) => parse_acknowledge_mode(mode),
        };

        def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self) -> &str {
        &self.destination_lookup
    }

    pub fn selector_expr(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn ack_mode(&self) -> AcknowledgeMode {
        self.acknowledge_mode
    }

    /// Parses the destination type.
    ///
    /// # Errors
    /// `ActivationError::Configuration` when the type is missing or is neither a
    /// queue nor a topic.
    pub fn resolved_type(&self) -> Result<DestinationType, ActivationError> {
        let Some(raw) = self.destination_type.as_deref() else {
            return Err(ActivationError::configuration(
                &self.name,
                "no destination type in activation config",
            ));
        };

        raw.parse()
            .map_err(|reason: String| ActivationError::configuration(&self.name, reason))
    }

    /// The durable subscription name: the explicit override, else the listener name.
    pub fn durable_subscription(&self) -> Option<&str> {
        if !self.durable {
            return None;
        }
        Some(self.subscription_name.as_deref().unwrap_or(&self.name))
    }
}

fn parse_acknowledge_mode(mode: &str) -> AcknowledgeMode {
    let normalized: String = mode
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "auto" | "autoacknowledge" => AcknowledgeMode::Auto,
        _ => AcknowledgeMode::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn destination_type_accepts_qualified_names() {
        assert_eq!("Queue".parse(), Ok(DestinationType::Queue));
        assert_eq!("topic".parse(), Ok(DestinationType::Topic));
        assert_eq!("org.broker.Topic".parse(), Ok(DestinationType::Topic));
        assert!("Exchange".parse::<DestinationType>().is_err());
    }

    #[test]
    fn missing_destination_type_is_a_configuration_error() {
        let def = ListenerDefinition::new("orders").destination_lookup("queue.orders");
        let err = def.resolved_type().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn properties_map_to_definition() {
        let def = ListenerDefinition::from_properties(
            "AuditListener",
            &props(&[
                (DESTINATION_TYPE, "org.broker.Topic"),
                (DESTINATION_LOOKUP, "topic.audit"),
                (MESSAGE_SELECTOR, "region = 'eu'"),
                (SUBSCRIPTION_DURABILITY, "Durable"),
                (ACKNOWLEDGE_MODE, "Dups-ok-acknowledge"),
            ]),
        );

        assert_eq!(def.resolved_type(), Ok(DestinationType::Topic));
        assert_eq!(def.lookup(), "topic.audit");
        assert_eq!(def.selector_expr(), Some("region = 'eu'"));
        assert_eq!(def.durable_subscription(), Some("AuditListener"));
        assert_eq!(def.ack_mode(), AcknowledgeMode::Manual);
    }

    #[test]
    fn properties_default_to_non_durable_auto_ack() {
        let def = ListenerDefinition::from_properties(
            "Foo",
            &props(&[
                (DESTINATION_TYPE, "Queue"),
                (DESTINATION_LOOKUP, "queue.foo"),
                (SUBSCRIPTION_DURABILITY, "NonDurable"),
                (MESSAGE_SELECTOR, "  "),
            ]),
        );

        assert!(!def.is_durable());
        assert_eq!(def.selector_expr(), None);
        assert_eq!(def.ack_mode(), AcknowledgeMode::Auto);
        assert_eq!(
            ListenerDefinition::from_properties(
                "Bar",
                &props(&[(ACKNOWLEDGE_MODE, "AUTO_ACKNOWLEDGE")]),
            )
            .ack_mode(),
            AcknowledgeMode::Auto
        );
    }

    #[test]
    fn subscription_name_override_wins() {
        let def = ListenerDefinition::new("Billing")
            .topic("topic.invoices")
            .durable()
            .subscription_name("billing-v2");
        assert_eq!(def.durable_subscription(), Some("billing-v2"));

        let ephemeral = ListenerDefinition::new("Billing").topic("topic.invoices");
        assert_eq!(ephemeral.durable_subscription(), None);
    }
}
