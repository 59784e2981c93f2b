// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Registry
//!
//! Handler modules register their listener definition together with the handler that
//! processes its messages. The registry is filled at startup and handed to the
//! `ActivationCoordinator`, which activates every entry.

use crate::{
    broker::InboundMessage,
    definition::ListenerDefinition,
    errors::{ActivationError, HandlerError},
};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};

/// Business logic invoked once per inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, msg: &InboundMessage) -> Result<(), HandlerError>;
}

/// Wraps a closure returning a future into a `MessageHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_message(&self, msg: &InboundMessage) -> Result<(), HandlerError> {
        (self.0)(msg.clone()).await
    }
}

/// A definition bound to its handler.
#[derive(Clone)]
pub struct ListenerRegistration {
    pub(crate) definition: ListenerDefinition,
    pub(crate) handler: Arc<dyn MessageHandler>,
}

impl ListenerRegistration {
    pub fn definition(&self) -> &ListenerDefinition {
        &self.definition
    }
}

/// Ordered set of registered listeners, unique by name.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerRegistration>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    ///
    /// # Errors
    /// `ActivationError::DuplicateListener` when the name is taken, and
    /// `ActivationError::Configuration` when the name is empty.
    pub fn register(
        &mut self,
        definition: ListenerDefinition,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, ActivationError> {
        if definition.name().trim().is_empty() {
            return Err(ActivationError::configuration(
                definition.name(),
                "listener name must not be empty",
            ));
        }
        if self.entries.iter().any(|e| e.definition.name() == definition.name()) {
            return Err(ActivationError::DuplicateListener(definition.name().to_owned()));
        }

        self.entries.push(ListenerRegistration { definition, handler });
        Ok(self)
    }

    pub fn entries(&self) -> &[ListenerRegistration] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_| async { Ok(()) })
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut registry = ListenerRegistry::new();
        registry
            .register(ListenerDefinition::new("Foo").queue("queue.foo"), noop())
            .unwrap()
            .register(ListenerDefinition::new("Bar").queue("queue.bar"), noop())
            .unwrap();

        let err = registry
            .register(ListenerDefinition::new("Foo").topic("topic.foo"), noop())
            .err();

        assert_eq!(err, Some(ActivationError::DuplicateListener("Foo".into())));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries()[1].definition().name(), "Bar");
    }

    #[test]
    fn rejects_empty_names() {
        let mut registry = ListenerRegistry::new();
        assert!(registry
            .register(ListenerDefinition::new(" ").queue("queue.foo"), noop())
            .is_err());
        assert!(registry.is_empty());
    }
}
