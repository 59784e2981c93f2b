// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Listener Activation
//!
//! This module provides the error types raised while activating listeners and while
//! driving their receive loops. Errors are split by the scope they affect:
//! `ActivationError` for one listener's configuration or startup, `BrokerError` for one
//! session, `TransactionError` and `HandlerError` for one message.

use thiserror::Error;

/// Errors raised while registering or activating a listener.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ActivationError {
    /// The listener's activation attributes cannot be turned into a consumer
    #[error("invalid configuration for listener `{listener}`: {reason}")]
    Configuration { listener: String, reason: String },

    /// A listener with the same name was already registered
    #[error("listener `{0}` is already registered")]
    DuplicateListener(String),

    /// `init` was called on a coordinator that already activated its listeners
    #[error("listeners were already activated")]
    AlreadyInitialized,

    /// The coordinator was shut down and cannot activate listeners again
    #[error("listener activation was shut down")]
    Stopped,
}

impl ActivationError {
    pub(crate) fn configuration(listener: &str, reason: impl Into<String>) -> Self {
        ActivationError::Configuration {
            listener: listener.to_owned(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors tied to one listener's definition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ActivationError::Configuration { .. } | ActivationError::DuplicateListener(_)
        )
    }
}

/// Errors reported by a broker binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker invalidated the session; the consumer must be rebuilt
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error opening a transactional session
    #[error("failure to create a session: {0}")]
    SessionCreation(String),

    /// Error creating the consumer on an open session
    #[error("failure to create consumer on `{destination}`: {reason}")]
    ConsumerCreation { destination: String, reason: String },

    /// The broker cannot apply the selector expression
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Error pulling the next message
    #[error("failure to receive message: {0}")]
    Receive(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    Acknowledge(String),

    /// Error reported by the session's transactional resource
    #[error("transactional resource failure: {0}")]
    Resource(String),
}

impl BrokerError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// Errors raised by a transaction coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("failure to begin transaction: {0}")]
    Begin(String),

    #[error("failure to enlist resource")]
    Enlist(#[source] BrokerError),

    #[error("failure to commit transaction")]
    Commit(#[source] BrokerError),

    #[error("failure to rollback transaction")]
    Rollback(#[source] BrokerError),
}

impl TransactionError {
    pub fn is_connection_lost(&self) -> bool {
        match self {
            TransactionError::Begin(_) => false,
            TransactionError::Enlist(e)
            | TransactionError::Commit(e)
            | TransactionError::Rollback(e) => e.is_connection_lost(),
        }
    }
}

/// Failure returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_owned())
    }
}

/// Failure to map a destination lookup key to a destination name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no destination configured for lookup key `{0}`")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_error_carries_connection_loss() {
        let lost = TransactionError::Commit(BrokerError::ConnectionLost("closed".into()));
        assert!(lost.is_connection_lost());

        let failed = TransactionError::Commit(BrokerError::Resource("constraint".into()));
        assert!(!failed.is_connection_lost());
        assert!(!TransactionError::Begin("no tx".into()).is_connection_lost());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(ActivationError::configuration("a", "missing").is_configuration());
        assert!(ActivationError::DuplicateListener("a".into()).is_configuration());
        assert!(!ActivationError::AlreadyInitialized.is_configuration());
        assert!(!ActivationError::Stopped.is_configuration());
    }
}
