// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod session;

pub mod activation;
pub mod amqp;
pub mod broker;
pub mod channel;
pub mod definition;
pub mod errors;
pub mod health;
pub mod memory;
pub mod policy;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod settings;
pub mod transaction;
pub mod worker;

pub use activation::{ActivationCoordinator, ActivationSummary};
pub use definition::{AcknowledgeMode, DestinationType, ListenerDefinition};
pub use health::{HealthSnapshot, ListenerStatus};
pub use registry::{handler_fn, ListenerRegistry, MessageHandler};
pub use settings::ActivationSettings;
pub use worker::{BrokerContext, ListenerWorker, WorkerState};
