// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Destination Resolution
//!
//! Listeners name their destination indirectly through a lookup key. The host decides
//! where the actual destination names come from; this module provides the trait and two
//! simple sources: a static map and the process environment.

use crate::errors::ResolveError;
use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;

/// Maps a destination lookup key to the broker-side destination name.
#[cfg_attr(test, automock)]
pub trait DestinationResolver: Send + Sync {
    /// # Errors
    /// `ResolveError::NotFound` when no destination is configured for `key`.
    fn resolve(&self, key: &str) -> Result<String, ResolveError>;
}

/// Resolver backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinationResolver {
    destinations: HashMap<String, String>,
}

impl StaticDestinationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, destination: &str) -> Self {
        self.destinations
            .insert(key.to_owned(), destination.to_owned());
        self
    }
}

impl FromIterator<(String, String)> for StaticDestinationResolver {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        StaticDestinationResolver {
            destinations: iter.into_iter().collect(),
        }
    }
}

impl DestinationResolver for StaticDestinationResolver {
    fn resolve(&self, key: &str) -> Result<String, ResolveError> {
        self.destinations
            .get(key)
            .filter(|d| !d.is_empty())
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(key.to_owned()))
    }
}

/// Resolver reading environment variables.
///
/// The lookup key `queue.mdb.name` is read from `QUEUE_MDB_NAME`, or from
/// `{PREFIX}_QUEUE_MDB_NAME` when a prefix is set.
#[derive(Debug, Clone, Default)]
pub struct EnvDestinationResolver {
    prefix: Option<String>,
}

impl EnvDestinationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        EnvDestinationResolver {
            prefix: Some(prefix.to_owned()),
        }
    }

    pub(crate) fn variable_name(&self, key: &str) -> String {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();

        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_ascii_uppercase(), name),
            None => name,
        }
    }
}

impl DestinationResolver for EnvDestinationResolver {
    fn resolve(&self, key: &str) -> Result<String, ResolveError> {
        std::env::var(self.variable_name(key))
            .ok()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ResolveError::NotFound(key.to_owned()))
    }
}
