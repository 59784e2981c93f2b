// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transaction Coordination
//!
//! Each message is processed inside one transaction: the worker begins it, enlists its
//! session's transactional resource, runs the handler and then commits or rolls back.
//! The coordinator is supplied by the host; `LocalTransactionCoordinator` drives the
//! enlisted resources one-phase, in enlistment order.

use crate::errors::{BrokerError, TransactionError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// A resource whose work follows the outcome of a transaction.
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    async fn commit(&self) -> Result<(), BrokerError>;

    async fn rollback(&self) -> Result<(), BrokerError>;
}

/// Begins transactions.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, TransactionError>;
}

/// One in-flight transaction.
#[async_trait]
pub trait Transaction: Send {
    async fn enlist(&mut self, resource: Arc<dyn TransactionalResource>)
        -> Result<(), TransactionError>;

    async fn commit(&mut self) -> Result<(), TransactionError>;

    async fn rollback(&mut self) -> Result<(), TransactionError>;
}

/// One-phase coordinator for hosts without a distributed transaction manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransactionCoordinator;

#[async_trait]
impl TransactionCoordinator for LocalTransactionCoordinator {
    async fn begin(&self) -> Result<Box<dyn Transaction>, TransactionError> {
        Ok(Box::new(LocalTransaction::default()))
    }
}

#[derive(Default)]
struct LocalTransaction {
    resources: Vec<Arc<dyn TransactionalResource>>,
    completed: bool,
}

impl LocalTransaction {
    fn ensure_active(&self) -> Result<(), TransactionError> {
        if self.completed {
            return Err(TransactionError::Begin(
                "transaction already completed".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    async fn enlist(
        &mut self,
        resource: Arc<dyn TransactionalResource>,
    ) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.resources.push(resource);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.completed = true;

        for (idx, resource) in self.resources.iter().enumerate() {
            if let Err(err) = resource.commit().await {
                error!(error = err.to_string(), "failure to commit resource");
                for remaining in &self.resources[idx + 1..] {
                    if let Err(e) = remaining.rollback().await {
                        warn!(error = e.to_string(), "failure to rollback resource");
                    }
                }
                return Err(TransactionError::Commit(err));
            }
        }

        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        self.ensure_active()?;
        self.completed = true;

        let mut first_err = None;
        for resource in &self.resources {
            if let Err(err) = resource.rollback().await {
                warn!(error = err.to_string(), "failure to rollback resource");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(TransactionError::Rollback(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        fail_commit: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransactionalResource for Recorder {
        async fn commit(&self) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(format!("commit {}", self.name));
            if self.fail_commit {
                return Err(BrokerError::Resource("commit refused".into()));
            }
            Ok(())
        }

        async fn rollback(&self) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(format!("rollback {}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn commits_in_enlistment_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut tx = LocalTransactionCoordinator.begin().await.unwrap();
        for name in ["a", "b"] {
            tx.enlist(Arc::new(Recorder {
                name,
                log: log.clone(),
                ..Default::default()
            }))
            .await
            .unwrap();
        }

        tx.commit().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["commit a", "commit b"]);
        assert!(tx.rollback().await.is_err());
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_the_rest() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut tx = LocalTransactionCoordinator.begin().await.unwrap();
        tx.enlist(Arc::new(Recorder {
            name: "a",
            fail_commit: true,
            log: log.clone(),
        }))
        .await
        .unwrap();
        tx.enlist(Arc::new(Recorder {
            name: "b",
            log: log.clone(),
            ..Default::default()
        }))
        .await
        .unwrap();

        let err = tx.commit().await.unwrap_err();

        assert!(matches!(err, TransactionError::Commit(_)));
        assert_eq!(*log.lock().unwrap(), vec!["commit a", "rollback b"]);
    }
}
