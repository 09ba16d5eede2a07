/// Transaction Interceptor Module
///
/// `TransactionInterceptor` drives a `TransactionalConnectionProvider` from
/// the outside: it starts a transaction before the work runs, commits or rolls
/// back depending on the outcome, and always releases the connection last.
/// Work started while the thread already has a transaction joins it.

use crate::core::db::{ConnectionSource, TransactionalConnectionProvider};
use crate::core::{TxconnError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether a failed unit of work rolls back or commits what it did.
#[derive(Clone, Default)]
pub enum RollbackPolicy {
    /// Every error rolls back
    #[default]
    Always,
    /// Errors never roll back; completed work is committed and the error returned
    Never,
    /// Roll back only for errors matching the predicate
    When(Arc<dyn Fn(&TxconnError) -> bool + Send + Sync>),
}

impl RollbackPolicy {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&TxconnError) -> bool + Send + Sync + 'static,
    {
        RollbackPolicy::When(Arc::new(predicate))
    }

    pub fn should_rollback(&self, error: &TxconnError) -> bool {
        match self {
            RollbackPolicy::Always => true,
            RollbackPolicy::Never => false,
            RollbackPolicy::When(predicate) => predicate(error),
        }
    }
}

impl std::fmt::Debug for RollbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackPolicy::Always => f.write_str("Always"),
            RollbackPolicy::Never => f.write_str("Never"),
            RollbackPolicy::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Runs closures as transactional units of work.
pub struct TransactionInterceptor<S: ConnectionSource> {
    provider: Arc<TransactionalConnectionProvider<S>>,
    policy: RollbackPolicy,
}

impl<S: ConnectionSource> TransactionInterceptor<S> {
    pub fn new(provider: Arc<TransactionalConnectionProvider<S>>) -> Self {
        TransactionInterceptor {
            provider,
            policy: RollbackPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider(&self) -> &Arc<TransactionalConnectionProvider<S>> {
        &self.provider
    }

    /// Runs `work` inside a transaction.
    ///
    /// - `Ok` commits; a commit failure rolls back and is returned
    /// - `Err` rolls back or commits according to the policy; the commit is
    ///   done with errors suppressed, so the work's error is what comes back
    /// - a panic rolls back before unwinding further
    ///
    /// If the calling thread already has a transaction, `work` runs inside it
    /// and the enclosing boundary decides the outcome. If `work` ends the
    /// transaction itself, its result is returned as is.
    pub fn run<T, W>(&self, work: W) -> Result<T>
    where
        W: FnOnce() -> Result<T>,
    {
        if self.provider.has_active_transaction() {
            debug!("Joining active transaction");
            return work();
        }

        self.provider.start_new_transaction()?;
        let _boundary = Boundary {
            provider: &self.provider,
        };

        let outcome = work();
        if !self.provider.has_active_transaction() {
            warn!("Unit of work ended its own transaction");
            return outcome;
        }

        match outcome {
            Ok(value) => {
                if let Err(e) = self.provider.commit_active_transaction(false) {
                    self.rollback_quietly();
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                let outcome = if self.policy.should_rollback(&e) {
                    debug!("Rolling back after error: {}", e);
                    self.provider.rollback_active_transaction()
                } else {
                    debug!("Committing despite error: {}", e);
                    self.provider.commit_active_transaction(true)
                };
                if let Err(cleanup) = outcome {
                    warn!("Transaction cleanup failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn rollback_quietly(&self) {
        if let Err(e) = self.provider.rollback_active_transaction() {
            warn!("Rollback after failed commit skipped: {}", e);
        }
    }
}

impl<S: ConnectionSource> Clone for TransactionInterceptor<S> {
    fn clone(&self) -> Self {
        TransactionInterceptor {
            provider: Arc::clone(&self.provider),
            policy: self.policy.clone(),
        }
    }
}

impl<S: ConnectionSource> std::fmt::Debug for TransactionInterceptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionInterceptor")
            .field("provider", &self.provider)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Releases the transaction connection when the boundary is left, rolling
/// back first if it is left by unwinding.
struct Boundary<'a, S: ConnectionSource> {
    provider: &'a TransactionalConnectionProvider<S>,
}

impl<S: ConnectionSource> Drop for Boundary<'_, S> {
    fn drop(&mut self) {
        if std::thread::panicking() && self.provider.has_active_transaction() {
            warn!("Unit of work panicked, rolling back");
            let _ = self.provider.rollback_active_transaction();
        }
        self.provider.remove_active_transaction_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{ConnectionProvider, FactorySource};
    use crate::test_utils::{MockFactory, Recorder};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn interceptor() -> (TransactionInterceptor<FactorySource<MockFactory>>, Recorder) {
        let recorder = Recorder::new();
        let provider = TransactionalConnectionProvider::from_factory(MockFactory::new(recorder.clone()));
        (TransactionInterceptor::new(Arc::new(provider)), recorder)
    }

    #[test]
    fn test_success_commits_and_releases() {
        let (interceptor, recorder) = interceptor();
        let provider = Arc::clone(interceptor.provider());

        let ids = interceptor
            .run(|| {
                let first = provider.provide(|c| Ok(c.id()))?;
                let second = provider.provide(|c| Ok(c.id()))?;
                Ok((first, second))
            })
            .unwrap();

        assert_eq!(ids.0, ids.1);
        assert_eq!(recorder.commits(), vec![ids.0]);
        assert!(recorder.rollbacks().is_empty());
        assert_eq!(recorder.closed_ids(), vec![ids.0]);
        assert!(!provider.has_active_transaction());
    }

    #[test]
    fn test_error_rolls_back_by_default() {
        let (interceptor, recorder) = interceptor();

        let result: Result<()> = interceptor.run(|| Err(TxconnError::Query("constraint".to_string())));

        assert!(matches!(result, Err(TxconnError::Query(_))));
        assert_eq!(recorder.rollbacks().len(), 1);
        assert!(recorder.commits().is_empty());
        assert_eq!(recorder.closed_ids().len(), 1);
        assert!(!interceptor.provider().has_active_transaction());
    }

    #[test]
    fn test_policy_can_commit_on_error() {
        let (interceptor, recorder) = interceptor();
        let interceptor = interceptor.with_policy(RollbackPolicy::when(|e| !matches!(e, TxconnError::Query(_))));
        // Commit failure must not replace the work's error
        recorder.fail_commit(true);

        let result: Result<()> = interceptor.run(|| Err(TxconnError::Query("not found".to_string())));

        match result {
            Err(TxconnError::Query(msg)) => assert_eq!(msg, "not found"),
            other => panic!("Expected Query error, got {:?}", other),
        }
        assert!(recorder.rollbacks().is_empty());
        assert_eq!(recorder.closed_ids().len(), 1);
    }

    #[test]
    fn test_commit_failure_rolls_back_and_is_returned() {
        let (interceptor, recorder) = interceptor();
        recorder.fail_commit(true);

        let result = interceptor.run(|| Ok(42));

        assert!(matches!(result, Err(TxconnError::Sql { .. })));
        assert_eq!(recorder.rollbacks().len(), 1);
        assert_eq!(recorder.closed_ids().len(), 1);
        assert!(!interceptor.provider().has_active_transaction());
    }

    #[test]
    fn test_nested_run_joins_outer_transaction() {
        let (interceptor, recorder) = interceptor();
        let provider = Arc::clone(interceptor.provider());

        let (outer, inner) = interceptor
            .run(|| {
                let outer = provider.provide(|c| Ok(c.id()))?;
                let inner = interceptor.run(|| provider.provide(|c| Ok(c.id())))?;
                // The inner boundary must not have torn the transaction down
                assert!(provider.has_active_transaction());
                Ok((outer, inner))
            })
            .unwrap();

        assert_eq!(outer, inner);
        assert_eq!(recorder.opened(), 1);
        assert_eq!(recorder.commits().len(), 1);
    }

    #[test]
    fn test_start_failure_is_returned_without_running_work() {
        let (interceptor, recorder) = interceptor();
        recorder.fail_connect(true);

        let mut ran = false;
        let result = interceptor.run(|| {
            ran = true;
            Ok(())
        });

        assert!(matches!(result, Err(TxconnError::Sql { .. })));
        assert!(!ran);
    }

    #[test]
    fn test_panic_rolls_back_and_releases() {
        let (interceptor, recorder) = interceptor();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            interceptor.run(|| -> Result<()> { panic!("work panicked") })
        }));

        assert!(outcome.is_err());
        assert_eq!(recorder.rollbacks().len(), 1);
        assert_eq!(recorder.closed_ids().len(), 1);
        assert!(!interceptor.provider().has_active_transaction());
    }

    #[test]
    fn test_work_ending_its_own_transaction_keeps_its_result() {
        let (interceptor, recorder) = interceptor();
        let provider = Arc::clone(interceptor.provider());

        let value = interceptor
            .run(|| {
                provider.commit_active_transaction(false)?;
                provider.remove_active_transaction_connection();
                Ok(1)
            })
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(recorder.commits().len(), 1);
        assert_eq!(recorder.closed_ids().len(), 1);
        assert!(!provider.has_active_transaction());
    }

    #[test]
    fn test_work_ending_its_own_transaction_keeps_its_error() {
        let (interceptor, recorder) = interceptor();
        let provider = Arc::clone(interceptor.provider());

        let result: Result<()> = interceptor.run(|| {
            provider.remove_active_transaction_connection();
            Err(TxconnError::Query("gave up".to_string()))
        });

        assert!(matches!(result, Err(TxconnError::Query(_))));
        assert!(recorder.rollbacks().is_empty());
        assert_eq!(recorder.closed_ids().len(), 1);
    }

    #[test]
    fn test_rollback_policy_never() {
        let policy = RollbackPolicy::Never;
        assert!(!policy.should_rollback(&TxconnError::NoActiveTransaction));
        assert!(RollbackPolicy::Always.should_rollback(&TxconnError::NoActiveTransaction));
        assert_eq!(format!("{:?}", RollbackPolicy::when(|_| true)), "When(..)");
    }
}
