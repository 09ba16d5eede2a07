/// Transaction Propagation Module
///
/// This module provides `TransactionalConnectionProvider`, which routes each
/// connection request either to the calling thread's active transaction or to
/// a fresh connection that is closed as soon as the request completes.

use crate::core::db::connection::{
    Connection, ConnectionFactory, ConnectionProvider, ConnectionSource, FactorySource,
    ScopedConnection,
};
use crate::core::{TxconnError, Result};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

thread_local! {
    /// Per-thread transaction slots, keyed by provider id. Each value is an
    /// `Rc<C>` for the owning provider's connection type.
    static TRANSACTION_SLOTS: RefCell<HashMap<u64, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps a [`ConnectionSource`] with per-thread transaction tracking.
///
/// The provider is meant to be shared process-wide (typically behind an `Arc`).
/// Transaction state lives in thread-local storage, so each thread sees only
/// its own transaction and no locking is involved.
///
/// A transaction is driven from outside, usually by
/// [`TransactionInterceptor`](crate::interceptor::TransactionInterceptor):
/// `start_new_transaction`, then any number of `provide` calls, then
/// `commit_active_transaction` or `rollback_active_transaction`, and finally
/// `remove_active_transaction_connection`.
///
/// A thread that exits while its transaction is still active releases the
/// connection when its thread-local storage is destroyed. Dropping the
/// provider releases the dropping thread's transaction; transactions other
/// threads left open stay in their slots until those threads exit.
pub struct TransactionalConnectionProvider<S: ConnectionSource> {
    id: u64,
    // Never closes what it hands out; closing happens in `provide` and in
    // `remove_active_transaction_connection`.
    source: S,
}

impl<F: ConnectionFactory> TransactionalConnectionProvider<FactorySource<F>> {
    /// Builds a provider that opens connections from `factory`.
    pub fn from_factory(factory: F) -> Self {
        TransactionalConnectionProvider::new(FactorySource::new(factory))
    }
}

impl<S: ConnectionSource> TransactionalConnectionProvider<S> {
    /// Builds a provider on top of `source`, which must keep connections open
    /// after handing them over.
    pub fn new(source: S) -> Self {
        TransactionalConnectionProvider {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
            source,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns `true` if the calling thread has an active transaction.
    pub fn has_active_transaction(&self) -> bool {
        TRANSACTION_SLOTS.with(|slots| slots.borrow().contains_key(&self.id))
    }

    /// Opens a connection, disables auto-commit on it and binds it to the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// - `TxconnError::TransactionAlreadyActive` if this thread already has one; no
    ///   connection is acquired in that case
    /// - `TxconnError::Sql` if acquisition or the auto-commit toggle fails; the slot
    ///   stays empty and a connection that was already opened is closed
    pub fn start_new_transaction(&self) -> Result<()> {
        if self.has_active_transaction() {
            return Err(TxconnError::TransactionAlreadyActive);
        }

        let connection = self.fetch_new_connection().map_err(|e| match e {
            TxconnError::Sql { source, .. } => TxconnError::sql("Error initializing transaction", source),
            other => other,
        })?;
        let connection = ScopedConnection::new(connection);
        connection
            .set_auto_commit(false)
            .map_err(|e| TxconnError::sql("Error initializing transaction", e))?;

        self.store(Rc::new(connection.into_inner()));
        debug!("Started transaction on provider {}", self.id);
        Ok(())
    }

    /// Commits the calling thread's transaction.
    ///
    /// With `suppress_errors` set, a commit failure is logged and swallowed.
    /// This is for committing while another error is already propagating, so
    /// the commit failure does not mask it.
    ///
    /// # Errors
    ///
    /// `TxconnError::NoActiveTransaction` without an active transaction, `TxconnError::Sql`
    /// if the commit fails and `suppress_errors` is not set.
    pub fn commit_active_transaction(&self, suppress_errors: bool) -> Result<()> {
        let connection = self.current().ok_or(TxconnError::NoActiveTransaction)?;
        match connection.commit() {
            Ok(()) => {
                debug!("Committed transaction on provider {}", self.id);
                Ok(())
            }
            Err(e) if suppress_errors => {
                warn!("Suppressed commit failure on provider {}: {}", self.id, e);
                Ok(())
            }
            Err(e) => Err(TxconnError::sql("Error committing transaction", e)),
        }
    }

    /// Rolls back the calling thread's transaction. Rollback failures are
    /// logged and never returned.
    ///
    /// # Errors
    ///
    /// `TxconnError::NoActiveTransaction` without an active transaction.
    pub fn rollback_active_transaction(&self) -> Result<()> {
        let connection = self.current().ok_or(TxconnError::NoActiveTransaction)?;
        match connection.rollback() {
            Ok(()) => debug!("Rolled back transaction on provider {}", self.id),
            Err(e) => warn!("Rollback failed on provider {}: {}", self.id, e),
        }
        Ok(())
    }

    /// Closes the calling thread's transaction connection and clears its slot.
    ///
    /// Does nothing when no transaction is active. Close failures are logged.
    pub fn remove_active_transaction_connection(&self) {
        let Some(connection) = self.take() else {
            return;
        };
        self.release(connection);
        debug!("Removed transaction connection on provider {}", self.id);
    }

    fn release(&self, connection: Rc<S::Connection>) {
        match Rc::try_unwrap(connection) {
            Ok(connection) => {
                if let Err(e) = connection.close() {
                    warn!("Failed to close transaction connection on provider {}: {}", self.id, e);
                }
            }
            // Still lent to an outer receiver; released when that receiver returns
            Err(_) => debug!(
                "Transaction connection on provider {} still in use, deferring release",
                self.id
            ),
        }
    }

    fn fetch_new_connection(&self) -> Result<S::Connection> {
        self.source.provide(|connection| Ok(connection))
    }

    fn current(&self) -> Option<Rc<S::Connection>> {
        TRANSACTION_SLOTS.with(|slots| {
            slots
                .borrow()
                .get(&self.id)
                .and_then(|slot| slot.downcast_ref::<Rc<S::Connection>>())
                .cloned()
        })
    }

    fn store(&self, connection: Rc<S::Connection>) {
        TRANSACTION_SLOTS.with(|slots| {
            slots.borrow_mut().insert(self.id, Box::new(connection));
        });
    }

    fn take(&self) -> Option<Rc<S::Connection>> {
        let slot = TRANSACTION_SLOTS.with(|slots| slots.borrow_mut().remove(&self.id))?;
        slot.downcast::<Rc<S::Connection>>().ok().map(|connection| *connection)
    }
}

impl<S: ConnectionSource> ConnectionProvider for TransactionalConnectionProvider<S> {
    type Connection = S::Connection;

    fn provide<T, R>(&self, receiver: R) -> Result<T>
    where
        R: FnOnce(&Self::Connection) -> Result<T>,
    {
        if let Some(connection) = self.current() {
            // Closed by remove_active_transaction_connection
            return receiver(&*connection);
        }

        let connection = ScopedConnection::new(self.fetch_new_connection()?);
        receiver(&*connection)
    }
}

impl<S: ConnectionSource> Drop for TransactionalConnectionProvider<S> {
    fn drop(&mut self) {
        // The slot map may already be gone during thread teardown
        let slot = TRANSACTION_SLOTS
            .try_with(|slots| slots.try_borrow_mut().ok()?.remove(&self.id))
            .ok()
            .flatten();
        let Some(connection) = slot.and_then(|slot| slot.downcast::<Rc<S::Connection>>().ok()) else {
            return;
        };
        warn!("Provider {} dropped with an active transaction, releasing it", self.id);
        self.release(*connection);
    }
}

impl<S: ConnectionSource> std::fmt::Debug for TransactionalConnectionProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalConnectionProvider")
            .field("id", &self.id)
            .field("has_active_transaction", &self.has_active_transaction())
            .finish()
    }
}
