/// Connection Contracts Module
///
/// This module defines the handle and acquisition traits shared by every
/// provider in txconn.

use crate::core::{TxconnError, Result};
use tracing::{debug, warn};

/// A live database session.
///
/// Methods mirror the driver-level operations the transaction layer needs.
/// The handle is released exactly once, through [`Connection::close`] or by
/// being dropped.
pub trait Connection: 'static {
    /// Enables or disables auto-commit. Disabling it opens a transaction that
    /// lasts until the next `commit` or `rollback`.
    fn set_auto_commit(&self, enabled: bool) -> rusqlite::Result<()>;

    /// Commits the open transaction.
    fn commit(&self) -> rusqlite::Result<()>;

    /// Rolls back the open transaction.
    fn rollback(&self) -> rusqlite::Result<()>;

    /// Releases the session.
    fn close(self) -> rusqlite::Result<()>
    where
        Self: Sized;
}

/// Opens brand-new connections, the analogue of a driver data source.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection;

    fn connect(&self) -> rusqlite::Result<Self::Connection>;
}

/// Supplies a connection on demand by handing ownership to a receiver.
///
/// Implementations never close a connection after the receiver returns: the
/// caller that owns the handle decides. This is what lets a transactional
/// wrapper keep one connection open across many calls.
pub trait ConnectionSource: Send + Sync {
    type Connection: Connection;

    fn provide<T, R>(&self, receiver: R) -> Result<T>
    where
        R: FnOnce(Self::Connection) -> Result<T>;
}

/// The inbound entry point for code that needs a connection for one operation.
///
/// The connection is only lent to the receiver; whoever implements the trait
/// owns its lifecycle.
pub trait ConnectionProvider {
    type Connection: Connection;

    fn provide<T, R>(&self, receiver: R) -> Result<T>
    where
        R: FnOnce(&Self::Connection) -> Result<T>;
}

/// A [`ConnectionSource`] that opens a new connection from a factory on every call.
#[derive(Debug, Clone)]
pub struct FactorySource<F> {
    factory: F,
}

impl<F: ConnectionFactory> FactorySource<F> {
    pub fn new(factory: F) -> Self {
        FactorySource { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<F: ConnectionFactory> ConnectionSource for FactorySource<F> {
    type Connection = F::Connection;

    fn provide<T, R>(&self, receiver: R) -> Result<T>
    where
        R: FnOnce(Self::Connection) -> Result<T>,
    {
        let connection = self
            .factory
            .connect()
            .map_err(|e| TxconnError::sql("Error acquiring connection", e))?;
        debug!("Opened new connection");
        receiver(connection)
    }
}

impl<S: ConnectionSource + ?Sized> ConnectionSource for std::sync::Arc<S> {
    type Connection = S::Connection;

    fn provide<T, R>(&self, receiver: R) -> Result<T>
    where
        R: FnOnce(Self::Connection) -> Result<T>,
    {
        (**self).provide(receiver)
    }
}

/// Owns a freshly acquired connection for the length of one scope and closes
/// it when dropped, on normal return, error return and unwinding alike.
pub(crate) struct ScopedConnection<C: Connection> {
    connection: Option<C>,
}

impl<C: Connection> ScopedConnection<C> {
    pub(crate) fn new(connection: C) -> Self {
        ScopedConnection {
            connection: Some(connection),
        }
    }

    /// Gives up ownership without closing.
    pub(crate) fn into_inner(mut self) -> C {
        match self.connection.take() {
            Some(connection) => connection,
            None => unreachable!("scoped connection released twice"),
        }
    }
}

impl<C: Connection> std::ops::Deref for ScopedConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `into_inner` empties the option, and it consumes self
        match self.connection.as_ref() {
            Some(connection) => connection,
            None => unreachable!("scoped connection used after release"),
        }
    }
}

impl<C: Connection> Drop for ScopedConnection<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close() {
                warn!("Failed to close connection: {}", e);
            }
        }
    }
}
