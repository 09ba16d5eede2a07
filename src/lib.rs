// Core infrastructure modules
pub mod core;

// Feature-specific modules
pub mod config;
pub mod interceptor;

#[cfg(test)]
mod test_utils;

pub use crate::core::db::{
    Connection, ConnectionFactory, ConnectionProvider, ConnectionSource, FactorySource,
    SqliteConnection, SqliteConnectionFactory, TransactionalConnectionProvider,
};
pub use crate::core::{TxconnError, Result};
pub use crate::interceptor::{RollbackPolicy, TransactionInterceptor};
