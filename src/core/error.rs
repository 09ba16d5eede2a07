/// txconn Error Module
///
/// This module defines the error type shared by the connection providers,
/// the transaction interceptor and the configuration layer.
use thiserror::Error;

/// Error type for connection and transaction management.
///
/// The variants fall into two groups:
/// - failures that mean a unit of work cannot proceed (acquisition, auto-commit
///   toggle, commit), all wrapped as [`TxconnError::Sql`]
/// - misuse of the transaction surface ([`TxconnError::NoActiveTransaction`],
///   [`TxconnError::TransactionAlreadyActive`])
///
/// Rollback and close failures never show up here; they are logged and swallowed.
#[derive(Error, Debug)]
pub enum TxconnError {
    /// A driver failure while managing a connection or transaction
    #[error("{context}: {source}")]
    Sql {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Driver errors raised by receivers while using a lent connection
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Commit or rollback requested on a thread without an active transaction
    #[error("Transaction error: no active transaction on this thread")]
    NoActiveTransaction,

    /// A transaction was started while one is already active on this thread
    #[error("Transaction error: a transaction is already active on this thread")]
    TransactionAlreadyActive,

    /// Receiver-level failures that are not driver errors
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TxconnError {
    /// Wraps a driver error with the operation that failed.
    pub fn sql(context: &'static str, source: rusqlite::Error) -> Self {
        TxconnError::Sql { context, source }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TxconnError>;
