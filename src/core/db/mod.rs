/// Database Module
///
/// This module provides connection management for txconn, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Connection Contracts** (`connection.rs`): the `Connection` handle, the
///   `ConnectionFactory`/`ConnectionSource` acquisition traits and the inbound
///   `ConnectionProvider` trait
/// - **SQLite Binding** (`sqlite.rs`): `rusqlite` backed connections and factory
/// - **Transaction Propagation** (`transactional.rs`): per-thread transaction
///   tracking on top of a `ConnectionSource`
///
/// ## Error Handling
///
/// Acquisition and commit failures propagate as `TxconnError::Sql`; rollback and close
/// failures are logged and swallowed.
pub mod connection;
pub mod sqlite;
pub mod transactional;

pub use connection::*;
pub use sqlite::*;
pub use transactional::*;
