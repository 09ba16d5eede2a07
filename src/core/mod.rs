/// Core Module for txconn
///
/// This module contains the connection abstractions, the transactional
/// provider and the shared error type.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{TxconnError, Result};
