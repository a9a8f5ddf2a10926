//! Error types and result handling for relq.
//!
//! This module defines the core error type [`Error`] used throughout the crate, as well as the [`Result`] alias for fallible operations.
//!
//! ## What
//!
//! - [`Error`] enumerates all error cases that can occur in relq: store failures, configuration
//!   and option validation, serialization, handler outcomes and worker pool state.
//! - [`Result<T>`] is a convenient alias for `Result<T, Error>`.
//!
//! ## How
//!
//! Store round-trips surface as [`Error::QueryFailed`] or [`Error::TransactionFailed`] and are
//! returned to the caller unchanged. Handlers signal unrecoverable input with [`Error::Poison`];
//! the consumer quarantines those messages instead of retrying them.
//!
//! ### Example
//!
//! ```rust
//! use relq::error::{Error, Result};
//!
//! fn parse(bytes: &[u8]) -> Result<u64> {
//!     std::str::from_utf8(bytes)
//!         .ok()
//!         .and_then(|s| s.parse().ok())
//!         .ok_or_else(|| Error::Poison { reason: "not a number".into() })
//! }
//! ```
use thiserror::Error;

/// Result type for relq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type for heterogeneous error sources
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for relq operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (SQLx errors)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Required configuration field is missing
    #[error("Missing required configuration: {field}")]
    MissingConfig { field: String },

    /// Configuration field has an invalid value
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// Transport options are inconsistent or unsupported by the backend
    #[error("Invalid transport option {option}: {message}")]
    InvalidOptions { option: String, message: String },

    /// Attempted to access a queue whose tables do not exist
    #[error("Queue '{name}' not found")]
    QueueNotFound { name: String },

    /// Attempted to access a message that doesn't exist
    #[error("Message with id '{id}' not found")]
    MessageNotFound { id: i64 },

    /// Database connection failed or was lost
    #[error("Database connection failed: {source}. Context: {context}")]
    ConnectionFailed { source: BoxError, context: String },

    /// SQL query failed
    #[error("Database query failed: {query}. Context: {context}. Source: {source}")]
    QueryFailed {
        source: BoxError,
        query: String,
        context: String,
    },

    /// Database transaction operation failed
    #[error("Database transaction failed: {source}. Context: {context}")]
    TransactionFailed { source: BoxError, context: String },

    /// The message can never be processed and must be quarantined
    #[error("Poison message: {reason}")]
    Poison { reason: String },

    /// A handler failed in a way that may succeed on a later attempt
    #[error("Handler failed: {message}")]
    Handler { message: String },

    /// Work was submitted to a worker pool that is stopping or stopped
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// Operation exceeded timeout limit
    #[error("Operation timeout: {operation}")]
    Timeout { operation: String },

    /// Unexpected internal error occurred
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Whether the failure means the message itself is unprocessable.
    ///
    /// Poison failures go straight to the error store; every other failure is retried
    /// according to the queue's retry policy.
    pub fn is_poison(&self) -> bool {
        matches!(self, Error::Poison { .. } | Error::Serialization(_))
    }

    /// Shorthand for a retryable handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler {
            message: message.into(),
        }
    }

    /// Shorthand for a poison failure.
    pub fn poison(reason: impl Into<String>) -> Self {
        Error::Poison {
            reason: reason.into(),
        }
    }

    pub(crate) fn query(query: impl Into<String>, context: impl Into<String>, e: sqlx::Error) -> Self {
        Error::QueryFailed {
            source: Box::new(e),
            query: query.into(),
            context: context.into(),
        }
    }

    pub(crate) fn transaction(context: impl Into<String>, e: sqlx::Error) -> Self {
        Error::TransactionFailed {
            source: Box::new(e),
            context: context.into(),
        }
    }
}
