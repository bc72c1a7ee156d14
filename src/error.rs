//! Error types for bangumi-dl
//!
//! The taxonomy follows how far a failure is allowed to travel:
//! - [`ParseFailure`](crate::resolver::ParseFailure) drops one feed item (not an [`Error`])
//! - [`FetchError`] skips one source for one series in the current pass
//! - [`BackendError`] marks one ledger record `failed` (eligible for bounded retry)
//! - [`Error::LedgerWrite`] aborts the pass for one series
//!
//! Nothing here crosses a series boundary; the pass runner turns errors into
//! per-series outcomes.

use crate::types::{LedgerKey, SourceKind};
use thiserror::Error;

/// Result type alias for bangumi-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bangumi-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "reconcile.retry_limit")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// A ledger write could not be persisted
    ///
    /// Fatal for the series being dispatched: without the write the
    /// at-least-once submission guarantee cannot be kept.
    #[error("ledger write failed for {key}: {reason}")]
    LedgerWrite {
        /// Key of the record being written
        key: LedgerKey,
        /// Underlying failure
        reason: String,
    },

    /// Source feed adapter failure
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Downloader backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Series not found
    #[error("series not found: {0}")]
    SeriesNotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not starting new passes
    #[error("shutdown in progress: not starting new passes")]
    ShuttingDown,
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Transport-level failure of a source feed adapter
///
/// Distinct from a per-item parse failure: the whole response for one
/// series from one source is unusable.
#[derive(Debug, Clone, Error)]
#[error("fetch from {kind} failed: {reason}")]
pub struct FetchError {
    /// Source that failed
    pub kind: SourceKind,
    /// Human-readable reason
    pub reason: String,
    /// Whether the failure looks transient (timeout, 5xx, connection reset)
    pub transient: bool,
}

impl FetchError {
    /// Create a permanent fetch error (bad feed, 4xx)
    pub fn permanent(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            transient: false,
        }
    }

    /// Create a transient fetch error (timeouts, 5xx)
    pub fn transient(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            transient: true,
        }
    }
}

/// Downloader backend errors
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend rejected or failed to accept a submission
    #[error("{backend} rejected submission: {reason}")]
    Submit {
        /// Backend name (e.g., "transmission")
        backend: &'static str,
        /// Reason reported by the backend or transport
        reason: String,
        /// Whether the failure looks transient
        transient: bool,
    },

    /// The backend could not be reached
    #[error("{backend} unavailable: {reason}")]
    Unavailable {
        /// Backend name (e.g., "aria2")
        backend: &'static str,
        /// Transport failure description
        reason: String,
    },
}
