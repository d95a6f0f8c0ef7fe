//! Error types for the document broker.
//!
//! The [`Result`] type alias provides a convenient shorthand for operations
//! that may fail. Save outcomes are not errors: they are reported through
//! [`crate::storage::SaveResult`] and handled by the save state machine.
//!
//! The broker loop never propagates errors past itself; session-scoped
//! failures are logged and affect only that session.

use std::io;
use thiserror::Error;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while coordinating a document.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokerError {
    /// No kit process could be acquired within the retry budget.
    #[error("Failed to acquire a child process: {0}")]
    ChildAcquire(String),

    /// Document load failed (storage failure, invalid file info, or a
    /// rejected session). If this leaves the registry empty the broker
    /// marks itself for destruction.
    #[error("Load failed: {0}")]
    Load(String),

    /// Storage connection could not be established or was refused.
    ///
    /// Token-reuse rejection surfaces as this variant with the message
    /// "WOPI::CheckFileInfo failed".
    #[error("Storage connection error: {0}")]
    StorageConnection(String),

    /// The storage ran out of space while materializing the document.
    ///
    /// All sessions of the affected broker are alerted before this
    /// propagates.
    #[error("Storage is low on disk space")]
    StorageSpaceLow,

    /// Malformed or unexpected protocol traffic (unknown kit message,
    /// malformed tile header). Logged; the loop continues.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A session id did not resolve in the registry.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The document URI could not be sanitized.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Broker or storage configuration problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Permission policy file could not be parsed.
    #[error("Policy parse error: {0}")]
    Xml(String),

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Token ledger database error.
    #[error("Ledger error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP transport error talking to remote storage.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
