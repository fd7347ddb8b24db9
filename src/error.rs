//! Error handling for bundoc operations.
//!
//! All public APIs return [`Result`]. The variants group into the kinds the
//! HTTP layer maps onto status codes: validation, not-found, conflict,
//! capacity, integrity, and deadline failures. Integrity errors
//! ([`DbError::Corruption`]) are fatal for the affected database: it stops
//! accepting writes and is marked read-only.

use std::io;
use thiserror::Error;

/// Result type for bundoc operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected in the data file, WAL, or catalog.
    ///
    /// Fatal for the affected database; it is switched to read-only and
    /// refuses further writes until repaired.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Document is not a JSON object, or its `_id` is malformed.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Document failed validation against the collection schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// An `x-bundoc-ref` annotation could not be parsed.
    #[error("invalid reference schema: {0}")]
    InvalidReferenceSchema(String),

    /// Invalid configuration value or operation argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Named collection does not exist.
    #[error("collection {0:?} not found")]
    CollectionNotFound(String),

    /// No visible document with the requested id.
    #[error("document {0:?} not found")]
    DocumentNotFound(String),

    /// Collection already exists.
    #[error("collection {0:?} already exists")]
    CollectionExists(String),

    /// Insert collided with an existing `_id`.
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),

    /// A referenced document does not exist in the target collection.
    #[error("reference target {target:?} not found in {collection:?} (field {field:?})")]
    ReferenceTargetNotFound {
        /// Target collection of the reference rule.
        collection: String,
        /// Source field carrying the reference.
        field: String,
        /// The id that failed to resolve.
        target: String,
    },

    /// Delete blocked by a `restrict` reference rule.
    #[error("delete restricted: {collection:?}/{id:?} is still referenced")]
    ReferenceRestrictViolation {
        /// Collection of the document being deleted.
        collection: String,
        /// Id of the document being deleted.
        id: String,
    },

    /// Per-project concurrency cap exceeded.
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Per-project storage cap exceeded.
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Every buffer-pool frame is pinned; caller should release pins and retry.
    #[error("buffer pool exhausted")]
    BufferPoolExhausted,

    /// Operation exceeded its execution deadline.
    #[error("operation timed out")]
    Timeout,

    /// Operation attempted on a committed or rolled-back transaction.
    #[error("transaction is no longer active")]
    TransactionInactive,

    /// The shared flusher has been stopped; no further commits are durable.
    #[error("shared flusher stopped")]
    FlusherStopped,

    /// Database is read-only after an integrity failure.
    #[error("database is read-only: {0}")]
    ReadOnly(String),
}

impl DbError {
    /// True for integrity failures that must flip the database read-only.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Corruption(_))
    }
}
