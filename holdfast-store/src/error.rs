//! Storage error types.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors produced by the durable blob table.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Opening the database file failed
    #[error("failed to open database '{path}': {source}")]
    Open {
        /// Path of the database file
        path: String,
        /// Underlying SQLite error
        #[source]
        source: rusqlite::Error,
    },

    /// A statement failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Creating the database directory failed
    #[error("filesystem error at '{path}': {source}")]
    Io {
        /// Path that could not be prepared
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A stored blob could not be decoded into an entity
    #[error("failed to decode entity {id}: {reason}")]
    Decode {
        /// Id of the entity whose blob was rejected
        id: i64,
        /// Why decoding failed
        reason: String,
    },
}
