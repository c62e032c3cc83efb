//! Error types for the Holdfast core library.

use thiserror::Error;

/// Main error type for Holdfast core operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Encoding or decoding an entity failed
    #[error("Codec error: {message}")]
    Codec {
        /// What failed to encode or decode
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// Network errors
    #[error("Network error: {message}")]
    Network {
        /// What failed on the network path
        message: String,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong internally
        message: String,
    },
}

/// Result type alias for Holdfast operations.
pub type Result<T> = std::result::Result<T, Error>;
