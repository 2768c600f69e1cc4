//! Error types for riskgate

use thiserror::Error;

use crate::classifier::ClassifierError;

/// Main error type for riskgate operations
#[derive(Error, Debug)]
pub enum GateError {
    /// Missing or invalid startup configuration. Fatal, nothing binds.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The risk classifier could not be reached or answered garbage
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    /// gRPC transport errors (bind, serve)
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for riskgate operations
pub type Result<T> = std::result::Result<T, GateError>;
