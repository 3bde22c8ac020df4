//! Error types for the messages module

use thiserror::Error;

/// Error types for the messages module
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// Serialization of a stored column failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}
