//! Courier errors

use courier_storage_traits::messages::error::MessageError;

/// Courier error
///
/// Only failures the caller should retry surface as errors. Invalid envelopes,
/// duplicates and deferrals are regular
/// [`IngestOutcome`](crate::pipeline::IngestOutcome) values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] MessageError),
    /// Configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether retrying the same envelope later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(MessageError::DatabaseError(_)) => true,
            Self::Storage(_) | Self::InvalidConfig(_) => false,
        }
    }
}
