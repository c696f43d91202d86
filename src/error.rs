use thiserror::Error;

use crate::transport::TransportError;

/// Failures surfaced by a completed lookup.
///
/// Duplicate suppression and address-construction fallbacks are not
/// errors; they are neutral [`LookupOutcome`](crate::LookupOutcome)
/// variants of their own.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The transfer failed at the network level.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The transfer succeeded but the payload was not a JSON sequence of
    /// records.
    #[error("response payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LookupError {
    pub fn is_transport(&self) -> bool {
        matches!(self, LookupError::Transport(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, LookupError::Decode(_))
    }
}
