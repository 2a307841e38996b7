//! Error types for oais-ingest
//!
//! Only submission-time validation is surfaced to callers as an error;
//! step and storage failures become request/entity state instead.

use thiserror::Error;

/// Result alias for the service layer
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Submission refused before anything was persisted
    #[error("Request denied: {}", .0.join("; "))]
    Denied(Vec<String>),

    /// Entity or request not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the current request state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Remote storage client failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job could not be enqueued
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// oais-common error (database, serialization, config)
    #[error(transparent)]
    Common(#[from] oais_common::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(oais_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Common(oais_common::Error::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_lists_every_reason() {
        let err = IngestError::Denied(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Request denied: a; b");
    }

    #[test]
    fn test_common_error_is_transparent() {
        let err: IngestError = oais_common::Error::NotFound("AIP 4".into()).into();
        assert_eq!(err.to_string(), "Not found: AIP 4");
    }
}
