//! Typed errors surfaced by the sync engine.

use thiserror::Error;

use crate::queue::MutationStatus;
use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid transition for mutation {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: MutationStatus,
        to: MutationStatus,
    },

    #[error("mutation {0} not found")]
    NotFound(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<String> for SyncError {
    fn from(message: String) -> Self {
        SyncError::Storage(message)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
