use thiserror::Error;

use crate::storage::{QueueError, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Transfer buffer unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),
    #[error("Transfer buffer is shutting down")]
    ShuttingDown,
    #[error("Failed to persist buffered transfers: {0}")]
    Storage(#[from] StorageError)
}

impl From<QueueError> for BufferError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Unavailable(reason) => Self::Unavailable(reason)
        }
    }
}
