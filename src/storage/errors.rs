use thiserror::Error;

use crate::types::AccountId;

/// Infrastructure failures raised by the relational stores.
///
/// None of these describe a business outcome. Callers treat every variant as
/// retryable and surface it only as an outbox state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    #[error("Unique constraint violated for key [{key}]")]
    UniqueViolation {
        key: String
    },
    #[error("Timed out waiting for the lock on account [{account_id}]")]
    LockTimeout {
        account_id: AccountId
    },
    #[error("Account locks must be requested in strictly ascending id order")]
    LockOrder,
    #[error("Account [{account_id}] was modified concurrently")]
    OptimisticLock {
        account_id: AccountId
    },
    #[error("{0} was not found")]
    NotFound(String)
}

impl StorageError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn unique_violation(key: impl ToString) -> Self {
        Self::UniqueViolation { key: key.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue store unavailable: {0}")]
    Unavailable(String)
}
