use thiserror::Error;

use crate::models::{AccountError, UserError};
use crate::storage::StorageError;
use crate::types::{AccountId, UserId};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Account [{0}] was not found")]
    AccountNotFound(AccountId),
    #[error("User [{0}] was not found")]
    UserNotFound(UserId),
    #[error("User [{0}] already has an account")]
    AlreadyExists(UserId),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error)
}
