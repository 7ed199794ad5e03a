use thiserror::Error;

use crate::models::TransactionError;
use crate::storage::StorageError;

/// Infrastructure failures that abort a whole settlement batch.
///
/// Business outcomes never appear here; they are recorded on the transaction
/// itself and reported through a `TransactionFailed` audit event.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to serialize audit event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Transaction(#[from] TransactionError)
}
