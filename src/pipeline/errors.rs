use thiserror::Error;

use crate::buffer::BufferError;
use crate::services::ServiceError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to read input: {0}")]
    Input(#[from] csv::Error),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Pipeline is already running")]
    AlreadyStarted
}
