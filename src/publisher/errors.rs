use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Broker rejected the message: {0}")]
    Rejected(String),
    #[error("Broker unavailable: {0}")]
    Unavailable(String)
}

/// Why a single outbox row could not be forwarded. Every variant counts as a
/// failed attempt against the row's retry budget.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to deserialize event payload: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Broker did not acknowledge within {0:?}")]
    Timeout(Duration)
}
