use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::OutboxEventId;

pub const TRANSFER_REQUESTED: &str = "TransferRequested";
pub const TRANSACTION_COMPLETED: &str = "TransactionCompleted";
pub const TRANSACTION_FAILED: &str = "TransactionFailed";
pub const ACCOUNT_CREATED: &str = "AccountCreated";

pub const AGGREGATE_TRANSFER: &str = "Transfer";
pub const AGGREGATE_TRANSACTION: &str = "Transaction";
pub const AGGREGATE_ACCOUNT: &str = "Account";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Unprocessed,
    Processing,
    Processed,
    Failed
}

/// A pending side effect written in the same unit of work as the mutation
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// Serialized event body, stored verbatim.
    pub payload: String,
    pub status: OutboxStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>
}

impl OutboxEvent {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>, event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            status: OutboxStatus::Unprocessed,
            locked_at: None,
            retry_count: 0,
            created_at: Utc::now()
        }
    }

    /// Whether a claimant may take this row at `now`.
    ///
    /// Unprocessed rows are claimable unless a lock younger than `lock_timeout`
    /// is still held on them. Processing rows whose lock has expired were
    /// abandoned by a claimant that died mid-batch and are claimable again.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_timeout: Duration) -> bool {
        let lock_expired = match self.locked_at {
            Some(locked_at) => now.checked_sub_signed(lock_timeout)
                .is_some_and(|deadline| locked_at < deadline),
            None => true
        };

        match self.status {
            OutboxStatus::Unprocessed => lock_expired,
            OutboxStatus::Processing => self.locked_at.is_some() && lock_expired,
            OutboxStatus::Processed | OutboxStatus::Failed => false
        }
    }

    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.locked_at = Some(now);
    }

    /// Hands the row back untouched so the next cycle retries it from scratch.
    pub fn release(&mut self) {
        self.status = OutboxStatus::Unprocessed;
        self.locked_at = None;
    }

    pub fn mark_processed(&mut self) {
        self.status = OutboxStatus::Processed;
        self.locked_at = None;
    }

    /// Counts a failed attempt. The row goes back to `Unprocessed` until
    /// `max_retries` attempts have failed, then it is quarantined as `Failed`.
    pub fn record_failure(&mut self, max_retries: u32) -> OutboxStatus {
        self.retry_count = self.retry_count.saturating_add(1);
        self.locked_at = None;

        if self.retry_count >= max_retries {
            self.retry_count = max_retries;
            self.status = OutboxStatus::Failed;
        } else {
            self.status = OutboxStatus::Unprocessed;
        }

        self.status
    }
}

/// Which event types a claimant takes ownership of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTypeFilter {
    Only(Vec<String>),
    Excluding(Vec<String>)
}

impl EventTypeFilter {
    pub fn only(event_types: &[&str]) -> Self {
        Self::Only(event_types.iter().map(|event_type| event_type.to_string()).collect())
    }

    pub fn excluding(event_types: &[&str]) -> Self {
        Self::Excluding(event_types.iter().map(|event_type| event_type.to_string()).collect())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Only(event_types) => event_types.iter().any(|candidate| candidate == event_type),
            Self::Excluding(event_types) => !event_types.iter().any(|candidate| candidate == event_type)
        }
    }
}
