use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::errors::TransactionError;
use crate::types::{AccountId, Amount, IdempotencyKey, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed
}

/// The settled record of a transfer between two accounts.
///
/// A transaction is created `Pending` when its outbox row is first claimed and
/// moves to `Success` or `Failed` exactly once. The idempotency key is unique
/// across all transactions and is what makes redelivered requests harmless.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Assigned by the store on insert, zero until then.
    pub id: TransactionId,
    pub sender_account_id: AccountId,
    pub receiver_account_id: AccountId,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>
}

impl Transaction {
    pub fn pending(sender_account_id: AccountId, receiver_account_id: AccountId, amount: Amount, idempotency_key: IdempotencyKey) -> Self {
        Self {
            id: 0,
            sender_account_id,
            receiver_account_id,
            amount,
            status: TransactionStatus::Pending,
            failure_reason: None,
            idempotency_key,
            created_at: Utc::now()
        }
    }

    pub fn complete(&mut self) -> Result<(), TransactionError> {
        self.check_pending()?;
        self.status = TransactionStatus::Success;

        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransactionError> {
        self.check_pending()?;
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason.into());

        Ok(())
    }

    fn check_pending(&self) -> Result<(), TransactionError> {
        if self.status != TransactionStatus::Pending {
            return Err(TransactionError::AlreadySettled { transaction_id: self.id, status: self.status })
        }

        Ok(())
    }
}
