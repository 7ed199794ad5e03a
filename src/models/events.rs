use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Account, Transaction, User};
use crate::types::{AccountId, Amount, IdempotencyKey, TransactionId, UserId};

/// A transfer as accepted at the API boundary and stored as the
/// `TransferRequested` outbox payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequested {
    pub sender_account_id: AccountId,
    pub receiver_account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey
}

impl TransferRequested {
    /// Boundary checks that do not need the database.
    pub fn validate(&self) -> Result<(), String> {
        if self.sender_account_id == self.receiver_account_id {
            return Err("Sender and receiver accounts cannot be the same.".to_string())
        }

        if self.amount <= Amount::ZERO {
            return Err("Transfer amount must be positive.".to_string())
        }

        Ok(())
    }
}

/// Payload of `TransactionCompleted` and `TransactionFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub sender_account_id: AccountId,
    pub receiver_account_id: AccountId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey
}

impl From<&Transaction> for TransactionEvent {
    fn from(transaction: &Transaction) -> Self {
        Self {
            transaction_id: transaction.id,
            sender_account_id: transaction.sender_account_id,
            receiver_account_id: transaction.receiver_account_id,
            amount: transaction.amount,
            created_at: transaction.created_at,
            idempotency_key: transaction.idempotency_key
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
    pub created_at: DateTime<Utc>
}

impl AccountCreated {
    pub fn new(account: &Account, user: &User) -> Self {
        Self {
            account_id: account.id,
            user_id: user.id,
            user_name: user.name.clone(),
            user_email: user.email.clone(),
            created_at: account.created_at
        }
    }
}
