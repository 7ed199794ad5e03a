use thiserror::Error;

use crate::models::{AccountStatus, TransactionStatus};
use crate::types::{AccountId, Amount, TransactionId};

/// Business rule violations raised by [`Account`](crate::models::Account) mutations.
///
/// These are the only conditions the settlement engine treats as a terminal,
/// non-retryable outcome for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("Insufficient balance for withdrawal on account [{account_id}]. Current: {balance}, Required: {required}")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Amount,
        required: Amount
    },
    #[error("Account [{account_id}] is {status:?}. Cannot {operation}.")]
    InvalidAccountState {
        account_id: AccountId,
        status: AccountStatus,
        operation: &'static str
    },
    #[error("Invalid argument for account [{account_id}]: {reason}")]
    InvalidArgument {
        account_id: AccountId,
        reason: String
    },
    #[error("Account [{account_id}] was not found")]
    AccountNotFound {
        account_id: AccountId
    }
}

impl AccountError {
    pub fn insufficient_balance(account_id: AccountId, balance: Amount, required: Amount) -> Self {
        Self::InsufficientBalance { account_id, balance, required }
    }

    pub fn invalid_state(account_id: AccountId, status: AccountStatus, operation: &'static str) -> Self {
        Self::InvalidAccountState { account_id, status, operation }
    }

    pub fn invalid_argument(account_id: AccountId, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { account_id, reason: reason.into() }
    }

    pub fn not_found(account_id: AccountId) -> Self {
        Self::AccountNotFound { account_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Transaction [{transaction_id}] is already {status:?}")]
    AlreadySettled {
        transaction_id: TransactionId,
        status: TransactionStatus
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    #[error("User {0} cannot be blank.")]
    BlankField(&'static str)
}
