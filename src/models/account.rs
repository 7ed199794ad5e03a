use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::errors::AccountError;
use crate::types::{AccountId, Amount, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Blocked,
    Inactive
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Blocked => "BLOCKED",
            AccountStatus::Inactive => "INACTIVE"
        };

        formatter.write_str(label)
    }
}

/// A client account holding an exact decimal balance.
///
/// The balance is private so that every change goes through a method that
/// upholds `balance >= 0`. Violations come back as [`AccountError`] values the
/// caller can match on, leaving the account untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Assigned by the store on insert, zero until then.
    pub id: AccountId,
    pub user_id: UserId,
    balance: Amount,
    pub status: AccountStatus,
    /// Optimistic lock token, bumped by the store on every committed save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

impl Account {
    /// Opens a new active account. The initial balance must not be negative.
    pub fn open(user_id: UserId, initial_balance: Amount) -> Result<Self, AccountError> {
        if initial_balance < Amount::ZERO {
            return Err(AccountError::invalid_argument(0, "Initial balance cannot be negative."))
        }

        let now = Utc::now();

        Ok(Self {
            id: 0,
            user_id,
            balance: initial_balance,
            status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now
        })
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn deposit(&mut self, amount: Amount) -> Result<(), AccountError> {
        self.check_active("deposit")?;
        self.check_positive(amount, "Deposit amount must be positive.")?;

        self.balance = self.balance.checked_add(amount)
            .ok_or_else(|| AccountError::invalid_argument(self.id, "Deposit overflows the account balance."))?;
        self.touch();

        Ok(())
    }

    pub fn withdraw(&mut self, amount: Amount) -> Result<(), AccountError> {
        self.check_active("withdraw")?;
        self.check_positive(amount, "Withdrawal amount must be positive.")?;

        if self.balance < amount {
            return Err(AccountError::insufficient_balance(self.id, self.balance, amount))
        }

        self.balance -= amount;
        self.touch();

        Ok(())
    }

    /// Administrative override of the balance. Works regardless of status.
    pub fn adjust_balance(&mut self, new_balance: Amount) -> Result<(), AccountError> {
        if new_balance < Amount::ZERO {
            return Err(AccountError::invalid_argument(self.id, "New balance cannot be negative."))
        }

        self.balance = new_balance;
        self.touch();

        Ok(())
    }

    pub fn block(&mut self) {
        self.status = AccountStatus::Blocked;
        self.touch();
    }

    pub fn activate(&mut self) {
        self.status = AccountStatus::Active;
        self.touch();
    }

    pub fn inactivate(&mut self) -> Result<(), AccountError> {
        if !self.balance.is_zero() {
            return Err(AccountError::invalid_state(self.id, self.status, "inactivate with a non-zero balance"))
        }

        self.status = AccountStatus::Inactive;
        self.touch();

        Ok(())
    }

    fn check_active(&self, operation: &'static str) -> Result<(), AccountError> {
        if self.status != AccountStatus::Active {
            return Err(AccountError::invalid_state(self.id, self.status, operation))
        }

        Ok(())
    }

    fn check_positive(&self, amount: Amount, reason: &'static str) -> Result<(), AccountError> {
        if amount <= Amount::ZERO {
            return Err(AccountError::invalid_argument(self.id, reason))
        }

        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
