use std::sync::Arc;

use tracing::{info, warn};

use crate::models::{Account, AccountCreated, AccountError, OutboxEvent, Role, User, ACCOUNT_CREATED, AGGREGATE_ACCOUNT};
use crate::services::ServiceError;
use crate::storage::{AccountCache, LedgerStore, StorageError};
use crate::types::{AccountId, Amount, UserId};

/// Administrative operations on users and accounts.
///
/// Every mutation locks the account row, commits through a unit of work and
/// then drops the cached copy.
pub struct AccountService<L: LedgerStore> {
    ledger: Arc<L>,
    cache: Option<AccountCache>
}

impl<L: LedgerStore> AccountService<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger, cache: None }
    }

    pub fn with_cache(mut self, cache: AccountCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn register_user(&self, name: &str, email: &str, document: &str, role: Role) -> Result<User, ServiceError> {
        let user = self.ledger.insert_user(User::new(name, email, document, role)?).await?;

        info!(user_id = user.id, "User registered");

        Ok(user)
    }

    /// Opens the user's only account and records an `AccountCreated` event in
    /// the same unit of work.
    pub async fn create_account_for_user(&self, user_id: UserId, initial_balance: Amount) -> Result<Account, ServiceError> {
        let user = self.ledger.find_user(user_id).await?.ok_or(ServiceError::UserNotFound(user_id))?;

        if self.ledger.find_account_by_user(user_id).await?.is_some() {
            return Err(ServiceError::AlreadyExists(user_id))
        }

        let account = Account::open(user.id, initial_balance)?;

        let mut unit = self.ledger.begin().await?;
        let account = unit.insert_account(account).await?;
        let payload = serde_json::to_string(&AccountCreated::new(&account, &user))?;

        unit.insert_outbox(vec![OutboxEvent::new(AGGREGATE_ACCOUNT, account.id.to_string(), ACCOUNT_CREATED, payload)]);

        unit.commit().await.map_err(|error| match error {
            //NOTE: Another request opened an account for this user between the check and the commit
            StorageError::UniqueViolation { .. } => ServiceError::AlreadyExists(user_id),
            error => ServiceError::Storage(error)
        })?;

        info!(account_id = account.id, user_id, "Account created");

        Ok(account)
    }

    pub async fn find_account(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        if let Some(cache) = &self.cache {
            if let Some(account) = cache.get(account_id).await {
                return Ok(account)
            }
        }

        let account = self.ledger.find_account(account_id).await?.ok_or(ServiceError::AccountNotFound(account_id))?;

        if let Some(cache) = &self.cache {
            cache.insert(account.clone()).await;

            //NOTE: A commit landing between the read and the insert has already run its invalidation
            let committed = self.ledger.find_account(account_id).await?.map(|current| current.version);

            if committed != Some(account.version) {
                cache.invalidate(account_id).await;
            }
        }

        Ok(account)
    }

    pub async fn adjust_balance(&self, account_id: AccountId, new_balance: Amount) -> Result<Account, ServiceError> {
        self.update(account_id, "adjust balance", |account| account.adjust_balance(new_balance)).await
    }

    pub async fn inactivate_account(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        self.update(account_id, "inactivate", Account::inactivate).await
    }

    pub async fn block_account(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        self.update(account_id, "block", |account| {
            account.block();
            Ok(())
        }).await
    }

    pub async fn activate_account(&self, account_id: AccountId) -> Result<Account, ServiceError> {
        self.update(account_id, "activate", |account| {
            account.activate();
            Ok(())
        }).await
    }

    async fn update<F>(&self, account_id: AccountId, operation: &'static str, change: F) -> Result<Account, ServiceError>
    where
        F: FnOnce(&mut Account) -> Result<(), AccountError> + Send,
    {
        let mut unit = self.ledger.begin().await?;

        let Some(mut account) = unit.lock_accounts(&[account_id]).await?.into_iter().next() else {
            unit.rollback().await;
            return Err(ServiceError::AccountNotFound(account_id))
        };

        if let Err(error) = change(&mut account) {
            warn!(account_id, "Rejected {operation}: {error}");
            unit.rollback().await;
            return Err(error.into())
        }

        unit.save_accounts(vec![account]);
        unit.commit().await?;

        if let Some(cache) = &self.cache {
            cache.invalidate(account_id).await;
        }

        info!(account_id, "Account updated: {operation}");

        //NOTE: Read back so the caller sees the version assigned on commit
        self.find_account(account_id).await
    }
}
