use super::{AccountService, ServiceError};

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::DatabaseConfig;
use crate::models::{
    Account, AccountCreated, AccountError, AccountStatus, OutboxStatus, Role, Transaction, User, UserError, ACCOUNT_CREATED
};
use crate::storage::{AccountCache, LedgerStore, MemoryDatabase, OutboxStore, StorageError, UnitOfWork};
use crate::types::{AccountId, IdempotencyKey, UserId};

fn amount(value: &str) -> Result<Decimal> {
    Ok(Decimal::from_str(value)?)
}

fn create_service() -> (Arc<MemoryDatabase>, AccountService<MemoryDatabase>) {
    let database = Arc::new(MemoryDatabase::new(&DatabaseConfig::default()));
    let service = AccountService::new(database.clone()).with_cache(AccountCache::new(100, Duration::from_secs(60)));

    (database, service)
}

/// Commits a balance change right after serving the next account read, the
/// way a settlement batch can land between a cache miss and the cache fill.
struct RacingLedger {
    inner: MemoryDatabase,
    armed: AtomicBool
}

#[async_trait]
impl LedgerStore for RacingLedger {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        self.inner.begin().await
    }

    async fn find_account(&self, account_id: AccountId) -> Result<Option<Account>, StorageError> {
        let account = self.inner.find_account(account_id).await?;

        if self.armed.swap(false, Ordering::SeqCst) {
            let mut unit = self.inner.begin().await?;

            if let Some(mut current) = unit.lock_accounts(&[account_id]).await?.into_iter().next() {
                current.adjust_balance(Decimal::ONE_HUNDRED).map_err(|error| StorageError::unavailable(error.to_string()))?;
                unit.save_accounts(vec![current]);
            }

            unit.commit().await?;
        }

        Ok(account)
    }

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>, StorageError> {
        self.inner.find_account_by_user(user_id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.inner.list_accounts().await
    }

    async fn insert_user(&self, user: User) -> Result<User, StorageError> {
        self.inner.insert_user(user).await
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        self.inner.find_user(user_id).await
    }

    async fn find_transaction_by_key(&self, key: IdempotencyKey) -> Result<Option<Transaction>, StorageError> {
        self.inner.find_transaction_by_key(key).await
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        self.inner.list_transactions().await
    }
}

#[tokio::test]
async fn test_register_user_rejects_blank_fields() -> Result<()> {
    let (_, service) = create_service();

    let result = service.register_user("Ada", "  ", "123", Role::User).await;

    assert!(matches!(result, Err(ServiceError::User(UserError::BlankField("email")))));

    Ok(())
}

#[tokio::test]
async fn test_create_account_writes_account_and_created_event_together() -> Result<()> {
    let (database, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;

    let account = service.create_account_for_user(user.id, amount("200.00")?).await?;

    assert_eq!(account.user_id, user.id);
    assert_eq!(account.balance(), amount("200.00")?);
    assert_eq!(database.find_account_by_user(user.id).await?.map(|stored| stored.id), Some(account.id));

    let events = database.find_by_status(OutboxStatus::Unprocessed, Some(ACCOUNT_CREATED)).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].aggregate_id, account.id.to_string());

    let body: AccountCreated = serde_json::from_str(&events[0].payload)?;
    assert_eq!(body.account_id, account.id);
    assert_eq!(body.user_email, "ada@example.com");

    Ok(())
}

#[tokio::test]
async fn test_user_gets_at_most_one_account() -> Result<()> {
    let (database, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;

    service.create_account_for_user(user.id, Decimal::ZERO).await?;
    let second = service.create_account_for_user(user.id, Decimal::ZERO).await;

    assert!(matches!(second, Err(ServiceError::AlreadyExists(id)) if id == user.id));
    assert_eq!(database.count_by_status(OutboxStatus::Unprocessed).await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_create_account_requires_existing_user_and_non_negative_balance() -> Result<()> {
    let (database, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;

    let missing = service.create_account_for_user(999, Decimal::ZERO).await;
    let negative = service.create_account_for_user(user.id, amount("-1")?).await;

    assert!(matches!(missing, Err(ServiceError::UserNotFound(999))));
    assert!(matches!(negative, Err(ServiceError::Account(AccountError::InvalidArgument { .. }))));
    assert!(database.list_accounts().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_adjust_balance_bumps_version_and_refreshes_cache() -> Result<()> {
    let (_, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;
    let account = service.create_account_for_user(user.id, amount("10")?).await?;

    // Warm the cache with the old balance.
    service.find_account(account.id).await?;

    let updated = service.adjust_balance(account.id, amount("75.50")?).await?;

    assert_eq!(updated.balance(), amount("75.50")?);
    assert_eq!(updated.version, account.version + 1);
    assert_eq!(service.find_account(account.id).await?.balance(), amount("75.50")?);

    let rejected = service.adjust_balance(account.id, amount("-5")?).await;

    assert!(matches!(rejected, Err(ServiceError::Account(AccountError::InvalidArgument { .. }))));
    assert_eq!(service.find_account(account.id).await?.balance(), amount("75.50")?);

    Ok(())
}

#[tokio::test]
async fn test_inactivate_requires_zero_balance() -> Result<()> {
    let (_, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;
    let account = service.create_account_for_user(user.id, amount("1")?).await?;

    let rejected = service.inactivate_account(account.id).await;

    assert!(matches!(rejected, Err(ServiceError::Account(AccountError::InvalidAccountState { .. }))));
    assert_eq!(service.find_account(account.id).await?.status, AccountStatus::Active);

    service.adjust_balance(account.id, Decimal::ZERO).await?;
    let inactive = service.inactivate_account(account.id).await?;

    assert_eq!(inactive.status, AccountStatus::Inactive);

    Ok(())
}

#[tokio::test]
async fn test_block_and_activate_toggle_status() -> Result<()> {
    let (database, service) = create_service();
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;
    let account = service.create_account_for_user(user.id, amount("1")?).await?;

    assert_eq!(service.block_account(account.id).await?.status, AccountStatus::Blocked);
    assert_eq!(database.find_account(account.id).await?.map(|stored| stored.status), Some(AccountStatus::Blocked));

    assert_eq!(service.activate_account(account.id).await?.status, AccountStatus::Active);

    Ok(())
}

#[tokio::test]
async fn test_updates_on_missing_account_are_not_found() {
    let (_, service) = create_service();

    assert!(matches!(service.block_account(41).await, Err(ServiceError::AccountNotFound(41))));
    assert!(matches!(service.find_account(41).await, Err(ServiceError::AccountNotFound(41))));
}

#[tokio::test]
async fn test_cache_fill_does_not_outlive_a_concurrent_commit() -> Result<()> {
    let ledger = Arc::new(RacingLedger { inner: MemoryDatabase::new(&DatabaseConfig::default()), armed: AtomicBool::new(false) });
    let service = AccountService::new(ledger.clone()).with_cache(AccountCache::new(100, Duration::from_secs(60)));
    let user = service.register_user("Ada", "ada@example.com", "123", Role::User).await?;
    let account = service.create_account_for_user(user.id, amount("10")?).await?;

    ledger.armed.store(true, Ordering::SeqCst);

    // This read was served before the commit, so it is allowed to be stale once.
    assert_eq!(service.find_account(account.id).await?.balance(), amount("10")?);

    let refreshed = service.find_account(account.id).await?;

    assert_eq!(refreshed.balance(), Decimal::ONE_HUNDRED);
    assert_eq!(refreshed.version, account.version + 1);

    Ok(())
}
