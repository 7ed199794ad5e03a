use std::time::Duration;

use moka::future::Cache;

use crate::models::Account;
use crate::types::AccountId;

/// Read-through cache in front of account lookups.
///
/// Every path that mutates an account must invalidate its entry after the
/// mutation commits.
#[derive(Clone)]
pub struct AccountCache {
    cache: Cache<AccountId, Account>
}

impl AccountCache {
    pub fn new(capacity: u64, time_to_live: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(time_to_live)
                .build()
        }
    }

    pub async fn get(&self, account_id: AccountId) -> Option<Account> {
        self.cache.get(&account_id).await
    }

    pub async fn insert(&self, account: Account) {
        self.cache.insert(account.id, account).await;
    }

    pub async fn invalidate(&self, account_id: AccountId) {
        self.cache.invalidate(&account_id).await;
    }
}
