use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::models::{Account, EventTypeFilter, OutboxEvent, OutboxStatus, Transaction, User};
use crate::storage::{LedgerStore, OutboxStore, SaturationProbe, StorageError, UnitOfWork};
use crate::types::{AccountId, IdempotencyKey, OutboxEventId, TransactionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Inserted by a unit of work that has not committed yet.
    Reserved(u64),
    Committed(TransactionId)
}

struct DatabaseState {
    accounts: DashMap<AccountId, Account>,
    accounts_by_user: DashMap<UserId, AccountId>,
    users: DashMap<UserId, User>,
    transactions: DashMap<TransactionId, Transaction>,
    idempotency_keys: DashMap<IdempotencyKey, KeyState>,
    outbox: DashMap<OutboxEventId, OutboxEvent>,
    row_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    commit_lock: StdMutex<()>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    acquire_timeout: Duration,
    lock_wait: Duration,
    account_sequence: AtomicI64,
    user_sequence: AtomicI64,
    transaction_sequence: AtomicI64,
    unit_sequence: AtomicU64
}

impl DatabaseState {
    /// Serializes commits and outbox claims against each other.
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, StorageError> {
        match timeout(self.acquire_timeout, self.pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StorageError::unavailable("connection pool is closed")),
            Err(_) => Err(StorageError::unavailable(format!("no connection available within {:?}", self.acquire_timeout)))
        }
    }
}

/// In-process relational store backing accounts, transactions, users and the
/// outbox table.
///
/// A semaphore plays the part of the connection pool: every unit of work and
/// every outbox claim holds one permit, which is what [`SaturationProbe`]
/// reports on.
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<DatabaseState>
}

impl MemoryDatabase {
    pub fn new(config: &DatabaseConfig) -> Self {
        let pool_size = config.pool_size.max(1);

        Self {
            state: Arc::new(DatabaseState {
                accounts: DashMap::new(),
                accounts_by_user: DashMap::new(),
                users: DashMap::new(),
                transactions: DashMap::new(),
                idempotency_keys: DashMap::new(),
                outbox: DashMap::new(),
                row_locks: DashMap::new(),
                commit_lock: StdMutex::new(()),
                pool: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                acquire_timeout: config.acquire_timeout(),
                lock_wait: config.lock_wait(),
                account_sequence: AtomicI64::new(1),
                user_sequence: AtomicI64::new(1),
                transaction_sequence: AtomicI64::new(1),
                unit_sequence: AtomicU64::new(1)
            })
        }
    }
}

impl MemoryDatabase {
    #[cfg(test)]
    pub(crate) fn row_lock_count(&self) -> usize {
        self.state.row_locks.len()
    }
}

impl SaturationProbe for MemoryDatabase {
    fn saturation(&self) -> f64 {
        let in_use = self.state.pool_size.saturating_sub(self.state.pool.available_permits());
        in_use as f64 / self.state.pool_size as f64
    }
}

#[async_trait]
impl OutboxStore for MemoryDatabase {
    async fn insert_events(&self, events: Vec<OutboxEvent>) -> Result<(), StorageError> {
        let _connection = self.state.acquire().await?;
        let _serial = self.state.serialize();

        for event in events {
            self.state.outbox.insert(event.id, event);
        }

        Ok(())
    }

    async fn claim_events(&self, filter: &EventTypeFilter, limit: usize, lock_timeout: Duration) -> Result<Vec<OutboxEvent>, StorageError> {
        let _connection = self.state.acquire().await?;
        let lock_timeout = TimeDelta::from_std(lock_timeout).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let _serial = self.state.serialize();

        let mut candidates: Vec<_> = self.state.outbox.iter()
            .filter(|row| filter.matches(&row.event_type) && row.is_claimable(now, lock_timeout))
            .map(|row| (row.created_at, row.id))
            .collect();

        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());

        for (_, event_id) in candidates {
            if let Some(mut row) = self.state.outbox.get_mut(&event_id) {
                row.claim(now);
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn save_events(&self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        let _connection = self.state.acquire().await?;
        let _serial = self.state.serialize();

        for event in events {
            self.state.outbox.insert(event.id, event.clone());
        }

        Ok(())
    }

    async fn delete_events(&self, event_ids: &[OutboxEventId]) -> Result<(), StorageError> {
        let _connection = self.state.acquire().await?;
        let _serial = self.state.serialize();

        for event_id in event_ids {
            self.state.outbox.remove(event_id);
        }

        Ok(())
    }

    async fn find_by_status(&self, status: OutboxStatus, event_type: Option<&str>) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut events: Vec<OutboxEvent> = self.state.outbox.iter()
            .filter(|row| row.status == status && event_type.is_none_or(|event_type| row.event_type == event_type))
            .map(|row| row.clone())
            .collect();

        events.sort_by_key(|event| event.created_at);

        Ok(events)
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<usize, StorageError> {
        Ok(self.state.outbox.iter().filter(|row| row.status == status).count())
    }
}

#[async_trait]
impl LedgerStore for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let connection = self.state.acquire().await?;

        Ok(Box::new(MemoryUnitOfWork {
            id: self.state.unit_sequence.fetch_add(1, Ordering::Relaxed),
            state: self.state.clone(),
            _connection: connection,
            row_guards: BTreeMap::new(),
            reserved_keys: Vec::new(),
            created_accounts: HashSet::new(),
            accounts: BTreeMap::new(),
            transactions: BTreeMap::new(),
            outbox_inserts: Vec::new(),
            outbox_saves: Vec::new(),
            outbox_deletes: Vec::new()
        }))
    }

    async fn find_account(&self, account_id: AccountId) -> Result<Option<Account>, StorageError> {
        Ok(self.state.accounts.get(&account_id).map(|account| account.clone()))
    }

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>, StorageError> {
        let account_id = self.state.accounts_by_user.get(&user_id).map(|account_id| *account_id);

        Ok(account_id.and_then(|account_id| self.state.accounts.get(&account_id).map(|account| account.clone())))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let mut accounts: Vec<Account> = self.state.accounts.iter().map(|account| account.clone()).collect();
        accounts.sort_by_key(|account| account.id);

        Ok(accounts)
    }

    async fn insert_user(&self, mut user: User) -> Result<User, StorageError> {
        user.id = self.state.user_sequence.fetch_add(1, Ordering::Relaxed);
        self.state.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        Ok(self.state.users.get(&user_id).map(|user| user.clone()))
    }

    async fn find_transaction_by_key(&self, key: IdempotencyKey) -> Result<Option<Transaction>, StorageError> {
        let transaction_id = match self.state.idempotency_keys.get(&key).map(|state| *state) {
            Some(KeyState::Committed(transaction_id)) => transaction_id,
            _ => return Ok(None)
        };

        Ok(self.state.transactions.get(&transaction_id).map(|transaction| transaction.clone()))
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        let mut transactions: Vec<Transaction> = self.state.transactions.iter().map(|transaction| transaction.clone()).collect();
        transactions.sort_by_key(|transaction| transaction.id);

        Ok(transactions)
    }
}

struct MemoryUnitOfWork {
    id: u64,
    state: Arc<DatabaseState>,
    _connection: OwnedSemaphorePermit,
    row_guards: BTreeMap<AccountId, OwnedMutexGuard<()>>,
    reserved_keys: Vec<IdempotencyKey>,
    created_accounts: HashSet<AccountId>,
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    outbox_inserts: Vec<OutboxEvent>,
    outbox_saves: Vec<OutboxEvent>,
    outbox_deletes: Vec<OutboxEventId>
}

impl MemoryUnitOfWork {
    fn reserve(&self, key: IdempotencyKey) -> Result<(), StorageError> {
        match self.state.idempotency_keys.entry(key) {
            Entry::Occupied(_) => Err(StorageError::unique_violation(key)),
            Entry::Vacant(slot) => {
                slot.insert(KeyState::Reserved(self.id));
                Ok(())
            }
        }
    }

    fn release(&self, keys: &[IdempotencyKey]) {
        for key in keys {
            self.state.idempotency_keys.remove_if(key, |_, state| *state == KeyState::Reserved(self.id));
        }
    }

    fn stage_transaction(&mut self, mut transaction: Transaction) -> Transaction {
        transaction.id = self.state.transaction_sequence.fetch_add(1, Ordering::Relaxed);
        self.reserved_keys.push(transaction.idempotency_key);
        self.transactions.insert(transaction.id, transaction.clone());

        transaction
    }

    /// Checks every staged account against the committed table. Must run under
    /// the commit lock.
    fn validate_accounts(&self) -> Result<(), StorageError> {
        for account in self.accounts.values() {
            if self.created_accounts.contains(&account.id) {
                let owner = self.state.accounts_by_user.get(&account.user_id).map(|account_id| *account_id);

                if owner.is_some_and(|owner| owner != account.id) {
                    return Err(StorageError::unique_violation(format!("user:{}", account.user_id)))
                }

                continue;
            }

            match self.state.accounts.get(&account.id).map(|current| current.version) {
                Some(version) if version == account.version => {}
                Some(_) => return Err(StorageError::OptimisticLock { account_id: account.id }),
                None => return Err(StorageError::NotFound(format!("Account [{}]", account.id)))
            }
        }

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_accounts(&mut self, account_ids: &[AccountId]) -> Result<Vec<Account>, StorageError> {
        let ascending = account_ids.windows(2).all(|pair| pair[0] < pair[1]);
        let after_held = match (self.row_guards.keys().next_back(), account_ids.first()) {
            (Some(held), Some(first)) => first > held,
            _ => true
        };

        if !ascending || !after_held {
            return Err(StorageError::LockOrder)
        }

        let deadline = Instant::now() + self.state.lock_wait;
        let mut locked = Vec::with_capacity(account_ids.len());

        for &account_id in account_ids {
            //NOTE: Ids with no committed row get no lock entry, so unknown ids cannot grow the lock table
            if !self.state.accounts.contains_key(&account_id) {
                continue;
            }

            let row_lock = self.state.row_locks.entry(account_id).or_default().clone();
            let guard = timeout_at(deadline, row_lock.lock_owned()).await
                .map_err(|_| StorageError::LockTimeout { account_id })?;

            self.row_guards.insert(account_id, guard);
            locked.push(account_id);
        }

        Ok(locked.iter()
            .filter_map(|account_id| self.state.accounts.get(account_id).map(|account| account.clone()))
            .collect())
    }

    async fn find_committed_keys(&mut self, keys: &[IdempotencyKey]) -> Result<HashSet<IdempotencyKey>, StorageError> {
        Ok(keys.iter()
            .filter(|key| matches!(self.state.idempotency_keys.get(*key).map(|state| *state), Some(KeyState::Committed(_))))
            .copied()
            .collect())
    }

    async fn insert_transactions(&mut self, transactions: Vec<Transaction>) -> Result<Vec<Transaction>, StorageError> {
        let mut reserved = Vec::with_capacity(transactions.len());

        for transaction in &transactions {
            if let Err(error) = self.reserve(transaction.idempotency_key) {
                self.release(&reserved);
                return Err(error)
            }

            reserved.push(transaction.idempotency_key);
        }

        Ok(transactions.into_iter().map(|transaction| self.stage_transaction(transaction)).collect())
    }

    async fn insert_transaction(&mut self, transaction: Transaction) -> Result<Transaction, StorageError> {
        self.reserve(transaction.idempotency_key)?;

        Ok(self.stage_transaction(transaction))
    }

    async fn insert_account(&mut self, mut account: Account) -> Result<Account, StorageError> {
        account.id = self.state.account_sequence.fetch_add(1, Ordering::Relaxed);
        account.version = 0;
        self.created_accounts.insert(account.id);
        self.accounts.insert(account.id, account.clone());

        Ok(account)
    }

    fn save_accounts(&mut self, accounts: Vec<Account>) {
        for account in accounts {
            self.accounts.insert(account.id, account);
        }
    }

    fn save_transactions(&mut self, transactions: Vec<Transaction>) {
        for transaction in transactions {
            self.transactions.insert(transaction.id, transaction);
        }
    }

    fn insert_outbox(&mut self, events: Vec<OutboxEvent>) {
        self.outbox_inserts.extend(events);
    }

    fn save_outbox(&mut self, events: Vec<OutboxEvent>) {
        self.outbox_saves.extend(events);
    }

    fn delete_outbox(&mut self, event_ids: Vec<OutboxEventId>) {
        self.outbox_deletes.extend(event_ids);
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let state = self.state.clone();
        let _serial = state.serialize();

        self.validate_accounts()?;

        for (account_id, mut account) in std::mem::take(&mut self.accounts) {
            if !self.created_accounts.contains(&account_id) {
                account.version += 1;
            }

            state.accounts_by_user.insert(account.user_id, account_id);
            state.accounts.insert(account_id, account);
        }

        for (transaction_id, transaction) in std::mem::take(&mut self.transactions) {
            state.idempotency_keys.insert(transaction.idempotency_key, KeyState::Committed(transaction_id));
            state.transactions.insert(transaction_id, transaction);
        }

        for event in std::mem::take(&mut self.outbox_inserts).into_iter().chain(std::mem::take(&mut self.outbox_saves)) {
            state.outbox.insert(event.id, event);
        }

        for event_id in std::mem::take(&mut self.outbox_deletes) {
            state.outbox.remove(&event_id);
        }

        self.reserved_keys.clear();
        debug!(unit = self.id, "Unit of work committed");

        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!(unit = self.id, "Unit of work rolled back");
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        let keys = std::mem::take(&mut self.reserved_keys);
        self.release(&keys);
    }
}
