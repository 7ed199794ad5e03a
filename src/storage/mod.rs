mod account_cache;
mod errors;
mod memory_database;
mod memory_queue;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{Account, EventTypeFilter, OutboxEvent, OutboxStatus, Transaction, User};
use crate::types::{AccountId, IdempotencyKey, OutboxEventId, UserId};

pub use account_cache::AccountCache;
pub use errors::{QueueError, StorageError};
pub use memory_database::MemoryDatabase;
pub use memory_queue::MemoryQueue;

/// Durable table of outbox rows.
///
/// Claiming is the only operation that must be atomic across claimants: two
/// concurrent `claim_events` calls never return the same row.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    async fn insert_events(&self, events: Vec<OutboxEvent>) -> Result<(), StorageError>;

    /// Flips up to `limit` claimable rows matching `filter` to `Processing`,
    /// oldest first, and returns them.
    async fn claim_events(&self, filter: &EventTypeFilter, limit: usize, lock_timeout: Duration) -> Result<Vec<OutboxEvent>, StorageError>;

    async fn save_events(&self, events: &[OutboxEvent]) -> Result<(), StorageError>;

    async fn delete_events(&self, event_ids: &[OutboxEventId]) -> Result<(), StorageError>;

    async fn find_by_status(&self, status: OutboxStatus, event_type: Option<&str>) -> Result<Vec<OutboxEvent>, StorageError>;

    async fn count_by_status(&self, status: OutboxStatus) -> Result<usize, StorageError>;
}

/// Accounts, transactions and users, written through a [`UnitOfWork`].
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;

    async fn find_account(&self, account_id: AccountId) -> Result<Option<Account>, StorageError>;

    async fn find_account_by_user(&self, user_id: UserId) -> Result<Option<Account>, StorageError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError>;

    async fn insert_user(&self, user: User) -> Result<User, StorageError>;

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StorageError>;

    async fn find_transaction_by_key(&self, key: IdempotencyKey) -> Result<Option<Transaction>, StorageError>;

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StorageError>;
}

/// One database transaction.
///
/// Writes are staged and become visible together on [`commit`](UnitOfWork::commit).
/// Dropping a unit of work without committing rolls it back and releases
/// every lock it holds.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Takes a pessimistic write lock on each account, in the order given, and
    /// returns the committed state of those that exist.
    ///
    /// Ids must be strictly ascending, and ids locked by an earlier call must
    /// all be lower than the new ones. This total order is what keeps
    /// overlapping batches from deadlocking.
    async fn lock_accounts(&mut self, account_ids: &[AccountId]) -> Result<Vec<Account>, StorageError>;

    /// The subset of `keys` that belong to already committed transactions.
    async fn find_committed_keys(&mut self, keys: &[IdempotencyKey]) -> Result<HashSet<IdempotencyKey>, StorageError>;

    /// Bulk insert. Either every row is inserted or, on the first duplicate
    /// idempotency key, none is.
    async fn insert_transactions(&mut self, transactions: Vec<Transaction>) -> Result<Vec<Transaction>, StorageError>;

    async fn insert_transaction(&mut self, transaction: Transaction) -> Result<Transaction, StorageError>;

    async fn insert_account(&mut self, account: Account) -> Result<Account, StorageError>;

    fn save_accounts(&mut self, accounts: Vec<Account>);

    fn save_transactions(&mut self, transactions: Vec<Transaction>);

    fn insert_outbox(&mut self, events: Vec<OutboxEvent>);

    fn save_outbox(&mut self, events: Vec<OutboxEvent>);

    fn delete_outbox(&mut self, event_ids: Vec<OutboxEventId>);

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>);
}

/// Live load signal used for admission control.
pub trait SaturationProbe: Send + Sync + 'static {
    /// Fraction of the connection pool in use, between `0.0` and `1.0`.
    fn saturation(&self) -> f64;
}

/// Shared list store holding serialized transfer requests.
///
/// Lists are pushed at the head and consumed from the tail.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    async fn push(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Atomically moves the tail of `source` to the head of `destination`.
    ///
    /// With `wait` set, blocks up to that long for an item to arrive. The item
    /// is always present in exactly one of the two lists.
    async fn move_next(&self, source: &str, destination: &str, wait: Option<Duration>) -> Result<Option<String>, QueueError>;

    /// The full list, head first.
    async fn range(&self, key: &str) -> Result<Vec<String>, QueueError>;

    async fn len(&self, key: &str) -> Result<usize, QueueError>;

    async fn delete(&self, key: &str) -> Result<bool, QueueError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError>;
}
