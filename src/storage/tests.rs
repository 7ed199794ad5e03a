use super::{AccountCache, LedgerStore, MemoryDatabase, MemoryQueue, OutboxStore, QueueStore, SaturationProbe, StorageError};

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{Account, EventTypeFilter, OutboxEvent, OutboxStatus, Transaction, TRANSACTION_COMPLETED, TRANSFER_REQUESTED};

fn create_database() -> MemoryDatabase {
    MemoryDatabase::new(&DatabaseConfig { pool_size: 4, acquire_timeout_ms: 200, lock_wait_ms: 200 })
}

async fn open_account(database: &MemoryDatabase, user_id: i64, balance: &str) -> Result<Account> {
    let mut unit = database.begin().await?;
    let account = unit.insert_account(Account::open(user_id, Decimal::from_str(balance)?)?).await?;
    unit.commit().await?;

    Ok(account)
}

fn transfer_event(aggregate_id: &str) -> OutboxEvent {
    OutboxEvent::new("Transfer", aggregate_id, TRANSFER_REQUESTED, "{}")
}

#[tokio::test]
async fn test_committed_account_is_visible_and_versioned() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "200.00").await?;

    let stored = database.find_account(account.id).await?.ok_or_else(|| anyhow!("account missing"))?;
    assert_eq!(stored.version, 0);
    assert_eq!(database.find_account_by_user(1).await?.map(|found| found.id), Some(account.id));

    let mut unit = database.begin().await?;
    let mut locked = unit.lock_accounts(&[account.id]).await?;
    locked[0].withdraw(Decimal::from(50))?;
    unit.save_accounts(locked);
    unit.commit().await?;

    let stored = database.find_account(account.id).await?.ok_or_else(|| anyhow!("account missing"))?;
    assert_eq!(stored.version, 1);
    assert_eq!(stored.balance(), Decimal::from_str("150.00")?);

    Ok(())
}

#[tokio::test]
async fn test_dropped_unit_of_work_leaves_no_trace() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "10").await?;
    let key = Uuid::new_v4();

    {
        let mut unit = database.begin().await?;
        unit.lock_accounts(&[account.id]).await?;
        unit.insert_transaction(Transaction::pending(account.id, 99, Decimal::ONE, key)).await?;
        unit.insert_outbox(vec![transfer_event("x")]);
    }

    assert!(database.find_transaction_by_key(key).await?.is_none());
    assert_eq!(database.count_by_status(OutboxStatus::Unprocessed).await?, 0);

    // The key and the row lock were both released by the drop.
    let mut unit = database.begin().await?;
    unit.lock_accounts(&[account.id]).await?;
    unit.insert_transaction(Transaction::pending(account.id, 99, Decimal::ONE, key)).await?;
    unit.commit().await?;

    assert!(database.find_transaction_by_key(key).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn test_lock_accounts_rejects_unsorted_ids() -> Result<()> {
    let database = create_database();
    let first = open_account(&database, 1, "1").await?;
    let second = open_account(&database, 2, "1").await?;

    let mut unit = database.begin().await?;
    assert_eq!(unit.lock_accounts(&[second.id, first.id]).await, Err(StorageError::LockOrder));
    assert_eq!(unit.lock_accounts(&[first.id, first.id]).await, Err(StorageError::LockOrder));

    unit.lock_accounts(&[second.id]).await?;
    assert_eq!(unit.lock_accounts(&[first.id]).await, Err(StorageError::LockOrder));

    Ok(())
}

#[tokio::test]
async fn test_lock_wait_is_bounded() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "1").await?;

    let mut holder = database.begin().await?;
    holder.lock_accounts(&[account.id]).await?;

    let mut waiter = database.begin().await?;
    let result = waiter.lock_accounts(&[account.id]).await;

    assert_eq!(result, Err(StorageError::LockTimeout { account_id: account.id }));

    holder.rollback().await;
    assert!(waiter.lock_accounts(&[account.id]).await.is_ok());

    Ok(())
}

#[tokio::test]
async fn test_lock_accounts_skips_missing_rows() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "1").await?;

    let mut unit = database.begin().await?;
    let locked = unit.lock_accounts(&[account.id, account.id + 100]).await?;

    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].id, account.id);

    Ok(())
}

#[tokio::test]
async fn test_unknown_account_ids_leave_no_lock_entries() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "1").await?;

    for offset in 1..=50 {
        let mut unit = database.begin().await?;
        unit.lock_accounts(&[account.id, account.id + offset * 1000]).await?;
        unit.rollback().await;
    }

    assert_eq!(database.row_lock_count(), 1);

    // An id nobody could lock still does not block the next caller.
    let mut unit = database.begin().await?;
    assert!(unit.lock_accounts(&[account.id + 1000]).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_bulk_insert_is_all_or_nothing_on_duplicate_key() -> Result<()> {
    let database = create_database();
    let existing = Uuid::new_v4();

    let mut unit = database.begin().await?;
    unit.insert_transaction(Transaction::pending(1, 2, Decimal::ONE, existing)).await?;
    unit.commit().await?;

    let fresh = Uuid::new_v4();
    let mut unit = database.begin().await?;
    let batch = vec![
        Transaction::pending(1, 2, Decimal::ONE, fresh),
        Transaction::pending(1, 2, Decimal::ONE, existing)
    ];

    assert!(matches!(unit.insert_transactions(batch).await, Err(StorageError::UniqueViolation { .. })));

    // The fresh key was released together with the failed bulk insert.
    let inserted = unit.insert_transaction(Transaction::pending(1, 2, Decimal::ONE, fresh)).await?;
    assert!(inserted.id > 0);

    let committed = unit.find_committed_keys(&[fresh, existing]).await?;
    assert!(committed.contains(&existing));
    assert!(!committed.contains(&fresh));

    Ok(())
}

#[tokio::test]
async fn test_uncommitted_key_collides_with_concurrent_insert() -> Result<()> {
    let database = create_database();
    let key = Uuid::new_v4();

    let mut first = database.begin().await?;
    first.insert_transaction(Transaction::pending(1, 2, Decimal::ONE, key)).await?;

    let mut second = database.begin().await?;
    assert!(matches!(second.insert_transaction(Transaction::pending(1, 2, Decimal::ONE, key)).await, Err(StorageError::UniqueViolation { .. })));
    assert!(second.find_committed_keys(&[key]).await?.is_empty());

    first.commit().await?;
    assert_eq!(second.find_committed_keys(&[key]).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_stale_version_fails_commit() -> Result<()> {
    let database = create_database();
    let account = open_account(&database, 1, "10").await?;
    let stale = database.find_account(account.id).await?.ok_or_else(|| anyhow!("account missing"))?;

    let mut unit = database.begin().await?;
    let mut locked = unit.lock_accounts(&[account.id]).await?;
    locked[0].deposit(Decimal::ONE)?;
    unit.save_accounts(locked);
    unit.commit().await?;

    let mut unit = database.begin().await?;
    unit.save_accounts(vec![stale]);

    assert_eq!(unit.commit().await, Err(StorageError::OptimisticLock { account_id: account.id }));

    let stored = database.find_account(account.id).await?.ok_or_else(|| anyhow!("account missing"))?;
    assert_eq!(stored.balance(), Decimal::from(11));

    Ok(())
}

#[tokio::test]
async fn test_second_account_for_same_user_is_rejected() -> Result<()> {
    let database = create_database();
    open_account(&database, 7, "0").await?;

    assert!(open_account(&database, 7, "0").await.is_err());
    assert_eq!(database.list_accounts().await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_claim_takes_oldest_matching_rows_once() -> Result<()> {
    let database = create_database();
    let mut events = Vec::new();

    for index in 0..5 {
        let mut event = transfer_event(&index.to_string());
        event.created_at = event.created_at + chrono::Duration::milliseconds(index);
        events.push(event);
    }

    events.push(OutboxEvent::new("Transaction", "1", TRANSACTION_COMPLETED, "{}"));
    database.insert_events(events).await?;

    let filter = EventTypeFilter::only(&[TRANSFER_REQUESTED]);
    let first = database.claim_events(&filter, 3, Duration::from_secs(60)).await?;
    let second = database.claim_events(&filter, 3, Duration::from_secs(60)).await?;
    let third = database.claim_events(&filter, 3, Duration::from_secs(60)).await?;

    let ids: Vec<&str> = first.iter().map(|event| event.aggregate_id.as_str()).collect();
    assert_eq!(ids, vec!["0", "1", "2"]);
    assert_eq!(second.len(), 2);
    assert!(third.is_empty());
    assert!(first.iter().all(|event| event.status == OutboxStatus::Processing && event.locked_at.is_some()));

    assert_eq!(database.count_by_status(OutboxStatus::Processing).await?, 5);
    assert_eq!(database.find_by_status(OutboxStatus::Unprocessed, Some(TRANSACTION_COMPLETED)).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_expired_claim_is_claimable_again() -> Result<()> {
    let database = create_database();
    database.insert_events(vec![transfer_event("a")]).await?;

    let filter = EventTypeFilter::only(&[TRANSFER_REQUESTED]);
    let claimed = database.claim_events(&filter, 10, Duration::from_millis(20)).await?;
    assert_eq!(claimed.len(), 1);
    assert!(database.claim_events(&filter, 10, Duration::from_millis(20)).await?.is_empty());

    sleep(Duration::from_millis(40)).await;

    let reclaimed = database.claim_events(&filter, 10, Duration::from_millis(20)).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, claimed[0].id);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_never_overlap() -> Result<()> {
    let database = create_database();
    database.insert_events((0..200).map(|index| transfer_event(&index.to_string())).collect()).await?;

    let filter = EventTypeFilter::only(&[TRANSFER_REQUESTED]);
    let claims = (0..4).map(|_| {
        let database = database.clone();
        let filter = filter.clone();
        tokio::spawn(async move { database.claim_events(&filter, 60, Duration::from_secs(60)).await })
    });

    let mut seen = std::collections::HashSet::new();

    for claim in futures::future::join_all(claims).await {
        for event in claim?? {
            assert!(seen.insert(event.id), "row claimed twice");
        }
    }

    assert_eq!(seen.len(), 200);

    Ok(())
}

#[tokio::test]
async fn test_saturation_tracks_open_units_of_work() -> Result<()> {
    let database = create_database();

    assert_eq!(database.saturation(), 0.0);

    let first = database.begin().await?;
    let second = database.begin().await?;
    assert_eq!(database.saturation(), 0.5);

    drop(first);
    drop(second);
    assert_eq!(database.saturation(), 0.0);

    Ok(())
}

#[tokio::test]
async fn test_exhausted_pool_reports_unavailable() -> Result<()> {
    let database = create_database();
    let mut units = Vec::new();

    for _ in 0..4 {
        units.push(database.begin().await?);
    }

    assert!(matches!(database.begin().await, Err(StorageError::Unavailable(_))));

    Ok(())
}

#[tokio::test]
async fn test_queue_moves_tail_to_destination_head() -> Result<()> {
    let queue = MemoryQueue::new();

    queue.push("main", "a".to_string()).await?;
    queue.push("main", "b".to_string()).await?;

    assert_eq!(queue.move_next("main", "worker", None).await?, Some("a".to_string()));
    assert_eq!(queue.move_next("main", "worker", None).await?, Some("b".to_string()));
    assert_eq!(queue.move_next("main", "worker", None).await?, None);

    assert_eq!(queue.range("worker").await?, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(queue.len("main").await?, 0);
    assert!(queue.delete("worker").await?);
    assert!(!queue.delete("worker").await?);

    Ok(())
}

#[tokio::test]
async fn test_blocking_move_wakes_on_push() -> Result<()> {
    let queue = MemoryQueue::new();
    let consumer = queue.clone();
    let handle = tokio::spawn(async move { consumer.move_next("main", "worker", Some(Duration::from_secs(2))).await });

    sleep(Duration::from_millis(20)).await;
    queue.push("main", "late".to_string()).await?;

    let moved = timeout(Duration::from_secs(1), handle).await???;
    assert_eq!(moved, Some("late".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_blocking_move_gives_up_after_wait() -> Result<()> {
    let queue = MemoryQueue::new();

    assert_eq!(queue.move_next("main", "worker", Some(Duration::from_millis(20))).await?, None);

    Ok(())
}

#[tokio::test]
async fn test_keys_with_prefix_lists_in_flight_queues() -> Result<()> {
    let queue = MemoryQueue::new();

    queue.push("main", "x".to_string()).await?;
    queue.push("main:processing:worker-1", "y".to_string()).await?;
    queue.push("main:processing:worker-0", "z".to_string()).await?;

    assert_eq!(queue.keys_with_prefix("main:processing:").await?, vec!["main:processing:worker-0", "main:processing:worker-1"]);

    Ok(())
}

#[tokio::test]
async fn test_account_cache_invalidation() -> Result<()> {
    let cache = AccountCache::new(10, Duration::from_secs(60));
    let mut account = Account::open(1, Decimal::TEN)?;
    account.id = 3;

    cache.insert(account.clone()).await;
    assert_eq!(cache.get(3).await, Some(account));

    cache.invalidate(3).await;
    assert!(cache.get(3).await.is_none());

    Ok(())
}
