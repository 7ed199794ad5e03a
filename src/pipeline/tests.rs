use super::{read_records, AccountRecord, LedgerPipeline, PipelineError, TransferRecord};

use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;
use tempfile::NamedTempFile;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::{BufferConfig, LedgerConfig, SettlementConfig};
use crate::models::{OutboxStatus, TransactionStatus, TRANSFER_REQUESTED};
use crate::publisher::TRANSACTIONS_TOPIC;
use crate::storage::{LedgerStore, OutboxStore, QueueStore};

fn csv_file(content: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;

    Ok(file)
}

fn fast_config() -> LedgerConfig {
    LedgerConfig {
        buffer: BufferConfig {
            workers: 2,
            pop_timeout_ms: 20,
            linger_ms: 5,
            shutdown_grace_ms: 2000,
            ..BufferConfig::default()
        },
        settlement: SettlementConfig {
            poll_interval_ms: 5,
            ..SettlementConfig::default()
        },
        ..LedgerConfig::default()
    }
}

fn account(name: &str, balance: &str) -> Result<AccountRecord> {
    Ok(AccountRecord {
        user_name: name.to_string(),
        user_email: format!("{}@example.com", name.to_lowercase()),
        document: format!("doc-{name}"),
        initial_balance: Decimal::from_str(balance)?
    })
}

#[test]
fn test_read_records_trims_and_parses_amounts() -> Result<()> {
    let file = csv_file("user_name, user_email, document, initial_balance\nAda , ada@example.com, 1, 200\nBob,bob@example.com,2, 12.5\n")?;

    let records: Vec<AccountRecord> = read_records(file.path())?;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].user_name, "Ada");
    assert_eq!(records[0].initial_balance.to_string(), "200.00");
    assert_eq!(records[1].initial_balance.to_string(), "12.50");

    Ok(())
}

#[test]
fn test_read_records_skips_malformed_rows() -> Result<()> {
    let key = Uuid::new_v4();
    let content = format!("sender,receiver,amount,idempotency_key\n1,2,10.00,{key}\nx,2,10.00,\n1,2,0.001,\n2,1,5\n");
    let file = csv_file(&content)?;

    let records: Vec<TransferRecord> = read_records(file.path())?;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].idempotency_key, Some(key));
    assert_eq!(records[1].idempotency_key, None);

    Ok(())
}

#[test]
fn test_transfer_record_without_key_gets_a_fresh_one() -> Result<()> {
    let record = TransferRecord { sender: 1, receiver: 2, amount: Decimal::ONE, idempotency_key: None };

    let first = record.clone().into_request();
    let second = record.into_request();

    assert_ne!(first.idempotency_key, second.idempotency_key);
    assert_eq!(first.sender_account_id, 1);

    Ok(())
}

#[test]
fn test_read_records_fails_on_missing_file() {
    let result: Result<Vec<AccountRecord>, PipelineError> = read_records(Path::new("does/not/exist.csv"));

    assert!(matches!(result, Err(PipelineError::Input(_))));
}

#[tokio::test]
async fn test_pipeline_settles_enqueued_transfers_and_publishes_audit_events() -> Result<()> {
    let mut pipeline = LedgerPipeline::new(fast_config());
    let accounts = pipeline.open_accounts(vec![account("Alice", "200.00")?, account("Bob", "50.00")?]).await?;
    let (alice, bob) = (accounts[0].id, accounts[1].id);

    pipeline.start().await?;

    let request = TransferRecord { sender: alice, receiver: bob, amount: Decimal::from_str("100.00")?, idempotency_key: None }.into_request();
    pipeline.enqueue(&request).await?;

    assert!(pipeline.wait_until_settled(Duration::from_secs(10)).await?);
    assert!(pipeline.shutdown().await);

    let database = pipeline.database();
    let transaction = database.find_transaction_by_key(request.idempotency_key).await?
        .ok_or_else(|| anyhow!("transaction missing"))?;

    assert_eq!(transaction.status, TransactionStatus::Success);
    assert_eq!(pipeline.accounts().find_account(alice).await?.balance(), Decimal::from_str("100.00")?);
    assert_eq!(pipeline.accounts().find_account(bob).await?.balance(), Decimal::from_str("150.00")?);
    assert_eq!(database.count_by_status(OutboxStatus::Unprocessed).await?, 0);

    // Two AccountCreated rows and one TransactionCompleted row, all published.
    assert_eq!(database.count_by_status(OutboxStatus::Processed).await?, 3);
    assert_eq!(pipeline.broker().messages(TRANSACTIONS_TOPIC).len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_pipeline_refuses_to_start_twice() -> Result<()> {
    let mut pipeline = LedgerPipeline::new(fast_config());

    pipeline.start().await?;
    let second = pipeline.start().await;

    assert!(matches!(second, Err(PipelineError::AlreadyStarted)));
    assert!(pipeline.shutdown().await);

    Ok(())
}

#[tokio::test]
async fn test_restarted_pipeline_settles_items_orphaned_in_flight() -> Result<()> {
    let first = LedgerPipeline::new(fast_config());
    let queue = first.queue().clone();

    let request = TransferRecord { sender: 1, receiver: 2, amount: Decimal::TEN, idempotency_key: None }.into_request();
    queue.push("ledger:transfer-buffer:processing:worker-3", serde_json::to_string(&request)?).await?;
    drop(first);

    let mut restarted = LedgerPipeline::with_queue(fast_config(), queue);
    restarted.open_accounts(vec![account("Alice", "10")?, account("Bob", "0")?]).await?;

    assert_eq!(restarted.start().await?, 1);
    assert!(restarted.wait_until_settled(Duration::from_secs(10)).await?);
    assert!(restarted.shutdown().await);

    assert_eq!(restarted.accounts().find_account(2).await?.balance(), Decimal::TEN);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_waits_for_a_settlement_cycle_blocked_on_row_locks() -> Result<()> {
    let mut config = fast_config();
    config.buffer.shutdown_grace_ms = 100;
    config.database.lock_wait_ms = 2000;

    let mut pipeline = LedgerPipeline::new(config.clone());
    let accounts = pipeline.open_accounts(vec![account("Alice", "10")?, account("Bob", "0")?]).await?;
    let (alice, bob) = (accounts[0].id, accounts[1].id);

    assert_eq!(pipeline.shutdown_signal().grace(), config.worker_grace());

    let mut holder = pipeline.database().begin().await?;
    holder.lock_accounts(&[alice]).await?;

    pipeline.start().await?;
    pipeline.enqueue(&TransferRecord { sender: alice, receiver: bob, amount: Decimal::TEN, idempotency_key: None }.into_request()).await?;

    let mut claimed = false;

    for _ in 0..300 {
        if !pipeline.database().find_by_status(OutboxStatus::Processing, Some(TRANSFER_REQUESTED)).await?.is_empty() {
            claimed = true;
            break;
        }

        sleep(Duration::from_millis(5)).await;
    }

    if !claimed {
        bail!("settlement never claimed the transfer")
    }

    let release = tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        holder.rollback().await;
    });

    // The cycle is stuck behind the row lock for longer than the buffer grace.
    assert!(pipeline.shutdown().await);
    release.await?;

    assert_eq!(pipeline.database().count_by_status(OutboxStatus::Processing).await?, 0);
    assert_eq!(pipeline.accounts().find_account(bob).await?.balance(), Decimal::TEN);

    Ok(())
}
