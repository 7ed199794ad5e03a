use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::engine::{BatchSizeController, EngineError};
use crate::models::{
    Account, AccountError, EventTypeFilter, OutboxEvent, OutboxStatus, Transaction, TransactionEvent, TransferRequested,
    AGGREGATE_TRANSACTION, TRANSACTION_COMPLETED, TRANSACTION_FAILED, TRANSFER_REQUESTED
};
use crate::shutdown::ShutdownSignal;
use crate::storage::{AccountCache, LedgerStore, OutboxStore, SaturationProbe, StorageError, UnitOfWork};
use crate::types::{AccountId, IdempotencyKey, OutboxEventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Saturation was above the threshold, nothing was claimed.
    Throttled,
    /// Nothing was waiting.
    Idle,
    /// The claim itself failed.
    Unavailable,
    Settled,
    /// The batch hit an infrastructure failure and every claimed row was handed back.
    Reverted
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Batch size this cycle claimed with.
    pub batch_size: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub retried: usize,
    pub quarantined: usize,
    pub elapsed: Duration
}

impl CycleReport {
    fn empty(outcome: CycleOutcome, batch_size: usize) -> Self {
        Self {
            outcome,
            batch_size,
            claimed: 0,
            completed: 0,
            failed: 0,
            duplicates: 0,
            retried: 0,
            quarantined: 0,
            elapsed: Duration::ZERO
        }
    }

    pub fn is_full(&self) -> bool {
        self.outcome == CycleOutcome::Settled && self.claimed >= self.batch_size
    }
}

/// Transfer waiting to be applied, paired with the outbox row it came from.
struct Settlement {
    event: OutboxEvent,
    transaction: Transaction
}

/// Settles claimed `TransferRequested` rows in batches.
///
/// Each cycle claims a batch, locks every account the batch touches in
/// ascending id order, filters out transfers whose idempotency key has already
/// been settled, applies the rest and commits balances, transactions, audit
/// events and the outbox deletions in one unit of work.
pub struct SettlementEngine<L: LedgerStore, O: OutboxStore, P: SaturationProbe> {
    name: String,
    ledger: Arc<L>,
    outbox: Arc<O>,
    probe: Arc<P>,
    config: SettlementConfig,
    controller: BatchSizeController,
    filter: EventTypeFilter,
    cache: Option<AccountCache>
}

impl<L: LedgerStore, O: OutboxStore, P: SaturationProbe> SettlementEngine<L, O, P> {
    pub fn new(name: impl Into<String>, ledger: Arc<L>, outbox: Arc<O>, probe: Arc<P>, config: SettlementConfig) -> Self {
        Self {
            name: name.into(),
            controller: BatchSizeController::from_config(&config),
            ledger,
            outbox,
            probe,
            config,
            filter: EventTypeFilter::only(&[TRANSFER_REQUESTED]),
            cache: None
        }
    }

    /// Invalidates cached accounts after every committed batch.
    pub fn with_cache(mut self, cache: AccountCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.controller.current()
    }

    /// Runs cycles until the shutdown signal is triggered. A cycle that has
    /// claimed rows always runs to completion before the loop checks the signal.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(engine = %self.name, batch_size = self.batch_size(), "Settlement engine started");

        while !shutdown.is_triggered() {
            let report = self.run_cycle().await;

            if !report.is_full() {
                tokio::select! {
                    _ = sleep(self.config.poll_interval()) => {}
                    _ = shutdown.triggered() => {}
                }
            }
        }

        info!(engine = %self.name, "Settlement engine stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let batch_size = self.controller.current();
        let saturation = self.probe.saturation();

        if saturation > self.config.saturation_threshold {
            warn!(engine = %self.name, saturation, "Database saturated, skipping settlement cycle");
            return CycleReport::empty(CycleOutcome::Throttled, batch_size)
        }

        let started = Instant::now();
        let claimed = match self.outbox.claim_events(&self.filter, batch_size, self.config.lock_timeout()).await {
            Ok(claimed) => claimed,
            Err(error) => {
                error!(engine = %self.name, "Failed to claim transfers: {error}");
                return CycleReport::empty(CycleOutcome::Unavailable, batch_size)
            }
        };

        if claimed.is_empty() {
            return CycleReport::empty(CycleOutcome::Idle, batch_size)
        }

        let claimed_count = claimed.len();
        let mut report = match self.settle(&claimed).await {
            Ok(report) => report,
            Err(error) => {
                error!(engine = %self.name, claimed = claimed_count, "Settlement batch failed, reverting: {error}");
                self.revert(claimed).await;

                let next = self.controller.on_failure();
                debug!(engine = %self.name, next_batch_size = next, "Batch size reduced after failure");

                let mut report = CycleReport::empty(CycleOutcome::Reverted, batch_size);
                report.claimed = claimed_count;
                report.elapsed = started.elapsed();
                return report
            }
        };

        report.batch_size = batch_size;
        report.elapsed = started.elapsed();

        let next = self.controller.record(report.elapsed, report.claimed);

        info!(
            engine = %self.name,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            duplicates = report.duplicates,
            retried = report.retried,
            quarantined = report.quarantined,
            elapsed_ms = report.elapsed.as_millis() as u64,
            next_batch_size = next,
            "Settlement cycle finished"
        );

        report
    }

    async fn settle(&self, claimed: &[OutboxEvent]) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::empty(CycleOutcome::Settled, claimed.len());
        report.claimed = claimed.len();

        let mut requests = Vec::with_capacity(claimed.len());
        let mut poisoned = Vec::new();

        for event in claimed {
            match serde_json::from_str::<TransferRequested>(&event.payload) {
                Ok(request) => requests.push((event.clone(), request)),
                Err(error) => {
                    let mut event = event.clone();

                    match event.record_failure(self.config.max_retries) {
                        OutboxStatus::Failed => report.quarantined += 1,
                        _ => report.retried += 1
                    }

                    warn!(engine = %self.name, event_id = %event.id, retry_count = event.retry_count, "Unparseable transfer payload: {error}");
                    poisoned.push(event);
                }
            }
        }

        let account_ids: Vec<AccountId> = requests.iter()
            .flat_map(|(_, request)| [request.sender_account_id, request.receiver_account_id])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut unit = self.ledger.begin().await?;
        let mut accounts: HashMap<AccountId, Account> = unit.lock_accounts(&account_ids).await?
            .into_iter()
            .map(|account| (account.id, account))
            .collect();

        let keys: Vec<IdempotencyKey> = requests.iter().map(|(_, request)| request.idempotency_key).collect();
        let committed = unit.find_committed_keys(&keys).await?;

        let mut processed = Vec::new();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for (event, request) in requests {
            if committed.contains(&request.idempotency_key) || !seen.insert(request.idempotency_key) {
                debug!(engine = %self.name, idempotency_key = %request.idempotency_key, "Transfer already settled");
                report.duplicates += 1;
                processed.push(event.id);
                continue;
            }

            candidates.push((event, request));
        }

        let settlements = self.insert_pending(unit.as_mut(), candidates, &mut processed, &mut report).await?;

        let mut touched = BTreeSet::new();
        let mut transactions = Vec::with_capacity(settlements.len());
        let mut audit = Vec::with_capacity(settlements.len());

        for Settlement { event, mut transaction } in settlements {
            let event_type = match apply_transfer(&mut accounts, &transaction) {
                Ok(()) => {
                    transaction.complete()?;
                    touched.extend([transaction.sender_account_id, transaction.receiver_account_id]);
                    report.completed += 1;
                    TRANSACTION_COMPLETED
                }
                Err(violation) => {
                    warn!(engine = %self.name, transaction_id = transaction.id, "Transfer failed: {violation}");
                    transaction.fail(violation.to_string())?;
                    report.failed += 1;
                    TRANSACTION_FAILED
                }
            };

            let payload = serde_json::to_string(&TransactionEvent::from(&transaction))?;

            audit.push(OutboxEvent::new(AGGREGATE_TRANSACTION, transaction.id.to_string(), event_type, payload));
            processed.push(event.id);
            transactions.push(transaction);
        }

        unit.save_accounts(touched.iter().filter_map(|account_id| accounts.remove(account_id)).collect());
        unit.save_transactions(transactions);
        unit.insert_outbox(audit);
        unit.delete_outbox(processed);
        unit.save_outbox(poisoned);
        unit.commit().await?;

        if let Some(cache) = &self.cache {
            for account_id in touched {
                cache.invalidate(account_id).await;
            }
        }

        Ok(report)
    }

    /// Inserts the pending transactions in bulk, falling back to one at a time
    /// when a concurrent batch already took one of the keys. Rows that collide
    /// on the retry are duplicates.
    async fn insert_pending(
        &self,
        unit: &mut dyn UnitOfWork,
        candidates: Vec<(OutboxEvent, TransferRequested)>,
        processed: &mut Vec<OutboxEventId>,
        report: &mut CycleReport
    ) -> Result<Vec<Settlement>, EngineError> {
        let pending: Vec<Transaction> = candidates.iter()
            .map(|(_, request)| Transaction::pending(request.sender_account_id, request.receiver_account_id, request.amount, request.idempotency_key))
            .collect();

        match unit.insert_transactions(pending.clone()).await {
            Ok(inserted) => {
                return Ok(candidates.into_iter()
                    .zip(inserted)
                    .map(|((event, _), transaction)| Settlement { event, transaction })
                    .collect())
            }
            Err(StorageError::UniqueViolation { key }) => {
                warn!(engine = %self.name, %key, "Bulk insert hit a duplicate key, inserting one by one");
            }
            Err(error) => return Err(error.into())
        }

        let mut settlements = Vec::with_capacity(candidates.len());

        for ((event, _), transaction) in candidates.into_iter().zip(pending) {
            match unit.insert_transaction(transaction).await {
                Ok(transaction) => settlements.push(Settlement { event, transaction }),
                Err(StorageError::UniqueViolation { .. }) => {
                    report.duplicates += 1;
                    processed.push(event.id);
                }
                Err(error) => return Err(error.into())
            }
        }

        Ok(settlements)
    }

    async fn revert(&self, claimed: Vec<OutboxEvent>) {
        let released: Vec<OutboxEvent> = claimed.into_iter()
            .map(|mut event| {
                event.release();
                event
            })
            .collect();

        if let Err(error) = self.outbox.save_events(&released).await {
            //NOTE: The rows stay claimed and become available again once their lock times out
            error!(engine = %self.name, "Failed to release claimed transfers: {error}");
        }
    }
}

/// Withdraws from the sender and deposits to the receiver. Both legs run on
/// copies and are written back only if both succeed.
fn apply_transfer(accounts: &mut HashMap<AccountId, Account>, transaction: &Transaction) -> Result<(), AccountError> {
    if transaction.sender_account_id == transaction.receiver_account_id {
        return Err(AccountError::invalid_argument(transaction.sender_account_id, "Sender and receiver accounts cannot be the same."))
    }

    let mut sender = accounts.get(&transaction.sender_account_id).cloned()
        .ok_or_else(|| AccountError::not_found(transaction.sender_account_id))?;
    let mut receiver = accounts.get(&transaction.receiver_account_id).cloned()
        .ok_or_else(|| AccountError::not_found(transaction.receiver_account_id))?;

    sender.withdraw(transaction.amount)?;
    receiver.deposit(transaction.amount)?;

    accounts.insert(sender.id, sender);
    accounts.insert(receiver.id, receiver);

    Ok(())
}
