use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::buffer::TransferBuffer;
use crate::config::LedgerConfig;
use crate::engine::SettlementEngine;
use crate::models::{Account, OutboxStatus, Role, TransferRequested};
use crate::pipeline::{AccountRecord, PipelineError};
use crate::publisher::{MemoryBroker, OutboxPublisher};
use crate::services::AccountService;
use crate::shutdown::ShutdownSignal;
use crate::storage::{AccountCache, MemoryDatabase, MemoryQueue, OutboxStore};

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// The whole settlement pipeline running in process: ingestion buffer,
/// settlement engines and outbox publisher over the in-memory stores.
pub struct LedgerPipeline {
    config: LedgerConfig,
    database: Arc<MemoryDatabase>,
    queue: Arc<MemoryQueue>,
    broker: Arc<MemoryBroker>,
    cache: AccountCache,
    buffer: TransferBuffer<MemoryQueue, MemoryDatabase>,
    shutdown: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>
}

impl LedgerPipeline {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_queue(config, Arc::new(MemoryQueue::new()))
    }

    /// Builds a pipeline over an existing queue, as a restarted process would
    /// find it.
    pub fn with_queue(config: LedgerConfig, queue: Arc<MemoryQueue>) -> Self {
        let database = Arc::new(MemoryDatabase::new(&config.database));
        let cache = AccountCache::new(config.cache.capacity, config.cache.time_to_live());
        let buffer = TransferBuffer::new(queue.clone(), database.clone(), config.buffer.clone());
        let shutdown = ShutdownSignal::with_grace(config.worker_grace());

        Self {
            config,
            database,
            queue,
            broker: Arc::new(MemoryBroker::new()),
            cache,
            buffer,
            shutdown,
            tasks: Vec::new()
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    pub fn queue(&self) -> &Arc<MemoryQueue> {
        &self.queue
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn accounts(&self) -> AccountService<MemoryDatabase> {
        AccountService::new(self.database.clone()).with_cache(self.cache.clone())
    }

    /// Registers one user per record and opens their account. Accounts are
    /// created in record order, so the first record gets the lowest id.
    pub async fn open_accounts(&self, records: Vec<AccountRecord>) -> Result<Vec<Account>, PipelineError> {
        let service = self.accounts();
        let mut accounts = Vec::with_capacity(records.len());

        for record in records {
            let user = service.register_user(&record.user_name, &record.user_email, &record.document, Role::User).await?;
            accounts.push(service.create_account_for_user(user.id, record.initial_balance).await?);
        }

        Ok(accounts)
    }

    /// Recovers orphaned buffer items and spawns every worker loop. Returns
    /// the number of recovered items.
    pub async fn start(&mut self) -> Result<usize, PipelineError> {
        if !self.tasks.is_empty() {
            return Err(PipelineError::AlreadyStarted)
        }

        let recovered = self.buffer.start().await?;

        for index in 0..self.config.settlement.workers {
            let engine = SettlementEngine::new(
                format!("settlement-{index}"),
                self.database.clone(),
                self.database.clone(),
                self.database.clone(),
                self.config.settlement.clone()
            ).with_cache(self.cache.clone());

            self.tasks.push(spawn(engine.run(self.shutdown.clone())));
        }

        let publisher = OutboxPublisher::new(self.database.clone(), self.broker.clone(), self.config.publisher.clone());
        self.tasks.push(spawn(publisher.run(self.shutdown.clone())));

        info!(settlement_workers = self.config.settlement.workers, "Ledger pipeline started");

        Ok(recovered)
    }

    pub async fn enqueue(&self, request: &TransferRequested) -> Result<(), PipelineError> {
        Ok(self.buffer.enqueue(request).await?)
    }

    /// Waits until the buffer is empty and no outbox row is still waiting or
    /// claimed. Returns `false` if that did not happen within `limit`.
    pub async fn wait_until_settled(&self, limit: Duration) -> Result<bool, PipelineError> {
        let deadline = Instant::now() + limit;

        loop {
            if self.is_settled().await? {
                return Ok(true)
            }

            if Instant::now() >= deadline {
                return Ok(false)
            }

            sleep(SETTLE_POLL).await;
        }
    }

    async fn is_settled(&self) -> Result<bool, PipelineError> {
        if self.buffer.backlog().await? > 0 {
            return Ok(false)
        }

        let pending = self.database.count_by_status(OutboxStatus::Unprocessed).await?
            + self.database.count_by_status(OutboxStatus::Processing).await?;

        Ok(pending == 0)
    }

    /// Stops the buffer first so nothing new reaches the outbox, then the
    /// engines and the publisher. Returns `false` if anything had to be aborted.
    pub async fn shutdown(&mut self) -> bool {
        let buffer_stopped = self.buffer.shutdown().await;

        self.shutdown.trigger();

        let handles: Vec<JoinHandle<()>> = self.tasks.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let workers_stopped = match timeout(self.shutdown.grace(), join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Pipeline workers did not stop within {:?}, aborting", self.shutdown.grace());
                aborts.iter().for_each(|abort| abort.abort());
                false
            }
        };

        info!("Ledger pipeline stopped");

        buffer_stopped && workers_stopped
    }
}
