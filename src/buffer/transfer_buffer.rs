use std::sync::Arc;

use futures::future::join_all;
use tokio::spawn;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::buffer::BufferError;
use crate::config::BufferConfig;
use crate::models::{OutboxEvent, TransferRequested, AGGREGATE_TRANSFER, TRANSFER_REQUESTED};
use crate::shutdown::ShutdownSignal;
use crate::storage::{OutboxStore, QueueStore};

/// Absorbs transfer requests on the request path and drains them into the
/// outbox in bulk.
///
/// Requests only ever touch the queue store when enqueued. A fixed pool of
/// drain workers moves them, one at a time, from the shared list into a
/// private in-flight list, writes the accumulated batch to the outbox and then
/// deletes the in-flight list as the acknowledgment. An item therefore lives in
/// exactly one list at any moment, and a worker that dies leaves its items
/// behind for [`recover_orphaned`](Self::recover_orphaned) to hand back.
pub struct TransferBuffer<Q: QueueStore, O: OutboxStore> {
    queue: Arc<Q>,
    outbox: Arc<O>,
    config: BufferConfig,
    shutdown: ShutdownSignal,
    workers: Mutex<Vec<JoinHandle<()>>>
}

impl<Q: QueueStore, O: OutboxStore> TransferBuffer<Q, O> {
    pub fn new(queue: Arc<Q>, outbox: Arc<O>, config: BufferConfig) -> Self {
        let shutdown = ShutdownSignal::with_grace(config.shutdown_grace());

        Self {
            queue,
            outbox,
            config,
            shutdown,
            workers: Mutex::new(Vec::new())
        }
    }

    /// Accepts a transfer request. Success means the request is durably
    /// queued, not that it has been settled.
    pub async fn enqueue(&self, request: &TransferRequested) -> Result<(), BufferError> {
        if self.shutdown.is_triggered() {
            return Err(BufferError::ShuttingDown)
        }

        request.validate().map_err(BufferError::InvalidRequest)?;

        let payload = serde_json::to_string(request)
            .map_err(|error| BufferError::Unavailable(format!("unable to serialize transfer request: {error}")))?;

        self.queue.push(&self.config.queue_key, payload).await.inspect_err(|error| {
            error!(idempotency_key = %request.idempotency_key, "Failed to enqueue transfer: {error}");
        })?;

        debug!(idempotency_key = %request.idempotency_key, "Transfer enqueued");

        Ok(())
    }

    /// Recovers orphaned in-flight items and starts the drain workers.
    /// Returns the number of items recovered.
    pub async fn start(&self) -> Result<usize, BufferError> {
        let recovered = self.recover_orphaned().await?;
        let mut workers = self.workers.lock().await;

        for index in 0..self.config.workers {
            let worker = DrainWorker {
                name: format!("worker-{index}"),
                processing_key: format!("{}worker-{index}", self.config.processing_prefix()),
                queue: self.queue.clone(),
                outbox: self.outbox.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone()
            };

            workers.push(spawn(worker.run()));
        }

        info!("Transfer buffer started with {} drain workers", self.config.workers);

        Ok(recovered)
    }

    /// Moves every item left in an in-flight list by a previous process back
    /// onto the shared list.
    pub async fn recover_orphaned(&self) -> Result<usize, BufferError> {
        let mut recovered = 0;

        for processing_key in self.queue.keys_with_prefix(&self.config.processing_prefix()).await? {
            while self.queue.move_next(&processing_key, &self.config.queue_key, None).await?.is_some() {
                recovered += 1;
            }

            self.queue.delete(&processing_key).await?;
        }

        if recovered > 0 {
            warn!("Recovered {recovered} orphaned transfers from in-flight queues");
        }

        Ok(recovered)
    }

    /// Items not yet written to the outbox, queued or in flight.
    pub async fn backlog(&self) -> Result<usize, BufferError> {
        let mut backlog = self.queue.len(&self.config.queue_key).await?;

        for processing_key in self.queue.keys_with_prefix(&self.config.processing_prefix()).await? {
            backlog += self.queue.len(&processing_key).await?;
        }

        Ok(backlog)
    }

    /// Stops accepting requests and waits up to the grace period for the
    /// workers to finish their current iteration. Returns `false` if any worker
    /// had to be aborted; its in-flight items are recovered on the next start.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.trigger();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match timeout(self.shutdown.grace(), join_all(handles)).await {
            Ok(_) => {
                info!("Transfer buffer stopped");
                true
            }
            Err(_) => {
                warn!("Drain workers did not stop within {:?}, aborting", self.shutdown.grace());
                aborts.iter().for_each(|abort| abort.abort());
                false
            }
        }
    }
}

struct DrainWorker<Q: QueueStore, O: OutboxStore> {
    name: String,
    processing_key: String,
    queue: Arc<Q>,
    outbox: Arc<O>,
    config: BufferConfig,
    shutdown: ShutdownSignal
}

impl<Q: QueueStore, O: OutboxStore> DrainWorker<Q, O> {
    async fn run(self) {
        debug!(worker = %self.name, "Drain worker started");

        while !self.shutdown.is_triggered() {
            match self.drain_once().await {
                Ok(0) => {}
                Ok(count) => debug!(worker = %self.name, count, "Drained transfers into the outbox"),
                Err(error) => {
                    //NOTE: The in-flight list is left untouched, the next iteration retries it as is
                    error!(worker = %self.name, "Drain failed, retrying: {error}");

                    tokio::select! {
                        _ = sleep(self.config.retry_backoff()) => {}
                        _ = self.shutdown.triggered() => {}
                    }
                }
            }
        }

        debug!(worker = %self.name, "Drain worker stopped");
    }

    async fn drain_once(&self) -> Result<usize, BufferError> {
        if self.fill().await? == 0 {
            return Ok(0)
        }

        let items = self.queue.range(&self.processing_key).await?;
        let events: Vec<OutboxEvent> = items.iter().filter_map(|raw| self.to_event(raw)).collect();

        if !events.is_empty() {
            self.outbox.insert_events(events).await?;
        }

        self.queue.delete(&self.processing_key).await?;

        Ok(items.len())
    }

    /// Moves items into the in-flight list until the batch is full or the
    /// linger window of a non-empty batch has elapsed. Blocks for up to the pop
    /// timeout while the batch is still empty.
    async fn fill(&self) -> Result<usize, BufferError> {
        let mut pending = self.queue.len(&self.processing_key).await?;
        let mut deadline = (pending > 0).then(|| Instant::now() + self.config.linger());

        while pending < self.config.batch_size {
            let wait = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.config.pop_timeout()
            };

            let moved = tokio::select! {
                moved = self.queue.move_next(&self.config.queue_key, &self.processing_key, Some(wait)) => moved?,
                _ = self.shutdown.triggered(), if deadline.is_none() => None
            };

            if moved.is_none() {
                break;
            }

            pending += 1;
            deadline.get_or_insert_with(|| Instant::now() + self.config.linger());
        }

        Ok(pending)
    }

    fn to_event(&self, raw: &str) -> Option<OutboxEvent> {
        match serde_json::from_str::<TransferRequested>(raw) {
            Ok(request) => Some(OutboxEvent::new(AGGREGATE_TRANSFER, request.idempotency_key.to_string(), TRANSFER_REQUESTED, raw)),
            Err(error) => {
                //NOTE: Unparseable items are acknowledged with the batch so they cannot block the worker
                error!(worker = %self.name, "Dropping unparseable buffered transfer: {error}");
                None
            }
        }
    }
}
