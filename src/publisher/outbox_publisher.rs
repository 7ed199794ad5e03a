use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::PublisherConfig;
use crate::models::{
    AccountCreated, EventTypeFilter, OutboxEvent, OutboxStatus, TransactionEvent, ACCOUNT_CREATED, TRANSACTION_COMPLETED,
    TRANSACTION_FAILED, TRANSFER_REQUESTED
};
use crate::publisher::{Acknowledgement, BrokerMessage, MessageBroker, PublishError, ACCOUNTS_TOPIC, TRANSACTIONS_TOPIC};
use crate::shutdown::ShutdownSignal;
use crate::storage::OutboxStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    /// Unknown event types, marked processed without publishing.
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize
}

/// Forwards every outbox row except `TransferRequested` to the message broker.
pub struct OutboxPublisher<O: OutboxStore, B: MessageBroker> {
    outbox: Arc<O>,
    broker: Arc<B>,
    config: PublisherConfig,
    filter: EventTypeFilter
}

impl<O: OutboxStore, B: MessageBroker> OutboxPublisher<O, B> {
    pub fn new(outbox: Arc<O>, broker: Arc<B>, config: PublisherConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
            filter: EventTypeFilter::excluding(&[TRANSFER_REQUESTED])
        }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("Outbox publisher started");

        while !shutdown.is_triggered() {
            let report = self.run_cycle().await;

            if report.claimed < self.config.batch_size {
                tokio::select! {
                    _ = sleep(self.config.poll_interval()) => {}
                    _ = shutdown.triggered() => {}
                }
            }
        }

        info!("Outbox publisher stopped");
    }

    /// Claims one batch, publishes each row and saves every row's outcome.
    pub async fn run_cycle(&self) -> PublishReport {
        let mut report = PublishReport::default();

        let mut claimed = match self.outbox.claim_events(&self.filter, self.config.batch_size, self.config.lock_timeout()).await {
            Ok(claimed) => claimed,
            Err(error) => {
                error!("Failed to claim outbox events: {error}");
                return report
            }
        };

        if claimed.is_empty() {
            return report
        }

        report.claimed = claimed.len();

        for event in claimed.iter_mut() {
            match self.publish(event).await {
                Ok(Some(acknowledgement)) => {
                    debug!(event_id = %event.id, topic = %acknowledgement.topic, offset = acknowledgement.offset, "Event published");
                    event.mark_processed();
                    report.published += 1;
                }
                Ok(None) => {
                    warn!(event_id = %event.id, event_type = %event.event_type, "Unknown event type, marking processed");
                    event.mark_processed();
                    report.skipped += 1;
                }
                Err(error) => match event.record_failure(self.config.max_retries) {
                    OutboxStatus::Failed => {
                        error!(event_id = %event.id, retry_count = event.retry_count, "Giving up on event: {error}");
                        report.failed += 1;
                    }
                    _ => {
                        warn!(event_id = %event.id, retry_count = event.retry_count, "Failed to publish event, will retry: {error}");
                        report.retried += 1;
                    }
                }
            }
        }

        if let Err(error) = self.outbox.save_events(&claimed).await {
            //NOTE: Published rows will be claimed and sent again once their lock expires
            error!("Failed to save outbox event outcomes: {error}");
        }

        info!(
            claimed = report.claimed,
            published = report.published,
            skipped = report.skipped,
            retried = report.retried,
            failed = report.failed,
            "Publisher cycle finished"
        );

        report
    }

    /// Returns `None` for event types with no destination.
    async fn publish(&self, event: &OutboxEvent) -> Result<Option<Acknowledgement>, PublishError> {
        let message = match event.event_type.as_str() {
            ACCOUNT_CREATED => {
                let body: AccountCreated = serde_json::from_str(&event.payload)?;

                BrokerMessage {
                    topic: ACCOUNTS_TOPIC.to_string(),
                    key: body.account_id.to_string(),
                    event_type: event.event_type.clone(),
                    body: serde_json::to_string(&body)?
                }
            }
            TRANSACTION_COMPLETED | TRANSACTION_FAILED => {
                let body: TransactionEvent = serde_json::from_str(&event.payload)?;

                BrokerMessage {
                    topic: TRANSACTIONS_TOPIC.to_string(),
                    key: body.idempotency_key.to_string(),
                    event_type: event.event_type.clone(),
                    body: serde_json::to_string(&body)?
                }
            }
            _ => return Ok(None)
        };

        let publish_timeout = self.config.publish_timeout();
        let acknowledgement = timeout(publish_timeout, self.broker.publish(message)).await
            .map_err(|_| PublishError::Timeout(publish_timeout))??;

        Ok(Some(acknowledgement))
    }
}
