use async_trait::async_trait;
use dashmap::DashMap;

use crate::publisher::BrokerError;

pub const TRANSACTIONS_TOPIC: &str = "transactions";
pub const ACCOUNTS_TOPIC: &str = "accounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partitioning key.
    pub key: String,
    /// Carried as a header so consumers can route without parsing the body.
    pub event_type: String,
    pub body: String
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub topic: String,
    pub offset: u64
}

/// Message broker the publisher forwards settled events to. `publish` resolves
/// once the broker has acknowledged the message.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    async fn publish(&self, message: BrokerMessage) -> Result<Acknowledgement, BrokerError>;
}

/// Broker that appends every message to an in-process log per topic.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<BrokerMessage>>
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.topics.get(topic).map(|messages| messages.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<Acknowledgement, BrokerError> {
        let topic = message.topic.clone();
        let mut log = self.topics.entry(topic.clone()).or_default();

        log.push(message);

        Ok(Acknowledgement { topic, offset: (log.len() - 1) as u64 })
    }
}
