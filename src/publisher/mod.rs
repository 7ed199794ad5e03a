mod broker;
mod errors;
mod outbox_publisher;

pub use broker::{Acknowledgement, BrokerMessage, MemoryBroker, MessageBroker, ACCOUNTS_TOPIC, TRANSACTIONS_TOPIC};
pub use errors::{BrokerError, PublishError};
pub use outbox_publisher::{OutboxPublisher, PublishReport};
