mod account;
mod errors;
mod events;
mod outbox;
mod transaction;
mod user;

pub use account::{Account, AccountStatus};
pub use errors::{AccountError, TransactionError, UserError};
pub use events::{AccountCreated, TransactionEvent, TransferRequested};
pub use outbox::{
    EventTypeFilter, OutboxEvent, OutboxStatus, ACCOUNT_CREATED, AGGREGATE_ACCOUNT, AGGREGATE_TRANSACTION,
    AGGREGATE_TRANSFER, TRANSACTION_COMPLETED, TRANSACTION_FAILED, TRANSFER_REQUESTED
};
pub use transaction::{Transaction, TransactionStatus};
pub use user::{Role, User, UserStatus};
