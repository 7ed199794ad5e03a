mod amount;
mod errors;

use rust_decimal::Decimal;
use uuid::Uuid;

pub use amount::{deserialize_amount, parse_amount, AMOUNT_SCALE};
pub use errors::AmountError;

pub type AccountId = i64;
pub type UserId = i64;
pub type TransactionId = i64;
pub type OutboxEventId = Uuid;

/// Client supplied key that makes a transfer request safe to redeliver.
pub type IdempotencyKey = Uuid;

/// Exact decimal used for every balance and transfer amount.
pub type Amount = Decimal;
