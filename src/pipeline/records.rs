use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::models::TransferRequested;
use crate::pipeline::PipelineError;
use crate::types::{deserialize_amount, AccountId, Amount};

/// One row of the accounts input: a user and the opening balance of their account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountRecord {
    pub user_name: String,
    pub user_email: String,
    pub document: String,
    #[serde(deserialize_with = "deserialize_amount")]
    pub initial_balance: Amount
}

/// One row of the transfers input. A blank idempotency key gets a fresh one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferRecord {
    pub sender: AccountId,
    pub receiver: AccountId,
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: Amount,
    #[serde(default)]
    pub idempotency_key: Option<Uuid>
}

impl TransferRecord {
    pub fn into_request(self) -> TransferRequested {
        TransferRequested {
            sender_account_id: self.sender,
            receiver_account_id: self.receiver,
            amount: self.amount,
            idempotency_key: self.idempotency_key.unwrap_or_else(Uuid::new_v4)
        }
    }
}

/// Reads every well-formed row of a headed CSV file. Malformed rows are logged
/// and skipped, a missing or unreadable file is an error.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PipelineError> {
    let file = File::open(path).map_err(csv::Error::from)?;

    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut records = Vec::new();

    for result in reader.deserialize::<T>() {
        match result {
            Ok(record) => records.push(record),
            Err(error) => error!("CSV deserialization error in {}: {error}", path.display())
        }
    }

    Ok(records)
}
