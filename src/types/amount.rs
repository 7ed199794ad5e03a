use std::str::FromStr;

use serde::{de, Deserialize, Deserializer};

use crate::types::errors::AmountError;
use crate::types::Amount;

/// Balances and transfer amounts are stored with two decimal places.
pub const AMOUNT_SCALE: u32 = 2;

/// Parses a plain decimal string such as `"100"` or `" 12.50 "`.
///
/// Values with more decimal places than [`AMOUNT_SCALE`] are rejected rather
/// than rounded. The result is rescaled so `"5"` and `"5.00"` print the same.
pub fn parse_amount(value: &str) -> Result<Amount, AmountError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(AmountError::InvalidFormat("Value is an empty string".to_string()))
    }

    let mut amount = Amount::from_str(value)
        .map_err(|error| AmountError::InvalidFormat(format!("'{value}' is not a decimal: {error}")))?;

    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(AmountError::TooPrecise(AMOUNT_SCALE))
    }

    amount.rescale(AMOUNT_SCALE);

    Ok(amount)
}

/// Serde adapter for CSV columns holding an amount.
pub fn deserialize_amount<'de, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_amount(&value).map_err(de::Error::custom)
}
