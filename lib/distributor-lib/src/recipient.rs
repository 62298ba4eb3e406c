use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use solana_sdk::pubkey::Pubkey;
use std::{io::Read, str::FromStr};
use thiserror::Error as ThisError;

/// Decimals of the native asset (lamports per SOL).
pub const NATIVE_DECIMALS: u8 = 9;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("invalid amount {0:?}")]
    Amount(String),
    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("amount {amount} is not representable with {decimals} decimals")]
    Unrepresentable { amount: Decimal, decimals: u8 },
    #[error("recipient list is empty")]
    Empty,
    #[error("too many recipients: {count}, maximum is {max}")]
    TooMany { count: usize, max: usize },
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("row {row}, field `{field}`: {message}")]
    Row {
        row: usize,
        field: String,
        message: String,
    },
}

impl ValidationError {
    /// Attach a CSV position to a field error.
    pub fn at(self, row: usize, field: &str) -> Self {
        match self {
            e @ ValidationError::Row { .. } => e,
            e => ValidationError::Row {
                row,
                field: field.to_owned(),
                message: e.to_string(),
            },
        }
    }
}

/// Decode a base58 public key, rejecting anything that is not exactly 32 bytes.
pub fn parse_address(s: &str) -> Result<Pubkey, ValidationError> {
    let s = s.trim();
    let mut buf = [0u8; 32];
    let error = |reason: String| ValidationError::Address {
        address: s.to_owned(),
        reason,
    };
    let size = bs58::decode(s)
        .into(&mut buf)
        .map_err(|e| error(e.to_string()))?;
    if size != buf.len() {
        return Err(error(format!(
            "invalid length, expected: {}, got: {}",
            buf.len(),
            size
        )));
    }
    Ok(Pubkey::new_from_array(buf))
}

/// Parse a strictly positive decimal amount.
pub fn parse_amount(s: &str) -> Result<Decimal, ValidationError> {
    let amount =
        Decimal::from_str(s.trim()).map_err(|_| ValidationError::Amount(s.trim().to_owned()))?;
    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    Ok(amount)
}

/// Convert a UI amount into base units, e.g. SOL into lamports.
///
/// Amounts finer than `decimals` are rejected, never rounded.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<u64, ValidationError> {
    let unrepresentable = || ValidationError::Unrepresentable { amount, decimals };
    if amount.normalize().scale() > u32::from(decimals) {
        return Err(unrepresentable());
    }
    let scale = 10u64
        .checked_pow(decimals as u32)
        .ok_or_else(unrepresentable)?;
    let units = amount
        .checked_mul(Decimal::from(scale))
        .and_then(|d| d.to_u64())
        .ok_or_else(unrepresentable)?;
    if units == 0 {
        return Err(unrepresentable());
    }
    Ok(units)
}

#[serde_as]
#[derive(Deserialize)]
struct RecipientRepr {
    #[serde_as(as = "DisplayFromStr")]
    address: Pubkey,
    amount: Decimal,
}

impl TryFrom<RecipientRepr> for Recipient {
    type Error = ValidationError;
    fn try_from(value: RecipientRepr) -> Result<Self, Self::Error> {
        Recipient::new(value.address, value.amount)
    }
}

/// A validated `(address, amount)` pair. Immutable once constructed.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecipientRepr")]
pub struct Recipient {
    #[serde_as(as = "DisplayFromStr")]
    address: Pubkey,
    amount: Decimal,
}

impl Recipient {
    pub fn new(address: Pubkey, amount: Decimal) -> Result<Self, ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount));
        }
        Ok(Self { address, amount })
    }

    pub fn parse(address: &str, amount: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            address: parse_address(address)?,
            amount: parse_amount(amount)?,
        })
    }

    pub fn address(&self) -> &Pubkey {
        &self.address
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

#[derive(Deserialize)]
struct CsvRow {
    address: String,
    amount: String,
}

/// Read recipients from a CSV with an `address,amount` header.
///
/// Every invalid row is reported, rows are numbered from 1 (first data row).
pub fn read_recipients_csv<R: Read>(reader: R) -> Result<Vec<Recipient>, Vec<ValidationError>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut recipients = Vec::new();
    let mut errors = Vec::new();
    for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
        let row_number = i + 1;
        let row = match row {
            Ok(row) => row,
            Err(error) => {
                errors.push(ValidationError::Row {
                    row: row_number,
                    field: "record".to_owned(),
                    message: error.to_string(),
                });
                continue;
            }
        };
        let address = parse_address(&row.address).map_err(|e| e.at(row_number, "address"));
        let amount = parse_amount(&row.amount).map_err(|e| e.at(row_number, "amount"));
        match (address, amount) {
            (Ok(address), Ok(amount)) => recipients.push(Recipient { address, amount }),
            (address, amount) => {
                errors.extend(address.err());
                errors.extend(amount.err());
            }
        }
    }
    if errors.is_empty() {
        Ok(recipients)
    } else {
        Err(errors)
    }
}

/// Check every amount converts exactly into base units of an asset with
/// `decimals`. Errors are numbered like CSV rows, from 1.
pub fn check_amounts(recipients: &[Recipient], decimals: u8) -> Result<(), Vec<ValidationError>> {
    let errors: Vec<_> = recipients
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            to_base_units(r.amount, decimals)
                .err()
                .map(|e| e.at(i + 1, "amount"))
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
