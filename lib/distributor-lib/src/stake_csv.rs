//! Stake account CSV upload: one create-and-delegate transaction per row.
//!
//! Header: `stake_amount,withdraw_authority,stake_authority,validator,unlock_date,lockup_custodian`.
//! `stake_amount` is in SOL, `unlock_date` is RFC3339 and `lockup_custodian`
//! may be left empty.

use crate::{
    builder::{compile, BlockhashContext, BuildError, UnsignedTransaction},
    config::SubmissionConfig,
    context::rpc::{self, SolanaRpc},
    engine::{Outcome, Submitter},
    recipient::{parse_address, parse_amount, to_base_units, ValidationError, NATIVE_DECIMALS},
    signing::SigningCoordinator,
    solana::Confirmation,
    utils::retry_transient,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use solana_stake_interface::{
    instruction::{authorize, create_account, delegate_stake},
    state::{Authorized, Lockup, StakeAuthorize},
};
use std::io::Read;
use thiserror::Error as ThisError;

pub const HEADER: [&str; 6] = [
    "stake_amount",
    "withdraw_authority",
    "stake_authority",
    "validator",
    "unlock_date",
    "lockup_custodian",
];

pub const MAX_ROWS: usize = 50;

#[derive(ThisError, Debug)]
pub enum StakeCsvError {
    #[error("expected header `{}`, found `{found}`", HEADER.join(","))]
    Header { found: String },
    #[error("no rows")]
    Empty,
    #[error("too many rows: {count}, maximum is {max}")]
    TooManyRows { count: usize, max: usize },
    #[error("{} invalid row(s), first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Rows(Vec<ValidationError>),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeRow {
    /// 1-based data row.
    pub row: usize,
    pub stake_amount: Decimal,
    pub withdraw_authority: Pubkey,
    pub stake_authority: Pubkey,
    /// Vote account to delegate to.
    pub validator: Pubkey,
    pub unlock_date: DateTime<Utc>,
    /// `Pubkey::default()` when the column is empty.
    pub lockup_custodian: Pubkey,
}

impl StakeRow {
    pub fn lockup(&self) -> Lockup {
        Lockup {
            unix_timestamp: self.unlock_date.timestamp(),
            epoch: 0,
            custodian: self.lockup_custodian,
        }
    }
}

fn parse_unlock_date(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let date = DateTime::parse_from_rfc3339(s)
        .map_err(|e| format!("invalid RFC3339 date {s:?}: {e}"))?
        .with_timezone(&Utc);
    if date <= now {
        return Err(format!("{date} is not in the future"));
    }
    Ok(date)
}

/// Parse and validate a stake CSV. `now` is the reference for
/// `unlock_date`. Every invalid field of every row is reported.
pub fn parse_stake_csv<R: Read>(
    reader: R,
    now: DateTime<Utc>,
) -> Result<Vec<StakeRow>, StakeCsvError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    if headers.iter().ne(HEADER.iter().copied()) {
        return Err(StakeCsvError::Header {
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    let records = rdr.records().collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Err(StakeCsvError::Empty);
    }
    if records.len() > MAX_ROWS {
        return Err(StakeCsvError::TooManyRows {
            count: records.len(),
            max: MAX_ROWS,
        });
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let row = i + 1;
        let field = |idx: usize| record.get(idx).unwrap_or_default();
        let mut address = |idx: usize| match parse_address(field(idx)) {
            Ok(pk) => Some(pk),
            Err(e) => {
                errors.push(e.at(row, HEADER[idx]));
                None
            }
        };
        let withdraw_authority = address(1);
        let stake_authority = address(2);
        let validator = address(3);
        let lockup_custodian = match field(5) {
            "" => Some(Pubkey::default()),
            _ => address(5),
        };
        let stake_amount = parse_amount(field(0))
            .and_then(|amount| to_base_units(amount, NATIVE_DECIMALS).map(|_| amount))
            .map_err(|e| errors.push(e.at(row, HEADER[0])))
            .ok();
        let unlock_date = parse_unlock_date(field(4), now)
            .map_err(|message| {
                errors.push(ValidationError::Row {
                    row,
                    field: HEADER[4].to_owned(),
                    message,
                })
            })
            .ok();

        if let (
            Some(stake_amount),
            Some(withdraw_authority),
            Some(stake_authority),
            Some(validator),
            Some(unlock_date),
            Some(lockup_custodian),
        ) = (
            stake_amount,
            withdraw_authority,
            stake_authority,
            validator,
            unlock_date,
            lockup_custodian,
        ) {
            rows.push(StakeRow {
                row,
                stake_amount,
                withdraw_authority,
                stake_authority,
                validator,
                unlock_date,
                lockup_custodian,
            });
        }
    }

    if errors.is_empty() {
        Ok(rows)
    } else {
        Err(StakeCsvError::Rows(errors))
    }
}

/// Instructions creating, locking and delegating the stake account of `row`.
///
/// Delegation needs the staker's signature, so `funder` is the staker until
/// the end of the transaction, when it hands over to the row's stake authority.
pub fn stake_instructions(
    row: &StakeRow,
    funder: &Pubkey,
    stake_account: &Pubkey,
) -> Result<Vec<Instruction>, BuildError> {
    let lamports = to_base_units(row.stake_amount, NATIVE_DECIMALS)?;
    let authorized = Authorized {
        staker: *funder,
        withdrawer: row.withdraw_authority,
    };
    let mut instructions =
        create_account(funder, stake_account, &authorized, &row.lockup(), lamports);
    instructions.push(delegate_stake(stake_account, funder, &row.validator));
    if row.stake_authority != *funder {
        instructions.push(authorize(
            stake_account,
            funder,
            &row.stake_authority,
            StakeAuthorize::Staker,
            None,
        ));
    }
    Ok(instructions)
}

/// Stake transaction for `row`, funded by `funder`. The new stake account
/// has signed, the funder's signature is still missing.
pub fn build_stake_transaction(
    row: &StakeRow,
    funder: &Pubkey,
    stake_account: &Keypair,
    compute_unit_price: Option<u64>,
    context: &BlockhashContext,
) -> Result<UnsignedTransaction, BuildError> {
    let instructions = stake_instructions(row, funder, &stake_account.pubkey())?;
    let mut tx: Transaction = compile(&instructions, funder, compute_unit_price, context)?;
    tx.try_partial_sign(&[stake_account], context.blockhash)?;
    Ok(UnsignedTransaction {
        batch_id: uuid::Uuid::new_v4(),
        tx,
        context: *context,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeOutcome {
    pub row: usize,
    pub stake_account: Pubkey,
    pub outcome: Outcome,
}

/// Build, sign, submit and confirm every row in order, each with its own
/// blockhash and wallet prompt. A failed row does not stop the next one;
/// only a build error or an unreachable RPC node ends the upload.
pub async fn submit_stake_rows(
    rows: &[StakeRow],
    rpc: &dyn SolanaRpc,
    signer: &SigningCoordinator,
    submitter: &dyn Submitter,
    config: &SubmissionConfig,
) -> Result<Vec<StakeOutcome>, StakeSubmitError> {
    let funder = signer.wallet().pubkey;
    let mut outcomes = Vec::with_capacity(rows.len());
    for row in rows {
        let context = retry_transient(
            &config.backoff,
            "getLatestBlockhash",
            rpc::Error::is_transient,
            || rpc.latest_blockhash(config.commitment_config()),
        )
        .await?;
        let stake_account = Keypair::new();
        let unsigned = build_stake_transaction(
            row,
            &funder,
            &stake_account,
            config.compute_unit_price,
            &context,
        )
        .map_err(|error| StakeSubmitError::Build { row: row.row, error })?;

        let outcome = match signer.sign_one(unsigned).await {
            Ok(signed) => match submitter.submit(&signed, false).await {
                Ok(signature) => match submitter.confirm(&signed, signature).await {
                    Confirmation::Confirmed => Outcome::Confirmed(signature),
                    Confirmation::Failed(message) => Outcome::Failed {
                        signature: Some(signature),
                        message,
                    },
                    Confirmation::Expired => Outcome::Expired(signature),
                },
                Err(error) => Outcome::Failed {
                    signature: None,
                    message: error.to_string(),
                },
            },
            Err(error) if error.is_rejection() => Outcome::Rejected,
            Err(error) => Outcome::NotSigned(error.to_string()),
        };
        tracing::info!(
            "row {}: stake account {} {:?}",
            row.row,
            stake_account.pubkey(),
            outcome
        );
        outcomes.push(StakeOutcome {
            row: row.row,
            stake_account: stake_account.pubkey(),
            outcome,
        });
    }
    Ok(outcomes)
}

#[derive(ThisError, Debug)]
pub enum StakeSubmitError {
    #[error("row {row}: {error}")]
    Build { row: usize, error: BuildError },
    #[error("failed to get a recent blockhash: {0}")]
    Blockhash(#[from] rpc::Error),
}
