use crate::{
    batch::{Batch, BatchId},
    config::BatchingConfig,
    recipient::{to_base_units, ValidationError, NATIVE_DECIMALS},
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction, hash::Hash, instruction::Instruction,
    message::Message, packet::PACKET_DATA_SIZE, program_error::ProgramError, pubkey::Pubkey,
    signature::Signature, signer::SignerError, transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BuildError {
    #[error("transaction too large: {size} bytes, limit is {limit} bytes, reduce the batch size")]
    TooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Amount(#[from] ValidationError),
    #[error("failed to build instruction: {0}")]
    Instruction(#[from] ProgramError),
    #[error("failed to serialize transaction: {0}")]
    Serialize(#[from] bincode::Error),
    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Blockhash a transaction is bound to, and the block height after which it
/// can no longer land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockhashContext {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    /// Slot the blockhash was observed at, used as `min_context_slot`.
    pub slot: u64,
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Asset {
    Native,
    Token {
        #[serde_as(as = "DisplayFromStr")]
        mint: Pubkey,
        decimals: u8,
    },
}

impl Asset {
    pub fn decimals(&self) -> u8 {
        match self {
            Asset::Native => NATIVE_DECIMALS,
            Asset::Token { decimals, .. } => *decimals,
        }
    }

    /// Token transfers carry more accounts per recipient, so they get smaller batches.
    pub fn batch_size(&self, cfg: &BatchingConfig) -> usize {
        match self {
            Asset::Native => cfg.batch_size,
            Asset::Token { .. } => cfg.token_batch_size,
        }
    }
}

/// Everything besides the batch and blockhash that a transfer transaction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub asset: Asset,
    /// Owner of the funds, must sign.
    pub sender: Pubkey,
    pub fee_payer: Pubkey,
    pub compute_unit_price: Option<u64>,
}

/// A transaction waiting for the wallet's signature.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub batch_id: BatchId,
    pub tx: Transaction,
    pub context: BlockhashContext,
}

impl UnsignedTransaction {
    pub fn message_data(&self) -> Vec<u8> {
        self.tx.message_data()
    }
}

/// A fully signed transaction, ready to be submitted.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub batch_id: BatchId,
    pub tx: Transaction,
    pub context: BlockhashContext,
}

impl SignedTransaction {
    /// Fee payer's signature, which identifies the transaction on chain.
    pub fn signature(&self) -> Signature {
        self.tx.signatures.first().copied().unwrap_or_default()
    }
}

/// One transfer per recipient, in recipient order.
pub fn transfer_instructions(
    batch: &Batch,
    plan: &TransferPlan,
) -> Result<Vec<Instruction>, BuildError> {
    let decimals = plan.asset.decimals();
    let mut instructions = Vec::with_capacity(batch.recipients.len() * 2);
    match plan.asset {
        Asset::Native => {
            for r in &batch.recipients {
                let lamports = to_base_units(r.amount(), decimals)?;
                instructions.push(solana_system_interface::instruction::transfer(
                    &plan.sender,
                    r.address(),
                    lamports,
                ));
            }
        }
        Asset::Token { mint, decimals } => {
            let source = get_associated_token_address(&plan.sender, &mint);
            for r in &batch.recipients {
                let amount = to_base_units(r.amount(), decimals)?;
                let destination = get_associated_token_address(r.address(), &mint);
                instructions.push(create_associated_token_account_idempotent(
                    &plan.fee_payer,
                    r.address(),
                    &mint,
                    &spl_token::id(),
                ));
                instructions.push(spl_token::instruction::transfer_checked(
                    &spl_token::id(),
                    &source,
                    &mint,
                    &destination,
                    &plan.sender,
                    &[],
                    amount,
                    decimals,
                )?);
            }
        }
    }
    Ok(instructions)
}

/// Compile `instructions` into an unsigned transaction bound to `context`.
pub fn compile(
    instructions: &[Instruction],
    fee_payer: &Pubkey,
    compute_unit_price: Option<u64>,
    context: &BlockhashContext,
) -> Result<Transaction, BuildError> {
    let mut all = Vec::with_capacity(instructions.len() + 1);
    if let Some(price) = compute_unit_price {
        all.push(ComputeBudgetInstruction::set_compute_unit_price(price));
    }
    all.extend_from_slice(instructions);
    let message = Message::new_with_blockhash(&all, Some(fee_payer), &context.blockhash);
    let tx = Transaction::new_unsigned(message);
    check_size(&tx)?;
    Ok(tx)
}

/// Fail fast when the serialized transaction cannot fit in a packet.
pub fn check_size(tx: &Transaction) -> Result<usize, BuildError> {
    let size = bincode::serialized_size(tx)? as usize;
    if size > PACKET_DATA_SIZE {
        return Err(BuildError::TooLarge {
            size,
            limit: PACKET_DATA_SIZE,
        });
    }
    Ok(size)
}

/// Build the transfer transaction of `batch`. The batch itself is not modified.
pub fn build(
    batch: &Batch,
    plan: &TransferPlan,
    context: &BlockhashContext,
) -> Result<UnsignedTransaction, BuildError> {
    let instructions = transfer_instructions(batch, plan)?;
    let tx = compile(
        &instructions,
        &plan.fee_payer,
        plan.compute_unit_price,
        context,
    )?;
    Ok(UnsignedTransaction {
        batch_id: batch.id,
        tx,
        context: *context,
    })
}
