//! Batch airdrop pipeline for Solana.
//!
//! Table of contents:
//! - [`recipient`]: parsing and validating `(address, amount)` pairs.
//! - [`partition`]: splitting recipients into bounded batches.
//! - [`batch`]: batch records and their status state machine.
//! - [`builder`]: building unsigned transfer transactions for a batch.
//! - [`context`]: wallet and RPC service contracts.
//! - [`signing`]: obtaining wallet signatures, windowed or one at a time.
//! - [`engine`]: submitting, confirming and retrying batches.
//! - [`tracker`]: in-memory per-batch state and aggregate progress.
//! - [`stake_csv`]: the stake account CSV upload tool.
//! - [`config`]: configuration types.

pub mod airdrop;
pub mod batch;
pub mod builder;
pub mod config;
pub mod context;
pub mod engine;
pub mod partition;
pub mod recipient;
pub mod signing;
pub mod solana;
pub mod stake_csv;
pub mod tracker;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use airdrop::{Airdrop, AirdropId, AirdropStatus};
pub use batch::{Batch, BatchId, BatchStatus};
pub use builder::{Asset, BlockhashContext, BuildError, SignedTransaction, UnsignedTransaction};
pub use config::{DistributorConfig, SolanaClientConfig, SolanaNet};
pub use context::{rpc::SolanaRpc, signer::SigningCapability, Wallet};
pub use engine::{Engine, EngineError, Outcome, PassReport, RpcSubmitter, SubmitError, Submitter};
pub use recipient::{Recipient, ValidationError};
pub use signing::{SignError, SigningCoordinator};
pub use tracker::{Progress, Tracker};
