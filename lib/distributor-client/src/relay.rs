//! Submission through the backend, which relays signed transactions to the
//! network and records their outcome.

use crate::{
    types::{start::StartBatch, TxEnvelope},
    BackendClient, BackendError,
};
use async_trait::async_trait;
use base64::prelude::*;
use distributor_lib::{
    config::SubmissionConfig,
    engine::{SubmitError, Submitter},
    solana::Confirmation,
    Airdrop, AirdropId, Batch, BatchStatus, SignedTransaction, Tracker,
};
use solana_sdk::signature::Signature;
use std::time::Duration;
use tokio::time::Instant;

pub fn start_batch(tx: &SignedTransaction) -> Result<StartBatch, bincode::Error> {
    Ok(StartBatch {
        batch_id: tx.batch_id,
        blockhash: tx.context.blockhash.to_string(),
        last_valid_block_height: tx.context.last_valid_block_height,
        min_context_slot: tx.context.slot,
        tx_base64: BASE64_STANDARD.encode(bincode::serialize(&tx.tx)?),
    })
}

impl From<StartBatch> for TxEnvelope {
    fn from(value: StartBatch) -> Self {
        TxEnvelope {
            blockhash: Some(value.blockhash),
            last_valid_block_height: Some(value.last_valid_block_height),
            min_context_slot: Some(value.min_context_slot),
            tx_base64: Some(value.tx_base64),
        }
    }
}

pub struct BackendSubmitter {
    client: BackendClient,
    airdrop: AirdropId,
    poll_interval: Duration,
    timeout: Duration,
}

impl BackendSubmitter {
    pub fn new(client: BackendClient, airdrop: AirdropId, config: &SubmissionConfig) -> Self {
        Self {
            client,
            airdrop,
            poll_interval: config.poll_interval,
            timeout: config.confirm_timeout,
        }
    }
}

#[async_trait]
impl Submitter for BackendSubmitter {
    async fn submit(&self, tx: &SignedTransaction, retry: bool) -> Result<Signature, SubmitError> {
        let batch = start_batch(tx).map_err(|e| SubmitError::Relay(e.to_string()))?;
        let result = if retry {
            self.client
                .retry_batch(self.airdrop, tx.batch_id, &batch.into())
                .await
                .map(|_| ())
        } else {
            self.client
                .start(self.airdrop, &[batch])
                .await
                .map(|_| ())
        };
        result.map_err(|e| SubmitError::Relay(e.to_string()))?;
        Ok(tx.signature())
    }

    async fn confirm(&self, tx: &SignedTransaction, signature: Signature) -> Confirmation {
        let start = Instant::now();
        loop {
            match self.client.get_airdrop(self.airdrop).await {
                Ok(detail) => {
                    match detail.transactions.iter().find(|b| b.id == tx.batch_id) {
                        Some(batch) => {
                            if let Some(confirmation) = settled(batch, &signature) {
                                return confirmation;
                            }
                        }
                        None => tracing::warn!("batch {} missing from airdrop", tx.batch_id),
                    }
                }
                Err(error) => {
                    tracing::warn!("failed to refresh airdrop {}: {}", self.airdrop, error)
                }
            }
            if start.elapsed() >= self.timeout {
                return Confirmation::Expired;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// What the backend record says about the attempt signed as `signature`,
/// `None` while it is still in flight or the record is about another attempt.
fn settled(batch: &Batch, signature: &Signature) -> Option<Confirmation> {
    if batch.signature.is_some_and(|s| s != *signature) {
        return None;
    }
    match batch.status {
        BatchStatus::Confirmed if batch.signature.as_ref() == Some(signature) => {
            Some(Confirmation::Confirmed)
        }
        BatchStatus::Failed => Some(Confirmation::Failed(
            batch
                .error_message
                .clone()
                .unwrap_or_else(|| "failed".to_owned()),
        )),
        BatchStatus::Expired => Some(Confirmation::Expired),
        _ => None,
    }
}

/// Fetch the authoritative record of an airdrop and fold it into `tracker`.
pub async fn refresh(
    client: &BackendClient,
    id: AirdropId,
    tracker: &Tracker,
) -> Result<Airdrop, BackendError> {
    let detail = client.get_airdrop(id).await?;
    let changed = tracker.reconcile(detail.transactions.iter().cloned());
    tracing::debug!("airdrop {}: {} batches updated", id, changed);
    let mut airdrop = Airdrop::from(detail);
    // keep the confirmed batches the backend has not caught up with yet
    airdrop.batches = tracker.transactions();
    airdrop.refresh();
    Ok(airdrop)
}
