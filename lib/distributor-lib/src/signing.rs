use crate::{
    batch::BatchId,
    builder::{SignedTransaction, UnsignedTransaction},
    context::{
        signer::{self, SignatureRequest, SigningCapability},
        Wallet,
    },
};
use solana_sdk::signature::{Presigner, Signature};
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum SignError {
    #[error("user rejected the signing request")]
    Rejected,
    #[error("wallet did not answer within {0:?}")]
    Timeout(Duration),
    #[error("wallet returned an invalid signature for batch {batch_id}: {error}")]
    InvalidSignature {
        batch_id: BatchId,
        error: solana_sdk::signer::SignerError,
    },
    #[error("batch {0} still needs other signers")]
    Incomplete(BatchId),
    #[error(transparent)]
    Wallet(signer::Error),
}

impl From<signer::Error> for SignError {
    fn from(value: signer::Error) -> Self {
        match value {
            signer::Error::Rejected => SignError::Rejected,
            error => SignError::Wallet(error),
        }
    }
}

impl SignError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, SignError::Rejected)
    }
}

/// Obtains the wallet's signatures for built transactions.
#[derive(Clone, Debug)]
pub struct SigningCoordinator {
    wallet: Wallet,
    timeout: Duration,
}

impl SigningCoordinator {
    pub fn new(wallet: Wallet, timeout: Duration) -> Self {
        Self { wallet, timeout }
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn capability(&self) -> SigningCapability {
        self.wallet.capability
    }

    /// Sign a whole window.
    ///
    /// A batched wallet gets one prompt for all of `txs`; a sequential one
    /// gets one prompt per transaction, in order. Either way the result is
    /// all or nothing: an error means none of `txs` may be submitted.
    pub async fn sign(
        &self,
        txs: Vec<UnsignedTransaction>,
    ) -> Result<Vec<SignedTransaction>, SignError> {
        match self.wallet.capability {
            SigningCapability::Batched { .. } => self.sign_all(txs).await,
            SigningCapability::Sequential => {
                let mut signed = Vec::with_capacity(txs.len());
                for tx in txs {
                    signed.push(self.sign_one(tx).await?);
                }
                Ok(signed)
            }
        }
    }

    /// One prompt, one transaction.
    pub async fn sign_one(&self, tx: UnsignedTransaction) -> Result<SignedTransaction, SignError> {
        let signature = self.request(vec![tx.message_data().into()]).await?;
        apply(&self.wallet, tx, signature[0])
    }

    async fn sign_all(
        &self,
        txs: Vec<UnsignedTransaction>,
    ) -> Result<Vec<SignedTransaction>, SignError> {
        if txs.is_empty() {
            return Ok(Vec::new());
        }
        let messages = txs.iter().map(|tx| tx.message_data().into()).collect();
        let signatures = self.request(messages).await?;
        txs.into_iter()
            .zip(signatures)
            .map(|(tx, signature)| apply(&self.wallet, tx, signature))
            .collect()
    }

    async fn request(&self, messages: Vec<bytes::Bytes>) -> Result<Vec<Signature>, SignError> {
        let expected = messages.len();
        let req = SignatureRequest {
            id: None,
            time: chrono::Utc::now(),
            pubkey: self.wallet.pubkey,
            messages,
            timeout: self.timeout,
        };
        tracing::info!("requesting {} signature(s) from {}", expected, self.wallet.pubkey);
        let resp = tokio::time::timeout(self.timeout, self.wallet.signer.call_ref(req))
            .await
            .map_err(|_| SignError::Timeout(self.timeout))??;
        if resp.signatures.len() != expected {
            return Err(signer::Error::Count {
                expected,
                got: resp.signatures.len(),
            }
            .into());
        }
        Ok(resp.signatures)
    }
}

fn apply(
    wallet: &Wallet,
    unsigned: UnsignedTransaction,
    signature: Signature,
) -> Result<SignedTransaction, SignError> {
    let UnsignedTransaction {
        batch_id,
        mut tx,
        context,
    } = unsigned;
    let presigner = Presigner::new(&wallet.pubkey, &signature);
    tx.try_partial_sign(&[&presigner], context.blockhash)
        .map_err(|error| SignError::InvalidSignature { batch_id, error })?;
    if !tx.is_signed() {
        return Err(SignError::Incomplete(batch_id));
    }
    Ok(SignedTransaction {
        batch_id,
        tx,
        context,
    })
}
