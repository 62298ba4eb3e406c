//! Services the pipeline consumes.
//!
//! - [`signer`]: the user's wallet, a buffered [`tower::Service`] wrapped in
//!   our [`TowerClient`][crate::utils::TowerClient].
//! - [`rpc`]: the Solana RPC node, abstracted by the [`rpc::SolanaRpc`] trait.

use solana_sdk::pubkey::Pubkey;

/// Request Solana signatures from the user's wallet.
pub mod signer {
    use crate::utils::{tower_client::CommonError, TowerClient};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_with::{base64::Base64, serde_as, DisplayFromStr, DurationSecondsWithFrac};
    use solana_sdk::{pubkey::Pubkey, signature::Signature};
    use std::{num::NonZeroUsize, time::Duration};
    use thiserror::Error as ThisError;

    #[derive(ThisError, Debug)]
    pub enum Error {
        #[error("user rejected the request")]
        Rejected,
        #[error("can't sign for pubkey: {}", .0)]
        Pubkey(String),
        #[error("timeout")]
        Timeout,
        #[error("wallet returned {got} signatures for {expected} messages")]
        Count { expected: usize, got: usize },
        #[error(transparent)]
        Common(#[from] CommonError),
    }

    impl Error {
        pub fn worker(error: tower::BoxError) -> Self {
            Error::Common(CommonError::worker(error))
        }
    }

    pub type Svc = TowerClient<SignatureRequest, SignatureResponse, Error>;

    /// What a connected wallet can do, decided once per session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SigningCapability {
        /// `signAllTransactions`: up to `window` transactions per approval.
        Batched { window: NonZeroUsize },
        /// `signTransaction` only: one approval per transaction.
        Sequential,
    }

    impl SigningCapability {
        /// Transactions per wallet prompt.
        pub fn window(&self) -> usize {
            match self {
                SigningCapability::Batched { window } => window.get(),
                SigningCapability::Sequential => 1,
            }
        }
    }

    /// One wallet prompt, covering one or more serialized messages.
    #[serde_as]
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SignatureRequest {
        pub id: Option<i64>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        pub time: DateTime<Utc>,
        #[serde_as(as = "DisplayFromStr")]
        pub pubkey: Pubkey,
        #[serde_as(as = "Vec<Base64>")]
        pub messages: Vec<bytes::Bytes>,
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        pub timeout: Duration,
    }

    /// One signature per requested message, in the same order.
    #[serde_as]
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SignatureResponse {
        #[serde_as(as = "Vec<DisplayFromStr>")]
        pub signatures: Vec<Signature>,
    }
}

/// Solana RPC node.
pub mod rpc {
    use crate::builder::BlockhashContext;
    use async_trait::async_trait;
    use solana_client::{
        client_error::{ClientError, ClientErrorKind},
        nonblocking::rpc_client::RpcClient,
        rpc_config::RpcSendTransactionConfig,
        rpc_request::RpcRequest,
        rpc_response::{Response, RpcBlockhash},
    };
    use solana_sdk::{
        commitment_config::{CommitmentConfig, CommitmentLevel},
        signature::Signature,
        transaction::{Transaction, TransactionError},
    };
    use solana_transaction_status::UiTransactionEncoding;
    use std::sync::Arc;
    use thiserror::Error as ThisError;

    #[derive(ThisError, Debug, Clone)]
    pub enum Error {
        #[error("{}", crate::solana::verbose_solana_error(.0))]
        Solana(Arc<ClientError>),
        #[error("transport error: {0}")]
        Transport(String),
        #[error("{0}")]
        Rejected(String),
        #[error("invalid response: {0}")]
        InvalidResponse(String),
    }

    impl From<ClientError> for Error {
        fn from(value: ClientError) -> Self {
            Error::Solana(Arc::new(value))
        }
    }

    impl Error {
        /// Errors worth retrying with backoff: the request may never have
        /// reached the node.
        pub fn is_transient(&self) -> bool {
            match self {
                Error::Solana(e) => matches!(
                    e.kind(),
                    ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_)
                ),
                Error::Transport(_) => true,
                Error::Rejected(_) | Error::InvalidResponse(_) => false,
            }
        }
    }

    /// Options of `sendTransaction`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendConfig {
        pub skip_preflight: bool,
        pub preflight_commitment: CommitmentLevel,
        pub max_retries: Option<usize>,
        pub min_context_slot: Option<u64>,
    }

    /// `None` while the network has not seen the signature at the requested
    /// commitment, `Some(Err(_))` if the transaction landed and failed.
    pub type SignatureStatus = Option<Result<(), TransactionError>>;

    #[async_trait]
    pub trait SolanaRpc: Send + Sync + 'static {
        async fn latest_blockhash(
            &self,
            commitment: CommitmentConfig,
        ) -> Result<BlockhashContext, Error>;

        async fn send_transaction(
            &self,
            tx: &Transaction,
            config: SendConfig,
        ) -> Result<Signature, Error>;

        async fn signature_status(
            &self,
            signature: &Signature,
            commitment: CommitmentConfig,
        ) -> Result<SignatureStatus, Error>;

        async fn block_height(&self, commitment: CommitmentConfig) -> Result<u64, Error>;
    }

    #[async_trait]
    impl SolanaRpc for RpcClient {
        async fn latest_blockhash(
            &self,
            commitment: CommitmentConfig,
        ) -> Result<BlockhashContext, Error> {
            // the typed helpers drop the context slot, ask for the raw response
            let resp: Response<RpcBlockhash> = self
                .send(
                    RpcRequest::GetLatestBlockhash,
                    serde_json::json!([commitment]),
                )
                .await?;
            let blockhash = resp
                .value
                .blockhash
                .parse()
                .map_err(|e| Error::InvalidResponse(format!("blockhash: {e}")))?;
            Ok(BlockhashContext {
                blockhash,
                last_valid_block_height: resp.value.last_valid_block_height,
                slot: resp.context.slot,
            })
        }

        async fn send_transaction(
            &self,
            tx: &Transaction,
            config: SendConfig,
        ) -> Result<Signature, Error> {
            let signature = self
                .send_transaction_with_config(
                    tx,
                    RpcSendTransactionConfig {
                        skip_preflight: config.skip_preflight,
                        preflight_commitment: Some(config.preflight_commitment),
                        encoding: Some(UiTransactionEncoding::Base64),
                        max_retries: config.max_retries,
                        min_context_slot: config.min_context_slot,
                    },
                )
                .await
                .map_err(|e| match e.kind() {
                    ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => Error::from(e),
                    _ => Error::Rejected(crate::solana::verbose_solana_error(&e)),
                })?;
            Ok(signature)
        }

        async fn signature_status(
            &self,
            signature: &Signature,
            commitment: CommitmentConfig,
        ) -> Result<SignatureStatus, Error> {
            Ok(self
                .get_signature_status_with_commitment(signature, commitment)
                .await?)
        }

        async fn block_height(&self, commitment: CommitmentConfig) -> Result<u64, Error> {
            Ok(self.get_block_height_with_commitment(commitment).await?)
        }
    }
}

/// The connected wallet: its address, how to reach it, and what it supports.
#[derive(Clone)]
pub struct Wallet {
    pub pubkey: Pubkey,
    pub signer: signer::Svc,
    pub capability: signer::SigningCapability,
}

impl Wallet {
    pub fn new(pubkey: Pubkey, signer: signer::Svc, capability: signer::SigningCapability) -> Self {
        Self {
            pubkey,
            signer,
            capability,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("pubkey", &self.pubkey)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}
