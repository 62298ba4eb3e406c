use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use std::{
    num::{NonZeroU64, NonZeroUsize},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};
use thiserror::Error as ThisError;

pub mod env {
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const SOLANA_RPC_URL: &str = "SOLANA_RPC_URL";
    pub const DISTRIBUTOR_TOKEN: &str = "DISTRIBUTOR_TOKEN";
    pub const PRIORITY_FEE: &str = "PRIORITY_FEE";
}

/// Recipients per native-asset transaction.
pub const BATCH_SIZE: usize = 10;

/// Recipients per token transaction. Each recipient costs an
/// associated-token-account creation plus a `transfer_checked`.
pub const TOKEN_BATCH_SIZE: usize = 5;

/// Batches per wallet approval when the wallet can sign many at once.
pub const SIGNING_WINDOW: usize = 10;

pub const MAX_RECIPIENTS: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub http_client: HttpClientConfig,
    pub solana_client: SolanaClientConfig,
    pub endpoints: Endpoints,
    pub batching: BatchingConfig,
    pub submission: SubmissionConfig,
}

impl DistributorConfig {
    /// Apply overrides from environment variables, see [`env`].
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(env::SOLANA_RPC_URL) {
            if let Ok(cluster) = SolanaNet::from_url(&url) {
                self.solana_client.cluster = cluster;
            }
            self.solana_client.url = url;
        }
        if let Ok(fee) = std::env::var(env::PRIORITY_FEE) {
            match fee.parse::<u64>() {
                Ok(fee) => self.submission.compute_unit_price = Some(fee),
                Err(error) => tracing::warn!("invalid {}: {}", env::PRIORITY_FEE, error),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub backend: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            backend: "http://localhost:8080".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    pub timeout_in_secs: NonZeroU64,
    pub gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_in_secs: NonZeroU64::MIN.saturating_add(99),
            gzip: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub batch_size: usize,
    pub token_batch_size: usize,
    pub signing_window: NonZeroUsize,
    pub max_recipients: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            token_batch_size: TOKEN_BATCH_SIZE,
            signing_window: NonZeroUsize::MIN.saturating_add(SIGNING_WINDOW - 1),
            max_recipients: MAX_RECIPIENTS,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub commitment: CommitmentLevel,
    pub skip_preflight: bool,
    pub max_retries: Option<usize>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub confirm_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub signature_timeout: Duration,
    /// Micro-lamports per compute unit, adds a `SetComputeUnitPrice` instruction.
    pub compute_unit_price: Option<u64>,
    pub backoff: Backoff,
}

impl SubmissionConfig {
    pub fn commitment_config(&self) -> CommitmentConfig {
        CommitmentConfig {
            commitment: self.commitment,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            commitment: CommitmentLevel::Confirmed,
            skip_preflight: false,
            max_retries: Some(3),
            poll_interval: Duration::from_millis(500),
            confirm_timeout: Duration::from_secs(90),
            signature_timeout: Duration::from_secs(5 * 60),
            compute_unit_price: None,
            backoff: Backoff::default(),
        }
    }
}

/// Exponential backoff for transient network errors.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max: Duration,
    pub retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(8),
            retries: 4,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaClientConfig {
    pub url: String,
    pub cluster: SolanaNet,
}

impl SolanaClientConfig {
    pub fn build_client(&self, commitment: CommitmentConfig) -> RpcClient {
        RpcClient::new_with_timeouts_and_commitment(
            self.url.clone(),
            Duration::from_secs(30),
            commitment,
            Duration::from_secs(180),
        )
    }
}

impl Default for SolanaClientConfig {
    fn default() -> Self {
        let cluster = SolanaNet::Devnet;
        Self {
            url: cluster.url(),
            cluster,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolanaNet {
    #[serde(rename = "devnet")]
    Devnet,
    #[serde(rename = "testnet")]
    Testnet,
    #[serde(rename = "mainnet-beta")]
    Mainnet,
}

/// Unknown Solana network.
#[derive(Debug, ThisError)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for SolanaNet {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devnet" => Ok(Self::Devnet),
            "testnet" => Ok(Self::Testnet),
            "mainnet-beta" | "mainnet" => Ok(Self::Mainnet),
            s => Err(UnknownNetwork(s.to_owned())),
        }
    }
}

impl SolanaNet {
    pub fn url(&self) -> String {
        match self {
            SolanaNet::Devnet => {
                static URL: LazyLock<String> = LazyLock::new(|| {
                    std::env::var("SOLANA_DEVNET_URL")
                        .unwrap_or_else(|_| "https://api.devnet.solana.com".to_owned())
                });
                URL.clone()
            }
            SolanaNet::Testnet => {
                static URL: LazyLock<String> = LazyLock::new(|| {
                    std::env::var("SOLANA_TESTNET_URL")
                        .unwrap_or_else(|_| "https://api.testnet.solana.com".to_owned())
                });
                URL.clone()
            }
            SolanaNet::Mainnet => {
                static URL: LazyLock<String> = LazyLock::new(|| {
                    std::env::var("SOLANA_MAINNET_URL")
                        .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_owned())
                });
                URL.clone()
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SolanaNet::Devnet => "devnet",
            SolanaNet::Testnet => "testnet",
            SolanaNet::Mainnet => "mainnet-beta",
        }
    }

    pub fn from_url(url: &str) -> Result<Self, UnknownNetwork> {
        if url.contains("devnet") {
            Ok(SolanaNet::Devnet)
        } else if url.contains("testnet") {
            Ok(SolanaNet::Testnet)
        } else if url.contains("mainnet") {
            Ok(SolanaNet::Mainnet)
        } else {
            Err(UnknownNetwork(url.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_max() {
        let b = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            retries: 5,
        };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(500));
        assert_eq!(b.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config() {
        let cfg: DistributorConfig = serde_json::from_value(serde_json::json!({
            "batching": { "batch_size": 4 },
            "submission": { "poll_interval": 100, "commitment": "finalized" },
        }))
        .unwrap();
        assert_eq!(cfg.batching.batch_size, 4);
        assert_eq!(cfg.batching.token_batch_size, TOKEN_BATCH_SIZE);
        assert_eq!(cfg.batching.signing_window.get(), SIGNING_WINDOW);
        assert_eq!(cfg.submission.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.submission.commitment, CommitmentLevel::Finalized);
        assert_eq!(cfg.submission.max_retries, Some(3));
    }

    #[test]
    fn test_network_from_url() {
        assert_eq!(
            SolanaNet::from_url("https://api.devnet.solana.com").unwrap(),
            SolanaNet::Devnet
        );
        assert!(SolanaNet::from_url("http://localhost:8899").is_err());
    }
}
