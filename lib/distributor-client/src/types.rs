use chrono::{DateTime, Utc};
use distributor_lib::{Airdrop, AirdropId, AirdropStatus, Asset, Batch, BatchId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum RestResult<T> {
    Error(ErrorBody),
    Success(T),
}

impl<T> RestResult<T> {
    pub fn into_result(self) -> Result<T, ErrorBody> {
        match self {
            RestResult::Error(e) => Err(e),
            RestResult::Success(v) => Ok(v),
        }
    }
}

#[derive(Debug)]
pub struct True;

impl Serialize for True {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        true.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for True {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = bool::deserialize(deserializer)?;
        if value {
            Ok(Self)
        } else {
            Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Bool(value),
                &"true",
            ))
        }
    }
}

/// Error payload of every failed request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_code: u16,
}

/// Binding of a signed transaction to the blockhash it was built with.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TxEnvelope {
    pub blockhash: Option<String>,
    pub last_valid_block_height: Option<u64>,
    pub min_context_slot: Option<u64>,
    pub tx_base64: Option<String>,
}

/// `POST /airdrops`
pub mod create_airdrop {
    use super::*;

    #[derive(Serialize, Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Params {
        pub asset: Asset,
        pub batches: Vec<Batch>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Output {
        pub id: AirdropId,
        pub status: AirdropStatus,
    }
}

/// `GET /airdrops`
pub mod list_airdrops {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct AirdropSummary {
        pub id: AirdropId,
        pub status: AirdropStatus,
        #[serde(default)]
        pub recipient_count: usize,
        #[serde(default)]
        pub total_amount: Decimal,
        #[serde(default)]
        pub total_transactions: usize,
        #[serde(default)]
        pub completed_transactions: usize,
        pub created_at: DateTime<Utc>,
    }

    pub type Output = Vec<AirdropSummary>;
}

/// `GET /airdrops/{id}`
pub mod get_airdrop {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct AirdropDetail {
        pub id: AirdropId,
        pub status: AirdropStatus,
        pub asset: Asset,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
        pub transactions: Vec<Batch>,
    }

    impl From<AirdropDetail> for Airdrop {
        fn from(value: AirdropDetail) -> Self {
            let mut airdrop = Airdrop::new(value.id, value.asset, value.transactions);
            airdrop.status = value.status;
            airdrop.created_at = value.created_at;
            airdrop.updated_at = value.updated_at;
            airdrop.refresh();
            airdrop
        }
    }

    pub type Output = AirdropDetail;
}

/// `POST /airdrops/{id}/start`
pub mod start {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct StartBatch {
        pub batch_id: BatchId,
        pub blockhash: String,
        pub last_valid_block_height: u64,
        pub min_context_slot: u64,
        pub tx_base64: String,
    }

    pub type Params = Vec<StartBatch>;

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Output {
        pub id: AirdropId,
        pub status: AirdropStatus,
    }
}

/// `POST /airdrops/{id}/retry-batch/{batchId}`
pub mod retry_batch {
    use super::*;

    pub type Params = TxEnvelope;

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Output {
        pub success: True,
    }
}

/// `DELETE /airdrops/{id}`
pub mod delete_airdrop {
    use super::*;

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Output {
        pub success: True,
    }
}
