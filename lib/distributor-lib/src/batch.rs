use crate::recipient::Recipient;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use solana_sdk::signature::Signature;
use std::fmt;
use uuid::Uuid;

pub type BatchId = Uuid;

/// Lifecycle of a batch.
///
/// ```text
/// pending -> processing -> confirming -> confirmed
///                       \-> failed
/// pending/processing/confirming -> expired
/// failed/expired -> processing (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Confirming,
    Confirmed,
    Failed,
    Expired,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Confirmed | BatchStatus::Failed | BatchStatus::Expired
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Expired)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Re-applying the current status is allowed, except that nothing ever
    /// leaves `confirmed`.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Confirmed, _) => false,
            (Pending, Processing) => true,
            (Processing, Confirming) | (Processing, Failed) => true,
            (Confirming, Confirmed) | (Confirming, Failed) => true,
            (Pending | Processing | Confirming, Expired) => true,
            (Failed | Expired, Processing) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Confirming => "confirming",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded group of recipients sent in one transaction.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub index: usize,
    pub recipients: Vec<Recipient>,
    pub status: BatchStatus,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Batch {
    pub fn new(index: usize, recipients: Vec<Recipient>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            recipients,
            status: BatchStatus::Pending,
            signature: None,
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn total_amount(&self) -> Decimal {
        self.recipients.iter().map(Recipient::amount).sum()
    }
}
