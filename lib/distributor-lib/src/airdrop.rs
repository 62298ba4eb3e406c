use crate::{
    batch::{Batch, BatchStatus},
    builder::Asset,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type AirdropId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirdropStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl AirdropStatus {
    /// Status implied by the batches alone.
    ///
    /// `Failed` is never derived, only the backend decides it.
    pub fn derive<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a BatchStatus>,
    {
        let mut any = false;
        let mut all_confirmed = true;
        let mut all_pending = true;
        for s in statuses {
            any = true;
            all_confirmed &= *s == BatchStatus::Confirmed;
            all_pending &= *s == BatchStatus::Pending;
        }
        if any && all_confirmed {
            AirdropStatus::Completed
        } else if all_pending {
            AirdropStatus::Created
        } else {
            AirdropStatus::Processing
        }
    }
}

impl fmt::Display for AirdropStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AirdropStatus::Created => "created",
            AirdropStatus::Processing => "processing",
            AirdropStatus::Completed => "completed",
            AirdropStatus::Failed => "failed",
        })
    }
}

/// An airdrop and its batches, as persisted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Airdrop {
    pub id: AirdropId,
    pub status: AirdropStatus,
    /// What every batch transfers.
    pub asset: Asset,
    pub recipient_count: usize,
    pub total_amount: Decimal,
    pub batches: Vec<Batch>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Airdrop {
    pub fn new(id: AirdropId, asset: Asset, batches: Vec<Batch>) -> Self {
        let now = Utc::now();
        let mut airdrop = Self {
            id,
            status: AirdropStatus::Created,
            asset,
            recipient_count: 0,
            total_amount: Decimal::ZERO,
            batches,
            created_at: now,
            updated_at: now,
        };
        airdrop.refresh();
        airdrop
    }

    /// Recompute the derived fields. A backend-decided `Failed` is kept.
    pub fn refresh(&mut self) {
        self.recipient_count = self.batches.iter().map(|b| b.recipients.len()).sum();
        self.total_amount = self.batches.iter().map(Batch::total_amount).sum();
        if self.status != AirdropStatus::Failed {
            self.status = AirdropStatus::derive(self.batches.iter().map(|b| &b.status));
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.status == BatchStatus::Confirmed)
            .count()
    }
}
