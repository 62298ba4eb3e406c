use crate::batch::{Batch, BatchId, BatchStatus};
use indexmap::IndexMap;
use serde::Serialize;
use solana_sdk::signature::Signature;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::watch;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),
    #[error("batch {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
    },
    #[error("batch {id} is {status}, only failed or expired batches can be retried")]
    NotRetryable { id: BatchId, status: BatchStatus },
}

/// Aggregate counters, always derived from the batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_transactions: usize,
    /// Batches in a terminal state, successful or not.
    pub completed_transactions: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
    pub is_processing: bool,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total_transactions == 0 {
            return 0;
        }
        (self.completed_transactions * 100 / self.total_transactions) as u8
    }

    pub fn is_done(&self) -> bool {
        self.total_transactions > 0 && self.completed_transactions == self.total_transactions
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    transactions: IndexMap<BatchId, Batch>,
    is_processing: bool,
}

impl TrackerState {
    pub fn transactions(&self) -> impl Iterator<Item = &Batch> {
        self.transactions.values()
    }

    pub fn get(&self, id: &BatchId) -> Option<&Batch> {
        self.transactions.get(id)
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn progress(&self) -> Progress {
        let mut p = Progress {
            total_transactions: self.transactions.len(),
            is_processing: self.is_processing,
            ..Progress::default()
        };
        for b in self.transactions.values() {
            match b.status {
                BatchStatus::Confirmed => p.confirmed += 1,
                BatchStatus::Failed => p.failed += 1,
                BatchStatus::Expired => p.expired += 1,
                _ => {}
            }
        }
        p.completed_transactions = p.confirmed + p.failed + p.expired;
        p
    }
}

/// Client-side projection of an airdrop's batches.
///
/// Cheap to clone, every clone shares the same state. Updates are applied
/// atomically per batch and published to subscribers, see [`subscribe`][Tracker::subscribe].
#[derive(Clone)]
pub struct Tracker {
    state: Arc<watch::Sender<TrackerState>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("progress", &self.progress())
            .finish()
    }
}

impl Tracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TrackerState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> Progress {
        self.state.borrow().progress()
    }

    pub fn transactions(&self) -> Vec<Batch> {
        self.state.borrow().transactions().cloned().collect()
    }

    pub fn get(&self, id: &BatchId) -> Option<Batch> {
        self.state.borrow().get(id).cloned()
    }

    /// Ids in display order whose status matches `filter`.
    pub fn ids_where(&self, filter: impl Fn(&Batch) -> bool) -> Vec<BatchId> {
        self.state
            .borrow()
            .transactions()
            .filter(|b| filter(b))
            .map(|b| b.id)
            .collect()
    }

    /// Replace all batches, ordered by index.
    pub fn initialize_transactions(&self, batches: impl IntoIterator<Item = Batch>) {
        let mut transactions: IndexMap<_, _> = batches.into_iter().map(|b| (b.id, b)).collect();
        transactions.sort_by(|_, a, _, b| a.index.cmp(&b.index));
        self.state.send_modify(|s| {
            s.transactions = transactions;
        });
    }

    pub fn set_processing(&self, processing: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.is_processing != processing;
            s.is_processing = processing;
            changed
        });
    }

    pub fn reset_transactions(&self) {
        self.state.send_modify(|s| *s = TrackerState::default());
    }

    /// Move batch `id` along the state machine.
    ///
    /// A `signature` or `error_message` of `None` keeps the current value,
    /// except that leaving the failed states clears a stale error.
    pub(crate) fn update_transaction_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        signature: Option<Signature>,
        error_message: Option<String>,
    ) -> Result<(), TrackerError> {
        let mut result = Ok(());
        self.state.send_if_modified(|s| {
            let Some(b) = s.transactions.get_mut(&id) else {
                result = Err(TrackerError::UnknownBatch(id));
                return false;
            };
            if !b.status.can_transition_to(status) {
                result = Err(TrackerError::InvalidTransition {
                    id,
                    from: b.status,
                    to: status,
                });
                return false;
            }
            tracing::debug!("batch {} ({}): {} -> {}", b.index, id, b.status, status);
            b.status = status;
            if let Some(signature) = signature {
                b.signature = Some(signature);
            }
            match error_message {
                Some(message) => b.error_message = Some(message),
                None if !status.is_retryable() => b.error_message = None,
                None => {}
            }
            true
        });
        result
    }

    /// Start a retry of a failed or expired batch: it becomes `processing`,
    /// loses its previous signature and error, and its retry count grows.
    ///
    /// Returns the batch as it was, for [`restore`][Self::restore].
    pub(crate) fn begin_retry(&self, id: BatchId) -> Result<Batch, TrackerError> {
        let mut result = Err(TrackerError::UnknownBatch(id));
        self.state.send_if_modified(|s| {
            let Some(b) = s.transactions.get_mut(&id) else {
                return false;
            };
            if !b.status.is_retryable() {
                result = Err(TrackerError::NotRetryable {
                    id,
                    status: b.status,
                });
                return false;
            }
            let snapshot = b.clone();
            b.status = BatchStatus::Processing;
            b.signature = None;
            b.error_message = None;
            b.retry_count += 1;
            result = Ok(snapshot);
            true
        });
        result
    }

    /// Roll a batch back to a snapshot taken before an optimistic change.
    /// A batch that got confirmed in the meantime is left alone.
    pub(crate) fn restore(&self, snapshot: Batch) {
        self.state.send_if_modified(|s| match s.transactions.get_mut(&snapshot.id) {
            Some(b) if b.status != BatchStatus::Confirmed => {
                *b = snapshot;
                true
            }
            _ => false,
        });
    }

    /// Overwrite local state with authoritative records.
    ///
    /// Unknown batches are added. A locally `confirmed` batch is never
    /// downgraded. Returns how many batches changed.
    pub fn reconcile(&self, remote: impl IntoIterator<Item = Batch>) -> usize {
        let remote: Vec<Batch> = remote.into_iter().collect();
        let mut changed = 0;
        self.state.send_if_modified(|s| {
            let mut inserted = false;
            for r in remote {
                match s.transactions.get_mut(&r.id) {
                    Some(local) => {
                        if local.status == BatchStatus::Confirmed
                            && r.status != BatchStatus::Confirmed
                        {
                            tracing::warn!(
                                "ignoring {} for confirmed batch {}",
                                r.status,
                                local.id
                            );
                            continue;
                        }
                        if local.status != r.status
                            || local.signature != r.signature
                            || local.error_message != r.error_message
                            || local.retry_count != r.retry_count
                        {
                            local.status = r.status;
                            local.signature = r.signature;
                            local.error_message = r.error_message;
                            local.retry_count = r.retry_count;
                            changed += 1;
                        }
                    }
                    None => {
                        s.transactions.insert(r.id, r);
                        inserted = true;
                        changed += 1;
                    }
                }
            }
            if inserted {
                s.transactions.sort_by(|_, a, _, b| a.index.cmp(&b.index));
            }
            changed > 0
        });
        changed
    }
}
