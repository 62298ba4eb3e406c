//! Submission and confirmation of batches.
//!
//! An [`Engine`] drives the batches held by a [`Tracker`] through
//! build, sign, submit and confirm. A pass over the pending batches runs in
//! one of two modes, chosen by the wallet's [`SigningCapability`]:
//!
//! - batched: batches are taken a signing window at a time. Each window shares
//!   one fresh blockhash, is approved with a single wallet prompt, and is
//!   submitted concurrently. Confirmations of a window keep running while the
//!   next window is being signed.
//! - sequential: each batch gets its own blockhash, prompt, submission and
//!   confirmation before the next one starts.
//!
//! A failing batch never stops its siblings.

use crate::{
    batch::{Batch, BatchId, BatchStatus},
    builder::{build, Asset, BlockhashContext, BuildError, SignedTransaction, TransferPlan},
    config::SubmissionConfig,
    context::{
        rpc::{self, SendConfig, SolanaRpc},
        signer::SigningCapability,
        Wallet,
    },
    signing::{SignError, SigningCoordinator},
    solana::{wait_for_confirmation, Confirmation},
    tracker::{Tracker, TrackerError},
    utils::retry_transient,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use solana_sdk::signature::Signature;
use std::{fmt, sync::Arc};
use thiserror::Error as ThisError;
use tokio::task::JoinSet;

#[derive(ThisError, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error("relay: {0}")]
    Relay(String),
}

#[derive(ThisError, Debug)]
pub enum EngineError {
    #[error("another pass is already running")]
    Busy,
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("failed to get a recent blockhash: {0}")]
    Blockhash(#[source] rpc::Error),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Gets signed transactions to the network and learns their fate.
#[async_trait]
pub trait Submitter: Send + Sync + 'static {
    /// Send `tx`, returning its signature once the network accepted it.
    /// `retry` is set when `tx` replaces a failed or expired attempt.
    async fn submit(&self, tx: &SignedTransaction, retry: bool) -> Result<Signature, SubmitError>;

    /// Wait until `signature` is confirmed, failed or expired.
    async fn confirm(&self, tx: &SignedTransaction, signature: Signature) -> Confirmation;
}

/// Submits straight to an RPC node.
pub struct RpcSubmitter {
    rpc: Arc<dyn SolanaRpc>,
    config: SubmissionConfig,
}

impl RpcSubmitter {
    pub fn new(rpc: Arc<dyn SolanaRpc>, config: SubmissionConfig) -> Self {
        Self { rpc, config }
    }
}

#[async_trait]
impl Submitter for RpcSubmitter {
    async fn submit(&self, tx: &SignedTransaction, _: bool) -> Result<Signature, SubmitError> {
        let config = SendConfig {
            skip_preflight: self.config.skip_preflight,
            preflight_commitment: self.config.commitment,
            max_retries: self.config.max_retries,
            min_context_slot: Some(tx.context.slot),
        };
        // resending the same signed bytes is idempotent
        let signature = retry_transient(
            &self.config.backoff,
            "sendTransaction",
            rpc::Error::is_transient,
            || self.rpc.send_transaction(&tx.tx, config),
        )
        .await?;
        Ok(signature)
    }

    async fn confirm(&self, tx: &SignedTransaction, signature: Signature) -> Confirmation {
        wait_for_confirmation(
            &*self.rpc,
            &signature,
            &tx.context,
            self.config.commitment_config(),
            self.config.poll_interval,
            self.config.confirm_timeout,
        )
        .await
    }
}

/// What happened to one batch during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Confirmed(Signature),
    Failed {
        signature: Option<Signature>,
        message: String,
    },
    Expired(Signature),
    /// The user declined to sign, the batch is untouched.
    Rejected,
    /// The wallet failed for another reason, the batch is untouched.
    NotSigned(String),
    /// Not reached, the pass stopped first.
    Skipped,
}

impl Outcome {
    pub fn signature(&self) -> Option<Signature> {
        match self {
            Outcome::Confirmed(s) | Outcome::Expired(s) => Some(*s),
            Outcome::Failed { signature, .. } => *signature,
            _ => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed(_))
    }

    fn from_sign_error(error: SignError) -> Self {
        if error.is_rejection() {
            tracing::warn!("{}", error);
            Outcome::Rejected
        } else {
            tracing::error!("signing failed: {}", error);
            Outcome::NotSigned(error.to_string())
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Confirmed(signature) => write!(f, "confirmed {signature}"),
            Outcome::Failed {
                signature: Some(signature),
                message,
            } => write!(f, "failed {signature}: {message}"),
            Outcome::Failed {
                signature: None,
                message,
            } => write!(f, "failed: {message}"),
            Outcome::Expired(signature) => write!(f, "expired {signature}"),
            Outcome::Rejected => f.write_str("declined"),
            Outcome::NotSigned(error) => write!(f, "not signed: {error}"),
            Outcome::Skipped => f.write_str("skipped"),
        }
    }
}

/// Per-batch outcomes of a pass, in batch order.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    outcomes: IndexMap<BatchId, Outcome>,
}

impl PassReport {
    fn new(ids: &[BatchId]) -> Self {
        Self {
            outcomes: ids.iter().map(|id| (*id, Outcome::Skipped)).collect(),
        }
    }

    fn set(&mut self, id: BatchId, outcome: Outcome) {
        self.outcomes.insert(id, outcome);
    }

    pub fn get(&self, id: &BatchId) -> Option<&Outcome> {
        self.outcomes.get(id)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (&BatchId, &Outcome)> {
        self.outcomes.iter()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| f(o)).count()
    }

    pub fn confirmed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Confirmed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn expired(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Expired(_)))
    }

    /// Batches left as they were: declined, unsigned or not reached.
    pub fn untouched(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                Outcome::Rejected | Outcome::NotSigned(_) | Outcome::Skipped
            )
        })
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} confirmed, {} failed, {} expired, {} not submitted",
            self.confirmed(),
            self.failed(),
            self.expired(),
            self.untouched()
        )
    }
}

struct EngineInner {
    rpc: Arc<dyn SolanaRpc>,
    submitter: Arc<dyn Submitter>,
    signer: SigningCoordinator,
    tracker: Tracker,
    plan: TransferPlan,
    config: SubmissionConfig,
    running: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine submitting directly through `rpc`.
    pub fn new(
        rpc: Arc<dyn SolanaRpc>,
        wallet: Wallet,
        tracker: Tracker,
        asset: Asset,
        config: SubmissionConfig,
    ) -> Self {
        let submitter = Arc::new(RpcSubmitter::new(rpc.clone(), config.clone()));
        Self::with_submitter(rpc, submitter, wallet, tracker, asset, config)
    }

    pub fn with_submitter(
        rpc: Arc<dyn SolanaRpc>,
        submitter: Arc<dyn Submitter>,
        wallet: Wallet,
        tracker: Tracker,
        asset: Asset,
        config: SubmissionConfig,
    ) -> Self {
        let plan = TransferPlan {
            asset,
            sender: wallet.pubkey,
            fee_payer: wallet.pubkey,
            compute_unit_price: config.compute_unit_price,
        };
        let signer = SigningCoordinator::new(wallet, config.signature_timeout);
        Self {
            inner: Arc::new(EngineInner {
                rpc,
                submitter,
                signer,
                tracker,
                plan,
                config,
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }

    /// Process every `pending` batch once.
    ///
    /// Per-batch failures end up in the report. An error means the pass
    /// stopped early; batches already submitted are still awaited and
    /// recorded before it is returned.
    pub async fn run(&self) -> Result<PassReport, EngineError> {
        let _guard = self.inner.running.try_lock().map_err(|_| EngineError::Busy)?;
        let ids = self
            .inner
            .tracker
            .ids_where(|b| b.status == BatchStatus::Pending);
        let mut report = PassReport::new(&ids);
        if ids.is_empty() {
            return Ok(report);
        }

        self.inner.tracker.set_processing(true);
        let result = match self.inner.signer.capability() {
            SigningCapability::Batched { window } => {
                tracing::info!(
                    "processing {} batches, {} per signing window",
                    ids.len(),
                    window
                );
                self.run_windows(&ids, window.get(), &mut report).await
            }
            SigningCapability::Sequential => {
                tracing::info!("processing {} batches one at a time", ids.len());
                self.run_sequential(&ids, &mut report).await
            }
        };
        self.inner.tracker.set_processing(false);

        result?;
        tracing::info!("pass finished: {}", report);
        Ok(report)
    }

    async fn run_windows(
        &self,
        ids: &[BatchId],
        window: usize,
        report: &mut PassReport,
    ) -> Result<(), EngineError> {
        let mut confirmations = JoinSet::new();
        let mut result = Ok(());
        for (k, chunk) in ids.chunks(window).enumerate() {
            tracing::info!("signing window {} ({} batches)", k, chunk.len());
            let batches: Vec<Batch> = chunk
                .iter()
                .filter_map(|id| self.inner.tracker.get(id))
                .collect();
            let signed = match self.prepare_window(&batches).await {
                Ok(Ok(signed)) => signed,
                Ok(Err(error)) => {
                    let outcome = Outcome::from_sign_error(error);
                    for b in &batches {
                        report.set(b.id, outcome.clone());
                    }
                    continue;
                }
                Err(error) => {
                    result = Err(error);
                    break;
                }
            };

            let sent = futures::future::join_all(signed.iter().map(|tx| self.submit(tx, false))).await;
            for (tx, sent) in signed.into_iter().zip(sent) {
                match sent {
                    Ok(signature) => {
                        let this = self.clone();
                        confirmations.spawn(async move {
                            let id = tx.batch_id;
                            (id, this.confirm(&tx, signature).await)
                        });
                    }
                    Err(outcome) => report.set(tx.batch_id, outcome),
                }
            }
        }

        while let Some(joined) = confirmations.join_next().await {
            match joined {
                Ok((id, outcome)) => report.set(id, outcome),
                Err(error) => tracing::error!("confirmation task failed: {}", error),
            }
        }
        result
    }

    /// Blockhash, build and one prompt for a window. The outer error stops
    /// the pass, the inner one only skips this window.
    async fn prepare_window(
        &self,
        batches: &[Batch],
    ) -> Result<Result<Vec<SignedTransaction>, SignError>, EngineError> {
        let context = self.fetch_blockhash().await?;
        let unsigned = batches
            .iter()
            .map(|b| build(b, &self.inner.plan, &context))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.inner.signer.sign(unsigned).await)
    }

    async fn run_sequential(
        &self,
        ids: &[BatchId],
        report: &mut PassReport,
    ) -> Result<(), EngineError> {
        for id in ids {
            let Some(batch) = self.inner.tracker.get(id) else {
                continue;
            };
            let context = self.fetch_blockhash().await?;
            let unsigned = build(&batch, &self.inner.plan, &context)?;
            let outcome = match self.inner.signer.sign_one(unsigned).await {
                Ok(signed) => match self.submit(&signed, false).await {
                    Ok(signature) => self.confirm(&signed, signature).await,
                    Err(outcome) => outcome,
                },
                Err(error) => Outcome::from_sign_error(error),
            };
            report.set(*id, outcome);
        }
        Ok(())
    }

    /// Retry one failed or expired batch with a fresh blockhash.
    ///
    /// If the wallet declines, the batch goes back to its previous state.
    pub async fn retry(&self, id: BatchId) -> Result<Outcome, EngineError> {
        let _guard = self.inner.running.try_lock().map_err(|_| EngineError::Busy)?;
        let snapshot = self.inner.tracker.begin_retry(id)?;
        self.inner.tracker.set_processing(true);
        let result = self.retry_started(snapshot).await;
        self.inner.tracker.set_processing(false);
        result
    }

    /// Retry several batches, each independently of the others. Every id gets
    /// its own result, one failing never prevents the rest.
    ///
    /// A batched wallet is prompted once per signing window, each window with
    /// its own blockhash. A declined window is restored, the others go on.
    pub async fn retry_many(
        &self,
        ids: &[BatchId],
    ) -> Result<Vec<(BatchId, Result<Outcome, EngineError>)>, EngineError> {
        let _guard = self.inner.running.try_lock().map_err(|_| EngineError::Busy)?;
        let mut results: IndexMap<BatchId, Result<Outcome, EngineError>> = IndexMap::new();
        let mut started = Vec::new();
        for id in ids {
            match self.inner.tracker.begin_retry(*id) {
                Ok(snapshot) => {
                    results.insert(*id, Ok(Outcome::Skipped));
                    started.push(snapshot);
                }
                Err(error) => {
                    results.insert(*id, Err(error.into()));
                }
            }
        }
        if started.is_empty() {
            return Ok(results.into_iter().collect());
        }

        self.inner.tracker.set_processing(true);
        match self.inner.signer.capability() {
            SigningCapability::Batched { window } => {
                let mut confirmations = JoinSet::new();
                for chunk in started.chunks(window.get()) {
                    for (id, result) in self.retry_window(chunk, &mut confirmations).await {
                        results.insert(id, result);
                    }
                }
                while let Some(joined) = confirmations.join_next().await {
                    match joined {
                        Ok((id, outcome)) => {
                            results.insert(id, Ok(outcome));
                        }
                        Err(error) => tracing::error!("confirmation task failed: {}", error),
                    }
                }
            }
            SigningCapability::Sequential => {
                for snapshot in started {
                    let id = snapshot.id;
                    let result = self.retry_started(snapshot).await;
                    results.insert(id, result);
                }
            }
        }
        self.inner.tracker.set_processing(false);
        Ok(results.into_iter().collect())
    }

    /// Retry up to one signing window of batches with one blockhash and one
    /// prompt. Submitted batches are confirmed through `confirmations`, every
    /// other batch gets its result here and is restored if it was not sent.
    async fn retry_window(
        &self,
        snapshots: &[Batch],
        confirmations: &mut JoinSet<(BatchId, Outcome)>,
    ) -> Vec<(BatchId, Result<Outcome, EngineError>)> {
        tracing::info!("retrying {} batches in one signing window", snapshots.len());
        let context = match self.latest_blockhash().await {
            Ok(context) => context,
            Err(error) => {
                return snapshots
                    .iter()
                    .map(|snapshot| {
                        self.inner.tracker.restore(snapshot.clone());
                        (snapshot.id, Err(EngineError::Blockhash(error.clone())))
                    })
                    .collect();
            }
        };

        let mut results = Vec::new();
        let mut built = Vec::with_capacity(snapshots.len());
        let mut unsigned = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            match build(snapshot, &self.inner.plan, &context) {
                Ok(tx) => {
                    built.push(snapshot);
                    unsigned.push(tx);
                }
                Err(error) => {
                    self.inner.tracker.restore(snapshot.clone());
                    results.push((snapshot.id, Err(error.into())));
                }
            }
        }
        if unsigned.is_empty() {
            return results;
        }

        let signed = match self.inner.signer.sign(unsigned).await {
            Ok(signed) => signed,
            Err(error) => {
                let outcome = Outcome::from_sign_error(error);
                for snapshot in built {
                    self.inner.tracker.restore(snapshot.clone());
                    results.push((snapshot.id, Ok(outcome.clone())));
                }
                return results;
            }
        };

        let sent = futures::future::join_all(signed.iter().map(|tx| self.submit(tx, true))).await;
        for (tx, sent) in signed.into_iter().zip(sent) {
            match sent {
                Ok(signature) => {
                    let this = self.clone();
                    confirmations.spawn(async move {
                        let id = tx.batch_id;
                        (id, this.confirm(&tx, signature).await)
                    });
                }
                Err(outcome) => results.push((tx.batch_id, Ok(outcome))),
            }
        }
        results
    }

    async fn retry_started(&self, snapshot: Batch) -> Result<Outcome, EngineError> {
        let id = snapshot.id;
        tracing::info!(
            "retrying batch {} ({}), attempt {}",
            snapshot.index,
            id,
            snapshot.retry_count + 1
        );
        let prepared = async {
            let context = self.fetch_blockhash().await?;
            let unsigned = build(&snapshot, &self.inner.plan, &context)?;
            Ok::<_, EngineError>(self.inner.signer.sign_one(unsigned).await)
        }
        .await;
        let signed = match prepared {
            Ok(Ok(signed)) => signed,
            Ok(Err(error)) => {
                self.inner.tracker.restore(snapshot);
                return Ok(Outcome::from_sign_error(error));
            }
            Err(error) => {
                self.inner.tracker.restore(snapshot);
                return Err(error);
            }
        };
        Ok(match self.submit(&signed, true).await {
            Ok(signature) => self.confirm(&signed, signature).await,
            Err(outcome) => outcome,
        })
    }

    async fn latest_blockhash(&self) -> Result<BlockhashContext, rpc::Error> {
        let commitment = self.inner.config.commitment_config();
        retry_transient(
            &self.inner.config.backoff,
            "getLatestBlockhash",
            rpc::Error::is_transient,
            || self.inner.rpc.latest_blockhash(commitment),
        )
        .await
    }

    async fn fetch_blockhash(&self) -> Result<BlockhashContext, EngineError> {
        self.latest_blockhash().await.map_err(EngineError::Blockhash)
    }

    /// `processing`, send, then `confirming` with the signature. A refused
    /// send fails the batch.
    async fn submit(&self, tx: &SignedTransaction, retry: bool) -> Result<Signature, Outcome> {
        let id = tx.batch_id;
        self.update(id, BatchStatus::Processing, None, None);
        match self.inner.submitter.submit(tx, retry).await {
            Ok(signature) => {
                tracing::debug!("batch {} sent: {}", id, signature);
                self.update(id, BatchStatus::Confirming, Some(signature), None);
                Ok(signature)
            }
            Err(error) => {
                let message = error.to_string();
                tracing::error!("batch {} was not accepted: {}", id, message);
                self.update(id, BatchStatus::Failed, None, Some(message.clone()));
                Err(Outcome::Failed {
                    signature: None,
                    message,
                })
            }
        }
    }

    async fn confirm(&self, tx: &SignedTransaction, signature: Signature) -> Outcome {
        let id = tx.batch_id;
        match self.inner.submitter.confirm(tx, signature).await {
            Confirmation::Confirmed => {
                tracing::info!("batch {} confirmed: {}", id, signature);
                self.update(id, BatchStatus::Confirmed, None, None);
                Outcome::Confirmed(signature)
            }
            Confirmation::Failed(message) => {
                tracing::error!("batch {} failed: {}", id, message);
                self.update(id, BatchStatus::Failed, None, Some(message.clone()));
                Outcome::Failed {
                    signature: Some(signature),
                    message,
                }
            }
            Confirmation::Expired => {
                tracing::warn!("batch {} expired: {}", id, signature);
                self.update(id, BatchStatus::Expired, None, None);
                Outcome::Expired(signature)
            }
        }
    }

    fn update(
        &self,
        id: BatchId,
        status: BatchStatus,
        signature: Option<Signature>,
        error_message: Option<String>,
    ) {
        if let Err(error) =
            self.inner
                .tracker
                .update_transaction_status(id, status, signature, error_message)
        {
            tracing::warn!("{}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        airdrop::{Airdrop, AirdropStatus},
        config::Backoff,
        partition::partition,
        recipient::Recipient,
        testing::{MockRpc, MockWallet, Script},
    };
    use rust_decimal_macros::dec;
    use solana_sdk::pubkey::Pubkey;
    use std::{num::NonZeroUsize, time::Duration};

    fn config() -> SubmissionConfig {
        SubmissionConfig {
            poll_interval: Duration::from_millis(100),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(100),
                retries: 3,
            },
            ..SubmissionConfig::default()
        }
    }

    fn batched(window: usize) -> SigningCapability {
        SigningCapability::Batched {
            window: NonZeroUsize::new(window).unwrap(),
        }
    }

    struct Setup {
        rpc: Arc<MockRpc>,
        wallet: MockWallet,
        engine: Engine,
        batches: Vec<Batch>,
    }

    fn setup(recipients: usize, batch_size: usize, capability: SigningCapability) -> Setup {
        let recipients = (0..recipients)
            .map(|_| Recipient::new(Pubkey::new_unique(), dec!(0.5)).unwrap())
            .collect();
        let batches = partition(recipients, batch_size, 1000).unwrap();
        let tracker = Tracker::new();
        tracker.initialize_transactions(batches.clone());
        let rpc = Arc::new(MockRpc::new());
        let wallet = MockWallet::new();
        let engine = Engine::new(
            rpc.clone(),
            wallet.wallet(capability),
            tracker,
            Asset::Native,
            config(),
        );
        Setup {
            rpc,
            wallet,
            engine,
            batches,
        }
    }

    fn first_recipient(b: &Batch) -> Pubkey {
        *b.recipients[0].address()
    }

    fn status(engine: &Engine, id: &BatchId) -> BatchStatus {
        engine.tracker().get(id).unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_batching() {
        let s = setup(25, 10, batched(10));
        assert_eq!(
            s.batches.iter().map(|b| b.recipients.len()).collect::<Vec<_>>(),
            [10, 10, 5]
        );

        let report = s.engine.run().await.unwrap();
        assert_eq!(report.confirmed(), 3);
        assert_eq!(s.wallet.prompts(), [3]);
        assert_eq!(s.rpc.blockhashes().len(), 1);

        let progress = s.engine.tracker().progress();
        assert_eq!(progress.completed_transactions, 3);
        assert!(!progress.is_processing);

        let mut airdrop = Airdrop::new(uuid::Uuid::new_v4(), Asset::Native, s.batches.clone());
        airdrop.batches = s.engine.tracker().transactions();
        airdrop.refresh();
        assert_eq!(airdrop.status, AirdropStatus::Completed);
        for b in &airdrop.batches {
            assert_eq!(b.signature, report.get(&b.id).unwrap().signature());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_in_order() {
        let s = setup(25, 5, batched(2));
        let report = s.engine.run().await.unwrap();
        assert_eq!(report.confirmed(), 5);
        assert_eq!(s.wallet.prompts(), [2, 2, 1]);
        // one blockhash per window
        assert_eq!(s.rpc.blockhashes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_then_retry() {
        let s = setup(2, 1, batched(10));
        let (b1, b2) = (&s.batches[0], &s.batches[1]);
        s.rpc.script(first_recipient(b2), [Script::FailOnChain]);

        let report = s.engine.run().await.unwrap();
        assert_eq!(report.confirmed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(status(&s.engine, &b2.id), BatchStatus::Failed);
        let failed = s.engine.tracker().get(&b2.id).unwrap();
        assert!(failed.error_message.is_some());
        assert!(failed.signature.is_some());
        let progress = s.engine.tracker().progress();
        assert_eq!((progress.confirmed, progress.total_transactions), (1, 2));
        let b1_signature = s.engine.tracker().get(&b1.id).unwrap().signature;

        let outcome = s.engine.retry(b2.id).await.unwrap();
        assert!(outcome.is_confirmed());
        let progress = s.engine.tracker().progress();
        assert_eq!((progress.confirmed, progress.total_transactions), (2, 2));
        assert_eq!(s.engine.tracker().get(&b1.id).unwrap().signature, b1_signature);

        let retried = s.engine.tracker().get(&b2.id).unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.recipients, b2.recipients);
        assert_eq!(retried.index, b2.index);
        assert_eq!(retried.error_message, None);
        // fresh blockhash for the retry
        assert_eq!(s.rpc.blockhashes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let s = setup(1, 1, batched(10));
        let b = &s.batches[0];
        s.rpc.script(first_recipient(b), [Script::Drop]);

        let report = s.engine.run().await.unwrap();
        assert_eq!(report.expired(), 1);
        let expired = s.engine.tracker().get(&b.id).unwrap();
        assert_eq!(expired.status, BatchStatus::Expired);
        assert!(expired.signature.is_some());
        assert!(expired.status.is_retryable());

        assert!(s.engine.retry(b.id).await.unwrap().is_confirmed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_fallback() {
        let s = setup(3, 1, SigningCapability::Sequential);
        s.rpc.script(
            first_recipient(&s.batches[1]),
            [Script::Reject("insufficient funds".to_owned())],
        );

        let report = s.engine.run().await.unwrap();
        assert_eq!(s.wallet.prompts(), [1, 1, 1]);
        assert_eq!(s.rpc.blockhashes().len(), 3);
        let ids: Vec<_> = s.batches.iter().map(|b| b.id).collect();
        assert_eq!(status(&s.engine, &ids[0]), BatchStatus::Confirmed);
        assert_eq!(status(&s.engine, &ids[1]), BatchStatus::Failed);
        assert_eq!(status(&s.engine, &ids[2]), BatchStatus::Confirmed);
        assert_eq!(
            s.engine.tracker().get(&ids[1]).unwrap().error_message.as_deref(),
            Some("insufficient funds")
        );
        assert!(matches!(
            report.get(&ids[1]),
            Some(Outcome::Failed { signature: None, .. })
        ));
        // each batch was sent with its own blockhash
        let sent = s.rpc.sent();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].message.recent_blockhash, sent[1].message.recent_blockhash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_leaves_window_pending() {
        let s = setup(4, 1, batched(2));
        s.wallet.reject_next(1);

        let report = s.engine.run().await.unwrap();
        assert_eq!(report.untouched(), 2);
        assert_eq!(report.confirmed(), 2);
        assert_eq!(status(&s.engine, &s.batches[0].id), BatchStatus::Pending);
        assert_eq!(status(&s.engine, &s.batches[1].id), BatchStatus::Pending);
        assert_eq!(status(&s.engine, &s.batches[2].id), BatchStatus::Confirmed);

        // the next pass picks them up
        let report = s.engine.run().await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.confirmed(), 2);
        assert!(s.engine.tracker().progress().is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_retry_rolls_back() {
        let s = setup(1, 1, batched(10));
        let b = &s.batches[0];
        s.rpc.script(first_recipient(b), [Script::Drop]);
        s.engine.run().await.unwrap();
        let before = s.engine.tracker().get(&b.id).unwrap();

        s.wallet.reject_next(1);
        assert_eq!(s.engine.retry(b.id).await.unwrap(), Outcome::Rejected);
        assert_eq!(s.engine.tracker().get(&b.id).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_is_never_retried() {
        let s = setup(2, 1, batched(10));
        s.engine.run().await.unwrap();
        let id = s.batches[0].id;
        assert!(matches!(
            s.engine.retry(id).await,
            Err(EngineError::Tracker(TrackerError::NotRetryable { .. }))
        ));
        assert_eq!(s.rpc.sent_to(&first_recipient(&s.batches[0])), 1);
        assert_eq!(s.engine.run().await.unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_many_settles_each() {
        let s = setup(3, 1, batched(10));
        for b in &s.batches[..2] {
            s.rpc.script(first_recipient(b), [Script::FailOnChain]);
        }
        // the second retry of batch 1 fails again
        s.rpc.script(first_recipient(&s.batches[1]), [Script::FailOnChain]);
        s.engine.run().await.unwrap();

        let ids: Vec<_> = s.batches.iter().map(|b| b.id).collect();
        let results = s.engine.retry_many(&ids).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].1.as_ref().unwrap().is_confirmed());
        assert!(matches!(results[1].1, Ok(Outcome::Failed { .. })));
        assert!(matches!(
            results[2].1,
            Err(EngineError::Tracker(TrackerError::NotRetryable { .. }))
        ));
        assert_eq!(status(&s.engine, &ids[0]), BatchStatus::Confirmed);
        assert_eq!(status(&s.engine, &ids[1]), BatchStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_many_prompts_per_window() {
        let s = setup(12, 1, batched(10));
        for b in &s.batches {
            s.rpc.script(first_recipient(b), [Script::FailOnChain]);
        }
        let report = s.engine.run().await.unwrap();
        assert_eq!(report.failed(), 12);
        assert_eq!(s.wallet.prompts(), [10, 2]);
        assert_eq!(s.rpc.blockhashes().len(), 2);

        let ids: Vec<_> = s.batches.iter().map(|b| b.id).collect();
        let results = s.engine.retry_many(&ids).await.unwrap();
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|(_, r)| r.as_ref().unwrap().is_confirmed()));
        assert_eq!(
            results.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(s.wallet.prompts(), [10, 2, 10, 2]);
        assert_eq!(s.rpc.blockhashes().len(), 4);
        assert!(s.engine.tracker().progress().is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_many_declined_window_is_restored() {
        let s = setup(3, 1, batched(2));
        for b in &s.batches {
            s.rpc.script(first_recipient(b), [Script::FailOnChain]);
        }
        s.engine.run().await.unwrap();
        let before: Vec<_> = s
            .batches
            .iter()
            .map(|b| s.engine.tracker().get(&b.id).unwrap())
            .collect();

        s.wallet.reject_next(1);
        let ids: Vec<_> = s.batches.iter().map(|b| b.id).collect();
        let results = s.engine.retry_many(&ids).await.unwrap();
        assert_eq!(s.wallet.prompts(), [2, 1, 2, 1]);
        assert_eq!(results[0].1.as_ref().unwrap(), &Outcome::Rejected);
        assert_eq!(results[1].1.as_ref().unwrap(), &Outcome::Rejected);
        assert!(results[2].1.as_ref().unwrap().is_confirmed());
        assert_eq!(s.engine.tracker().get(&ids[0]).unwrap(), before[0]);
        assert_eq!(s.engine.tracker().get(&ids[1]).unwrap(), before[1]);
        assert_eq!(status(&s.engine, &ids[2]), BatchStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let s = setup(1, 1, batched(10));
        s.rpc.fail_blockhash(2);
        s.rpc.script(
            first_recipient(&s.batches[0]),
            [Script::Transient, Script::Transient, Script::Confirm],
        );
        let report = s.engine.run().await.unwrap();
        assert_eq!(report.confirmed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blockhash_outage_stops_pass() {
        let s = setup(2, 1, batched(10));
        s.rpc.fail_blockhash(10);
        assert!(matches!(s.engine.run().await, Err(EngineError::Blockhash(_))));
        assert_eq!(s.engine.tracker().progress().completed_transactions, 0);
        assert!(!s.engine.tracker().progress().is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_large_fails_before_signing() {
        let s = setup(30, 30, batched(10));
        assert!(matches!(
            s.engine.run().await,
            Err(EngineError::Build(BuildError::TooLarge { .. }))
        ));
        assert!(s.wallet.prompts().is_empty());
        assert_eq!(status(&s.engine, &s.batches[0].id), BatchStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic() {
        let s = setup(30, 2, batched(3));
        for b in s.batches.iter().step_by(4) {
            s.rpc.script(first_recipient(b), [Script::Drop]);
        }
        let mut rx = s.engine.tracker().subscribe();
        let watcher = tokio::spawn(async move {
            let mut seen = vec![];
            while rx.changed().await.is_ok() {
                let p = rx.borrow_and_update().progress();
                seen.push(p.completed_transactions);
                if !p.is_processing && p.is_done() {
                    break;
                }
            }
            seen
        });
        let report = s.engine.run().await.unwrap();
        assert_eq!(report.confirmed() + report.expired(), 15);
        let seen = watcher.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&15));
    }
}
