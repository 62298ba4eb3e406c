//! In-process wallet and RPC doubles.

use crate::{
    builder::BlockhashContext,
    context::{
        rpc::{self, SendConfig, SignatureStatus, SolanaRpc},
        signer::{self, SignatureRequest, SignatureResponse, SigningCapability},
        Wallet,
    },
};
use async_trait::async_trait;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    instruction::InstructionError,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::{Transaction, TransactionError},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Wallet backed by a real keypair, so signatures verify.
#[derive(Clone)]
pub struct MockWallet {
    keypair: Arc<Keypair>,
    prompts: Arc<Mutex<Vec<usize>>>,
    reject: Arc<AtomicUsize>,
    hang: Arc<AtomicBool>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
            prompts: Default::default(),
            reject: Default::default(),
            hang: Default::default(),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Message count of every prompt so far.
    pub fn prompts(&self) -> Vec<usize> {
        self.prompts.lock().unwrap().clone()
    }

    /// Decline the next `n` prompts.
    pub fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }

    /// Never answer.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn wallet(&self, capability: SigningCapability) -> Wallet {
        let this = self.clone();
        let svc = tower::service_fn(move |req: SignatureRequest| {
            let this = this.clone();
            async move {
                if this.hang.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                this.prompts.lock().unwrap().push(req.messages.len());
                let rejected = this
                    .reject
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if rejected {
                    return Err(signer::Error::Rejected);
                }
                Ok(SignatureResponse {
                    signatures: req
                        .messages
                        .iter()
                        .map(|m| this.keypair.sign_message(m))
                        .collect(),
                })
            }
        });
        Wallet::new(
            self.keypair.pubkey(),
            signer::Svc::from_service(svc, signer::Error::worker, 32),
            capability,
        )
    }
}

/// What happens to one `sendTransaction` of a scripted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Confirm,
    /// Lands with an instruction error.
    FailOnChain,
    /// Accepted but never seen again.
    Drop,
    /// Refused at preflight.
    Reject(String),
    /// Connection error, the request never reached the node.
    Transient,
}

#[derive(Default)]
struct RpcState {
    block_height: u64,
    height_step: u64,
    blockhash_failures: usize,
    blockhashes: Vec<BlockhashContext>,
    scripts: HashMap<Pubkey, VecDeque<Script>>,
    sent: Vec<Transaction>,
    statuses: HashMap<Signature, SignatureStatus>,
}

/// Scripted RPC node. Transactions touching a scripted account follow its
/// script, one entry per send; everything else confirms.
#[derive(Default)]
pub struct MockRpc {
    state: Mutex<RpcState>,
}

impl MockRpc {
    pub fn new() -> Self {
        let rpc = Self::default();
        {
            let mut s = rpc.state.lock().unwrap();
            s.block_height = 1000;
            s.height_step = 40;
        }
        rpc
    }

    pub fn script(&self, account: Pubkey, steps: impl IntoIterator<Item = Script>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(account)
            .or_default()
            .extend(steps);
    }

    pub fn fail_blockhash(&self, times: usize) {
        self.state.lock().unwrap().blockhash_failures = times;
    }

    pub fn blockhashes(&self) -> Vec<BlockhashContext> {
        self.state.lock().unwrap().blockhashes.clone()
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Transactions sent that transfer to `account`.
    pub fn sent_to(&self, account: &Pubkey) -> usize {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|tx| tx.message.account_keys.contains(account))
            .count()
    }
}

#[async_trait]
impl SolanaRpc for MockRpc {
    async fn latest_blockhash(
        &self,
        _: CommitmentConfig,
    ) -> Result<BlockhashContext, rpc::Error> {
        let mut s = self.state.lock().unwrap();
        if s.blockhash_failures > 0 {
            s.blockhash_failures -= 1;
            return Err(rpc::Error::Transport("connection reset".to_owned()));
        }
        let context = BlockhashContext {
            blockhash: Hash::new_unique(),
            last_valid_block_height: s.block_height + 150,
            slot: s.block_height + 10,
        };
        s.blockhashes.push(context);
        Ok(context)
    }

    async fn send_transaction(
        &self,
        tx: &Transaction,
        config: SendConfig,
    ) -> Result<Signature, rpc::Error> {
        let mut s = self.state.lock().unwrap();
        assert!(
            s.blockhashes
                .iter()
                .any(|c| c.blockhash == tx.message.recent_blockhash
                    && config.min_context_slot == Some(c.slot)),
            "sent with an unknown blockhash or context slot"
        );
        tx.verify().expect("invalid signatures");
        let script = tx
            .message
            .account_keys
            .iter()
            .find_map(|k| s.scripts.get_mut(k).and_then(|q| q.pop_front()))
            .unwrap_or(Script::Confirm);
        let signature = tx.signatures[0];
        match script {
            Script::Transient => {
                return Err(rpc::Error::Transport("connection reset".to_owned()));
            }
            Script::Reject(message) => return Err(rpc::Error::Rejected(message)),
            Script::Confirm => {
                s.statuses.insert(signature, Some(Ok(())));
            }
            Script::FailOnChain => {
                s.statuses.insert(
                    signature,
                    Some(Err(TransactionError::InstructionError(
                        0,
                        InstructionError::Custom(1),
                    ))),
                );
            }
            Script::Drop => {}
        }
        s.sent.push(tx.clone());
        Ok(signature)
    }

    async fn signature_status(
        &self,
        signature: &Signature,
        _: CommitmentConfig,
    ) -> Result<SignatureStatus, rpc::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(signature)
            .cloned()
            .flatten())
    }

    async fn block_height(&self, _: CommitmentConfig) -> Result<u64, rpc::Error> {
        let mut s = self.state.lock().unwrap();
        s.block_height += s.height_step;
        Ok(s.block_height)
    }
}
