//! Wallet service backed by a local keypair file.

use anyhow::{anyhow, Context};
use distributor_lib::{
    context::signer::{self, SignatureRequest, SignatureResponse, SigningCapability},
    Wallet,
};
use solana_sdk::{
    signature::{read_keypair_file, Keypair},
    signer::Signer,
};
use std::{path::Path, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    sync::Mutex,
};

pub fn read_keypair(path: &Path) -> anyhow::Result<Keypair> {
    read_keypair_file(path)
        .map_err(|error| anyhow!("{error}"))
        .with_context(|| format!("reading keypair {}", path.display()))
}

/// Default location used by the Solana CLI.
pub fn default_keypair_path() -> Option<std::path::PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(Path::new(&home).join(".config/solana/id.json"))
}

type Prompt = Arc<Mutex<Lines<BufReader<Stdin>>>>;

/// Ask on the terminal before every wallet prompt. Anything but `y` declines.
async fn approve(prompt: &Prompt, req: &SignatureRequest) -> bool {
    let mut lines = prompt.lock().await;
    let question = format!(
        "Sign {} transaction(s) with {}? [y/N] ",
        req.messages.len(),
        req.pubkey
    );
    let mut stderr = tokio::io::stderr();
    if let Err(error) = stderr.write_all(question.as_bytes()).await {
        tracing::warn!("can't prompt for approval: {}", error);
        return false;
    }
    let _ = stderr.flush().await;
    match lines.next_line().await {
        Ok(Some(answer)) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Ok(None) => false,
        Err(error) => {
            tracing::warn!("can't read approval: {}", error);
            false
        }
    }
}

fn sign(keypair: &Keypair, req: &SignatureRequest) -> Result<SignatureResponse, signer::Error> {
    if req.pubkey != keypair.pubkey() {
        return Err(signer::Error::Pubkey(req.pubkey.to_string()));
    }
    Ok(SignatureResponse {
        signatures: req
            .messages
            .iter()
            .map(|m| keypair.sign_message(m))
            .collect(),
    })
}

/// Serve signature requests for `keypair`. With `interactive`, every request
/// waits for a yes on stdin and a no is reported as a rejection.
pub fn keypair_wallet(
    keypair: Keypair,
    capability: SigningCapability,
    interactive: bool,
) -> Wallet {
    let pubkey = keypair.pubkey();
    let keypair = Arc::new(keypair);
    let prompt: Option<Prompt> =
        interactive.then(|| Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())));
    let svc = tower::service_fn(move |req: SignatureRequest| {
        let keypair = keypair.clone();
        let prompt = prompt.clone();
        async move {
            if let Some(prompt) = prompt {
                if !approve(&prompt, &req).await {
                    return Err(signer::Error::Rejected);
                }
            }
            sign(&keypair, &req)
        }
    });
    Wallet::new(
        pubkey,
        signer::Svc::from_service(svc, signer::Error::worker, 32),
        capability,
    )
}
