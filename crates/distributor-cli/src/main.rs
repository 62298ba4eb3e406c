use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use distributor_client::{refresh, BackendClient, BackendSubmitter, Session};
use distributor_lib::{
    config::env,
    partition::partition,
    recipient::{check_amounts, read_recipients_csv, ValidationError},
    stake_csv::{parse_stake_csv, submit_stake_rows, StakeCsvError},
    Airdrop, AirdropId, AirdropStatus, Asset, Batch, BatchId, DistributorConfig, Engine,
    EngineError, Outcome, RpcSubmitter, SigningCapability, SigningCoordinator, SolanaRpc, Tracker,
    Wallet,
};
use solana_sdk::pubkey::Pubkey;
use std::{path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;

mod config;
mod wallet;

#[derive(Parser, Debug)]
#[command(name = "distributor", version, about, long_about = None)]
struct Args {
    /// TOML config file, `-` to read it from STDIN
    #[arg(long, short, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Debug)]
struct WalletArgs {
    /// Keypair file of the funding wallet, defaults to the Solana CLI keypair
    #[arg(long, short)]
    keypair: Option<PathBuf>,
    /// One wallet approval per transaction
    #[arg(long)]
    sequential: bool,
    /// Confirm every wallet prompt on the terminal
    #[arg(long, short)]
    interactive: bool,
}

impl WalletArgs {
    fn wallet(&self, config: &DistributorConfig) -> anyhow::Result<Wallet> {
        let path = match &self.keypair {
            Some(path) => path.clone(),
            None => wallet::default_keypair_path().context("no --keypair given and HOME is not set")?,
        };
        let keypair = wallet::read_keypair(&path)?;
        let capability = if self.sequential {
            SigningCapability::Sequential
        } else {
            SigningCapability::Batched {
                window: config.batching.signing_window,
            }
        };
        Ok(wallet::keypair_wallet(keypair, capability, self.interactive))
    }
}

#[derive(ClapArgs, Debug)]
struct AssetArgs {
    /// SPL token mint, SOL when omitted
    #[arg(long, requires = "decimals")]
    mint: Option<Pubkey>,
    /// Decimals of the mint
    #[arg(long, requires = "mint")]
    decimals: Option<u8>,
}

impl AssetArgs {
    fn asset(&self) -> Asset {
        match (self.mint, self.decimals) {
            (Some(mint), Some(decimals)) => Asset::Token { mint, decimals },
            _ => Asset::Native,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send to every recipient of a CSV file with an `address,amount` header
    Airdrop {
        csv: PathBuf,
        #[command(flatten)]
        asset: AssetArgs,
        #[command(flatten)]
        wallet: WalletArgs,
        /// Submit through the backend instead of the RPC node
        #[arg(long)]
        relay: bool,
        /// Rounds of retries for failed or expired batches
        #[arg(long, default_value_t = 0)]
        retries: usize,
    },
    /// Show an airdrop and its batches
    Status { id: AirdropId },
    /// List airdrops
    List,
    /// Retry failed or expired batches of an airdrop through the backend
    Retry {
        id: AirdropId,
        /// Batches to retry, every failed or expired one when omitted
        #[arg(long = "batch")]
        batches: Vec<BatchId>,
        #[command(flatten)]
        wallet: WalletArgs,
    },
    /// Delete an airdrop
    Delete { id: AirdropId },
    /// Create one delegated stake account per row of a stake CSV
    Stake {
        csv: PathBuf,
        #[command(flatten)]
        wallet: WalletArgs,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .parse_lossy(std::env::var(env::RUST_LOG).as_deref().unwrap_or("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn rpc_client(config: &DistributorConfig) -> Arc<dyn SolanaRpc> {
    Arc::new(
        config
            .solana_client
            .build_client(config.submission.commitment_config()),
    )
}

fn backend(config: &DistributorConfig, session: Session) -> anyhow::Result<BackendClient> {
    if !session.is_signed_in() {
        bail!("set {} to use the backend", env::DISTRIBUTOR_TOKEN);
    }
    Ok(BackendClient::from_config(config, session)?)
}

/// Log whenever another batch is confirmed.
fn spawn_progress(tracker: &Tracker) -> JoinHandle<()> {
    let mut rx = tracker.subscribe();
    tokio::spawn(async move {
        let mut last = 0;
        while rx.changed().await.is_ok() {
            let progress = rx.borrow_and_update().progress();
            if progress.confirmed != last {
                last = progress.confirmed;
                tracing::info!(
                    "{} of {} transactions confirmed ({}%)",
                    progress.confirmed,
                    progress.total_transactions,
                    progress.percent()
                );
            }
        }
    })
}

/// One pass over the pending batches, then up to `retries` rounds over the
/// failed and expired ones.
async fn drive(engine: &Engine, retries: usize) -> anyhow::Result<()> {
    let report = engine.run().await.context("airdrop pass")?;
    tracing::info!("pass finished: {}", report);
    for round in 1..=retries {
        let ids = engine.tracker().ids_where(|b| b.status.is_retryable());
        if ids.is_empty() {
            break;
        }
        tracing::info!("retry round {}: {} batch(es)", round, ids.len());
        log_retries(engine.retry_many(&ids).await?);
    }
    Ok(())
}

fn log_retries(results: Vec<(BatchId, Result<Outcome, EngineError>)>) {
    for (id, result) in results {
        match result {
            Ok(outcome) => tracing::info!("batch {}: {}", id, outcome),
            Err(error) => tracing::warn!("batch {}: {}", id, error),
        }
    }
}

fn print_airdrop(airdrop: &Airdrop) {
    println!(
        "airdrop {}: {}, {} of {} batches confirmed, {} recipients, {} total",
        airdrop.id,
        airdrop.status,
        airdrop.confirmed_count(),
        airdrop.batches.len(),
        airdrop.recipient_count,
        airdrop.total_amount
    );
    for batch in &airdrop.batches {
        print_batch(batch);
    }
}

fn print_batch(batch: &Batch) {
    let signature = batch
        .signature
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_owned());
    println!(
        "{:>4} {:<10} retries={} {} {}",
        batch.index,
        batch.status,
        batch.retry_count,
        signature,
        batch.error_message.as_deref().unwrap_or_default()
    );
}

fn finish(airdrop: &Airdrop) -> anyhow::Result<()> {
    print_airdrop(airdrop);
    if airdrop.status != AirdropStatus::Completed {
        bail!(
            "{} batch(es) not confirmed",
            airdrop.batches.len() - airdrop.confirmed_count()
        );
    }
    Ok(())
}

fn invalid_rows(errors: &[ValidationError], csv: &std::path::Path) -> anyhow::Error {
    for error in errors {
        tracing::error!("{}", error);
    }
    anyhow::anyhow!("{} invalid row(s) in {}", errors.len(), csv.display())
}

async fn airdrop(
    config: &DistributorConfig,
    session: Session,
    csv: PathBuf,
    asset: Asset,
    wallet: Wallet,
    relay: bool,
    retries: usize,
) -> anyhow::Result<()> {
    let file = std::fs::File::open(&csv).with_context(|| format!("opening {}", csv.display()))?;
    let recipients = read_recipients_csv(file).map_err(|errors| invalid_rows(&errors, &csv))?;
    check_amounts(&recipients, asset.decimals()).map_err(|errors| invalid_rows(&errors, &csv))?;
    let batches = partition(
        recipients,
        asset.batch_size(&config.batching),
        config.batching.max_recipients,
    )?;
    tracing::info!(
        "{} batch(es) from {} with wallet {}",
        batches.len(),
        csv.display(),
        wallet.pubkey()
    );

    let rpc = rpc_client(config);
    let tracker = Tracker::new();
    let progress = spawn_progress(&tracker);
    let result = if relay {
        let client = backend(config, session)?;
        let created = client
            .create_airdrop(asset, batches.clone())
            .await
            .context("creating airdrop")?;
        tracing::info!("created airdrop {}", created.id);
        tracker.initialize_transactions(batches);
        let submitter = Arc::new(BackendSubmitter::new(
            client.clone(),
            created.id,
            &config.submission,
        ));
        let engine = Engine::with_submitter(
            rpc,
            submitter,
            wallet,
            tracker.clone(),
            asset,
            config.submission.clone(),
        );
        match drive(&engine, retries).await {
            Ok(()) => refresh(&client, created.id, &tracker)
                .await
                .context("refreshing airdrop"),
            Err(error) => Err(error),
        }
    } else {
        tracker.initialize_transactions(batches);
        let engine = Engine::new(rpc, wallet, tracker.clone(), asset, config.submission.clone());
        drive(&engine, retries)
            .await
            .map(|()| Airdrop::new(uuid::Uuid::new_v4(), asset, tracker.transactions()))
    };
    progress.abort();
    finish(&result?)
}

async fn retry(
    config: &DistributorConfig,
    session: Session,
    id: AirdropId,
    batches: Vec<BatchId>,
    wallet: Wallet,
) -> anyhow::Result<()> {
    let client = backend(config, session)?;
    let tracker = Tracker::new();
    // rebuilt transfers must move the asset the airdrop was created with
    let asset = refresh(&client, id, &tracker)
        .await
        .with_context(|| format!("fetching airdrop {id}"))?
        .asset;
    let ids = if batches.is_empty() {
        tracker.ids_where(|b| b.status.is_retryable())
    } else {
        batches
    };
    if ids.is_empty() {
        println!("nothing to retry");
        return Ok(());
    }

    let submitter = Arc::new(BackendSubmitter::new(client.clone(), id, &config.submission));
    let engine = Engine::with_submitter(
        rpc_client(config),
        submitter,
        wallet,
        tracker.clone(),
        asset,
        config.submission.clone(),
    );
    log_retries(engine.retry_many(&ids).await?);
    let airdrop = refresh(&client, id, &tracker)
        .await
        .context("refreshing airdrop")?;
    finish(&airdrop)
}

async fn stake(config: &DistributorConfig, csv: PathBuf, wallet: Wallet) -> anyhow::Result<()> {
    let file = std::fs::File::open(&csv).with_context(|| format!("opening {}", csv.display()))?;
    let rows = match parse_stake_csv(file, chrono::Utc::now()) {
        Ok(rows) => rows,
        Err(StakeCsvError::Rows(errors)) => return Err(invalid_rows(&errors, &csv)),
        Err(error) => return Err(error).with_context(|| format!("reading {}", csv.display())),
    };

    let rpc = rpc_client(config);
    let submitter = RpcSubmitter::new(rpc.clone(), config.submission.clone());
    let signer = SigningCoordinator::new(wallet, config.submission.signature_timeout);
    let outcomes =
        submit_stake_rows(&rows, rpc.as_ref(), &signer, &submitter, &config.submission).await?;

    let mut confirmed = 0;
    for o in &outcomes {
        confirmed += usize::from(o.outcome.is_confirmed());
        println!("row {:>2} {} {}", o.row, o.stake_account, o.outcome);
    }
    if confirmed != outcomes.len() {
        bail!("{} of {} stake accounts created", confirmed, outcomes.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = config::get_config(args.config.as_deref());
    let session = Session::new(std::env::var(env::DISTRIBUTOR_TOKEN).ok());

    match args.command {
        Commands::Airdrop {
            csv,
            asset,
            wallet,
            relay,
            retries,
        } => {
            let wallet = wallet.wallet(&config)?;
            airdrop(&config, session, csv, asset.asset(), wallet, relay, retries).await
        }
        Commands::Status { id } => {
            let client = backend(&config, session)?;
            let detail = client.get_airdrop(id).await?;
            print_airdrop(&Airdrop::from(detail));
            Ok(())
        }
        Commands::List => {
            let client = backend(&config, session)?;
            for a in client.list_airdrops().await? {
                println!(
                    "{} {:<10} {}/{} transactions, {} recipients, {} total, created {}",
                    a.id,
                    a.status,
                    a.completed_transactions,
                    a.total_transactions,
                    a.recipient_count,
                    a.total_amount,
                    a.created_at
                );
            }
            Ok(())
        }
        Commands::Retry {
            id,
            batches,
            wallet,
        } => {
            let wallet = wallet.wallet(&config)?;
            retry(&config, session, id, batches, wallet).await
        }
        Commands::Delete { id } => {
            let client = backend(&config, session)?;
            client.delete_airdrop(id).await?;
            println!("deleted {id}");
            Ok(())
        }
        Commands::Stake { csv, wallet } => {
            let wallet = wallet.wallet(&config)?;
            stake(&config, csv, wallet).await
        }
    }
}
