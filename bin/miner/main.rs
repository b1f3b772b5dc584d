//! Reputation Miner
//!
//! Mines reputation cycles against a ledger gateway until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use reputation_miner::logging::init_tracing;
use reputation_miner::{
    ClientOptions, JsonRpcLedgerClient, MinerConfig, MinerStrategies, MiningClient, StepOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reputation-miner")]
#[command(about = "Off-chain reputation miner with binary-search dispute resolution")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "REPUTATION_MINER_CONFIG")]
    config: Option<PathBuf>,

    /// Mine a single cycle, then exit
    #[arg(long)]
    once: bool,

    /// Sync the local store with the ledger, then exit
    #[arg(long)]
    sync_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = MinerConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let staker = config.staker_address()?;

    info!("Starting reputation miner");
    info!("  Staker: {}", config.staker);
    info!("  Ledger: {}", config.ledger_url);
    info!("  Store: {}", config.store_path.display());

    let ledger = Arc::new(JsonRpcLedgerClient::new(
        &config.ledger_url,
        config.request_timeout(),
    )?);
    let mut client = MiningClient::open(
        ledger,
        staker,
        MinerStrategies::default(),
        ClientOptions::from(&config),
    )
    .context("Failed to open reputation store")?;

    if args.sync_only {
        let state = client.sync().await?;
        info!(cycle = state.cycle, n_nodes = state.n_nodes, "Sync complete");
        return Ok(());
    }

    loop {
        let result = tokio::select! {
            result = client.run_cycle() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
        };

        match result {
            Ok(StepOutcome::Resolved(outcome)) => info!(%outcome, "Cycle decided"),
            Ok(StepOutcome::Missed) => warn!("Missed the mining window"),
            Ok(StepOutcome::Pending) => {}
            Err(e) if e.is_consistency_fault() => {
                error!("Local state diverged from the ledger: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn!("Cycle failed: {}", e);
                tokio::time::sleep(config.poll_interval()).await;
                continue;
            }
        }

        if args.once {
            return Ok(());
        }
        client.wait_for_next_cycle().await?;
    }
}
