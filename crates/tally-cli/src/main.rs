//! Tally CLI
//!
//! Operator tooling: inspect configuration, replay an exported event log
//! into a snapshot, and look up or verify claim proofs offline.

mod replay;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tally_core::config::EngineConfig;
use tally_core::types::{hex32, SeasonSnapshot, WalletAddress};
use tally_crypto::MerkleProof;
use tally_season::{proof_for, verify};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Tally - seasonal contribution scoring and reward allocation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (TOML); defaults apply when absent
    #[arg(short, long, global = true, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Replay an event log and generate the season snapshot
    Replay {
        /// JSON event log
        #[arg(short, long)]
        input: PathBuf,

        /// Write the snapshot here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print Prometheus metrics after the replay
        #[arg(long)]
        metrics: bool,
    },

    /// Look up a wallet's claim in a snapshot file
    Proof {
        /// Snapshot JSON produced by `replay`
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Wallet address (0x…)
        wallet: String,
    },

    /// Check a claim against a published root
    Verify {
        /// Merkle root (0x…)
        #[arg(long)]
        root: String,

        /// Wallet address (0x…)
        #[arg(long)]
        wallet: String,

        /// Claimed amount
        #[arg(long)]
        amount: u128,

        /// Proof JSON as printed by `proof`
        #[arg(long)]
        proof: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts either a bare proof or the full `proof` command output
fn read_proof(path: &Path) -> anyhow::Result<MerkleProof> {
    let value: serde_json::Value = read_json(path)?;
    let proof = match value.get("proof") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(proof).context("decoding merkle proof")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Commands::Replay {
            input,
            output,
            metrics,
        } => {
            let log = replay::ReplayLog::from_file(&input)?;
            let out = replay::replay(log, config).await?;
            tracing::info!(
                season = out.snapshot.season,
                root = %out.snapshot.root_hex(),
                wallets = out.snapshot.allocations.len(),
                events = out.events_applied,
                weeks = out.weeks_processed,
                "Replay complete"
            );

            let json = serde_json::to_string_pretty(&out.snapshot)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Snapshot written to {}", path.display());
                    println!("Root: {}", out.snapshot.root_hex());
                }
                None => println!("{json}"),
            }
            if metrics {
                eprintln!("{}", out.metrics);
            }
        }

        Commands::Proof { snapshot, wallet } => {
            let snapshot: SeasonSnapshot = read_json(&snapshot)?;
            let wallet = WalletAddress::parse(&wallet)?;
            let claim = proof_for(&snapshot, &wallet);
            println!("{}", serde_json::to_string_pretty(&claim)?);
        }

        Commands::Verify {
            root,
            wallet,
            amount,
            proof,
        } => {
            let root = hex32::parse(&root).map_err(anyhow::Error::msg)?;
            let wallet = WalletAddress::parse(&wallet)?;
            let proof = read_proof(&proof)?;
            if verify(&root, &wallet, amount, &proof) {
                println!("valid");
            } else {
                println!("invalid");
                bail!("proof does not match root");
            }
        }
    }

    Ok(())
}
