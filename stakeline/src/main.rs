// Copyright (c) 2024 Botho Foundation

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::path::PathBuf;
use stk_consensus_weight::{block_weight, calc_minimum_timestamp, calc_timestamp, key_distance, BlockSummary};
use stk_util_amounts::pretty_amount;
use tracing_subscriber::EnvFilter;

use stakeline::account::Address;
use stakeline::ChainSettings;

#[derive(Parser)]
#[command(name = "stakeline")]
#[command(about = "Proof-of-stake consensus tools", long_about = None)]
struct Cli {
    /// Chain settings file (default: bundled test chain)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// The parent block being built on.
#[derive(clap::Args)]
struct Parent {
    /// Parent block height
    #[arg(long)]
    height: u32,

    /// Parent block signature (hex)
    #[arg(long)]
    signature: String,
}

/// The would-be minter.
#[derive(clap::Args)]
struct Minter {
    /// Reward-share public key (hex)
    #[arg(long)]
    minter_key: String,

    /// Effective minting level
    #[arg(long)]
    level: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and summarise chain settings
    CheckConfig {
        /// Settings file to check instead of --config
        path: Option<PathBuf>,
    },

    /// Timestamp a minter must use for the block after a parent
    NextTimestamp {
        #[command(flatten)]
        parent: Parent,

        /// Parent block timestamp (ms)
        #[arg(long)]
        timestamp: i64,

        #[command(flatten)]
        minter: Minter,
    },

    /// Key distance and block weight of a minter's block on a parent
    Weigh {
        #[command(flatten)]
        parent: Parent,

        #[command(flatten)]
        minter: Minter,

        /// Online accounts the block would claim
        #[arg(long, default_value_t = 1)]
        online_accounts: u32,
    },

    /// Generate a new minting or reward-share key pair
    Keygen,
}

fn load_settings(path: Option<&PathBuf>) -> Result<ChainSettings> {
    match path {
        Some(path) => ChainSettings::load(path),
        None => ChainSettings::testchain(),
    }
}

fn decode_hex(name: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).with_context(|| format!("{name} is not valid hex"))
}

fn decode_key(value: &str) -> Result<[u8; 32]> {
    decode_hex("minter key", value)?
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("minter key must be 32 bytes, got {}", bytes.len()))
}

fn check_config(path: Option<&PathBuf>) -> Result<()> {
    let settings = load_settings(path)?;

    println!("Test chain:          {}", settings.is_test_chain);
    println!("Genesis timestamp:   {}", settings.genesis.timestamp);
    println!("Genesis txs:         {}", settings.genesis_transactions().len());
    println!("Reward at height 1:  {}", pretty_amount(settings.reward_at_height(1)));
    println!("Legacy share:        {}", pretty_amount(settings.legacy_holders_share));
    for (index, bin) in settings.shares_by_level.iter().enumerate() {
        println!("Share bin {index}:         levels {:?} -> {}", bin.levels, pretty_amount(bin.share));
    }
    println!("Max level:           {}", settings.blocks_needed_by_level.len());
    println!("Block timings:       {}", settings.block_timings_by_height.len());
    println!("OK");
    Ok(())
}

fn next_timestamp(settings: &ChainSettings, parent: &Parent, parent_timestamp: i64, minter: &Minter) -> Result<()> {
    let signature = decode_hex("signature", &parent.signature)?;
    let minter_key = decode_key(&minter.minter_key)?;
    let timing = settings
        .block_timing_at_height(parent.height + 1)
        .ok_or_else(|| anyhow!("no block timing for height {}", parent.height + 1))?;

    let timestamp = calc_timestamp(parent.height, &signature, parent_timestamp, &minter_key, minter.level, timing);
    let minimum = calc_minimum_timestamp(parent_timestamp, timing);

    println!("Timestamp:         {timestamp}");
    println!("Minimum timestamp: {minimum}");
    println!("Delay:             {} ms", timestamp - parent_timestamp);
    Ok(())
}

fn weigh(parent: &Parent, minter: &Minter, online_accounts: u32) -> Result<()> {
    let signature = decode_hex("signature", &parent.signature)?;
    let minter_public_key = decode_key(&minter.minter_key)?;

    let distance = key_distance(parent.height, &signature, &minter_public_key, minter.level);
    let summary = BlockSummary {
        height: parent.height + 1,
        signature: Vec::new(),
        minter_public_key,
        minter_level: minter.level,
        online_accounts_count: online_accounts,
    };
    let weight = block_weight(parent.height, &signature, &summary);

    println!("Key distance: {distance}");
    println!("Block weight: {weight}");
    Ok(())
}

fn keygen() {
    let key = SigningKey::generate(&mut OsRng);
    let public_key = key.verifying_key().to_bytes();

    println!("Private key: {}", hex::encode(key.to_bytes()));
    println!("Public key:  {}", hex::encode(public_key));
    println!("Address:     {}", Address::from_public_key(&public_key));
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    match &cli.command {
        Commands::CheckConfig { path } => check_config(path.as_ref().or(cli.config.as_ref())),
        Commands::NextTimestamp {
            parent,
            timestamp,
            minter,
        } => {
            let settings = load_settings(cli.config.as_ref())?;
            next_timestamp(&settings, parent, *timestamp, minter)
        }
        Commands::Weigh {
            parent,
            minter,
            online_accounts,
        } => weigh(parent, minter, *online_accounts),
        Commands::Keygen => {
            keygen();
            Ok(())
        }
    }
}
