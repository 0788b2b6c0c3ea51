// Copyright (c) 2024 Botho Foundation

//! Chain settings.
//!
//! Loaded from TOML, validated, then fixed up into the lookup tables block
//! processing needs (cumulative blocks per level, share bin per level,
//! block timings, genesis transactions).

use crate::account::{Address, NULL_PUBLIC_KEY};
use crate::transaction::{ApprovalStatus, Payload, TransactionData, TransactionType};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use stk_consensus_weight::BlockTiming;
use stk_util_amounts::{serde_amount, MULTIPLIER};
use std::fs;
use std::path::Path;

const TESTCHAIN_TOML: &str = include_str!("../resources/testchain.toml");

/// Consensus parameters shared by every node on a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Relaxes block timestamp checks and allows a "now" genesis timestamp
    #[serde(default)]
    pub is_test_chain: bool,

    /// Milliseconds after its timestamp that a transaction may still be included
    #[serde(default = "default_transaction_expiry_period")]
    pub transaction_expiry_period: i64,

    #[serde(default = "default_unit_fee", with = "serde_amount")]
    pub unit_fee: i64,

    /// Allowed clock skew for blocks from the future, in milliseconds
    #[serde(default = "default_block_timestamp_margin")]
    pub block_timestamp_margin: i64,

    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    #[serde(default)]
    pub require_group_for_approval: bool,

    pub genesis: GenesisSettings,

    pub rewards_by_height: Vec<RewardByHeight>,

    pub shares_by_level: Vec<ShareBin>,

    #[serde(with = "serde_amount")]
    pub legacy_holders_share: i64,

    /// Legacy units that migrate one native unit
    #[serde(with = "serde_amount")]
    pub legacy_per_native_reward: i64,

    /// Minted blocks needed to advance from level `i` to `i + 1`
    pub blocks_needed_by_level: Vec<i32>,

    pub block_timings_by_height: Vec<BlockTimingSetting>,

    #[serde(default = "default_min_account_level_to_mint")]
    pub min_account_level_to_mint: u32,

    pub min_account_level_to_reward_share: u32,

    pub max_reward_shares_per_minting_account: u32,

    pub founder_effective_minting_level: u32,

    /// Blocks older than this (ms) have their online account signatures trusted
    pub online_account_signatures_min_lifetime: i64,

    pub online_account_signatures_max_lifetime: i64,

    pub contracts: ContractSettings,

    #[serde(skip)]
    cumulative_blocks_by_level: Vec<i32>,

    #[serde(skip)]
    share_bins_by_level: Vec<Option<usize>>,

    #[serde(skip)]
    block_timings: Vec<BlockTiming>,

    #[serde(skip)]
    genesis_transactions: Vec<TransactionData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisSettings {
    #[serde(default = "default_genesis_version")]
    pub version: i32,

    /// Genesis block timestamp; 0 means "now" on test chains
    pub timestamp: i64,

    #[serde(default)]
    pub transactions: Vec<GenesisTransaction>,
}

/// A transaction baked into the genesis block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisTransaction {
    /// 0 means the genesis block timestamp
    #[serde(default)]
    pub timestamp: i64,

    #[serde(default, with = "serde_amount")]
    pub fee: i64,

    /// Hex public key; the null account when absent
    #[serde(default)]
    pub creator_public_key: Option<String>,

    #[serde(flatten)]
    pub kind: GenesisKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenesisKind {
    Genesis {
        recipient: Address,
        #[serde(with = "serde_amount")]
        amount: i64,
        #[serde(default)]
        asset_id: i64,
    },
    AccountFlags {
        target: Address,
        and_mask: i32,
        or_mask: i32,
        xor_mask: i32,
    },
    AccountLevel {
        target: Address,
        level: u32,
    },
    RewardShare {
        recipient: Address,
        /// Hex public key of the minting key
        reward_share_public_key: String,
        /// Hundredths of a percent
        share_percent: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardByHeight {
    pub height: u32,
    #[serde(with = "serde_amount")]
    pub reward: i64,
}

/// Account levels sharing a fixed portion of each block reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareBin {
    pub levels: Vec<u32>,
    #[serde(with = "serde_amount")]
    pub share: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTimingSetting {
    pub height: u32,
    pub target: i64,
    pub deviation: i64,
    pub power: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSettings {
    #[serde(with = "serde_amount")]
    pub fee_per_step: i64,

    #[serde(default = "default_max_steps_per_round")]
    pub max_steps_per_round: u32,

    #[serde(default = "default_steps_per_function_call")]
    pub steps_per_function_call: u32,

    #[serde(default = "default_minutes_per_block")]
    pub minutes_per_block: i64,
}

fn default_transaction_expiry_period() -> i64 {
    86_400_000
}

fn default_unit_fee() -> i64 {
    MULTIPLIER / 1000
}

fn default_block_timestamp_margin() -> i64 {
    2_000
}

fn default_max_block_size() -> usize {
    2 * 1024 * 1024
}

fn default_genesis_version() -> i32 {
    1
}

fn default_min_account_level_to_mint() -> u32 {
    1
}

fn default_max_steps_per_round() -> u32 {
    500
}

fn default_steps_per_function_call() -> u32 {
    10
}

fn default_minutes_per_block() -> i64 {
    1
}

impl ChainSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain settings from {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load chain settings from {}", path.display()))
    }

    /// Parse, validate and fix up settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: ChainSettings =
            toml::from_str(content).context("Failed to parse chain settings")?;
        settings.validate()?;
        settings.fix_up()?;
        Ok(settings)
    }

    /// The bundled test chain settings.
    pub fn testchain() -> Result<Self> {
        Self::from_toml_str(TESTCHAIN_TOML)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_timestamp_margin <= 0 {
            bail!("block_timestamp_margin must be positive");
        }
        if self.transaction_expiry_period <= 0 {
            bail!("transaction_expiry_period must be positive");
        }
        if self.max_block_size == 0 {
            bail!("max_block_size must be positive");
        }
        if self.min_account_level_to_reward_share == 0 {
            bail!("min_account_level_to_reward_share must be non-zero");
        }
        if self.founder_effective_minting_level == 0 {
            bail!("founder_effective_minting_level must be non-zero");
        }
        if self.rewards_by_height.is_empty() {
            bail!("rewards_by_height must not be empty");
        }
        if self.shares_by_level.is_empty() {
            bail!("shares_by_level must not be empty");
        }
        if self.block_timings_by_height.is_empty() {
            bail!("block_timings_by_height must not be empty");
        }
        if self.contracts.minutes_per_block <= 0 {
            bail!("contracts.minutes_per_block must be positive");
        }
        if self.legacy_per_native_reward <= 0 {
            bail!("legacy_per_native_reward must be positive");
        }

        let total_share = self
            .shares_by_level
            .iter()
            .try_fold(self.legacy_holders_share, |total, bin| total.checked_add(bin.share))
            .ok_or_else(|| anyhow!("share total overflows"))?;
        if !(0..=MULTIPLIER).contains(&total_share) {
            bail!(
                "legacy holders share plus level shares must be between 0 and 1, got {}",
                stk_util_amounts::pretty_amount(total_share)
            );
        }

        if self.genesis.timestamp == 0 && !self.is_test_chain {
            bail!("genesis timestamp of 0 is only allowed on test chains");
        }

        Ok(())
    }

    /// Build the derived lookup tables. Safe to call again after editing fields.
    pub fn fix_up(&mut self) -> Result<()> {
        self.cumulative_blocks_by_level = Vec::with_capacity(self.blocks_needed_by_level.len() + 1);
        let mut cumulative = 0i32;
        self.cumulative_blocks_by_level.push(cumulative);
        for needed in &self.blocks_needed_by_level {
            cumulative = cumulative
                .checked_add(*needed)
                .ok_or_else(|| anyhow!("blocks_needed_by_level overflows"))?;
            self.cumulative_blocks_by_level.push(cumulative);
        }

        let max_level = self
            .shares_by_level
            .iter()
            .flat_map(|bin| bin.levels.iter().copied())
            .max()
            .unwrap_or(0) as usize;
        self.share_bins_by_level = vec![None; max_level + 1];
        for (index, bin) in self.shares_by_level.iter().enumerate() {
            for level in &bin.levels {
                self.share_bins_by_level[*level as usize] = Some(index);
            }
        }

        let mut timings: Vec<BlockTiming> = self
            .block_timings_by_height
            .iter()
            .map(|t| BlockTiming {
                height: t.height,
                target: t.target,
                deviation: t.deviation,
                power: t.power,
            })
            .collect();
        timings.sort_by_key(|t| t.height);
        self.block_timings = timings;

        self.rewards_by_height.sort_by_key(|r| r.height);

        self.genesis_transactions = self
            .genesis
            .transactions
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                entry
                    .to_transaction_data()
                    .with_context(|| format!("Invalid genesis transaction {index}"))
            })
            .collect::<Result<_>>()?;

        Ok(())
    }

    /// Block reward at `height`: the last configured entry at or below it.
    pub fn reward_at_height(&self, height: u32) -> i64 {
        self.rewards_by_height
            .iter()
            .rev()
            .find(|r| r.height <= height)
            .map(|r| r.reward)
            .unwrap_or(0)
    }

    pub fn block_timing_at_height(&self, height: u32) -> Option<&BlockTiming> {
        BlockTiming::at_height(&self.block_timings, height)
    }

    /// Minted blocks needed to reach each level, starting with 0 for level 0.
    pub fn cumulative_blocks_by_level(&self) -> &[i32] {
        &self.cumulative_blocks_by_level
    }

    /// Index into `shares_by_level` of the bin containing `level`.
    pub fn share_bin_for_level(&self, level: u32) -> Option<usize> {
        self.share_bins_by_level
            .get(level as usize)
            .copied()
            .flatten()
    }

    /// Genesis transactions with unset timestamps still at 0.
    pub fn genesis_transactions(&self) -> &[TransactionData] {
        &self.genesis_transactions
    }
}

fn parse_public_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).with_context(|| format!("Bad public key hex: {hex_key}"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("Public key must be 32 bytes, got {}", bytes.len()))
}

impl GenesisTransaction {
    fn to_transaction_data(&self) -> Result<TransactionData> {
        let creator_public_key = match &self.creator_public_key {
            Some(key) => parse_public_key(key)?,
            None => NULL_PUBLIC_KEY,
        };

        let (tx_type, payload) = match &self.kind {
            GenesisKind::Genesis {
                recipient,
                amount,
                asset_id,
            } => (
                TransactionType::Genesis,
                Payload::Genesis {
                    recipient: *recipient,
                    amount: *amount,
                    asset_id: *asset_id,
                },
            ),
            GenesisKind::AccountFlags {
                target,
                and_mask,
                or_mask,
                xor_mask,
            } => (
                TransactionType::AccountFlags,
                Payload::AccountFlags {
                    target: *target,
                    and_mask: *and_mask,
                    or_mask: *or_mask,
                    xor_mask: *xor_mask,
                },
            ),
            GenesisKind::AccountLevel { target, level } => (
                TransactionType::AccountLevel,
                Payload::AccountLevel {
                    target: *target,
                    level: *level,
                },
            ),
            GenesisKind::RewardShare {
                recipient,
                reward_share_public_key,
                share_percent,
            } => {
                if self.creator_public_key.is_none() {
                    bail!("reward share needs the minter as creator_public_key");
                }
                (
                    TransactionType::RewardShare,
                    Payload::RewardShare {
                        recipient: *recipient,
                        reward_share_public_key: parse_public_key(reward_share_public_key)?,
                        share_percent: *share_percent,
                    },
                )
            }
        };

        let mut data = TransactionData::new(tx_type, self.timestamp, creator_public_key, payload);
        data.fee = self.fee;
        data.approval_status = ApprovalStatus::NotRequired;
        Ok(data)
    }
}
