// Copyright (c) 2024 Botho Foundation

//! Balance correction for block 212937.
//!
//! The block at this height was accepted by most of the network although one
//! of its payments overspent, because those nodes carried slightly wrong
//! balances. Rather than rewrite history, every node applies the same fixed
//! balance deltas when processing that height and removes them again when
//! orphaning it.

use crate::account::Address;
use crate::error::ChainResult;
use crate::repository::{AccountBalance, Repository};
use serde::Deserialize;
use stk_util_amounts::serde_amount;
use thiserror::Error;
use tracing::info;

/// The only height with a balance correction.
pub const PATCH_HEIGHT: u32 = 212_937;

/// Deltas shipped with the crate.
///
/// This table is partial: it holds only the one delta that can be derived
/// from the published account figures for this block, and does not reproduce
/// the mainnet ledger at this height. Nodes that need the full correction
/// should load it with [`HistoricalPatch::from_json_str`].
const BUNDLED_DELTAS: &str = include_str!("../../resources/historical-patch-212937.json");

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to parse balance deltas: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaEntry {
    address: Address,
    asset_id: i64,
    #[serde(with = "serde_amount")]
    balance: i64,
}

/// Fixed balance deltas applied at exactly one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalPatch {
    pub height: u32,
    pub deltas: Vec<AccountBalance>,
}

impl HistoricalPatch {
    /// The deltas shipped with this crate.
    pub fn bundled() -> Result<Self, PatchError> {
        Self::from_json_str(PATCH_HEIGHT, BUNDLED_DELTAS)
    }

    pub fn from_json_str(height: u32, json: &str) -> Result<Self, PatchError> {
        let entries: Vec<DeltaEntry> = serde_json::from_str(json)?;
        let deltas = entries
            .into_iter()
            .map(|entry| AccountBalance {
                address: entry.address,
                asset_id: entry.asset_id,
                amount: entry.balance,
            })
            .collect();
        Ok(Self { height, deltas })
    }

    pub fn applies_at(&self, height: u32) -> bool {
        height == self.height
    }

    pub fn apply(&self, repository: &mut dyn Repository) -> ChainResult<()> {
        info!(height = self.height, deltas = self.deltas.len(), "Applying historical balance correction");
        repository.modify_balances(&self.deltas)?;
        Ok(())
    }

    pub fn revert(&self, repository: &mut dyn Repository) -> ChainResult<()> {
        info!(height = self.height, deltas = self.deltas.len(), "Reverting historical balance correction");
        let inverse: Vec<AccountBalance> = self
            .deltas
            .iter()
            .map(|delta| AccountBalance {
                amount: -delta.amount,
                ..*delta
            })
            .collect();
        repository.modify_balances(&inverse)?;
        Ok(())
    }
}
