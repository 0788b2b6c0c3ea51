// Copyright (c) 2024 Botho Foundation

//! Minted-block counting and account level changes.
//!
//! Every distinct minting and recipient account behind a block's online
//! reward-shares counts the block. Levels only ever move in the direction of
//! the count change, to the highest level whose cumulative threshold is met.

use crate::account::Address;
use crate::config::ChainSettings;
use crate::error::ChainResult;
use crate::repository::Repository;
use crate::rewards::ExpandedAccount;
use std::collections::BTreeSet;
use tracing::trace;

/// Highest level reached with `effective_blocks_minted`.
pub fn level_for_blocks_minted(cumulative_blocks_by_level: &[i32], effective_blocks_minted: i32) -> u32 {
    cumulative_blocks_by_level
        .iter()
        .rposition(|needed| effective_blocks_minted >= *needed)
        .unwrap_or(0) as u32
}

fn unique_addresses(accounts: &[ExpandedAccount]) -> Vec<Address> {
    let mut seen = BTreeSet::new();
    let mut addresses = Vec::new();

    for account in accounts {
        let mut candidates = vec![account.minting_account.address];
        if !account.is_recipient_also_minter {
            candidates.push(account.recipient_account.address);
        }
        for address in candidates {
            if seen.insert(address) {
                addresses.push(address);
            }
        }
    }
    addresses
}

/// Mirror a changed account onto every expanded copy of it.
fn sync_copies(accounts: &mut [ExpandedAccount], address: &Address, blocks_minted: i32, level: u32) {
    for account in accounts.iter_mut() {
        for data in [&mut account.minting_account, &mut account.recipient_account] {
            if data.address == *address {
                data.blocks_minted = blocks_minted;
                data.level = level;
            }
        }
    }
}

fn adjust_account_levels(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    accounts: &mut [ExpandedAccount],
    delta: i32,
) -> ChainResult<()> {
    let cumulative = settings.cumulative_blocks_by_level();
    let addresses = unique_addresses(accounts);

    repository.modify_minted_block_counts(&addresses, delta)?;

    for address in &addresses {
        let Some(mut data) = accounts
            .iter()
            .flat_map(|account| [&account.minting_account, &account.recipient_account])
            .find(|data| data.address == *address)
            .cloned()
        else {
            continue;
        };

        data.blocks_minted += delta;
        trace!(account = %address, blocks_minted = data.blocks_minted, "Minted block count changed");

        let new_level = level_for_blocks_minted(cumulative, data.effective_blocks_minted());
        let moved = if delta > 0 {
            new_level > data.level
        } else {
            new_level < data.level
        };

        if moved {
            data.level = new_level;
            repository.set_level(address, new_level)?;
            trace!(account = %address, level = new_level, "Account level changed");
        }

        sync_copies(accounts, address, data.blocks_minted, data.level);
    }

    Ok(())
}

/// Count the block for every online account and bump levels that crossed a threshold.
pub fn increase_account_levels(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    accounts: &mut [ExpandedAccount],
) -> ChainResult<()> {
    adjust_account_levels(repository, settings, accounts, 1)
}

/// Undo [`increase_account_levels`].
pub fn decrease_account_levels(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    accounts: &mut [ExpandedAccount],
) -> ChainResult<()> {
    adjust_account_levels(repository, settings, accounts, -1)
}
