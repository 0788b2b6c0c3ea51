// Copyright (c) 2024 Botho Foundation

//! Reward share for holders migrating from the legacy ledger.
//!
//! Each holder gets a cut proportional to their legacy balance until the
//! total migrated reaches `legacy_balance / legacy_per_native_reward`. The
//! block that hits the cap is recorded so orphaning it can restore the
//! uncapped amount.

use super::{credit, BalanceChanges};
use crate::account::{Address, MIGRATED_ASSET};
use crate::config::ChainSettings;
use crate::error::{ChainError, ChainResult};
use crate::repository::{AccountBalance, FinalMigration, LegacyHolder, Repository};
use stk_util_amounts::{pretty_amount, scaled_divide};
use tracing::trace;

fn holder_reward(amount: i64, legacy_balance: i64, total_held: i64) -> ChainResult<i64> {
    let reward = i128::from(amount) * i128::from(legacy_balance) / i128::from(total_held);
    i64::try_from(reward).map_err(|_| ChainError::Inconsistent("legacy reward out of range".to_string()))
}

/// Distribute `amount` (negative when orphaning) and return how much was actually shared.
pub fn distribute_to_legacy_holders(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    amount: i64,
    holders: &[LegacyHolder],
    changes: &mut BalanceChanges,
    height: u32,
) -> ChainResult<i64> {
    let is_processing = amount >= 0;

    let total_held: i64 = holders.iter().map(|holder| holder.legacy_balance).sum();
    trace!(total = %pretty_amount(total_held), "Total legacy balance held");
    if total_held <= 0 {
        return Ok(0);
    }

    let mut shared = 0;
    let mut migrated_balances = Vec::new();

    for holder in holders {
        let address: Address = holder.address;
        let mut reward = holder_reward(amount, holder.legacy_balance, total_held)?;

        trace!(
            holder = %address,
            balance = %pretty_amount(holder.legacy_balance),
            share = %pretty_amount(reward),
            "Legacy holder share"
        );

        if reward == 0 {
            continue;
        }

        let mut migrated = holder.migrated_balance + reward;

        if is_processing {
            let cap = scaled_divide(holder.legacy_balance, settings.legacy_per_native_reward);

            if migrated >= cap {
                let adjustment = migrated - cap;
                reward -= adjustment;
                migrated -= adjustment;

                repository.save_final_migration(&FinalMigration {
                    address,
                    amount: reward,
                    height,
                })?;
                trace!(holder = %address, share = %pretty_amount(reward), height, "Legacy holder final share");
            }
        } else if let (Some(final_migration), Some(_)) = (holder.final_migration, holder.final_block_height) {
            // The stored final amount is positive; reward is negative here
            let adjustment = reward + final_migration;
            reward -= adjustment;
            migrated -= adjustment;

            repository.delete_final_migration(&address)?;
            trace!(holder = %address, share = %pretty_amount(reward), height, "Legacy holder final share undone");
        }

        credit(changes, address, reward);
        migrated_balances.push(AccountBalance {
            address,
            asset_id: MIGRATED_ASSET,
            amount: migrated,
        });
        shared += reward;
    }

    repository.set_balances(&migrated_balances)?;

    Ok(shared)
}
