// Copyright (c) 2024 Botho Foundation

//! Block reward distribution.
//!
//! A block's reward (plus fees) is split between ordered candidates: one per
//! account-level share bin with online minters, the legacy holders, and the
//! founders. Every balance change is collected first and applied as a single
//! batch. A negative total undoes an earlier distribution.
//!
//! Candidate order matters: amounts a candidate cannot use (rounding,
//! capped legacy holders) are folded back into the total seen by the
//! candidates after it.

mod legacy;

pub use legacy::distribute_to_legacy_holders;

use crate::account::{AccountData, Address, RewardShareData, NATIVE_ASSET};
use crate::config::ChainSettings;
use crate::error::{ChainError, ChainResult};
use crate::repository::{AccountBalance, LegacyHolder, Repository};
use std::collections::BTreeMap;
use stk_util_amounts::{checked_scaled_divide, pretty_amount, round_down_scaled_multiply, scaled_divide, MULTIPLIER};
use tracing::trace;

/// Balance changes keyed by account, applied once at the end.
pub type BalanceChanges = BTreeMap<Address, i64>;

fn credit(changes: &mut BalanceChanges, address: Address, amount: i64) {
    *changes.entry(address).or_insert(0) += amount;
}

/// An online reward-share resolved to its minting and recipient accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedAccount {
    pub reward_share: RewardShareData,
    pub minting_account: AccountData,
    pub recipient_account: AccountData,
    pub is_minter_founder: bool,
    pub is_recipient_also_minter: bool,
}

impl ExpandedAccount {
    pub fn expand(repository: &dyn Repository, reward_share: RewardShareData) -> ChainResult<Self> {
        let minting_account = repository
            .account(&reward_share.minter)?
            .unwrap_or_else(|| AccountData::new(reward_share.minter));
        let is_minter_founder = minting_account.is_founder();
        let is_recipient_also_minter = reward_share.recipient == reward_share.minter;

        let recipient_account = if is_recipient_also_minter {
            minting_account.clone()
        } else {
            repository
                .account(&reward_share.recipient)?
                .unwrap_or_else(|| AccountData::new(reward_share.recipient))
        };

        Ok(Self {
            reward_share,
            minting_account,
            recipient_account,
            is_minter_founder,
            is_recipient_also_minter,
        })
    }

    /// Index of the share bin this account's minter falls into, if any.
    ///
    /// Read at distribution time because levels may have just been bumped.
    pub fn share_bin(&self, settings: &ChainSettings) -> Option<usize> {
        if self.is_minter_founder || self.minting_account.level == 0 {
            return None;
        }
        settings.share_bin_for_level(self.minting_account.level)
    }

    /// Credit `amount`, split between minter and recipient by the share percentage.
    ///
    /// Always distributes the whole amount.
    pub fn distribute(&self, amount: i64, changes: &mut BalanceChanges) -> i64 {
        let minter = self.minting_account.address;

        if self.is_recipient_also_minter {
            trace!(account = %minter, share = %pretty_amount(amount), "Minter/recipient share");
            if amount != 0 {
                credit(changes, minter, amount);
            }
            return amount;
        }

        // share_percent is in hundredths of a percent
        let recipient_amount = amount * self.reward_share.share_percent / 100 / 100;
        let minter_amount = amount - recipient_amount;
        let recipient = self.recipient_account.address;

        trace!(account = %minter, share = %pretty_amount(minter_amount), "Minter share");
        if minter_amount != 0 {
            credit(changes, minter, minter_amount);
        }

        trace!(account = %recipient, share = %pretty_amount(recipient_amount), "Recipient share");
        if recipient_amount != 0 {
            credit(changes, recipient, recipient_amount);
        }

        amount
    }
}

/// Split evenly across distinct minting accounts, then across each minter's reward-shares.
pub fn distribute_to_accounts(amount: i64, accounts: &[&ExpandedAccount], changes: &mut BalanceChanges) -> i64 {
    let mut by_minter: BTreeMap<Address, Vec<&ExpandedAccount>> = BTreeMap::new();
    for account in accounts {
        by_minter
            .entry(account.minting_account.address)
            .or_default()
            .push(*account);
    }

    if by_minter.is_empty() {
        return 0;
    }

    let per_minter = amount / by_minter.len() as i64;

    let mut shared = 0;
    for recipients in by_minter.values() {
        let per_recipient = per_minter / recipients.len() as i64;
        for account in recipients {
            shared += account.distribute(per_recipient, changes);
        }
    }
    shared
}

enum Distribution<'a> {
    Accounts(Vec<&'a ExpandedAccount>),
    LegacyHolders(Vec<LegacyHolder>),
}

struct RewardCandidate<'a> {
    description: String,
    share: i64,
    distribution: Distribution<'a>,
}

fn determine_candidates<'a>(
    repository: &dyn Repository,
    settings: &ChainSettings,
    accounts: &'a [ExpandedAccount],
    height: u32,
    is_processing: bool,
) -> ChainResult<Vec<RewardCandidate<'a>>> {
    let mut candidates = Vec::new();
    let mut total_shares = 0i64;

    let founders: Vec<&ExpandedAccount> = accounts.iter().filter(|a| a.is_minter_founder).collect();
    let have_founders = !founders.is_empty();

    for (bin_index, bin) in settings.shares_by_level.iter().enumerate() {
        let binned: Vec<&ExpandedAccount> = accounts
            .iter()
            .filter(|account| account.share_bin(settings) == Some(bin_index))
            .collect();
        if binned.is_empty() {
            continue;
        }

        candidates.push(RewardCandidate {
            description: format!("Bin {bin_index}"),
            share: bin.share,
            distribution: Distribution::Accounts(binned),
        });
        total_shares += bin.share;
    }

    let holders = repository.eligible_legacy_holders(if is_processing { None } else { Some(height) })?;
    let have_holders = !holders.is_empty();
    let legacy_share = settings.legacy_holders_share;

    if !have_founders {
        if total_shares == 0 {
            return Err(ChainError::NoRewardShares(height));
        }

        // Scale bin shares up to fill whatever the legacy holders leave
        let scaling = if have_holders {
            checked_scaled_divide(total_shares, MULTIPLIER - legacy_share)
        } else {
            Some(total_shares)
        }
        .filter(|scaling| *scaling != 0)
        .ok_or_else(|| ChainError::Inconsistent("share bins cannot be scaled".to_string()))?;

        for candidate in &mut candidates {
            candidate.share = scaled_divide(candidate.share, scaling);
        }
    }

    if have_holders {
        let candidate = RewardCandidate {
            description: "Legacy holders".to_string(),
            share: legacy_share,
            distribution: Distribution::LegacyHolders(holders),
        };

        if have_founders {
            candidates.push(candidate);
        } else {
            candidates.insert(0, candidate);
        }
        total_shares += legacy_share;
    }

    if have_founders {
        candidates.push(RewardCandidate {
            description: "Founders".to_string(),
            share: MULTIPLIER - total_shares,
            distribution: Distribution::Accounts(founders),
        });
    }

    Ok(candidates)
}

/// Distribute `total_amount` for the block at `height`; negative amounts undo.
pub fn distribute_block_reward(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    accounts: &[ExpandedAccount],
    total_amount: i64,
    height: u32,
) -> ChainResult<()> {
    trace!(height, amount = %pretty_amount(total_amount), "Distributing block reward");

    let is_processing = total_amount >= 0;
    let candidates = determine_candidates(&*repository, settings, accounts, height, is_processing)?;

    let mut changes = BalanceChanges::new();
    let mut total_amount = total_amount;
    let mut remaining = total_amount;

    for candidate in &candidates {
        let amount = round_down_scaled_multiply(total_amount, candidate.share);

        let shared = match &candidate.distribution {
            Distribution::Accounts(accounts) => distribute_to_accounts(amount, accounts, &mut changes),
            Distribution::LegacyHolders(holders) => {
                distribute_to_legacy_holders(repository, settings, amount, holders, &mut changes, height)?
            }
        };
        remaining -= shared;

        // Later candidates absorb what this one could not use
        if shared != amount && candidate.share < MULTIPLIER {
            total_amount += scaled_divide(amount - shared, MULTIPLIER - candidate.share);
        }

        trace!(
            candidate = %candidate.description,
            share = %pretty_amount(amount),
            shared = %pretty_amount(shared),
            remaining = %pretty_amount(remaining),
            "Reward candidate"
        );
    }

    let deltas: Vec<AccountBalance> = changes
        .into_iter()
        .map(|(address, amount)| AccountBalance {
            address,
            asset_id: NATIVE_ASSET,
            amount,
        })
        .collect();
    repository.modify_balances(&deltas)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{FOUNDER_FLAG, LEGACY_ASSET};
    use crate::repository::{AccountStore, MemoryRepository};

    fn address(seed: u8) -> Address {
        Address::from_public_key(&[seed; 32])
    }

    fn expanded(minter: u8, recipient: u8, level: u32, founder: bool, share_percent: i64) -> ExpandedAccount {
        let mut minting_account = AccountData::new(address(minter));
        minting_account.level = level;
        if founder {
            minting_account.flags = FOUNDER_FLAG;
        }
        let recipient_account = AccountData::new(address(recipient));

        ExpandedAccount {
            reward_share: RewardShareData {
                minter_public_key: [minter; 32],
                minter: address(minter),
                recipient: address(recipient),
                reward_share_public_key: [minter ^ recipient ^ 0x80; 32],
                share_percent,
            },
            is_minter_founder: founder,
            is_recipient_also_minter: minter == recipient,
            minting_account,
            recipient_account,
        }
    }

    fn native(repository: &MemoryRepository, seed: u8) -> i64 {
        repository.balance(&address(seed), NATIVE_ASSET).unwrap()
    }

    #[test]
    fn test_share_percent_split() {
        let account = expanded(1, 2, 1, false, 25_00);
        let mut changes = BalanceChanges::new();

        assert_eq!(account.distribute(1_000, &mut changes), 1_000);
        assert_eq!(changes[&address(1)], 750);
        assert_eq!(changes[&address(2)], 250);
    }

    #[test]
    fn test_sole_founder_gets_everything() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let accounts = vec![expanded(1, 1, 0, true, 0)];

        distribute_block_reward(&mut repository, &settings, &accounts, 5 * MULTIPLIER, 2).unwrap();
        assert_eq!(native(&repository, 1), 5 * MULTIPLIER);
    }

    #[test]
    fn test_founder_absorbs_leftover() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        // Level 1 falls in the first bin (5%)
        let accounts = vec![expanded(1, 1, 0, true, 0), expanded(2, 2, 1, false, 0)];

        distribute_block_reward(&mut repository, &settings, &accounts, 100 * MULTIPLIER, 2).unwrap();
        assert_eq!(native(&repository, 2), 5 * MULTIPLIER);
        assert_eq!(native(&repository, 1), 95 * MULTIPLIER);
    }

    #[test]
    fn test_bins_scale_up_without_founders() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        // 5% and 15% bins scale to 25% and 75%
        let accounts = vec![expanded(1, 1, 1, false, 0), expanded(2, 2, 5, false, 0)];

        distribute_block_reward(&mut repository, &settings, &accounts, 100 * MULTIPLIER, 2).unwrap();
        assert_eq!(native(&repository, 1), 25 * MULTIPLIER);
        assert_eq!(native(&repository, 2), 75 * MULTIPLIER);
    }

    #[test]
    fn test_minter_with_two_shares_split_evenly() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let accounts = vec![
            expanded(1, 1, 0, true, 0),
            expanded(1, 3, 0, true, 100_00),
            expanded(2, 2, 0, true, 0),
        ];

        distribute_block_reward(&mut repository, &settings, &accounts, 400, 2).unwrap();
        assert_eq!(native(&repository, 1), 100);
        assert_eq!(native(&repository, 3), 100);
        assert_eq!(native(&repository, 2), 200);
    }

    #[test]
    fn test_negative_amount_undoes_distribution() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let accounts = vec![expanded(1, 1, 0, true, 0), expanded(2, 4, 3, false, 40_00)];

        distribute_block_reward(&mut repository, &settings, &accounts, 123_456_789, 2).unwrap();
        distribute_block_reward(&mut repository, &settings, &accounts, -123_456_789, 2).unwrap();

        for seed in [1, 2, 4] {
            assert_eq!(native(&repository, seed), 0);
        }
    }

    #[test]
    fn test_no_candidates_is_an_error() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let accounts = vec![expanded(1, 1, 0, false, 0)];

        let result = distribute_block_reward(&mut repository, &settings, &accounts, 100, 7);
        assert!(matches!(result, Err(ChainError::NoRewardShares(7))));
    }

    #[test]
    fn test_legacy_holders_take_fixed_share() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        repository
            .set_balances(&[AccountBalance {
                address: address(9),
                asset_id: LEGACY_ASSET,
                amount: 1_000_000 * MULTIPLIER,
            }])
            .unwrap();
        let accounts = vec![expanded(1, 1, 0, true, 0)];

        distribute_block_reward(&mut repository, &settings, &accounts, 100 * MULTIPLIER, 2).unwrap();
        assert_eq!(native(&repository, 9), 20 * MULTIPLIER);
        assert_eq!(native(&repository, 1), 80 * MULTIPLIER);
    }
}
