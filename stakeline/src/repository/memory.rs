// Copyright (c) 2024 Botho Foundation

//! In-memory repository.
//!
//! All data lives in one [`MemoryState`]. Savepoints and the last commit are
//! whole-state snapshots, which keeps rollback exact at the cost of cloning.

use super::{
    AccountBalance, AccountStore, BlockStore, ContractStore, FinalMigration, LegacyHolder, NextTransaction,
    Repository, RepositoryError, RepositoryResult, TransactionStore,
};
use crate::account::{AccountData, Address, RewardShareData, LEGACY_ASSET, MIGRATED_ASSET};
use crate::block::BlockData;
use crate::contract::{ContractData, ContractStateData};
use crate::transaction::{ApprovalStatus, Payload, TransactionData};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// Approval window `(min, max)` in blocks for groups without explicit delays.
const DEFAULT_APPROVAL_DELAYS: (u32, u32) = (0, 1440);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Chain blocks by height
    blocks: BTreeMap<u32, BlockData>,
    /// Block signature to (sequence to transaction signature)
    block_transactions: HashMap<Vec<u8>, BTreeMap<u32, Vec<u8>>>,
    transactions: HashMap<Vec<u8>, TransactionData>,
    unconfirmed: BTreeSet<Vec<u8>>,
    participants: HashMap<Vec<u8>, Vec<Address>>,
    accounts: HashMap<Address, AccountData>,
    reward_shares: BTreeMap<[u8; 32], RewardShareData>,
    balances: BTreeMap<(Address, i64), i64>,
    final_migrations: HashMap<Address, FinalMigration>,
    contracts: HashMap<Address, ContractData>,
    contract_states: BTreeMap<(Address, u32), ContractStateData>,
}

impl MemoryState {
    fn account_mut(&mut self, address: &Address) -> &mut AccountData {
        self.accounts
            .entry(*address)
            .or_insert_with(|| AccountData::new(*address))
    }

    fn contracts_by_creation(&self) -> Vec<&ContractData> {
        let mut contracts: Vec<&ContractData> = self.contracts.values().collect();
        contracts.sort_by(|a, b| a.creation.cmp(&b.creation).then_with(|| a.address.cmp(&b.address)));
        contracts
    }

    fn block_signature_at(&self, height: u32) -> Option<Vec<u8>> {
        self.blocks.get(&height).map(BlockData::signature)
    }
}

/// A complete [`Repository`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: MemoryState,
    committed: MemoryState,
    savepoints: Vec<MemoryState>,
    approval_delays: HashMap<i32, (u32, u32)>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks a group's pending transactions wait before approval opens and before they expire.
    pub fn set_group_approval_delays(&mut self, group_id: i32, min_block_delay: u32, max_block_delay: u32) {
        self.approval_delays
            .insert(group_id, (min_block_delay, max_block_delay));
    }

    /// Transactions in the unconfirmed pool, oldest first.
    pub fn unconfirmed_transactions(&self) -> Vec<TransactionData> {
        let mut transactions: Vec<TransactionData> = self
            .state
            .unconfirmed
            .iter()
            .filter_map(|signature| self.state.transactions.get(signature).cloned())
            .collect();
        transactions.sort_by_key(|tx| tx.timestamp);
        transactions
    }

    pub fn participants(&self, signature: &[u8]) -> Option<&[Address]> {
        self.state.participants.get(signature).map(Vec::as_slice)
    }

    pub fn final_migration(&self, address: &Address) -> Option<FinalMigration> {
        self.state.final_migrations.get(address).copied()
    }

    fn approval_delays(&self, group_id: i32) -> (u32, u32) {
        self.approval_delays
            .get(&group_id)
            .copied()
            .unwrap_or(DEFAULT_APPROVAL_DELAYS)
    }

    fn pending_approval(&self) -> impl Iterator<Item = &TransactionData> {
        self.state
            .transactions
            .values()
            .filter(|tx| tx.approval_status == ApprovalStatus::Pending)
    }

    fn sorted(mut transactions: Vec<TransactionData>) -> Vec<TransactionData> {
        transactions.sort_by(|a, b| {
            a.block_height
                .cmp(&b.block_height)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.signature().cmp(b.signature()))
        });
        transactions
    }
}

fn recipient_of(transaction: &TransactionData) -> Option<&Address> {
    match &transaction.payload {
        Payload::Payment { recipient, .. } => Some(recipient),
        Payload::Message {
            recipient: Some(recipient),
            ..
        } => Some(recipient),
        Payload::Contract { recipient, .. } => Some(recipient),
        _ => None,
    }
}

impl BlockStore for MemoryRepository {
    fn chain_height(&self) -> RepositoryResult<u32> {
        Ok(self
            .state
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn block_at_height(&self, height: u32) -> RepositoryResult<Option<BlockData>> {
        Ok(self.state.blocks.get(&height).cloned())
    }

    fn block_by_signature(&self, signature: &[u8]) -> RepositoryResult<Option<BlockData>> {
        Ok(self
            .state
            .blocks
            .values()
            .find(|block| block.signature() == signature)
            .cloned())
    }

    fn block_by_reference(&self, reference: &[u8]) -> RepositoryResult<Option<BlockData>> {
        Ok(self
            .state
            .blocks
            .values()
            .find(|block| block.reference == reference)
            .cloned())
    }

    fn last_block(&self) -> RepositoryResult<Option<BlockData>> {
        Ok(self
            .state
            .blocks
            .values()
            .next_back()
            .cloned())
    }

    fn save_block(&mut self, block: &BlockData) -> RepositoryResult<()> {
        let height = block
            .height
            .ok_or_else(|| RepositoryError::Conflict("block has no height".to_string()))?;
        self.state.blocks.insert(height, block.clone());
        Ok(())
    }

    fn delete_block(&mut self, signature: &[u8]) -> RepositoryResult<()> {
        let height = self
            .state
            .blocks
            .iter()
            .find(|(_, block)| block.signature() == signature)
            .map(|(height, _)| *height)
            .ok_or_else(|| RepositoryError::NotFound(format!("block {}", hex::encode(signature))))?;

        self.state.blocks.remove(&height);
        self.state.block_transactions.remove(signature);
        Ok(())
    }

    fn save_block_transaction(
        &mut self,
        block_signature: &[u8],
        sequence: u32,
        transaction_signature: &[u8],
    ) -> RepositoryResult<()> {
        self.state
            .block_transactions
            .entry(block_signature.to_vec())
            .or_default()
            .insert(sequence, transaction_signature.to_vec());
        Ok(())
    }

    fn delete_block_transaction(&mut self, block_signature: &[u8], sequence: u32) -> RepositoryResult<()> {
        if let Some(links) = self.state.block_transactions.get_mut(block_signature) {
            links.remove(&sequence);
            if links.is_empty() {
                self.state.block_transactions.remove(block_signature);
            }
        }
        Ok(())
    }

    fn block_transactions(&self, block_signature: &[u8]) -> RepositoryResult<Vec<TransactionData>> {
        let Some(links) = self.state.block_transactions.get(block_signature) else {
            return Ok(Vec::new());
        };

        links
            .values()
            .map(|signature| {
                self.state
                    .transactions
                    .get(signature)
                    .cloned()
                    .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", hex::encode(signature))))
            })
            .collect()
    }

    fn detached_block(&self, from_height: u32) -> RepositoryResult<Option<BlockData>> {
        Ok(self
            .state
            .blocks
            .range(from_height.max(2)..)
            .map(|(_, block)| block)
            .find(|block| {
                !self
                    .state
                    .blocks
                    .values()
                    .any(|parent| parent.signature() == block.reference)
            })
            .cloned())
    }
}

impl TransactionStore for MemoryRepository {
    fn transaction(&self, signature: &[u8]) -> RepositoryResult<Option<TransactionData>> {
        Ok(self.state.transactions.get(signature).cloned())
    }

    fn is_confirmed(&self, signature: &[u8]) -> RepositoryResult<bool> {
        Ok(self
            .state
            .transactions
            .get(signature)
            .is_some_and(|tx| tx.block_height.is_some()))
    }

    fn save_transaction(&mut self, transaction: &TransactionData) -> RepositoryResult<()> {
        self.state
            .transactions
            .insert(transaction.signature().to_vec(), transaction.clone());
        Ok(())
    }

    fn delete_transaction(&mut self, signature: &[u8]) -> RepositoryResult<()> {
        self.state.transactions.remove(signature);
        self.state.unconfirmed.remove(signature);
        self.state.participants.remove(signature);
        Ok(())
    }

    fn confirm_transaction(&mut self, signature: &[u8]) -> RepositoryResult<()> {
        self.state.unconfirmed.remove(signature);
        Ok(())
    }

    fn unconfirm_transaction(&mut self, transaction: &TransactionData) -> RepositoryResult<()> {
        let signature = transaction.signature().to_vec();
        let mut transaction = transaction.clone();
        transaction.block_height = None;
        self.state.transactions.insert(signature.clone(), transaction);
        self.state.unconfirmed.insert(signature);
        Ok(())
    }

    fn update_block_height(&mut self, signature: &[u8], height: Option<u32>) -> RepositoryResult<()> {
        let transaction = self
            .state
            .transactions
            .get_mut(signature)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", hex::encode(signature))))?;
        transaction.block_height = height;
        Ok(())
    }

    fn transaction_at(&self, height: u32, sequence: u32) -> RepositoryResult<Option<TransactionData>> {
        let Some(block_signature) = self.state.block_signature_at(height) else {
            return Ok(None);
        };

        Ok(self
            .state
            .block_transactions
            .get(&block_signature)
            .and_then(|links| links.get(&sequence))
            .and_then(|signature| self.state.transactions.get(signature))
            .cloned())
    }

    fn save_participants(&mut self, transaction: &TransactionData, participants: &[Address]) -> RepositoryResult<()> {
        self.state
            .participants
            .insert(transaction.signature().to_vec(), participants.to_vec());
        Ok(())
    }

    fn delete_participants(&mut self, transaction: &TransactionData) -> RepositoryResult<()> {
        self.state.participants.remove(transaction.signature());
        Ok(())
    }

    fn approval_expiring(&self, height: u32) -> RepositoryResult<Vec<TransactionData>> {
        let expiring = self
            .pending_approval()
            .filter(|tx| {
                let (_, max_delay) = self.approval_delays(tx.group_id);
                tx.block_height
                    .is_some_and(|included| included.saturating_add(max_delay) < height)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(expiring))
    }

    fn approval_pending(&self, height: u32) -> RepositoryResult<Vec<TransactionData>> {
        let pending = self
            .pending_approval()
            .filter(|tx| {
                let (min_delay, _) = self.approval_delays(tx.group_id);
                tx.block_height
                    .is_some_and(|included| included.saturating_add(min_delay) <= height)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(pending))
    }

    fn approval_decided_at(&self, height: u32) -> RepositoryResult<Vec<TransactionData>> {
        let decided = self
            .state
            .transactions
            .values()
            .filter(|tx| tx.approval_height == Some(height))
            .cloned()
            .collect();
        Ok(Self::sorted(decided))
    }

    fn update_approval(
        &mut self,
        signature: &[u8],
        status: ApprovalStatus,
        approval_height: Option<u32>,
    ) -> RepositoryResult<()> {
        let transaction = self
            .state
            .transactions
            .get_mut(signature)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", hex::encode(signature))))?;
        transaction.approval_status = status;
        transaction.approval_height = approval_height;
        Ok(())
    }
}

impl AccountStore for MemoryRepository {
    fn account(&self, address: &Address) -> RepositoryResult<Option<AccountData>> {
        Ok(self.state.accounts.get(address).cloned())
    }

    fn save_account(&mut self, account: &AccountData) -> RepositoryResult<()> {
        self.state.accounts.insert(account.address, account.clone());
        Ok(())
    }

    fn reward_share(&self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<Option<RewardShareData>> {
        Ok(self.state.reward_shares.get(reward_share_public_key).cloned())
    }

    fn reward_share_index(&self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<Option<u32>> {
        Ok(self
            .state
            .reward_shares
            .keys()
            .position(|key| key == reward_share_public_key)
            .map(|index| index as u32))
    }

    fn reward_shares_by_indexes(&self, indexes: &[u32]) -> RepositoryResult<Option<Vec<RewardShareData>>> {
        let all: Vec<&RewardShareData> = self.state.reward_shares.values().collect();

        Ok(indexes
            .iter()
            .map(|index| all.get(*index as usize).map(|share| (*share).clone()))
            .collect())
    }

    fn save_reward_share(&mut self, reward_share: &RewardShareData) -> RepositoryResult<()> {
        self.state
            .reward_shares
            .insert(reward_share.reward_share_public_key, reward_share.clone());
        Ok(())
    }

    fn delete_reward_share(&mut self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<()> {
        self.state.reward_shares.remove(reward_share_public_key);
        Ok(())
    }

    fn modify_minted_block_counts(&mut self, addresses: &[Address], delta: i32) -> RepositoryResult<()> {
        for address in addresses {
            let account = self.state.account_mut(address);
            account.blocks_minted = account
                .blocks_minted
                .checked_add(delta)
                .ok_or_else(|| RepositoryError::Conflict(format!("minted block count overflow for {address}")))?;
        }
        Ok(())
    }

    fn set_level(&mut self, address: &Address, level: u32) -> RepositoryResult<()> {
        self.state.account_mut(address).level = level;
        Ok(())
    }

    fn balance(&self, address: &Address, asset_id: i64) -> RepositoryResult<i64> {
        Ok(self
            .state
            .balances
            .get(&(*address, asset_id))
            .copied()
            .unwrap_or(0))
    }

    fn modify_balances(&mut self, deltas: &[AccountBalance]) -> RepositoryResult<()> {
        // Check the whole batch before touching anything
        let mut updated: BTreeMap<(Address, i64), i64> = BTreeMap::new();
        for delta in deltas {
            let key = (delta.address, delta.asset_id);
            let current = match updated.get(&key) {
                Some(amount) => *amount,
                None => self.state.balances.get(&key).copied().unwrap_or(0),
            };
            let amount = current
                .checked_add(delta.amount)
                .ok_or_else(|| RepositoryError::Conflict(format!("balance overflow for {}", delta.address)))?;
            updated.insert(key, amount);
        }

        for ((address, asset_id), amount) in updated {
            trace!(%address, asset_id, amount, "Balance updated");
            self.state.account_mut(&address);
            self.state.balances.insert((address, asset_id), amount);
        }
        Ok(())
    }

    fn set_balances(&mut self, balances: &[AccountBalance]) -> RepositoryResult<()> {
        for balance in balances {
            self.state.account_mut(&balance.address);
            self.state
                .balances
                .insert((balance.address, balance.asset_id), balance.amount);
        }
        Ok(())
    }

    fn last_reference(&self, address: &Address) -> RepositoryResult<Option<Vec<u8>>> {
        Ok(self
            .state
            .accounts
            .get(address)
            .and_then(|account| account.reference.clone()))
    }

    fn set_last_reference(&mut self, address: &Address, reference: Option<Vec<u8>>) -> RepositoryResult<()> {
        self.state.account_mut(address).reference = reference;
        Ok(())
    }

    fn eligible_legacy_holders(&self, orphan_height: Option<u32>) -> RepositoryResult<Vec<LegacyHolder>> {
        let holders = self
            .state
            .balances
            .iter()
            .filter(|((_, asset_id), amount)| *asset_id == LEGACY_ASSET && **amount > 0)
            .filter_map(|((address, _), legacy_balance)| {
                let final_migration = self.state.final_migrations.get(address);
                let eligible = match (final_migration, orphan_height) {
                    (None, _) => true,
                    (Some(migration), Some(height)) => migration.height >= height,
                    (Some(_), None) => false,
                };

                eligible.then(|| LegacyHolder {
                    address: *address,
                    legacy_balance: *legacy_balance,
                    migrated_balance: self
                        .state
                        .balances
                        .get(&(*address, MIGRATED_ASSET))
                        .copied()
                        .unwrap_or(0),
                    final_migration: final_migration.map(|migration| migration.amount),
                    final_block_height: final_migration.map(|migration| migration.height),
                })
            })
            .collect();
        Ok(holders)
    }

    fn save_final_migration(&mut self, migration: &FinalMigration) -> RepositoryResult<()> {
        self.state
            .final_migrations
            .insert(migration.address, *migration);
        Ok(())
    }

    fn delete_final_migration(&mut self, address: &Address) -> RepositoryResult<()> {
        self.state.final_migrations.remove(address);
        Ok(())
    }

    fn tidy(&mut self) -> RepositoryResult<()> {
        self.state.balances.retain(|_, amount| *amount != 0);
        Ok(())
    }
}

impl ContractStore for MemoryRepository {
    fn executable_contracts(&self, height: u32) -> RepositoryResult<Vec<ContractData>> {
        Ok(self
            .state
            .contracts_by_creation()
            .into_iter()
            .filter(|contract| contract.is_executable_at(height))
            .cloned()
            .collect())
    }

    fn contract(&self, address: &Address) -> RepositoryResult<Option<ContractData>> {
        Ok(self.state.contracts.get(address).cloned())
    }

    fn save_contract(&mut self, contract: &ContractData) -> RepositoryResult<()> {
        self.state.contracts.insert(contract.address, contract.clone());
        Ok(())
    }

    fn delete_contract(&mut self, address: &Address) -> RepositoryResult<()> {
        self.state.contracts.remove(address);
        self.state
            .contract_states
            .retain(|(state_address, _), _| state_address != address);
        Ok(())
    }

    fn contract_creation_height(&self, address: &Address) -> RepositoryResult<Option<u32>> {
        Ok(self
            .state
            .contract_states
            .range((*address, 0)..=(*address, u32::MAX))
            .find(|(_, state)| state.is_initial)
            .map(|((_, height), _)| *height))
    }

    fn latest_contract_state(&self, address: &Address) -> RepositoryResult<Option<ContractStateData>> {
        Ok(self
            .state
            .contract_states
            .range((*address, 0)..=(*address, u32::MAX))
            .next_back()
            .map(|(_, state)| state.clone()))
    }

    fn contract_states_at(&self, height: u32) -> RepositoryResult<Vec<ContractStateData>> {
        Ok(self
            .state
            .contracts_by_creation()
            .into_iter()
            .filter_map(|contract| self.state.contract_states.get(&(contract.address, height)))
            .cloned()
            .collect())
    }

    fn save_contract_state(&mut self, state: &ContractStateData) -> RepositoryResult<()> {
        self.state
            .contract_states
            .insert((state.address, state.height), state.clone());
        Ok(())
    }

    fn delete_contract_state(&mut self, address: &Address, height: u32) -> RepositoryResult<()> {
        self.state.contract_states.remove(&(*address, height));
        Ok(())
    }

    fn next_transaction(
        &self,
        recipient: &Address,
        height: u32,
        sequence: u32,
    ) -> RepositoryResult<Option<NextTransaction>> {
        for (block_height, block) in self.state.blocks.range(height..) {
            let Some(links) = self.state.block_transactions.get(&block.signature()) else {
                continue;
            };
            let first = if *block_height == height { sequence } else { 0 };

            for (link_sequence, signature) in links.range(first..) {
                let matches = self
                    .state
                    .transactions
                    .get(signature)
                    .and_then(recipient_of)
                    .is_some_and(|address| address == recipient);
                if matches {
                    return Ok(Some(NextTransaction {
                        height: *block_height,
                        sequence: *link_sequence,
                        signature: signature.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }
}

impl Repository for MemoryRepository {
    fn set_savepoint(&mut self) -> RepositoryResult<()> {
        self.savepoints.push(self.state.clone());
        Ok(())
    }

    fn rollback_to_savepoint(&mut self) -> RepositoryResult<()> {
        self.state = self.savepoints.pop().ok_or(RepositoryError::NoSavepoint)?;
        Ok(())
    }

    fn save_changes(&mut self) -> RepositoryResult<()> {
        self.committed = self.state.clone();
        self.savepoints.clear();
        Ok(())
    }

    fn discard_changes(&mut self) -> RepositoryResult<()> {
        self.state = self.committed.clone();
        self.savepoints.clear();
        Ok(())
    }
}
