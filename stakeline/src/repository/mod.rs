// Copyright (c) 2024 Botho Foundation

//! Storage surfaces consumed by block processing.
//!
//! Persistence itself belongs to the node. The traits are grouped by concern
//! and combined into [`Repository`], which adds savepoints and commits.
//! [`MemoryRepository`] is a complete in-memory implementation.

mod memory;

pub use memory::MemoryRepository;

use crate::account::{AccountData, Address, RewardShareData};
use crate::block::BlockData;
use crate::contract::{ContractData, ContractStateData};
use crate::transaction::{ApprovalStatus, TransactionData};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No savepoint to roll back to")]
    NoSavepoint,

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A signed change (or absolute value, for [`AccountStore::set_balances`]) to one asset balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountBalance {
    pub address: Address,
    pub asset_id: i64,
    pub amount: i64,
}

/// An account still migrating balance from the predecessor ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHolder {
    pub address: Address,
    pub legacy_balance: i64,
    pub migrated_balance: i64,
    /// Amount credited by the block that completed this holder's migration
    pub final_migration: Option<i64>,
    pub final_block_height: Option<u32>,
}

/// Marker left when a legacy holder's migration cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalMigration {
    pub address: Address,
    pub amount: i64,
    pub height: u32,
}

/// Location of a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTransaction {
    pub height: u32,
    pub sequence: u32,
    pub signature: Vec<u8>,
}

pub trait BlockStore {
    fn chain_height(&self) -> RepositoryResult<u32>;

    fn block_at_height(&self, height: u32) -> RepositoryResult<Option<BlockData>>;

    fn block_by_signature(&self, signature: &[u8]) -> RepositoryResult<Option<BlockData>>;

    /// The stored block whose reference is `reference`, i.e. the child of that block.
    fn block_by_reference(&self, reference: &[u8]) -> RepositoryResult<Option<BlockData>>;

    fn last_block(&self) -> RepositoryResult<Option<BlockData>>;

    fn save_block(&mut self, block: &BlockData) -> RepositoryResult<()>;

    fn delete_block(&mut self, signature: &[u8]) -> RepositoryResult<()>;

    fn save_block_transaction(
        &mut self,
        block_signature: &[u8],
        sequence: u32,
        transaction_signature: &[u8],
    ) -> RepositoryResult<()>;

    fn delete_block_transaction(&mut self, block_signature: &[u8], sequence: u32) -> RepositoryResult<()>;

    /// Transactions linked to a block, in sequence order.
    fn block_transactions(&self, block_signature: &[u8]) -> RepositoryResult<Vec<TransactionData>>;

    /// Lowest block at or above `from_height` whose parent is not stored.
    fn detached_block(&self, from_height: u32) -> RepositoryResult<Option<BlockData>>;
}

pub trait TransactionStore {
    fn transaction(&self, signature: &[u8]) -> RepositoryResult<Option<TransactionData>>;

    /// Whether the transaction is linked into a block.
    fn is_confirmed(&self, signature: &[u8]) -> RepositoryResult<bool>;

    fn save_transaction(&mut self, transaction: &TransactionData) -> RepositoryResult<()>;

    fn delete_transaction(&mut self, signature: &[u8]) -> RepositoryResult<()>;

    /// Remove from the unconfirmed pool.
    fn confirm_transaction(&mut self, signature: &[u8]) -> RepositoryResult<()>;

    /// Return to the unconfirmed pool.
    fn unconfirm_transaction(&mut self, transaction: &TransactionData) -> RepositoryResult<()>;

    fn update_block_height(&mut self, signature: &[u8], height: Option<u32>) -> RepositoryResult<()>;

    fn transaction_at(&self, height: u32, sequence: u32) -> RepositoryResult<Option<TransactionData>>;

    fn save_participants(&mut self, transaction: &TransactionData, participants: &[Address]) -> RepositoryResult<()>;

    fn delete_participants(&mut self, transaction: &TransactionData) -> RepositoryResult<()>;

    /// Pending transactions whose approval window has closed by `height`.
    fn approval_expiring(&self, height: u32) -> RepositoryResult<Vec<TransactionData>>;

    /// Pending transactions whose approval window is open at `height`.
    fn approval_pending(&self, height: u32) -> RepositoryResult<Vec<TransactionData>>;

    /// Transactions whose approval was decided at `height`.
    fn approval_decided_at(&self, height: u32) -> RepositoryResult<Vec<TransactionData>>;

    fn update_approval(
        &mut self,
        signature: &[u8],
        status: ApprovalStatus,
        approval_height: Option<u32>,
    ) -> RepositoryResult<()>;
}

pub trait AccountStore {
    fn account(&self, address: &Address) -> RepositoryResult<Option<AccountData>>;

    fn save_account(&mut self, account: &AccountData) -> RepositoryResult<()>;

    fn reward_share(&self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<Option<RewardShareData>>;

    fn reward_share_index(&self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<Option<u32>>;

    /// `None` if any index is unknown.
    fn reward_shares_by_indexes(&self, indexes: &[u32]) -> RepositoryResult<Option<Vec<RewardShareData>>>;

    fn save_reward_share(&mut self, reward_share: &RewardShareData) -> RepositoryResult<()>;

    fn delete_reward_share(&mut self, reward_share_public_key: &[u8; 32]) -> RepositoryResult<()>;

    fn modify_minted_block_counts(&mut self, addresses: &[Address], delta: i32) -> RepositoryResult<()>;

    fn set_level(&mut self, address: &Address, level: u32) -> RepositoryResult<()>;

    fn balance(&self, address: &Address, asset_id: i64) -> RepositoryResult<i64>;

    /// Apply signed deltas as one batch.
    fn modify_balances(&mut self, deltas: &[AccountBalance]) -> RepositoryResult<()>;

    fn set_balances(&mut self, balances: &[AccountBalance]) -> RepositoryResult<()>;

    fn last_reference(&self, address: &Address) -> RepositoryResult<Option<Vec<u8>>>;

    fn set_last_reference(&mut self, address: &Address, reference: Option<Vec<u8>>) -> RepositoryResult<()>;

    /// Holders with a legacy balance that have not finished migrating, plus, when orphaning
    /// (`orphan_height` set), those that finished at or above that height.
    fn eligible_legacy_holders(&self, orphan_height: Option<u32>) -> RepositoryResult<Vec<LegacyHolder>>;

    fn save_final_migration(&mut self, migration: &FinalMigration) -> RepositoryResult<()>;

    fn delete_final_migration(&mut self, address: &Address) -> RepositoryResult<()>;

    /// Drop empty balances and other debris left by orphaning.
    fn tidy(&mut self) -> RepositoryResult<()>;
}

pub trait ContractStore {
    /// Unfinished contracts that are awake at `height`, oldest first.
    fn executable_contracts(&self, height: u32) -> RepositoryResult<Vec<ContractData>>;

    fn contract(&self, address: &Address) -> RepositoryResult<Option<ContractData>>;

    fn save_contract(&mut self, contract: &ContractData) -> RepositoryResult<()>;

    /// Remove a contract and all its states.
    fn delete_contract(&mut self, address: &Address) -> RepositoryResult<()>;

    fn contract_creation_height(&self, address: &Address) -> RepositoryResult<Option<u32>>;

    fn latest_contract_state(&self, address: &Address) -> RepositoryResult<Option<ContractStateData>>;

    /// States produced at `height`, in contract creation order.
    fn contract_states_at(&self, height: u32) -> RepositoryResult<Vec<ContractStateData>>;

    fn save_contract_state(&mut self, state: &ContractStateData) -> RepositoryResult<()>;

    fn delete_contract_state(&mut self, address: &Address, height: u32) -> RepositoryResult<()>;

    /// First confirmed payment, message or contract transaction to `recipient` at or after
    /// `(height, sequence)`.
    fn next_transaction(
        &self,
        recipient: &Address,
        height: u32,
        sequence: u32,
    ) -> RepositoryResult<Option<NextTransaction>>;
}

pub trait Repository: BlockStore + TransactionStore + AccountStore + ContractStore + Send {
    fn set_savepoint(&mut self) -> RepositoryResult<()>;

    fn rollback_to_savepoint(&mut self) -> RepositoryResult<()>;

    fn save_changes(&mut self) -> RepositoryResult<()>;

    fn discard_changes(&mut self) -> RepositoryResult<()>;
}
