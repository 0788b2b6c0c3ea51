// Copyright (c) 2024 Botho Foundation

//! Applying a block to the chain state and taking it off again.
//!
//! [`Block::orphan`] undoes [`Block::process`] step by step in reverse, so
//! that every balance, level, minted-block count and contract state returns
//! to its exact value from before the block.

use super::validate::short_hex;
use super::{Block, Consensus};
use crate::contract::{self, execute_contracts};
use crate::error::{ChainError, ChainResult};
use crate::levels::{decrease_account_levels, increase_account_levels};
use crate::repository::Repository;
use crate::rewards::{distribute_block_reward, ExpandedAccount};
use crate::transaction::{ApprovalStatus, TransactionData, TransactionType};
use stk_util_amounts::pretty_amount;
use tracing::{debug, trace};

/// Apply one transaction's type-specific effects, deploying contracts as needed.
pub(crate) fn process_transaction(
    repository: &mut dyn Repository,
    consensus: &Consensus,
    transaction: &TransactionData,
) -> ChainResult<()> {
    consensus.handler.process(repository, transaction)?;

    if transaction.tx_type == TransactionType::DeployContract {
        contract::deploy(repository, &consensus.settings, consensus.interpreter.as_ref(), transaction)?;
    }
    Ok(())
}

/// Undo [`process_transaction`].
pub(crate) fn orphan_transaction(
    repository: &mut dyn Repository,
    consensus: &Consensus,
    transaction: &TransactionData,
) -> ChainResult<()> {
    if transaction.tx_type == TransactionType::DeployContract {
        contract::undeploy(repository, transaction)?;
    }

    consensus.handler.orphan(repository, transaction)?;
    Ok(())
}

fn block_reward(consensus: &Consensus, height: u32, total_fees: i64) -> i64 {
    consensus.settings.reward_at_height(height) + total_fees
}

impl Block {
    /// Apply this block on top of the current chain tip.
    ///
    /// Call only after [`Block::is_valid`] accepted the block (or for the
    /// genesis block). An error part-way through leaves the repository
    /// inconsistent; callers must discard uncommitted changes.
    pub fn process(&mut self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<()> {
        let chain_height = repository.chain_height()?;
        let height = chain_height + 1;
        self.data.height = Some(height);

        trace!(height, "Processing block");

        if self.transactions.is_none() {
            self.transactions = Some(Vec::new());
        }

        if self.local_contracts.is_none() && !self.is_genesis {
            let run = execute_contracts(
                &*repository,
                &consensus.settings,
                consensus.interpreter.as_ref(),
                height,
                self.data.timestamp,
            )?;
            self.adopt_contract_run(run, consensus);
        }

        if height > 1 {
            let mut accounts = self.expanded_accounts(&*repository)?;
            increase_account_levels(repository, &consensus.settings, &mut accounts)?;
            self.store_expanded_accounts(accounts.clone());

            self.process_block_rewards(repository, consensus, &accounts, height)?;

            if consensus.patch.applies_at(height) {
                consensus.patch.apply(repository)?;
            }
        }

        self.process_transactions(repository, consensus)?;

        process_group_approvals(repository, consensus, height)?;

        self.process_contract_states(repository)?;

        if let Some(parent) = repository.block_at_height(chain_height)? {
            self.data.reference = parent.signature();
        }

        repository.save_block(&self.data)?;

        self.link_transactions(repository, consensus, height)?;

        repository.tidy()?;

        consensus
            .online_accounts
            .push_latest_block(self.valid_online_accounts.clone().unwrap_or_default());

        debug!(
            height,
            signature = %short_hex(&self.signature()),
            transactions = self.transactions().len(),
            contracts = self.data.contract_count,
            "Processed block"
        );
        Ok(())
    }

    fn process_block_rewards(
        &self,
        repository: &mut dyn Repository,
        consensus: &Consensus,
        accounts: &[ExpandedAccount],
        height: u32,
    ) -> ChainResult<()> {
        let reward = block_reward(consensus, height, self.data.total_fees);
        if reward <= 0 {
            return Ok(());
        }

        trace!(height, reward = %pretty_amount(reward), "Distributing block reward");
        distribute_block_reward(repository, &consensus.settings, accounts, reward, height)
    }

    fn process_transactions(&self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<()> {
        for transaction in self.transactions() {
            // Contract transactions are generated here; others may not have reached this node's pool
            if transaction.is_contract() || repository.transaction(transaction.signature())?.is_none() {
                repository.save_transaction(transaction)?;
            }

            // Group-approval transactions are dealt with once decided
            if transaction.approval_status == ApprovalStatus::NotRequired {
                process_transaction(repository, consensus, transaction)?;
            }

            consensus
                .handler
                .process_references_and_fees(repository, transaction)?;
        }
        Ok(())
    }

    fn process_contract_states(&self, repository: &mut dyn Repository) -> ChainResult<()> {
        let Some(run) = &self.local_contracts else {
            return Ok(());
        };

        for state in &run.states {
            contract::apply_state(repository, state)?;
        }
        Ok(())
    }

    fn link_transactions(&mut self, repository: &mut dyn Repository, consensus: &Consensus, height: u32) -> ChainResult<()> {
        let signature = self.signature();
        let transactions = self.transactions.get_or_insert_with(Vec::new);

        for (sequence, transaction) in transactions.iter_mut().enumerate() {
            let sequence = sequence as u32;
            repository.save_block_transaction(&signature, sequence, transaction.signature())?;

            repository.update_block_height(transaction.signature(), Some(height))?;
            transaction.block_height = Some(height);

            repository.confirm_transaction(transaction.signature())?;

            let participants = consensus.handler.involved_addresses(transaction);
            repository.save_participants(transaction, &participants)?;
        }
        Ok(())
    }

    /// Take this block, the current chain tip, off the chain.
    pub fn orphan(&mut self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<()> {
        let height = self.data.height.ok_or(ChainError::MissingHeight)?;
        let signature = self.signature();

        trace!(height, "Orphaning block");

        // Includes initial states of contracts deployed at this height
        for state in repository.contract_states_at(height)? {
            contract::revert_state(repository, &state, height)?;
        }

        self.orphan_transactions(repository, consensus, &signature)?;

        orphan_group_approvals(repository, consensus, height)?;

        if height > 1 {
            // Orphaned transactions may have changed the accounts behind the online reward-shares
            self.invalidate_expanded_accounts();

            if consensus.patch.applies_at(height) {
                consensus.patch.revert(repository)?;
            }

            let mut accounts = self.expanded_accounts(&*repository)?;

            let reward = block_reward(consensus, height, self.data.total_fees);
            if reward > 0 {
                trace!(height, reward = %pretty_amount(reward), "Undoing block reward");
                distribute_block_reward(repository, &consensus.settings, &accounts, -reward, height)?;
            }

            decrease_account_levels(repository, &consensus.settings, &mut accounts)?;
            self.invalidate_expanded_accounts();
        }

        repository.delete_block(&signature)?;
        self.data.height = None;

        repository.tidy()?;

        consensus.online_accounts.pop_latest_block();

        debug!(height, signature = %short_hex(&signature), "Orphaned block");
        Ok(())
    }

    fn orphan_transactions(
        &mut self,
        repository: &mut dyn Repository,
        consensus: &Consensus,
        signature: &[u8],
    ) -> ChainResult<()> {
        let transactions = self.load_transactions(&*repository)?.to_vec();

        for (sequence, transaction) in transactions.iter().enumerate().rev() {
            if transaction.approval_status == ApprovalStatus::NotRequired {
                orphan_transaction(repository, consensus, transaction)?;
            }

            consensus
                .handler
                .orphan_references_and_fees(repository, transaction)?;

            repository.delete_block_transaction(signature, sequence as u32)?;

            if transaction.is_contract() {
                repository.delete_transaction(transaction.signature())?;
            } else {
                repository.unconfirm_transaction(transaction)?;
                repository.update_block_height(transaction.signature(), None)?;
            }

            repository.delete_participants(transaction)?;
        }

        if let Some(held) = self.transactions.as_mut() {
            held.retain(|tx| !tx.is_contract());
            for transaction in held.iter_mut() {
                transaction.block_height = None;
            }
        }
        self.local_contracts = None;
        Ok(())
    }
}

/// Settle group approvals whose window closes or whose decision arrives at `height`.
fn process_group_approvals(repository: &mut dyn Repository, consensus: &Consensus, height: u32) -> ChainResult<()> {
    for transaction in repository.approval_expiring(height)? {
        trace!(transaction = %short_hex(transaction.signature()), height, "Group approval expired");
        repository.update_approval(transaction.signature(), ApprovalStatus::Expired, Some(height))?;
    }

    for mut transaction in repository.approval_pending(height)? {
        let Some(approved) = consensus.handler.approval_decision(&*repository, &transaction)? else {
            continue;
        };

        let status = if !approved {
            ApprovalStatus::Rejected
        } else if !consensus.handler.is_processable(&*repository, &transaction)?.is_valid() {
            ApprovalStatus::Invalid
        } else {
            ApprovalStatus::Approved
        };

        trace!(transaction = %short_hex(transaction.signature()), height, status = ?status, "Group approval decided");
        repository.update_approval(transaction.signature(), status, Some(height))?;

        if status == ApprovalStatus::Approved {
            transaction.approval_status = status;
            transaction.approval_height = Some(height);
            process_transaction(repository, consensus, &transaction)?;
        }
    }
    Ok(())
}

/// Return every transaction decided at `height` to pending, undoing approved ones.
fn orphan_group_approvals(repository: &mut dyn Repository, consensus: &Consensus, height: u32) -> ChainResult<()> {
    for transaction in repository.approval_decided_at(height)? {
        if transaction.approval_status == ApprovalStatus::Approved {
            orphan_transaction(repository, consensus, &transaction)?;
        }
        repository.update_approval(transaction.signature(), ApprovalStatus::Pending, None)?;
    }
    Ok(())
}
