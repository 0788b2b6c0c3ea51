// Copyright (c) 2024 Botho Foundation

//! Block validation.
//!
//! Checks run in a fixed order and stop at the first failure. Validation
//! never leaves changes behind: transactions are test-processed under a
//! savepoint that is always rolled back.

use super::online::{self, OnlineAccountData, ONLINE_TIMESTAMP_MODULUS, SIGNATURE_LENGTH};
use super::{process, Block, Consensus};
use crate::account::reward_share_effective_minting_level;
use crate::contract::execute_contracts;
use crate::error::{ChainError, ChainResult};
use crate::repository::Repository;
use crate::transaction::{ApprovalStatus, TransactionData, TransactionError, TransactionHandler, TransactionVerdict};
use std::fmt;
use stk_consensus_weight::{calc_minimum_timestamp, calc_timestamp};
use tracing::{debug, error};

/// Consensus verdict on a block. Codes are stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationResult {
    Ok,
    ReferenceMissing,
    ParentDoesNotExist,
    BlockchainNotEmpty,
    ParentHasExistingChild,
    TimestampOlderThanParent,
    TimestampInFuture,
    TimestampMsIncorrect,
    TimestampTooSoon,
    TimestampIncorrect,
    VersionIncorrect,
    FeatureNotYetReleased,
    MinterNotAccepted,
    GenesisTransactionsInvalid,
    TransactionTimestampInvalid,
    TransactionInvalid,
    TransactionProcessingFailed,
    TransactionAlreadyProcessed,
    TransactionNeedsApproval,
    ContractStatesMismatch,
    OnlineAccountsInvalid,
    OnlineAccountUnknown,
    OnlineAccountSignaturesMissing,
    OnlineAccountSignaturesMalformed,
    OnlineAccountSignatureIncorrect,
}

impl ValidationResult {
    const ALL: [ValidationResult; 25] = [
        Self::Ok,
        Self::ReferenceMissing,
        Self::ParentDoesNotExist,
        Self::BlockchainNotEmpty,
        Self::ParentHasExistingChild,
        Self::TimestampOlderThanParent,
        Self::TimestampInFuture,
        Self::TimestampMsIncorrect,
        Self::TimestampTooSoon,
        Self::TimestampIncorrect,
        Self::VersionIncorrect,
        Self::FeatureNotYetReleased,
        Self::MinterNotAccepted,
        Self::GenesisTransactionsInvalid,
        Self::TransactionTimestampInvalid,
        Self::TransactionInvalid,
        Self::TransactionProcessingFailed,
        Self::TransactionAlreadyProcessed,
        Self::TransactionNeedsApproval,
        Self::ContractStatesMismatch,
        Self::OnlineAccountsInvalid,
        Self::OnlineAccountUnknown,
        Self::OnlineAccountSignaturesMissing,
        Self::OnlineAccountSignaturesMalformed,
        Self::OnlineAccountSignatureIncorrect,
    ];

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Stable numeric code.
    pub fn value(self) -> i32 {
        match self {
            Self::Ok => 1,
            Self::ReferenceMissing => 10,
            Self::ParentDoesNotExist => 11,
            Self::BlockchainNotEmpty => 12,
            Self::ParentHasExistingChild => 13,
            Self::TimestampOlderThanParent => 20,
            Self::TimestampInFuture => 21,
            Self::TimestampMsIncorrect => 22,
            Self::TimestampTooSoon => 23,
            Self::TimestampIncorrect => 24,
            Self::VersionIncorrect => 30,
            Self::FeatureNotYetReleased => 31,
            Self::MinterNotAccepted => 41,
            Self::GenesisTransactionsInvalid => 50,
            Self::TransactionTimestampInvalid => 51,
            Self::TransactionInvalid => 52,
            Self::TransactionProcessingFailed => 53,
            Self::TransactionAlreadyProcessed => 54,
            Self::TransactionNeedsApproval => 55,
            Self::ContractStatesMismatch => 61,
            Self::OnlineAccountsInvalid => 70,
            Self::OnlineAccountUnknown => 71,
            Self::OnlineAccountSignaturesMissing => 72,
            Self::OnlineAccountSignaturesMalformed => 73,
            Self::OnlineAccountSignatureIncorrect => 74,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|result| result.value() == value)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::ReferenceMissing => write!(f, "Reference missing"),
            Self::ParentDoesNotExist => write!(f, "Parent block does not exist"),
            Self::BlockchainNotEmpty => write!(f, "Blockchain not empty"),
            Self::ParentHasExistingChild => write!(f, "Parent already has a child block"),
            Self::TimestampOlderThanParent => write!(f, "Timestamp older than parent"),
            Self::TimestampInFuture => write!(f, "Timestamp in the future"),
            Self::TimestampMsIncorrect => write!(f, "Timestamp milliseconds incorrect"),
            Self::TimestampTooSoon => write!(f, "Timestamp too soon after parent"),
            Self::TimestampIncorrect => write!(f, "Timestamp incorrect for minter"),
            Self::VersionIncorrect => write!(f, "Version incorrect"),
            Self::FeatureNotYetReleased => write!(f, "Feature not yet released"),
            Self::MinterNotAccepted => write!(f, "Minter not accepted"),
            Self::GenesisTransactionsInvalid => write!(f, "Genesis transactions not allowed"),
            Self::TransactionTimestampInvalid => write!(f, "Transaction timestamp invalid"),
            Self::TransactionInvalid => write!(f, "Transaction invalid"),
            Self::TransactionProcessingFailed => write!(f, "Transaction processing failed"),
            Self::TransactionAlreadyProcessed => write!(f, "Transaction already processed"),
            Self::TransactionNeedsApproval => write!(f, "Transaction needs approval"),
            Self::ContractStatesMismatch => write!(f, "Contract states mismatch"),
            Self::OnlineAccountsInvalid => write!(f, "Online accounts invalid"),
            Self::OnlineAccountUnknown => write!(f, "Online account unknown"),
            Self::OnlineAccountSignaturesMissing => write!(f, "Online account signatures missing"),
            Self::OnlineAccountSignaturesMalformed => write!(f, "Online account signatures malformed"),
            Self::OnlineAccountSignatureIncorrect => write!(f, "Online account signature incorrect"),
        }
    }
}

/// Short hex prefix for log fields.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

macro_rules! check {
    ($result:expr) => {
        let result: ValidationResult = $result;
        if !result.is_ok() {
            return Ok(result);
        }
    };
}

impl Block {
    /// Whether this block may extend the chain.
    ///
    /// Errors mean no verdict could be reached, not that the block is invalid.
    pub fn is_valid(&mut self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<ValidationResult> {
        let result = if self.is_genesis {
            self.is_genesis_valid(&*repository, consensus)?
        } else {
            self.check_validity(repository, consensus)?
        };

        if !result.is_ok() {
            debug!(
                result = %result,
                code = result.value(),
                signature = %short_hex(&self.signature()),
                "Block failed validation"
            );
        }
        Ok(result)
    }

    fn check_validity(&mut self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<ValidationResult> {
        if self.data.reference.is_empty() {
            return Ok(ValidationResult::ReferenceMissing);
        }

        let Some(parent) = repository.block_by_signature(&self.data.reference)? else {
            return Ok(ValidationResult::ParentDoesNotExist);
        };
        let parent = Block::stored(parent);
        let parent_height = parent.height().ok_or(ChainError::MissingHeight)?;
        let height = parent_height + 1;

        if repository.block_by_reference(&parent.signature())?.is_some() {
            return Ok(ValidationResult::ParentHasExistingChild);
        }

        if self.data.timestamp <= parent.data.timestamp {
            return Ok(ValidationResult::TimestampOlderThanParent);
        }

        if !consensus.settings.is_test_chain {
            check!(self.is_timestamp_valid(&*repository, consensus)?);
        }

        if self.data.version != parent.next_block_version()? {
            return Ok(ValidationResult::VersionIncorrect);
        }
        if self.data.version < 2 && self.data.contract_count > 0 {
            return Ok(ValidationResult::FeatureNotYetReleased);
        }

        if !self.is_minter_valid(&*repository, consensus)? {
            return Ok(ValidationResult::MinterNotAccepted);
        }

        check!(self.are_online_accounts_valid(&*repository, consensus, height)?);

        check!(self.are_contracts_valid(&*repository, consensus, height)?);

        self.are_transactions_valid(repository, consensus, height)
    }

    /// Timestamp checks against the parent and the minter's level.
    pub fn is_timestamp_valid(&self, repository: &dyn Repository, consensus: &Consensus) -> ChainResult<ValidationResult> {
        let Some(parent) = repository.block_by_signature(&self.data.reference)? else {
            return Ok(ValidationResult::ParentDoesNotExist);
        };
        let parent_height = parent.height.ok_or(ChainError::MissingHeight)?;
        let settings = &consensus.settings;

        if self.data.timestamp <= parent.timestamp {
            return Ok(ValidationResult::TimestampOlderThanParent);
        }

        if self.data.timestamp - settings.block_timestamp_margin > consensus.now() {
            return Ok(ValidationResult::TimestampInFuture);
        }

        let timing = settings
            .block_timing_at_height(parent_height + 1)
            .ok_or(ChainError::MissingBlockTiming(parent_height + 1))?;

        if self.data.timestamp < calc_minimum_timestamp(parent.timestamp, timing) {
            return Ok(ValidationResult::TimestampTooSoon);
        }

        let level = reward_share_effective_minting_level(repository, settings, &self.data.minter_public_key)?;
        if level == 0 {
            return Ok(ValidationResult::MinterNotAccepted);
        }

        let expected = calc_timestamp(
            parent_height,
            &parent.signature(),
            parent.timestamp,
            &self.data.minter_public_key,
            level,
            timing,
        );
        if self.data.timestamp != expected {
            debug!(expected, actual = self.data.timestamp, level, "Block timestamp does not match minter");
            return Ok(ValidationResult::TimestampIncorrect);
        }

        Ok(ValidationResult::Ok)
    }

    fn is_minter_valid(&self, repository: &dyn Repository, consensus: &Consensus) -> ChainResult<bool> {
        let Some(reward_share) = repository.reward_share(&self.data.minter_public_key)? else {
            return Ok(false);
        };
        Ok(repository
            .account(&reward_share.minter)?
            .is_some_and(|account| account.can_mint(&consensus.settings)))
    }

    /// Check the online accounts bitset and, for recent blocks, their timestamp signatures.
    ///
    /// Accounts whose signatures check out are remembered on the block and
    /// handed to the online accounts cache when the block is processed.
    pub fn are_online_accounts_valid(
        &mut self,
        repository: &dyn Repository,
        consensus: &Consensus,
        height: u32,
    ) -> ChainResult<ValidationResult> {
        if height == 1 {
            return Ok(ValidationResult::Ok);
        }

        let Ok(indexes) = online::decode_online_accounts(&self.data.encoded_online_accounts) else {
            return Ok(ValidationResult::OnlineAccountsInvalid);
        };
        if indexes.len() != self.data.online_accounts_count as usize {
            return Ok(ValidationResult::OnlineAccountsInvalid);
        }

        let Some(reward_shares) = repository.reward_shares_by_indexes(&indexes)? else {
            return Ok(ValidationResult::OnlineAccountUnknown);
        };
        self.online_reward_shares = Some(reward_shares.clone());

        let now = consensus.now();
        if self.data.timestamp < now - consensus.settings.online_account_signatures_min_lifetime {
            return Ok(ValidationResult::Ok);
        }

        let Some(signatures) = self.data.online_accounts_signatures.as_ref().filter(|s| !s.is_empty()) else {
            return Ok(ValidationResult::OnlineAccountSignaturesMissing);
        };
        if signatures.len() != reward_shares.len() * SIGNATURE_LENGTH {
            return Ok(ValidationResult::OnlineAccountSignaturesMalformed);
        }
        let Some(online_timestamp) = self.data.online_accounts_timestamp else {
            return Ok(ValidationResult::OnlineAccountsInvalid);
        };

        let mut current = if online_timestamp >= now - ONLINE_TIMESTAMP_MODULUS {
            consensus.online_accounts.current()
        } else {
            Vec::new()
        };
        let latest_block = consensus.online_accounts.latest_block_accounts();

        let mut valid = Vec::with_capacity(reward_shares.len());
        for (reward_share, signature) in reward_shares.iter().zip(online::split_signatures(signatures)) {
            let account = OnlineAccountData::new(
                online_timestamp,
                signature.to_vec(),
                reward_share.reward_share_public_key,
            );

            if let Some(position) = current.iter().position(|known| *known == account) {
                current.swap_remove(position);
            } else if !latest_block.contains(&account) && !account.is_signature_valid() {
                return Ok(ValidationResult::OnlineAccountSignatureIncorrect);
            }

            valid.push(account);
        }

        self.valid_online_accounts = Some(valid);
        Ok(ValidationResult::Ok)
    }

    /// Re-run contracts and compare with the states the block claims.
    fn are_contracts_valid(
        &mut self,
        repository: &dyn Repository,
        consensus: &Consensus,
        height: u32,
    ) -> ChainResult<ValidationResult> {
        if self.contracts_run_locally {
            return Ok(ValidationResult::Ok);
        }

        let run = execute_contracts(
            repository,
            &consensus.settings,
            consensus.interpreter.as_ref(),
            height,
            self.data.timestamp,
        )?;
        self.adopt_contract_run(run, consensus);

        let Some(ours) = self.local_contracts.as_ref() else {
            return Ok(ValidationResult::ContractStatesMismatch);
        };
        let theirs = self.contract_states.as_deref().unwrap_or(&[]);

        if ours.states.len() != self.data.contract_count as usize || ours.fees != self.data.contract_fees {
            return Ok(ValidationResult::ContractStatesMismatch);
        }
        if ours.states.len() != theirs.len() {
            return Ok(ValidationResult::ContractStatesMismatch);
        }

        let mismatch = ours.states.iter().zip(theirs).any(|(ours, theirs)| {
            ours.address != theirs.address || ours.state_hash != theirs.state_hash || ours.fees != theirs.fees
        });
        if mismatch {
            return Ok(ValidationResult::ContractStatesMismatch);
        }

        Ok(ValidationResult::Ok)
    }

    /// Test-process every non-contract transaction under a savepoint that is always rolled back.
    fn are_transactions_valid(
        &mut self,
        repository: &mut dyn Repository,
        consensus: &Consensus,
        height: u32,
    ) -> ChainResult<ValidationResult> {
        repository.set_savepoint()?;

        let result = self.test_process_transactions(repository, consensus, height);

        let rollback = repository.rollback_to_savepoint();
        match (result, rollback) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => {
                error!(error = %e, "Failed to roll back after validating transactions");
                Err(e.into())
            }
            // Rollback failure here most likely comes from the same fault
            (Err(ChainError::Repository(_)), _) => Ok(ValidationResult::TransactionInvalid),
            (Err(e), _) => Err(e),
        }
    }

    fn test_process_transactions(
        &self,
        repository: &mut dyn Repository,
        consensus: &Consensus,
        height: u32,
    ) -> ChainResult<ValidationResult> {
        let handler = consensus.handler.as_ref();

        if consensus.patch.applies_at(height) {
            consensus.patch.apply(repository)?;
        }

        for transaction in self.transactions().iter().filter(|tx| !tx.is_contract()) {
            if transaction.tx_type.is_genesis_only() {
                return Ok(ValidationResult::GenesisTransactionsInvalid);
            }

            if transaction.timestamp > self.data.timestamp
                || transaction.deadline(&consensus.settings) <= self.data.timestamp
            {
                return Ok(ValidationResult::TransactionTimestampInvalid);
            }

            if repository.is_confirmed(transaction.signature())? {
                return Ok(ValidationResult::TransactionAlreadyProcessed);
            }

            match transaction_verdict(handler, &*repository, transaction) {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    debug!(
                        transaction = %short_hex(transaction.signature()),
                        reason = %reason,
                        "Transaction invalid in block"
                    );
                    return Ok(ValidationResult::TransactionInvalid);
                }
                Err(e) => {
                    debug!(transaction = %short_hex(transaction.signature()), error = %e, "Transaction check failed");
                    return Ok(ValidationResult::TransactionInvalid);
                }
            }

            if let Err(e) = test_process_transaction(repository, consensus, transaction) {
                error!(
                    transaction = %short_hex(transaction.signature()),
                    error = %e,
                    "Transaction failed while validating block"
                );
                return Ok(ValidationResult::TransactionProcessingFailed);
            }
        }

        Ok(ValidationResult::Ok)
    }
}

/// Why the transaction cannot go into a block, or `None` if it can.
fn transaction_verdict(
    handler: &dyn TransactionHandler,
    repository: &dyn Repository,
    transaction: &TransactionData,
) -> Result<Option<String>, TransactionError> {
    if !handler.has_valid_reference(repository, transaction)? {
        return Ok(Some("invalid reference".to_string()));
    }
    if let TransactionVerdict::Invalid(reason) = handler.is_valid(repository, transaction)? {
        return Ok(Some(reason));
    }
    if let TransactionVerdict::Invalid(reason) = handler.is_processable(repository, transaction)? {
        return Ok(Some(reason));
    }
    Ok(None)
}

fn test_process_transaction(
    repository: &mut dyn Repository,
    consensus: &Consensus,
    transaction: &TransactionData,
) -> ChainResult<()> {
    if transaction.approval_status == ApprovalStatus::NotRequired {
        process::process_transaction(repository, consensus, transaction)?;
    }
    consensus
        .handler
        .process_references_and_fees(repository, transaction)?;
    Ok(())
}
