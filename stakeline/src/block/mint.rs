// Copyright (c) 2024 Botho Foundation

//! Building new blocks on this node.

use super::online::{encode_online_accounts, OnlineAccountData};
use super::{Block, BlockData, Consensus};
use crate::account::reward_share_effective_minting_level;
use crate::contract::execute_contracts;
use crate::error::{ChainError, ChainResult};
use crate::repository::Repository;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::BTreeMap;
use stk_consensus_weight::calc_timestamp;
use tracing::{debug, error};

fn minting_timestamp(
    repository: &dyn Repository,
    consensus: &Consensus,
    parent: &BlockData,
    minter_public_key: &[u8; 32],
) -> ChainResult<Option<i64>> {
    let parent_height = parent.height.ok_or(ChainError::MissingHeight)?;

    let level = reward_share_effective_minting_level(repository, &consensus.settings, minter_public_key)?;
    if level == 0 {
        error!(minter = %hex::encode(minter_public_key), "Minter effective level is zero");
        return Ok(None);
    }

    let timing = consensus
        .settings
        .block_timing_at_height(parent_height + 1)
        .ok_or(ChainError::MissingBlockTiming(parent_height + 1))?;

    Ok(Some(calc_timestamp(
        parent_height,
        &parent.signature(),
        parent.timestamp,
        minter_public_key,
        level,
        timing,
    )))
}

/// Online accounts at the newest timestamp, keyed by reward-share index.
fn indexed_online_accounts(
    repository: &dyn Repository,
    online_accounts: Vec<OnlineAccountData>,
) -> ChainResult<Option<(i64, BTreeMap<u32, OnlineAccountData>)>> {
    let Some(newest) = online_accounts.iter().map(|account| account.timestamp).max() else {
        return Ok(None);
    };

    let mut indexed = BTreeMap::new();
    for account in online_accounts.into_iter().filter(|account| account.timestamp == newest) {
        // Reward-share may have been cancelled since the account came online
        if let Some(index) = repository.reward_share_index(&account.public_key)? {
            indexed.insert(index, account);
        }
    }

    Ok(Some((newest, indexed)))
}

impl Block {
    /// Mint an unsigned-transactions block on top of `parent` with a reward-share key.
    ///
    /// Contracts are run here. Returns `None` when there are no online
    /// accounts or the key cannot mint. Call [`Block::sign`] before use.
    pub fn mint(
        repository: &dyn Repository,
        consensus: &Consensus,
        parent: &BlockData,
        minter_key: SigningKey,
    ) -> ChainResult<Option<Block>> {
        let parent_height = parent.height.ok_or(ChainError::MissingHeight)?;
        let version = Block::stored(parent.clone()).next_block_version()?;
        let minter_public_key = minter_key.verifying_key().to_bytes();

        let Some((online_timestamp, indexed)) =
            indexed_online_accounts(repository, consensus.online_accounts.current())?
        else {
            error!("No online accounts, not even our own");
            return Ok(None);
        };

        let indexes: Vec<u32> = indexed.keys().copied().collect();
        let encoded_online_accounts = encode_online_accounts(&indexes);
        let signatures: Vec<u8> = indexed
            .values()
            .flat_map(|account| account.signature.iter().copied())
            .collect();

        let Some(timestamp) = minting_timestamp(repository, consensus, parent, &minter_public_key)? else {
            return Ok(None);
        };

        let mut data = BlockData {
            version,
            reference: parent.signature(),
            transaction_count: 0,
            total_fees: 0,
            transactions_signature: None,
            height: None,
            timestamp,
            minter_public_key,
            minter_signature: None,
            contract_count: 0,
            contract_fees: 0,
            encoded_online_accounts,
            online_accounts_count: indexes.len() as u32,
            online_accounts_timestamp: Some(online_timestamp),
            online_accounts_signatures: Some(signatures),
        };
        data.minter_signature = Some(minter_key.sign(&data.minter_signing_bytes()).to_bytes().to_vec());

        let run = execute_contracts(
            repository,
            &consensus.settings,
            consensus.interpreter.as_ref(),
            parent_height + 1,
            timestamp,
        )?;
        data.contract_count = run.states.len() as u32;
        data.contract_fees = run.fees;
        data.total_fees = run.fees;

        let mut block = Block::new(data, Vec::new(), run.states.clone());
        block.adopt_contract_run(run, consensus);
        block.contracts_run_locally = true;
        block.set_minter_key(minter_key);

        debug!(
            height = parent_height + 1,
            timestamp,
            online_accounts = indexes.len(),
            contracts = block.data.contract_count,
            "Minted block"
        );
        Ok(Some(block))
    }

    /// The same block contents minted and signed by a different reward-share key.
    pub fn remint(
        &self,
        repository: &dyn Repository,
        consensus: &Consensus,
        minter_key: SigningKey,
    ) -> ChainResult<Option<Block>> {
        let parent = repository
            .block_by_signature(&self.data.reference)?
            .ok_or(ChainError::MissingParent)?;
        let minter_public_key = minter_key.verifying_key().to_bytes();

        let Some(timestamp) = minting_timestamp(repository, consensus, &parent, &minter_public_key)? else {
            return Ok(None);
        };

        let mut block = self.clone();
        block.data.minter_public_key = minter_public_key;
        block.data.timestamp = timestamp;
        block.data.minter_signature = None;
        block.data.transactions_signature = None;
        block.expanded_accounts = None;
        block.valid_online_accounts = None;
        block.set_minter_key(minter_key);

        block.sign(consensus.handler.as_ref())?;
        Ok(Some(block))
    }
}
