// Copyright (c) 2024 Botho Foundation

//! The chain driver.
//!
//! [`Blockchain`] owns the repository behind the chain lock. Every change to
//! the chain (importing, minting, orphaning) runs while holding it and is
//! committed, or discarded on error, before the lock is released.

use crate::block::{is_genesis_block, Block, BlockData, Consensus, ValidationResult};
use crate::error::{ChainError, ChainResult};
use crate::repository::Repository;
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// How far back from the tip to look for detached blocks at startup.
const DETACHED_BLOCK_WINDOW: u32 = 1440;

/// Outcome of offering a block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    Imported,
    BadSignature,
    Rejected(ValidationResult),
}

pub struct Blockchain {
    repository: Mutex<Box<dyn Repository>>,
    consensus: Consensus,
}

/// Run `operation` and commit, or discard everything it changed.
fn commit(
    repository: &mut dyn Repository,
    operation: impl FnOnce(&mut dyn Repository) -> ChainResult<()>,
) -> ChainResult<()> {
    match operation(repository) {
        Ok(()) => {
            repository.save_changes()?;
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Chain update failed, discarding changes");
            if let Err(discard) = repository.discard_changes() {
                error!(error = %discard, "Failed to discard changes");
            }
            Err(e)
        }
    }
}

impl Blockchain {
    pub fn new(repository: Box<dyn Repository>, consensus: Consensus) -> Self {
        Self {
            repository: Mutex::new(repository),
            consensus,
        }
    }

    pub fn consensus(&self) -> &Consensus {
        &self.consensus
    }

    /// Take the chain lock, blocking until it is free.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Repository>> {
        self.repository.lock()
    }

    /// Make sure the chain starts with our genesis block and has no detached blocks near the tip.
    ///
    /// An empty repository gets the genesis block. A non-empty one that starts
    /// with some other block is an error.
    pub fn validate(&self) -> ChainResult<()> {
        let mut guard = self.repository.lock();
        let repository: &mut dyn Repository = &mut **guard;

        let has_genesis = repository
            .block_at_height(1)?
            .is_some_and(|data| is_genesis_block(&data, &self.consensus.settings));

        if !has_genesis {
            if repository.chain_height()? != 0 {
                return Err(ChainError::Inconsistent(
                    "chain does not start with the configured genesis block".to_string(),
                ));
            }

            let mut genesis = Block::genesis(&self.consensus);
            commit(repository, |repository| genesis.process_genesis(repository, &self.consensus))?;
        }

        let start_height = repository
            .chain_height()?
            .saturating_sub(DETACHED_BLOCK_WINDOW)
            .max(1);

        if let Some(detached) = repository.detached_block(start_height)? {
            let height = detached.height.ok_or(ChainError::MissingHeight)?;
            error!(height, "Block's reference does not match any block's signature");
            info!(target_height = height - 1, "Orphaning back past detached block");
            self.orphan_locked(repository, height - 1)?;
        }

        Ok(())
    }

    /// Validate and apply a block received from a peer.
    pub fn import_block(&self, mut block: Block) -> ChainResult<ImportResult> {
        let mut guard = self.repository.lock();
        let repository: &mut dyn Repository = &mut **guard;

        if !block.is_signature_valid(self.consensus.handler.as_ref()) {
            warn!(signature = %hex::encode(block.signature()), "Block signature invalid");
            return Ok(ImportResult::BadSignature);
        }

        let result = block.is_valid(repository, &self.consensus)?;
        if !result.is_ok() {
            return Ok(ImportResult::Rejected(result));
        }

        commit(repository, |repository| block.process(repository, &self.consensus))?;
        Ok(ImportResult::Imported)
    }

    /// Mint, validate and apply a block on the current tip with a reward-share key.
    ///
    /// Returns `None` if this key cannot mint right now.
    pub fn mint(&self, minter_key: SigningKey) -> ChainResult<Option<BlockData>> {
        let mut guard = self.repository.lock();
        let repository: &mut dyn Repository = &mut **guard;

        let parent = repository.last_block()?.ok_or(ChainError::MissingParent)?;

        let Some(mut block) = Block::mint(&*repository, &self.consensus, &parent, minter_key)? else {
            return Ok(None);
        };
        block.sign(self.consensus.handler.as_ref())?;

        let result = block.is_valid(repository, &self.consensus)?;
        if !result.is_ok() {
            warn!(result = %result, "Newly minted block is invalid");
            return Ok(None);
        }

        commit(repository, |repository| block.process(repository, &self.consensus))?;

        info!(
            height = block.height().unwrap_or_default(),
            timestamp = block.data().timestamp,
            "Minted new block"
        );
        Ok(Some(block.into_data()))
    }

    /// Orphan blocks until the tip is at `target_height`.
    ///
    /// Returns `false` without waiting if the chain lock is held elsewhere.
    pub fn orphan_to(&self, target_height: u32) -> ChainResult<bool> {
        let Some(mut guard) = self.repository.try_lock() else {
            return Ok(false);
        };

        self.orphan_locked(&mut **guard, target_height)?;
        Ok(true)
    }

    fn orphan_locked(&self, repository: &mut dyn Repository, target_height: u32) -> ChainResult<()> {
        let mut height = repository.chain_height()?;

        while height > target_height {
            info!(height, "Forcibly orphaning block");

            let data = repository
                .block_at_height(height)?
                .ok_or_else(|| ChainError::Inconsistent(format!("no block at height {height}")))?;

            let mut block = Block::stored(data);
            commit(repository, |repository| block.orphan(repository, &self.consensus))?;

            height -= 1;
        }

        Ok(())
    }
}
