// Copyright (c) 2024 Botho Foundation

//! The genesis block.
//!
//! Nobody holds the null account's private key, so the genesis block cannot
//! be signed. Each of its two signature halves is instead a single SHA-256
//! digest written out twice: one over the header, one over the (index, type,
//! creator) tuple of every transaction. Any node can recompute both from the
//! chain settings.

use super::{Block, BlockData, Consensus, ValidationResult, SIGNATURE_LENGTH};
use crate::account::NULL_PUBLIC_KEY;
use crate::config::ChainSettings;
use crate::error::ChainResult;
use crate::repository::Repository;
use crate::transaction::{ApprovalStatus, TransactionData};
use sha2::{Digest, Sha256};
use tracing::info;

/// The genesis block references 128 zero bytes.
pub const GENESIS_REFERENCE_LENGTH: usize = 128;

/// Reference given to genesis transactions that lack one.
const GENESIS_TRANSACTION_REFERENCE: [u8; SIGNATURE_LENGTH] = [0u8; SIGNATURE_LENGTH];

fn dup_digest(bytes: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(bytes);
    [digest.as_slice(), digest.as_slice()].concat()
}

fn minter_signing_bytes(timestamp: i64, reference: &[u8], minter_public_key: &[u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + GENESIS_REFERENCE_LENGTH + 32);
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    bytes.extend_from_slice(reference);
    bytes.extend_from_slice(minter_public_key);
    bytes
}

fn transactions_digest(transactions: &[TransactionData]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(transactions.len() * (4 + 4 + 32));
    for (index, transaction) in transactions.iter().enumerate() {
        bytes.extend_from_slice(&(index as i32).to_be_bytes());
        bytes.extend_from_slice(&transaction.tx_type.value().to_be_bytes());
        bytes.extend_from_slice(&transaction.creator_public_key);
    }
    dup_digest(&bytes)
}

/// Minter and transactions signatures of a genesis block at `timestamp`.
pub fn genesis_signatures(timestamp: i64, transactions: &[TransactionData]) -> (Vec<u8>, Vec<u8>) {
    let reference = [0u8; GENESIS_REFERENCE_LENGTH];
    let minter = dup_digest(&minter_signing_bytes(timestamp, &reference, &NULL_PUBLIC_KEY));
    (minter, transactions_digest(transactions))
}

fn signatures_match(data: &BlockData, transactions: &[TransactionData]) -> bool {
    let minter = dup_digest(&minter_signing_bytes(data.timestamp, &data.reference, &data.minter_public_key));

    data.minter_signature.as_deref() == Some(minter.as_slice())
        && data.transactions_signature.as_deref() == Some(transactions_digest(transactions).as_slice())
}

/// Whether a stored block is the genesis block these settings describe.
pub fn is_genesis_block(data: &BlockData, settings: &ChainSettings) -> bool {
    data.height == Some(1) && signatures_match(data, settings.genesis_transactions())
}

impl Block {
    /// The genesis block described by the chain settings.
    ///
    /// A configured timestamp of 0 (test chains only) means "now".
    pub fn genesis(consensus: &Consensus) -> Block {
        let settings = &consensus.settings;
        let timestamp = match settings.genesis.timestamp {
            0 => consensus.now(),
            timestamp => timestamp,
        };

        let transactions: Vec<TransactionData> = settings
            .genesis_transactions()
            .iter()
            .cloned()
            .map(|mut transaction| {
                if transaction.timestamp == 0 {
                    transaction.timestamp = timestamp;
                }
                transaction
            })
            .collect();

        let (minter_signature, transactions_signature) = genesis_signatures(timestamp, &transactions);

        let data = BlockData {
            version: settings.genesis.version,
            reference: vec![0u8; GENESIS_REFERENCE_LENGTH],
            transaction_count: transactions.len() as u32,
            total_fees: 0,
            transactions_signature: Some(transactions_signature),
            height: None,
            timestamp,
            minter_public_key: NULL_PUBLIC_KEY,
            minter_signature: Some(minter_signature),
            contract_count: 0,
            contract_fees: 0,
            encoded_online_accounts: Vec::new(),
            online_accounts_count: 0,
            online_accounts_timestamp: None,
            online_accounts_signatures: None,
        };

        let mut block = Block::new(data, transactions, Vec::new());
        block.is_genesis = true;
        block
    }

    pub(super) fn is_genesis_signature_valid(&self) -> bool {
        signatures_match(&self.data, self.transactions())
    }

    pub(super) fn is_genesis_valid(
        &self,
        repository: &dyn Repository,
        consensus: &Consensus,
    ) -> ChainResult<ValidationResult> {
        if repository.chain_height()? != 0 {
            return Ok(ValidationResult::BlockchainNotEmpty);
        }

        for transaction in self.transactions() {
            if !consensus.handler.is_valid(repository, transaction)?.is_valid() {
                return Ok(ValidationResult::TransactionInvalid);
            }
        }

        Ok(ValidationResult::Ok)
    }

    /// Process the genesis block into an empty repository.
    ///
    /// Transactions without a reference or signature get generated ones.
    pub fn process_genesis(&mut self, repository: &mut dyn Repository, consensus: &Consensus) -> ChainResult<()> {
        info!(timestamp = self.data.timestamp, "Using genesis block timestamp");

        let handler = consensus.handler.as_ref();
        let transactions = self.transactions.get_or_insert_with(Vec::new);
        for transaction in transactions.iter_mut() {
            if transaction.reference.is_none() {
                transaction.reference = Some(GENESIS_TRANSACTION_REFERENCE.to_vec());
            }

            if transaction.signature.is_none() {
                let digest = Sha256::digest(handler.bytes_for_signing(transaction));
                transaction.signature = Some([digest.as_slice(), digest.as_slice()].concat());
            }

            transaction.approval_status = ApprovalStatus::NotRequired;
        }

        for transaction in transactions.iter() {
            repository.save_transaction(transaction)?;
        }

        self.contract_states = Some(Vec::new());
        self.process(repository, consensus)
    }
}
