// Copyright (c) 2024 Botho Foundation

//! [`MachinePlatform`] backed by the chain repository.
//!
//! One platform is created per contract per block. It only reads from the
//! repository; payments and messages become contract transactions collected
//! for the block, applied later with the rest of the block's transactions.

use super::interpreter::{MachinePlatform, RandomDraw, Register};
use super::{contract_timestamp, timestamp_height, timestamp_sequence, ContractData};
use crate::account::{is_address_version, Address, ADDRESS_LENGTH, NATIVE_ASSET, NULL_PUBLIC_KEY};
use crate::config::ChainSettings;
use crate::repository::{Repository, RepositoryError};
use crate::transaction::{ApprovalStatus, Payload, TransactionData, TransactionType};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Contract-facing transaction type for payments.
pub const PAYMENT_TYPE: i64 = 0;
/// Contract-facing transaction type for messages.
pub const MESSAGE_TYPE: i64 = 1;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("No block at height {0}")]
    MissingBlock(u32),

    #[error("No creation height for contract {0}")]
    MissingCreationHeight(Address),

    #[error("No transaction at height {height} sequence {sequence}")]
    MissingTransaction { height: u32, sequence: u32 },

    #[error("Transaction in A no longer matches the stored transaction")]
    StaleTransaction,

    #[error("Signature too short: {0} bytes")]
    ShortSignature(usize),
}

fn word_at(bytes: &[u8], offset: usize) -> Result<i64, PlatformError> {
    let word: [u8; 8] = bytes
        .get(offset..offset + 8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(PlatformError::ShortSignature(bytes.len()))?;
    Ok(i64::from_be_bytes(word))
}

/// Platform for one contract's run within one block.
pub struct ContractPlatform<'a> {
    repository: &'a dyn Repository,
    settings: &'a ChainSettings,
    contract: &'a ContractData,
    block_timestamp: i64,
    transactions: Vec<TransactionData>,
}

impl<'a> ContractPlatform<'a> {
    pub fn new(
        repository: &'a dyn Repository,
        settings: &'a ChainSettings,
        contract: &'a ContractData,
        block_timestamp: i64,
    ) -> Self {
        Self {
            repository,
            settings,
            contract,
            block_timestamp,
            transactions: Vec::new(),
        }
    }

    /// Contract transactions generated so far, in emission order.
    pub fn into_transactions(self) -> Vec<TransactionData> {
        self.transactions
    }

    fn transaction_from_a(&self, a: &Register) -> Result<TransactionData, PlatformError> {
        let height = timestamp_height(a.0[0]);
        let sequence = timestamp_sequence(a.0[0]);

        let transaction = self
            .repository
            .transaction_at(height, sequence)?
            .ok_or(PlatformError::MissingTransaction { height, sequence })?;

        let signature = transaction.signature();
        if a.0[1] != word_at(signature, 8)?
            || a.0[2] != word_at(signature, 16)?
            || a.0[3] != word_at(signature, 24)?
        {
            return Err(PlatformError::StaleTransaction);
        }

        Ok(transaction)
    }

    /// An address when B holds a valid padded address, otherwise B is a public key.
    fn account_from_b(b: &Register) -> Address {
        let bytes = b.to_bytes();

        if is_address_version(bytes[0]) && bytes[ADDRESS_LENGTH..].iter().all(|byte| *byte == 0) {
            if let Ok(address) = Address::from_bytes(&bytes[..ADDRESS_LENGTH]) {
                return address;
            }
        }

        Address::from_public_key(&bytes)
    }

    fn emit(&mut self, recipient: Address, amount: Option<i64>, message: Vec<u8>) -> Result<(), PlatformError> {
        let reference = self.repository.last_reference(&self.contract.address)?;

        let mut transaction = TransactionData::new(
            TransactionType::Contract,
            self.block_timestamp,
            NULL_PUBLIC_KEY,
            Payload::Contract {
                contract_address: self.contract.address,
                recipient,
                amount,
                asset_id: self.contract.asset_id,
                message,
            },
        );
        transaction.reference = reference;
        transaction.approval_status = ApprovalStatus::NotRequired;
        transaction.signature = Some(contract_transaction_signature(
            &transaction,
            self.transactions.len() as u32,
        ));

        self.transactions.push(transaction);
        Ok(())
    }
}

/// Signature for a contract-generated transaction: `digest ‖ digest` of its fields.
pub fn contract_transaction_signature(transaction: &TransactionData, index: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(transaction.tx_type.value().to_be_bytes());
    hasher.update(transaction.timestamp.to_be_bytes());
    hasher.update(transaction.reference.as_deref().unwrap_or(&[]));

    if let Payload::Contract {
        contract_address,
        recipient,
        amount,
        asset_id,
        message,
    } = &transaction.payload
    {
        hasher.update(contract_address.as_bytes());
        hasher.update(recipient.as_bytes());
        hasher.update(amount.unwrap_or(-1).to_be_bytes());
        hasher.update(asset_id.to_be_bytes());
        hasher.update(message);
    }
    hasher.update(index.to_be_bytes());

    let digest = hasher.finalize();
    [digest.as_slice(), digest.as_slice()].concat()
}

impl MachinePlatform for ContractPlatform<'_> {
    fn max_steps_per_round(&self) -> u32 {
        self.settings.contracts.max_steps_per_round
    }

    fn steps_per_function_call(&self) -> u32 {
        self.settings.contracts.steps_per_function_call
    }

    fn fee_per_step(&self) -> i64 {
        self.settings.contracts.fee_per_step
    }

    fn current_block_height(&self) -> Result<u32, PlatformError> {
        Ok(self.repository.chain_height()?)
    }

    fn creation_block_height(&self) -> Result<u32, PlatformError> {
        self.repository
            .contract_creation_height(&self.contract.address)?
            .ok_or(PlatformError::MissingCreationHeight(self.contract.address))
    }

    fn previous_block_hash(&self) -> Result<Register, PlatformError> {
        let chain_height = self.repository.chain_height()?;
        let previous_height = chain_height
            .checked_sub(1)
            .ok_or(PlatformError::MissingBlock(0))?;

        let block = self
            .repository
            .block_at_height(previous_height)?
            .ok_or(PlatformError::MissingBlock(previous_height))?;
        let signature = block.signature();

        // Height plus the middle 24 bytes of the 128-byte signature
        Ok(Register([
            i64::from(previous_height),
            word_at(&signature, 52)?,
            word_at(&signature, 60)?,
            word_at(&signature, 68)?,
        ]))
    }

    fn transaction_after_timestamp(&self, timestamp: i64) -> Result<Register, PlatformError> {
        let height = timestamp_height(timestamp);
        let sequence = timestamp_sequence(timestamp).saturating_add(1);

        let Some(next) = self
            .repository
            .next_transaction(&self.contract.address, height, sequence)?
        else {
            return Ok(Register::ZERO);
        };

        Ok(Register([
            contract_timestamp(next.height, next.sequence),
            word_at(&next.signature, 8)?,
            word_at(&next.signature, 16)?,
            word_at(&next.signature, 24)?,
        ]))
    }

    fn transaction_type(&self, a: &Register) -> Result<i64, PlatformError> {
        let transaction = self.transaction_from_a(a)?;

        Ok(match &transaction.payload {
            Payload::Payment { .. } => PAYMENT_TYPE,
            Payload::Message { .. } => MESSAGE_TYPE,
            Payload::Contract { amount: Some(_), .. } => PAYMENT_TYPE,
            Payload::Contract { amount: None, .. } => MESSAGE_TYPE,
            _ => -1,
        })
    }

    fn transaction_amount(&self, a: &Register) -> Result<i64, PlatformError> {
        let transaction = self.transaction_from_a(a)?;

        Ok(match &transaction.payload {
            Payload::Payment { amount, .. } => *amount,
            Payload::Contract {
                amount: Some(amount),
                ..
            } => *amount,
            _ => -1,
        })
    }

    fn transaction_timestamp(&self, a: &Register) -> Result<i64, PlatformError> {
        Ok(a.0[0])
    }

    fn random_from_transaction(&self, a: &Register, woke_from_sleep: bool) -> Result<RandomDraw, PlatformError> {
        if !woke_from_sleep {
            // Sleep through the block being built so its signature is unknown now
            let until_height = self.repository.chain_height()? + 2;
            return Ok(RandomDraw::Sleep { until_height });
        }

        let transaction = self.transaction_from_a(a)?;
        let last_block = self
            .repository
            .last_block()?
            .ok_or(PlatformError::MissingBlock(0))?;

        let mut hasher = Sha256::new();
        hasher.update(transaction.signature());
        hasher.update(last_block.signature());
        let hash = hasher.finalize();

        Ok(RandomDraw::Value(word_at(&hash, 0)?))
    }

    fn message_from_transaction(&self, a: &Register) -> Result<Register, PlatformError> {
        let transaction = self.transaction_from_a(a)?;

        let message: &[u8] = match &transaction.payload {
            Payload::Message { data, .. } => data,
            Payload::Contract { message, .. } => message,
            _ => &[],
        };

        Ok(Register::from_padded(message))
    }

    fn sender_from_transaction(&self, a: &Register) -> Result<Register, PlatformError> {
        let transaction = self.transaction_from_a(a)?;

        let sender = match &transaction.payload {
            Payload::Contract {
                contract_address, ..
            } => *contract_address,
            _ => transaction.creator_address(),
        };

        Ok(Register::from_padded(sender.as_bytes()))
    }

    fn creator_address(&self) -> Result<Register, PlatformError> {
        let creator = Address::from_public_key(&self.contract.creator_public_key);
        Ok(Register::from_padded(creator.as_bytes()))
    }

    fn current_balance(&self) -> Result<i64, PlatformError> {
        Ok(self.repository.balance(&self.contract.address, NATIVE_ASSET)?)
    }

    fn pay_to(&mut self, amount: i64, b: &Register) -> Result<(), PlatformError> {
        let recipient = Self::account_from_b(b);
        self.emit(recipient, Some(amount), Vec::new())
    }

    fn message_to(&mut self, message: &Register, b: &Register) -> Result<(), PlatformError> {
        let recipient = Self::account_from_b(b);
        self.emit(recipient, None, message.to_bytes().to_vec())
    }

    fn add_minutes_to_timestamp(&self, timestamp: i64, minutes: i64) -> i64 {
        let blocks = (minutes / self.settings.contracts.minutes_per_block).max(1);
        let height = i64::from(timestamp_height(timestamp)) + blocks;
        contract_timestamp(height.clamp(0, i64::from(u32::MAX)) as u32, 0)
    }

    fn on_finished(&mut self, final_balance: i64) -> Result<(), PlatformError> {
        if final_balance <= 0 {
            return Ok(());
        }

        let creator = Address::from_public_key(&self.contract.creator_public_key);
        self.emit(creator, Some(final_balance), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MachineFlags;
    use crate::repository::MemoryRepository;

    fn contract() -> ContractData {
        ContractData {
            address: Address::contract(&[4u8; 64]),
            creator_public_key: [6u8; 32],
            creation: 1_000,
            version: 2,
            asset_id: NATIVE_ASSET,
            code: vec![1, 2, 3],
            code_hash: [0u8; 32],
            flags: MachineFlags::default(),
        }
    }

    #[test]
    fn test_b_register_address_or_public_key() {
        let address = Address::from_public_key(&[9u8; 32]);
        let as_address = Register::from_padded(address.as_bytes());
        assert_eq!(ContractPlatform::account_from_b(&as_address), address);

        // Trailing bytes set: treat as a public key
        let mut bytes = as_address.to_bytes();
        bytes[31] = 1;
        let as_key = Register::from_bytes(&bytes);
        assert_eq!(
            ContractPlatform::account_from_b(&as_key),
            Address::from_public_key(&bytes)
        );
    }

    #[test]
    fn test_add_minutes_rounds_up_to_one_block() {
        let repository = MemoryRepository::new();
        let settings = ChainSettings::testchain().unwrap();
        let contract = contract();
        let platform = ContractPlatform::new(&repository, &settings, &contract, 0);

        let start = contract_timestamp(10, 3);
        assert_eq!(platform.add_minutes_to_timestamp(start, 0), contract_timestamp(11, 0));
        assert_eq!(platform.add_minutes_to_timestamp(start, 5), contract_timestamp(15, 0));
    }

    #[test]
    fn test_refund_on_finish() {
        let repository = MemoryRepository::new();
        let settings = ChainSettings::testchain().unwrap();
        let contract = contract();
        let mut platform = ContractPlatform::new(&repository, &settings, &contract, 77);

        platform.on_finished(0).unwrap();
        platform.on_finished(500).unwrap();

        let transactions = platform.into_transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].timestamp, 77);
        assert_eq!(transactions[0].creator_public_key, NULL_PUBLIC_KEY);
        assert_eq!(
            transactions[0].payload,
            Payload::Contract {
                contract_address: contract.address,
                recipient: Address::from_public_key(&contract.creator_public_key),
                amount: Some(500),
                asset_id: NATIVE_ASSET,
                message: Vec::new(),
            }
        );
        assert_eq!(transactions[0].signature().len(), 64);
    }

    #[test]
    fn test_no_next_transaction_zeroes_a() {
        let repository = MemoryRepository::new();
        let settings = ChainSettings::testchain().unwrap();
        let contract = contract();
        let platform = ContractPlatform::new(&repository, &settings, &contract, 0);

        assert!(platform
            .transaction_after_timestamp(contract_timestamp(1, 0))
            .unwrap()
            .is_zero());
    }

    #[test]
    fn test_random_sleeps_first() {
        let repository = MemoryRepository::new();
        let settings = ChainSettings::testchain().unwrap();
        let contract = contract();
        let platform = ContractPlatform::new(&repository, &settings, &contract, 0);

        assert_eq!(
            platform.random_from_transaction(&Register::ZERO, false).unwrap(),
            RandomDraw::Sleep { until_height: 2 }
        );
    }
}
