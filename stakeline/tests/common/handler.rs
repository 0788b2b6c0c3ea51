// Copyright (c) 2024 Botho Foundation
//
//! A transaction handler that moves native balances.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use stakeline::account::{AccountData, Address, RewardShareData, NATIVE_ASSET, NULL_PUBLIC_KEY};
use stakeline::repository::{AccountBalance, Repository};
use stakeline::transaction::{
    Payload, TransactionData, TransactionError, TransactionHandler, TransactionType, TransactionVerdict,
};

/// Handles genesis, payment, deploy and contract transactions; everything else is a no-op.
pub struct LedgerHandler {
    cumulative_blocks_by_level: Vec<i32>,
}

impl LedgerHandler {
    pub fn new(cumulative_blocks_by_level: Vec<i32>) -> Self {
        Self {
            cumulative_blocks_by_level,
        }
    }
}

fn transfer(
    repository: &mut dyn Repository,
    from: Option<Address>,
    to: Address,
    asset_id: i64,
    amount: i64,
) -> Result<(), TransactionError> {
    let mut deltas = vec![AccountBalance {
        address: to,
        asset_id,
        amount,
    }];
    if let Some(from) = from {
        deltas.push(AccountBalance {
            address: from,
            asset_id,
            amount: -amount,
        });
    }
    repository.modify_balances(&deltas)?;
    Ok(())
}

fn account_or_new(repository: &dyn Repository, address: &Address) -> Result<AccountData, TransactionError> {
    Ok(repository
        .account(address)?
        .unwrap_or_else(|| AccountData::new(*address)))
}

/// Amount leaving the creator (or contract) with this transaction, as (from, to, asset, amount).
fn movement(transaction: &TransactionData) -> Option<(Option<Address>, Address, i64, i64)> {
    match &transaction.payload {
        Payload::Genesis {
            recipient,
            amount,
            asset_id,
        } => Some((None, *recipient, *asset_id, *amount)),
        Payload::Payment { recipient, amount } => {
            Some((Some(transaction.creator_address()), *recipient, NATIVE_ASSET, *amount))
        }
        Payload::DeployContract { amount, asset_id, .. } => Some((
            Some(transaction.creator_address()),
            Address::contract(transaction.signature()),
            *asset_id,
            *amount,
        )),
        Payload::Contract {
            contract_address,
            recipient,
            amount: Some(amount),
            asset_id,
            ..
        } => Some((Some(*contract_address), *recipient, *asset_id, *amount)),
        _ => None,
    }
}

impl TransactionHandler for LedgerHandler {
    fn is_valid(&self, _: &dyn Repository, transaction: &TransactionData) -> Result<TransactionVerdict, TransactionError> {
        if transaction.fee < 0 {
            return Ok(TransactionVerdict::Invalid("negative fee".to_string()));
        }
        match movement(transaction) {
            Some((_, _, _, amount)) if amount < 0 => Ok(TransactionVerdict::Invalid("negative amount".to_string())),
            _ => Ok(TransactionVerdict::Valid),
        }
    }

    fn is_processable(
        &self,
        repository: &dyn Repository,
        transaction: &TransactionData,
    ) -> Result<TransactionVerdict, TransactionError> {
        let Some((Some(from), _, asset_id, amount)) = movement(transaction) else {
            return Ok(TransactionVerdict::Valid);
        };
        let needed = amount + if asset_id == NATIVE_ASSET { transaction.fee } else { 0 };
        if repository.balance(&from, asset_id)? < needed {
            return Ok(TransactionVerdict::Invalid("insufficient balance".to_string()));
        }
        Ok(TransactionVerdict::Valid)
    }

    fn has_valid_reference(&self, _: &dyn Repository, _: &TransactionData) -> Result<bool, TransactionError> {
        Ok(true)
    }

    fn is_signature_valid(&self, transaction: &TransactionData) -> bool {
        let Some(signature) = &transaction.signature else {
            return false;
        };
        if transaction.creator_public_key == NULL_PUBLIC_KEY {
            return true;
        }

        let Ok(key) = VerifyingKey::from_bytes(&transaction.creator_public_key) else {
            return false;
        };
        Signature::from_slice(signature)
            .is_ok_and(|signature| key.verify(&self.bytes_for_signing(transaction), &signature).is_ok())
    }

    fn process(&self, repository: &mut dyn Repository, transaction: &TransactionData) -> Result<(), TransactionError> {
        match &transaction.payload {
            Payload::AccountFlags {
                target,
                and_mask,
                or_mask,
                xor_mask,
            } => {
                let mut account = account_or_new(repository, target)?;
                account.flags = ((account.flags & and_mask) | or_mask) ^ xor_mask;
                repository.save_account(&account)?;
            }
            Payload::AccountLevel { target, level } => {
                let mut account = account_or_new(repository, target)?;
                account.level = *level;
                account.blocks_minted_adjustment = self
                    .cumulative_blocks_by_level
                    .get(*level as usize)
                    .copied()
                    .unwrap_or_default();
                repository.save_account(&account)?;
            }
            Payload::RewardShare {
                recipient,
                reward_share_public_key,
                share_percent,
            } => {
                repository.save_reward_share(&RewardShareData {
                    minter_public_key: transaction.creator_public_key,
                    minter: transaction.creator_address(),
                    recipient: *recipient,
                    reward_share_public_key: *reward_share_public_key,
                    share_percent: *share_percent,
                })?;
            }
            _ => {
                if let Some((from, to, asset_id, amount)) = movement(transaction) {
                    transfer(repository, from, to, asset_id, amount)?;
                }
            }
        }
        Ok(())
    }

    fn orphan(&self, repository: &mut dyn Repository, transaction: &TransactionData) -> Result<(), TransactionError> {
        if let Some((from, to, asset_id, amount)) = movement(transaction) {
            transfer(repository, from, to, asset_id, -amount)?;
        }
        Ok(())
    }

    fn process_references_and_fees(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError> {
        if let Payload::Contract { contract_address, .. } = &transaction.payload {
            repository.set_last_reference(contract_address, transaction.signature.clone())?;
            return Ok(());
        }
        if transaction.creator_public_key == NULL_PUBLIC_KEY {
            return Ok(());
        }

        let creator = transaction.creator_address();
        if transaction.fee != 0 {
            transfer(repository, None, creator, NATIVE_ASSET, -transaction.fee)?;
        }
        repository.set_last_reference(&creator, transaction.signature.clone())?;
        Ok(())
    }

    fn orphan_references_and_fees(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError> {
        if let Payload::Contract { contract_address, .. } = &transaction.payload {
            repository.set_last_reference(contract_address, transaction.reference.clone())?;
            return Ok(());
        }
        if transaction.creator_public_key == NULL_PUBLIC_KEY {
            return Ok(());
        }

        let creator = transaction.creator_address();
        if transaction.fee != 0 {
            transfer(repository, None, creator, NATIVE_ASSET, transaction.fee)?;
        }
        repository.set_last_reference(&creator, transaction.reference.clone())?;
        Ok(())
    }

    fn approval_decision(&self, _: &dyn Repository, _: &TransactionData) -> Result<Option<bool>, TransactionError> {
        Ok(None)
    }

    fn involved_addresses(&self, transaction: &TransactionData) -> Vec<Address> {
        let mut addresses = vec![transaction.creator_address()];
        if let Some((_, to, _, _)) = movement(transaction) {
            addresses.push(to);
        }
        addresses
    }

    fn bytes_for_signing(&self, transaction: &TransactionData) -> Vec<u8> {
        let mut bytes = transaction.tx_type.value().to_be_bytes().to_vec();
        bytes.extend_from_slice(&transaction.timestamp.to_be_bytes());
        bytes.extend_from_slice(transaction.reference.as_deref().unwrap_or(&[]));
        bytes.extend_from_slice(&transaction.creator_public_key);
        bytes.extend_from_slice(&transaction.fee.to_be_bytes());

        match &transaction.payload {
            // The contract address derives from the signature itself
            Payload::DeployContract {
                creation_bytes,
                amount,
                asset_id,
                ..
            } => {
                bytes.extend_from_slice(creation_bytes);
                bytes.extend_from_slice(&asset_id.to_be_bytes());
                bytes.extend_from_slice(&amount.to_be_bytes());
            }
            Payload::Opaque(data) => bytes.extend_from_slice(data),
            _ => {
                if let Some((_, to, asset_id, amount)) = movement(transaction) {
                    bytes.extend_from_slice(to.as_bytes());
                    bytes.extend_from_slice(&asset_id.to_be_bytes());
                    bytes.extend_from_slice(&amount.to_be_bytes());
                }
            }
        }
        bytes
    }

    fn data_length(&self, transaction: &TransactionData) -> usize {
        self.bytes_for_signing(transaction).len() + 64
    }
}

/// A signed payment from `sender`.
pub fn signed_payment(
    handler: &dyn TransactionHandler,
    sender: &SigningKey,
    recipient: Address,
    amount: i64,
    fee: i64,
    timestamp: i64,
) -> TransactionData {
    let mut transaction = TransactionData::new(
        TransactionType::Payment,
        timestamp,
        sender.verifying_key().to_bytes(),
        Payload::Payment { recipient, amount },
    );
    transaction.fee = fee;
    sign(handler, sender, transaction)
}

/// A signed deployment of a [`super::ScriptedInterpreter`] contract funded with `amount`.
pub fn signed_deploy(
    handler: &dyn TransactionHandler,
    creator: &SigningKey,
    creation_bytes: Vec<u8>,
    amount: i64,
    timestamp: i64,
) -> TransactionData {
    let transaction = TransactionData::new(
        TransactionType::DeployContract,
        timestamp,
        creator.verifying_key().to_bytes(),
        Payload::DeployContract {
            name: "scripted".to_string(),
            creation_bytes,
            amount,
            asset_id: NATIVE_ASSET,
        },
    );
    sign(handler, creator, transaction)
}

fn sign(handler: &dyn TransactionHandler, key: &SigningKey, mut transaction: TransactionData) -> TransactionData {
    let signature = key.sign(&handler.bytes_for_signing(&transaction));
    transaction.signature = Some(signature.to_bytes().to_vec());
    transaction
}
