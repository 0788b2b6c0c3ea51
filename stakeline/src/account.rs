// Copyright (c) 2024 Botho Foundation

//! Addresses, account records and reward-share records.

use crate::config::ChainSettings;
use crate::repository::{Repository, RepositoryError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a binary address: version byte, 20-byte key hash, 4-byte checksum.
pub const ADDRESS_LENGTH: usize = 25;

/// Address version byte for ordinary accounts.
pub const ACCOUNT_ADDRESS_VERSION: u8 = 58;

/// Address version byte for contract accounts.
pub const CONTRACT_ADDRESS_VERSION: u8 = 23;

const KEY_HASH_LENGTH: usize = 20;
const CHECKSUM_LENGTH: usize = 4;

/// Account flag marking a protocol founder.
pub const FOUNDER_FLAG: i32 = 0x1;

/// Native chain asset.
pub const NATIVE_ASSET: i64 = 0;
/// Balance held on the predecessor ledger.
pub const LEGACY_ASSET: i64 = 1;
/// Native balance migrated from the predecessor ledger.
pub const MIGRATED_ASSET: i64 = 2;

/// Public key of the protocol-owned null account (genesis minter, contract transaction creator).
pub const NULL_PUBLIC_KEY: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid base58: {0}")]
    Base58(String),

    #[error("Wrong address length: {0}")]
    Length(usize),

    #[error("Unknown address version: {0}")]
    Version(u8),

    #[error("Bad address checksum")]
    Checksum,
}

/// A 25-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    fn with_version(version: u8, input: &[u8]) -> Self {
        let once = Sha256::digest(input);
        let twice = Sha256::digest(once);

        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = version;
        bytes[1..1 + KEY_HASH_LENGTH].copy_from_slice(&twice[..KEY_HASH_LENGTH]);

        let checksum = checksum(&bytes[..1 + KEY_HASH_LENGTH]);
        bytes[1 + KEY_HASH_LENGTH..].copy_from_slice(&checksum);
        Self(bytes)
    }

    /// Address of the account owning `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self::with_version(ACCOUNT_ADDRESS_VERSION, public_key)
    }

    /// Address of the contract deployed by the transaction with `deploy_signature`.
    pub fn contract(deploy_signature: &[u8]) -> Self {
        Self::with_version(CONTRACT_ADDRESS_VERSION, deploy_signature)
    }

    /// Parse raw bytes, checking the version byte and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| AddressError::Length(bytes.len()))?;

        if !is_address_version(bytes[0]) {
            return Err(AddressError::Version(bytes[0]));
        }
        if checksum(&bytes[..1 + KEY_HASH_LENGTH]) != bytes[1 + KEY_HASH_LENGTH..] {
            return Err(AddressError::Checksum);
        }

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    pub fn is_contract(&self) -> bool {
        self.version() == CONTRACT_ADDRESS_VERSION
    }
}

/// Whether `version` is one of the address version bytes in use.
pub fn is_address_version(version: u8) -> bool {
    version == ACCOUNT_ADDRESS_VERSION || version == CONTRACT_ADDRESS_VERSION
}

fn checksum(versioned_hash: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let twice = Sha256::digest(Sha256::digest(versioned_hash));
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&twice[..CHECKSUM_LENGTH]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::Base58(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Persistent account state touched by block processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountData {
    pub address: Address,
    /// Signature of the last transaction created by this account
    pub reference: Option<Vec<u8>>,
    pub public_key: Option<[u8; 32]>,
    pub default_group_id: i32,
    pub flags: i32,
    pub level: u32,
    pub blocks_minted: i32,
    /// Carried over from privilege transfers
    pub blocks_minted_adjustment: i32,
}

impl AccountData {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            reference: None,
            public_key: None,
            default_group_id: 0,
            flags: 0,
            level: 0,
            blocks_minted: 0,
            blocks_minted_adjustment: 0,
        }
    }

    pub fn is_founder(&self) -> bool {
        self.flags & FOUNDER_FLAG != 0
    }

    /// Minted block count used for level thresholds.
    pub fn effective_blocks_minted(&self) -> i32 {
        self.blocks_minted + self.blocks_minted_adjustment
    }

    pub fn can_mint(&self, settings: &ChainSettings) -> bool {
        self.level >= settings.min_account_level_to_mint || self.is_founder()
    }

    pub fn effective_minting_level(&self, settings: &ChainSettings) -> u32 {
        if self.is_founder() {
            settings.founder_effective_minting_level
        } else {
            self.level
        }
    }
}

/// A delegation letting `reward_share_public_key` mint on behalf of `minter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardShareData {
    pub minter_public_key: [u8; 32],
    pub minter: Address,
    pub recipient: Address,
    pub reward_share_public_key: [u8; 32],
    /// Recipient's cut in hundredths of a percent (10000 = 100%)
    pub share_percent: i64,
}

/// Effective minting level behind a reward-share key, or 0 when the key or its minter is unknown.
pub fn reward_share_effective_minting_level(
    repository: &dyn Repository,
    settings: &ChainSettings,
    reward_share_public_key: &[u8; 32],
) -> Result<u32, RepositoryError> {
    let Some(reward_share) = repository.reward_share(reward_share_public_key)? else {
        return Ok(0);
    };

    Ok(repository
        .account(&reward_share.minter)?
        .map(|account| account.effective_minting_level(settings))
        .unwrap_or(0))
}
