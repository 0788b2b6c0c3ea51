// Copyright (c) 2024 Botho Foundation

//! Online accounts: the bitset carried in block headers and the cache of
//! timestamp signatures already known to be valid.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Online account timestamps are multiples of this many milliseconds.
pub const ONLINE_TIMESTAMP_MODULUS: i64 = 5 * 60 * 1000;

/// How many recent blocks' accepted online accounts are kept.
const MAX_CACHED_BLOCKS: usize = 2;

pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitsetError {
    #[error("Encoded length {0} is not a whole number of words")]
    PartialWord(usize),

    #[error("Encoding has trailing empty words")]
    NotMinimal,
}

/// Encode reward-share indexes as big-endian 32-bit words.
///
/// Bit `i` of word `w` marks index `32 * w + i`. Duplicates collapse.
pub fn encode_online_accounts(indexes: &[u32]) -> Vec<u8> {
    let Some(max) = indexes.iter().max() else {
        return Vec::new();
    };

    let mut words = vec![0u32; *max as usize / 32 + 1];
    for index in indexes {
        words[*index as usize / 32] |= 1 << (index % 32);
    }

    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

/// Decode a bitset into ascending indexes.
pub fn decode_online_accounts(encoded: &[u8]) -> Result<Vec<u32>, BitsetError> {
    if encoded.len() % 4 != 0 {
        return Err(BitsetError::PartialWord(encoded.len()));
    }
    if encoded.len() >= 4 && encoded[encoded.len() - 4..] == [0, 0, 0, 0] {
        return Err(BitsetError::NotMinimal);
    }

    let mut indexes = Vec::new();
    for (word_index, chunk) in encoded.chunks_exact(4).enumerate() {
        let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        for bit in 0..32u32 {
            if word & (1 << bit) != 0 {
                indexes.push(word_index as u32 * 32 + bit);
            }
        }
    }
    Ok(indexes)
}

/// A reward-share key's signature over an online timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnlineAccountData {
    pub timestamp: i64,
    pub signature: Vec<u8>,
    pub public_key: [u8; 32],
}

impl OnlineAccountData {
    pub fn new(timestamp: i64, signature: Vec<u8>, public_key: [u8; 32]) -> Self {
        Self {
            timestamp,
            signature,
            public_key,
        }
    }

    pub fn is_signature_valid(&self) -> bool {
        verify_timestamp_signature(&self.public_key, &self.signature, self.timestamp)
    }
}

/// Check an ed25519 signature over the big-endian online timestamp.
pub fn verify_timestamp_signature(public_key: &[u8; 32], signature: &[u8], timestamp: i64) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(&timestamp.to_be_bytes(), &signature).is_ok()
}

/// Split concatenated timestamp signatures.
pub fn split_signatures(signatures: &[u8]) -> impl Iterator<Item = &[u8]> {
    signatures.chunks(SIGNATURE_LENGTH)
}

/// Online accounts the node currently sees, plus those accepted by the latest blocks.
#[derive(Debug, Default)]
pub struct OnlineAccountsCache {
    current: Mutex<Vec<OnlineAccountData>>,
    latest_blocks: Mutex<VecDeque<Vec<OnlineAccountData>>>,
}

impl OnlineAccountsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node's view of currently online accounts.
    pub fn set_current(&self, accounts: Vec<OnlineAccountData>) {
        *self.current.lock() = accounts;
    }

    pub fn current(&self) -> Vec<OnlineAccountData> {
        self.current.lock().clone()
    }

    /// Accounts accepted by the most recently processed block.
    pub fn latest_block_accounts(&self) -> Vec<OnlineAccountData> {
        self.latest_blocks
            .lock()
            .front()
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_latest_block(&self, accounts: Vec<OnlineAccountData>) {
        let mut latest = self.latest_blocks.lock();
        if latest.len() == MAX_CACHED_BLOCKS {
            latest.pop_back();
        }
        latest.push_front(accounts);
    }

    pub fn pop_latest_block(&self) {
        self.latest_blocks.lock().pop_front();
    }
}
