// Copyright (c) 2024 Botho Foundation

//! Key distance, block weight and chain weight.
//!
//! ```text
//!   ideal key     = SHA-256(parent height ‖ parent signature)
//!   perturbed key = SHA-256(height ‖ minter public key)
//!
//!   distance      = (2^256 - 1 - |ideal - perturbed|) / minter level
//!
//!   block weight  = (online accounts << 256) + distance
//!   chain weight  = fold(0, |w, block| (w << 8) + block weight)
//! ```
//!
//! Both keys are interpreted as two's-complement signed 256-bit integers
//! when taking their difference.

use num_bigint::{BigInt, Sign};
use num_traits::{Signed, Zero};
use sha2::{Digest, Sha256};
use tracing::trace;

/// Left shift applied to a block's online accounts count (public key bits).
pub const ACCOUNTS_COUNT_SHIFT: usize = 32 * 8;

/// Left shift applied to the running total before adding each block's weight.
pub const CHAIN_WEIGHT_SHIFT: usize = 8;

/// The summary of a block needed to weigh it against its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    /// Height of this block
    pub height: u32,
    /// Full block signature (minter signature ‖ transactions signature)
    pub signature: Vec<u8>,
    /// Reward-share public key that minted this block
    pub minter_public_key: [u8; 32],
    /// Effective minting level of the minter when the block was minted
    pub minter_level: u32,
    /// Number of online accounts claimed by the block
    pub online_accounts_count: u32,
}

/// `2^256 - 1`, the largest possible key distance.
pub fn max_distance() -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, &[0xff; 32])
}

/// The key a perfectly lucky minter would have for the block after `parent_height`.
pub fn ideal_minter_key(parent_height: u32, parent_signature: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(i64::from(parent_height).to_be_bytes());
    hasher.update(parent_signature);
    hasher.finalize().into()
}

/// A minter's public key mixed with the height it wants to mint at.
pub fn height_perturbed_key(height: u32, public_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(i64::from(height).to_be_bytes());
    hasher.update(public_key);
    hasher.finalize().into()
}

/// Distance of a minter from the ideal minter for the block after the parent.
///
/// Larger is better. An `account_level` of zero cannot mint and yields a
/// distance of zero.
pub fn key_distance(
    parent_height: u32,
    parent_signature: &[u8],
    public_key: &[u8],
    account_level: u32,
) -> BigInt {
    if account_level == 0 {
        return BigInt::zero();
    }

    let ideal = ideal_minter_key(parent_height, parent_signature);
    let perturbed = height_perturbed_key(parent_height + 1, public_key);

    let difference =
        BigInt::from_signed_bytes_be(&ideal) - BigInt::from_signed_bytes_be(&perturbed);

    (max_distance() - difference.abs()) / BigInt::from(account_level)
}

/// Weight of a single block relative to its parent.
pub fn block_weight(parent_height: u32, parent_signature: &[u8], summary: &BlockSummary) -> BigInt {
    let distance = key_distance(
        parent_height,
        parent_signature,
        &summary.minter_public_key,
        summary.minter_level,
    );

    (BigInt::from(summary.online_accounts_count) << ACCOUNTS_COUNT_SHIFT) + distance
}

/// Cumulative weight of a chain segment built on top of a common block.
///
/// Each summary becomes the parent of the next one, so `summaries` must be in
/// ascending height order starting at `common_height + 1`.
pub fn chain_weight(common_height: u32, common_signature: &[u8], summaries: &[BlockSummary]) -> BigInt {
    let mut cumulative = BigInt::zero();
    let mut parent_height = common_height;
    let mut parent_signature = common_signature;

    for summary in summaries {
        let weight = block_weight(parent_height, parent_signature, summary);
        cumulative = (cumulative << CHAIN_WEIGHT_SHIFT) + weight;

        trace!(
            height = parent_height + 1,
            online = summary.online_accounts_count,
            bits = cumulative.bits(),
            "Folded block into chain weight"
        );

        parent_height = summary.height;
        parent_signature = &summary.signature;
    }

    cumulative
}
