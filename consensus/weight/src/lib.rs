// Copyright (c) 2024 Botho Foundation

//! Chain weight and block timing for Stakeline.
//!
//! Everything in this crate is a pure function of public keys, signatures,
//! heights and timestamps, so candidate chains can be weighed concurrently
//! without touching a repository.
//!
//! - Key distance: how close a minter's height-perturbed key is to the
//!   "ideal" key derived from the parent block, scaled by minting level
//! - Block weight: online account count in the high bits, key distance in
//!   the low bits
//! - Chain weight: block weights folded left-to-right with a shift per block
//! - Block timing: the exact timestamp a minter may use for the next block

#![deny(missing_docs)]

pub mod timing;
pub mod weight;

pub use timing::{calc_minimum_timestamp, calc_timestamp, distance_ratio, BlockTiming};
pub use weight::{
    block_weight, chain_weight, height_perturbed_key, ideal_minter_key, key_distance,
    max_distance, BlockSummary, ACCOUNTS_COUNT_SHIFT, CHAIN_WEIGHT_SHIFT,
};
