// Copyright (c) 2024 Botho Foundation

//! Deterministic next-block timestamps.
//!
//! A minter's key distance, normalised to `0..=1`, is pushed through a power
//! curve and used to pick a point in the window
//! `[target - deviation, target + deviation]` after the parent's timestamp:
//!
//! ```text
//!   parent                minimum                  target                 maximum
//!     |---------------------|-----------------------|-----------------------|
//!                           ^ offset = trunc(2 * deviation * ratio^power)
//! ```
//!
//! The ratio is truncated to 40 decimal digits before conversion to `f64` so
//! every node rounds it the same way.

use crate::weight::{key_distance, max_distance};
use num_bigint::BigInt;
use num_traits::Zero;
use std::str::FromStr;

/// Decimal digits kept from `distance / MAX_DISTANCE`.
const RATIO_DIGITS: usize = 40;

/// Block timing parameters effective from a given height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockTiming {
    /// First height these timings apply to
    pub height: u32,
    /// Target interval between blocks in milliseconds
    pub target: i64,
    /// Maximum deviation either side of the target in milliseconds
    pub deviation: i64,
    /// Exponent applied to the distance ratio
    pub power: f64,
}

impl BlockTiming {
    /// The timing in effect at `height`: the last entry whose height is not above it.
    ///
    /// `timings` must be sorted by ascending height.
    pub fn at_height(timings: &[BlockTiming], height: u32) -> Option<&BlockTiming> {
        timings.iter().rev().find(|timing| timing.height <= height)
    }
}

/// `distance / MAX_DISTANCE`, truncated to 40 decimal digits, as the nearest `f64`.
pub fn distance_ratio(distance: &BigInt) -> f64 {
    let scale = BigInt::from(10u8).pow(RATIO_DIGITS as u32);
    let scaled = distance * &scale / max_distance();

    if scaled.is_zero() {
        return 0.0;
    }
    if scaled >= scale {
        return 1.0;
    }

    let digits = format!("0.{:0>width$}", scaled.to_string(), width = RATIO_DIGITS);
    f64::from_str(&digits).unwrap_or(0.0)
}

/// The exact timestamp a minter at `minter_level` must use for the block after the parent.
pub fn calc_timestamp(
    parent_height: u32,
    parent_signature: &[u8],
    parent_timestamp: i64,
    minter_public_key: &[u8],
    minter_level: u32,
    timing: &BlockTiming,
) -> i64 {
    let distance = key_distance(parent_height, parent_signature, minter_public_key, minter_level);
    let ratio = distance_ratio(&distance);

    let transformed = ratio.powf(timing.power);
    let offset = (timing.deviation as f64 * 2.0 * transformed) as i64;

    parent_timestamp + timing.target - timing.deviation + offset
}

/// The earliest timestamp any minter may use for the block after the parent.
pub fn calc_minimum_timestamp(parent_timestamp: i64, timing: &BlockTiming) -> i64 {
    parent_timestamp + timing.target - timing.deviation
}
