// Copyright (c) 2024 Botho Foundation
//
//! Deterministic keys and a settable clock.

use ed25519_dalek::SigningKey;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stakeline::block::Clock;
use std::sync::atomic::{AtomicI64, Ordering};

/// `count` signing keys from a seeded RNG.
pub fn seeded_keys(seed: u64, count: usize) -> Vec<SigningKey> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count).map(|_| SigningKey::generate(&mut rng)).collect()
}

pub fn public_key(key: &SigningKey) -> [u8; 32] {
    key.verifying_key().to_bytes()
}

/// A clock the test moves by hand.
#[derive(Debug, Default)]
pub struct TestClock(AtomicI64);

impl TestClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
