// Copyright (c) 2024 Botho Foundation
//
//! Common test utilities for the chain integration tests.
//!
//! Provides a transaction handler that moves balances for the handful of
//! transaction types the tests use, a scripted contract interpreter, seeded
//! keys and a [`TestChain`] wrapper around a [`stakeline::Blockchain`]
//! backed by the in-memory repository.
//!
//! # Example
//!
//! ```ignore
//! use common::{TestChain, seeded_keys};
//!
//! let keys = seeded_keys(1, 1);
//! let chain = TestChain::single_minter(&keys[0], &keys[0], true, true);
//! let block = chain.mint(&keys[0]);
//! ```

mod chain;
mod handler;
mod interpreter;
mod keys;

pub use chain::*;
pub use handler::*;
pub use interpreter::*;
pub use keys::*;
