// Copyright (c) 2024 Botho Foundation

//! Stakeline consensus core.
//!
//! Decides whether a candidate block may extend the chain, applies accepted
//! blocks (rewards, levels, contracts, transactions) and takes them off
//! again when the chain reorganises. Chain weight and block timing live in
//! `stk-consensus-weight`; persistence and per-type transaction logic are
//! supplied by the node through the [`repository::Repository`] and
//! [`transaction::TransactionHandler`] traits.

#![deny(clippy::print_stdout)]

pub mod account;
pub mod block;
pub mod chain;
pub mod config;
pub mod contract;
pub mod error;
pub mod levels;
pub mod repository;
pub mod rewards;
pub mod transaction;

pub use block::{Block, BlockData, Consensus, ValidationResult};
pub use chain::{Blockchain, ImportResult};
pub use config::ChainSettings;
pub use error::{ChainError, ChainResult};
