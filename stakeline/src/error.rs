// Copyright (c) 2024 Botho Foundation

//! Fatal errors raised while validating, processing or orphaning blocks.
//!
//! Consensus verdicts are not errors: see [`crate::block::ValidationResult`].
//! Anything in here means the node could not reach a verdict, or could not
//! finish applying a block it had already accepted.

use crate::contract::{InterpreterFault, PlatformError};
use crate::repository::RepositoryError;
use crate::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Contract platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Contract interpreter fault: {0}")]
    Interpreter(#[from] InterpreterFault),

    #[error("No previous contract state for {0}")]
    MissingContractState(String),

    #[error("No block timing configured for height {0}")]
    MissingBlockTiming(u32),

    #[error("Block has no height; it has not been processed")]
    MissingHeight,

    #[error("Parent block not found")]
    MissingParent,

    #[error("No reward candidates share in a block reward at height {0}")]
    NoRewardShares(u32),

    #[error("Unable to sign block: {0}")]
    Signing(String),

    #[error("Chain state inconsistent: {0}")]
    Inconsistent(String),
}

pub type ChainResult<T> = Result<T, ChainError>;
