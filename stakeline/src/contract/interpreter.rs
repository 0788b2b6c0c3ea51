// Copyright (c) 2024 Botho Foundation

//! The contract interpreter and the platform surface it calls back into.
//!
//! The interpreter is a black box supplied by the node: it turns creation
//! bytes into code plus an initial state, and advances a state by one round.
//! Everything it needs to know about the chain goes through
//! [`MachinePlatform`], implemented by [`super::ContractPlatform`].

use super::PlatformError;
use thiserror::Error;

/// One of the machine's four-word A/B registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Register(pub [i64; 4]);

impl Register {
    pub const ZERO: Register = Register([0; 4]);

    /// Big-endian byte view, word by word.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.0.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0i64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut be = [0u8; 8];
            be.copy_from_slice(chunk);
            *word = i64::from_be_bytes(be);
        }
        Register(words)
    }

    /// Copy up to 32 bytes in, zero-padding the rest.
    pub fn from_padded(bytes: &[u8]) -> Self {
        let mut padded = [0u8; 32];
        let len = bytes.len().min(32);
        padded[..len].copy_from_slice(&bytes[..len]);
        Self::from_bytes(&padded)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Flags mirrored from a machine state onto its contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineFlags {
    pub is_sleeping: bool,
    pub sleep_until_height: Option<u32>,
    pub is_finished: bool,
    pub had_fatal_error: bool,
    pub is_frozen: bool,
    pub frozen_balance: Option<i64>,
}

/// A freshly deployed machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub version: i32,
    pub code: Vec<u8>,
    pub state: Vec<u8>,
    pub flags: MachineFlags,
}

/// The outcome of one execution round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub state: Vec<u8>,
    pub steps: u64,
    pub flags: MachineFlags,
}

/// Result of asking the platform for a random value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomDraw {
    /// Sleep until the given height, then ask again
    Sleep { until_height: u32 },
    Value(i64),
}

#[derive(Debug, Error)]
pub enum InterpreterFault {
    #[error("Invalid creation bytes: {0}")]
    InvalidCreation(String),

    #[error("Corrupt machine state: {0}")]
    CorruptState(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Platform call failed: {0}")]
    Platform(#[from] PlatformError),
}

/// A deterministic contract interpreter.
pub trait Interpreter: Send + Sync {
    fn initialize(
        &self,
        creation_bytes: &[u8],
        platform: &mut dyn MachinePlatform,
    ) -> Result<Deployment, InterpreterFault>;

    fn execute(
        &self,
        code: &[u8],
        state: &[u8],
        platform: &mut dyn MachinePlatform,
    ) -> Result<Execution, InterpreterFault>;
}

/// Chain access offered to a running machine.
///
/// Transaction-related calls take the A register as filled in by
/// [`MachinePlatform::transaction_after_timestamp`]; a register that no
/// longer matches the stored transaction is an error.
pub trait MachinePlatform {
    fn max_steps_per_round(&self) -> u32;

    fn steps_per_function_call(&self) -> u32;

    fn fee_per_step(&self) -> i64;

    fn current_block_height(&self) -> Result<u32, PlatformError>;

    fn creation_block_height(&self) -> Result<u32, PlatformError>;

    fn previous_block_hash(&self) -> Result<Register, PlatformError>;

    /// The next inbound transaction after the contract timestamp, or zero when none.
    fn transaction_after_timestamp(&self, timestamp: i64) -> Result<Register, PlatformError>;

    /// 0 payment, 1 message, -1 anything else.
    fn transaction_type(&self, a: &Register) -> Result<i64, PlatformError>;

    /// Amount paid, or -1.
    fn transaction_amount(&self, a: &Register) -> Result<i64, PlatformError>;

    fn transaction_timestamp(&self, a: &Register) -> Result<i64, PlatformError>;

    fn random_from_transaction(&self, a: &Register, woke_from_sleep: bool) -> Result<RandomDraw, PlatformError>;

    fn message_from_transaction(&self, a: &Register) -> Result<Register, PlatformError>;

    fn sender_from_transaction(&self, a: &Register) -> Result<Register, PlatformError>;

    fn creator_address(&self) -> Result<Register, PlatformError>;

    fn current_balance(&self) -> Result<i64, PlatformError>;

    fn pay_to(&mut self, amount: i64, b: &Register) -> Result<(), PlatformError>;

    fn message_to(&mut self, message: &Register, b: &Register) -> Result<(), PlatformError>;

    fn add_minutes_to_timestamp(&self, timestamp: i64, minutes: i64) -> i64;

    /// Called once when the machine finishes; refunds what is left.
    fn on_finished(&mut self, final_balance: i64) -> Result<(), PlatformError>;
}
