// Copyright (c) 2024 Botho Foundation

//! Transactions as seen by block processing.
//!
//! Validating and applying individual transaction types is the job of a
//! [`TransactionHandler`] supplied by the node. Block processing only needs
//! the common fields, the canonical ordering and a few typed payloads that
//! contracts and the genesis block produce or inspect.

use crate::account::Address;
use crate::config::ChainSettings;
use crate::repository::{Repository, RepositoryError};
use num_bigint::BigInt;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum TransactionType {
    Genesis = 1,
    Payment = 2,
    RegisterName = 3,
    UpdateName = 4,
    SellName = 5,
    CancelSellName = 6,
    BuyName = 7,
    CreatePoll = 8,
    VoteOnPoll = 9,
    Arbitrary = 10,
    IssueAsset = 11,
    TransferAsset = 12,
    CreateAssetOrder = 13,
    CancelAssetOrder = 14,
    MultiPayment = 15,
    DeployContract = 16,
    Message = 17,
    Chat = 18,
    Publicize = 19,
    Airdrop = 20,
    Contract = 21,
    CreateGroup = 22,
    UpdateGroup = 23,
    AddGroupAdmin = 24,
    RemoveGroupAdmin = 25,
    GroupBan = 26,
    CancelGroupBan = 27,
    GroupKick = 28,
    GroupInvite = 29,
    CancelGroupInvite = 30,
    JoinGroup = 31,
    LeaveGroup = 32,
    GroupApproval = 33,
    SetGroup = 34,
    UpdateAsset = 35,
    AccountFlags = 36,
    EnableForging = 37,
    RewardShare = 38,
    AccountLevel = 39,
    TransferPrivs = 40,
    Presence = 41,
}

impl TransactionType {
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Types that may only appear in the genesis block.
    pub fn is_genesis_only(self) -> bool {
        matches!(self, Self::Genesis | Self::AccountFlags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ApprovalStatus {
    NotRequired = 0,
    Pending = 1,
    Approved = 2,
    Rejected = 3,
    Expired = 4,
    Invalid = 5,
}

impl ApprovalStatus {
    pub fn value(self) -> i32 {
        self as i32
    }
}

/// Type-specific fields the consensus core needs to read or build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Genesis {
        recipient: Address,
        amount: i64,
        asset_id: i64,
    },
    Payment {
        recipient: Address,
        amount: i64,
    },
    Message {
        recipient: Option<Address>,
        amount: i64,
        asset_id: i64,
        data: Vec<u8>,
    },
    DeployContract {
        name: String,
        creation_bytes: Vec<u8>,
        amount: i64,
        asset_id: i64,
    },
    /// Generated by a contract: a payment when `amount` is set, otherwise a message
    Contract {
        contract_address: Address,
        recipient: Address,
        amount: Option<i64>,
        asset_id: i64,
        message: Vec<u8>,
    },
    AccountFlags {
        target: Address,
        and_mask: i32,
        or_mask: i32,
        xor_mask: i32,
    },
    AccountLevel {
        target: Address,
        level: u32,
    },
    RewardShare {
        recipient: Address,
        reward_share_public_key: [u8; 32],
        share_percent: i64,
    },
    /// Fields only the transaction handler understands
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub tx_type: TransactionType,
    pub timestamp: i64,
    pub group_id: i32,
    pub reference: Option<Vec<u8>>,
    pub creator_public_key: [u8; 32],
    pub fee: i64,
    pub signature: Option<Vec<u8>>,
    pub approval_status: ApprovalStatus,
    pub block_height: Option<u32>,
    pub approval_height: Option<u32>,
    pub payload: Payload,
}

impl TransactionData {
    pub fn new(
        tx_type: TransactionType,
        timestamp: i64,
        creator_public_key: [u8; 32],
        payload: Payload,
    ) -> Self {
        Self {
            tx_type,
            timestamp,
            group_id: 0,
            reference: None,
            creator_public_key,
            fee: 0,
            signature: None,
            approval_status: ApprovalStatus::NotRequired,
            block_height: None,
            approval_height: None,
            payload,
        }
    }

    /// The signature, or an empty slice for unsigned genesis transactions.
    pub fn signature(&self) -> &[u8] {
        self.signature.as_deref().unwrap_or(&[])
    }

    pub fn is_contract(&self) -> bool {
        self.tx_type == TransactionType::Contract
    }

    pub fn creator_address(&self) -> Address {
        Address::from_public_key(&self.creator_public_key)
    }

    /// Latest block timestamp this transaction may be included at (exclusive).
    pub fn deadline(&self, settings: &ChainSettings) -> i64 {
        self.timestamp + settings.transaction_expiry_period
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Transaction processing failed: {0}")]
    Processing(String),
}

/// Verdict of a transaction-level check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionVerdict {
    Valid,
    Invalid(String),
}

impl TransactionVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Per-type transaction logic supplied by the node.
pub trait TransactionHandler: Send + Sync {
    fn is_valid(
        &self,
        repository: &dyn Repository,
        transaction: &TransactionData,
    ) -> Result<TransactionVerdict, TransactionError>;

    /// Whether the transaction could be applied right now (balances, group membership, ...).
    fn is_processable(
        &self,
        repository: &dyn Repository,
        transaction: &TransactionData,
    ) -> Result<TransactionVerdict, TransactionError>;

    fn has_valid_reference(
        &self,
        repository: &dyn Repository,
        transaction: &TransactionData,
    ) -> Result<bool, TransactionError>;

    fn is_signature_valid(&self, transaction: &TransactionData) -> bool;

    fn process(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError>;

    fn orphan(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError>;

    fn process_references_and_fees(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError>;

    fn orphan_references_and_fees(
        &self,
        repository: &mut dyn Repository,
        transaction: &TransactionData,
    ) -> Result<(), TransactionError>;

    /// Group approval outcome once the approval window has opened: `None` while undecided.
    fn approval_decision(
        &self,
        repository: &dyn Repository,
        transaction: &TransactionData,
    ) -> Result<Option<bool>, TransactionError>;

    fn involved_addresses(&self, transaction: &TransactionData) -> Vec<Address>;

    fn bytes_for_signing(&self, transaction: &TransactionData) -> Vec<u8>;

    /// Serialized length, counted against the block size limit.
    fn data_length(&self, transaction: &TransactionData) -> usize;

    /// Canonical block order.
    fn compare(&self, a: &TransactionData, b: &TransactionData) -> Ordering {
        canonical_order(a, b)
    }
}

/// Contract transactions first, in their existing order, then by timestamp,
/// then by signature read as a signed big-endian integer.
pub fn canonical_order(a: &TransactionData, b: &TransactionData) -> Ordering {
    match (a.is_contract(), b.is_contract()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.timestamp.cmp(&b.timestamp).then_with(|| {
            BigInt::from_signed_bytes_be(a.signature()).cmp(&BigInt::from_signed_bytes_be(b.signature()))
        }),
    }
}
