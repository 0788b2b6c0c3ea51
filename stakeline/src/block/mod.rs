// Copyright (c) 2024 Botho Foundation

//! Blocks: header data, signing, transaction bookkeeping and the
//! validate / process / orphan pipeline.
//!
//! A [`Block`] wraps the persisted [`BlockData`] header together with the
//! block's transactions, its contract states and a few per-instance caches
//! (expanded online accounts, verified online account signatures). Blocks
//! loaded from the repository fetch their transactions and contract states
//! lazily.

mod genesis;
mod mint;
pub mod online;
mod patch;
mod process;
mod validate;

pub use genesis::{genesis_signatures, is_genesis_block, GENESIS_REFERENCE_LENGTH};
pub use online::{OnlineAccountData, OnlineAccountsCache};
pub use patch::{HistoricalPatch, PatchError, PATCH_HEIGHT};
pub use validate::ValidationResult;

use crate::account::RewardShareData;
use crate::config::ChainSettings;
use crate::contract::{ContractRun, ContractStateData, Interpreter};
use crate::error::{ChainError, ChainResult};
use crate::repository::Repository;
use crate::rewards::ExpandedAccount;
use crate::transaction::{ApprovalStatus, TransactionData, TransactionHandler};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Block version produced and accepted by this node.
pub const BLOCK_VERSION: i32 = 4;

/// Length of one half of the block signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// Fixed header bytes counted against the block size limit.
const BASE_LENGTH: usize = 4 + 8 + 128 + 32 + 128 + 4;
const CONTRACT_STATE_LENGTH: usize = 25 + 32 + 8;

/// The persisted block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub version: i32,
    /// Signature of the parent block
    pub reference: Vec<u8>,
    /// Non-contract transactions only
    pub transaction_count: u32,
    pub total_fees: i64,
    pub transactions_signature: Option<Vec<u8>>,
    /// Assigned when the block is processed
    pub height: Option<u32>,
    pub timestamp: i64,
    /// Reward-share public key of the minter
    pub minter_public_key: [u8; 32],
    pub minter_signature: Option<Vec<u8>>,
    pub contract_count: u32,
    pub contract_fees: i64,
    pub encoded_online_accounts: Vec<u8>,
    pub online_accounts_count: u32,
    pub online_accounts_timestamp: Option<i64>,
    pub online_accounts_signatures: Option<Vec<u8>>,
}

impl BlockData {
    /// Minter signature followed by transactions signature, or empty while either is missing.
    pub fn signature(&self) -> Vec<u8> {
        match (&self.minter_signature, &self.transactions_signature) {
            (Some(minter), Some(transactions)) => [minter.as_slice(), transactions.as_slice()].concat(),
            _ => Vec::new(),
        }
    }

    /// The parent's minter signature, which is what this block's minter signs over.
    pub fn parent_minter_signature(&self) -> &[u8] {
        self.reference
            .get(..SIGNATURE_LENGTH)
            .unwrap_or(&self.reference)
    }

    /// Bytes covered by the minter signature.
    pub fn minter_signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH + 32 + self.encoded_online_accounts.len());
        bytes.extend_from_slice(self.parent_minter_signature());
        bytes.extend_from_slice(&self.minter_public_key);
        bytes.extend_from_slice(&self.encoded_online_accounts);
        bytes
    }
}

/// Source of "now" in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Collaborators and node-wide state shared by every block operation.
pub struct Consensus {
    pub settings: ChainSettings,
    pub handler: Arc<dyn TransactionHandler>,
    pub interpreter: Arc<dyn Interpreter>,
    pub online_accounts: OnlineAccountsCache,
    pub patch: HistoricalPatch,
    pub clock: Arc<dyn Clock>,
}

impl Consensus {
    /// Services with the bundled historical patch and the system clock.
    pub fn new(
        settings: ChainSettings,
        handler: Arc<dyn TransactionHandler>,
        interpreter: Arc<dyn Interpreter>,
    ) -> Result<Self, PatchError> {
        Ok(Self {
            settings,
            handler,
            interpreter,
            online_accounts: OnlineAccountsCache::new(),
            patch: HistoricalPatch::bundled()?,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}

/// A block plus everything derived from it while validating, processing or orphaning.
#[derive(Debug, Clone)]
pub struct Block {
    data: BlockData,
    /// `None` until loaded for stored blocks
    transactions: Option<Vec<TransactionData>>,
    /// States claimed by the block; `None` until loaded for stored blocks
    contract_states: Option<Vec<ContractStateData>>,
    /// Result of running contracts on this node
    local_contracts: Option<ContractRun>,
    /// Set when the claimed states came from our own run (minting)
    contracts_run_locally: bool,
    minter_key: Option<SigningKey>,
    is_genesis: bool,
    expanded_accounts: Option<Vec<ExpandedAccount>>,
    online_reward_shares: Option<Vec<RewardShareData>>,
    valid_online_accounts: Option<Vec<OnlineAccountData>>,
}

impl Block {
    fn from_parts(
        data: BlockData,
        transactions: Option<Vec<TransactionData>>,
        contract_states: Option<Vec<ContractStateData>>,
    ) -> Self {
        Self {
            data,
            transactions,
            contract_states,
            local_contracts: None,
            contracts_run_locally: false,
            minter_key: None,
            is_genesis: false,
            expanded_accounts: None,
            online_reward_shares: None,
            valid_online_accounts: None,
        }
    }

    /// A block received from a peer: header, transactions and claimed contract states.
    pub fn new(data: BlockData, transactions: Vec<TransactionData>, contract_states: Vec<ContractStateData>) -> Self {
        Self::from_parts(data, Some(transactions), Some(contract_states))
    }

    /// A block already in the repository; transactions and states load on demand.
    pub fn stored(data: BlockData) -> Self {
        Self::from_parts(data, None, None)
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn into_data(self) -> BlockData {
        self.data
    }

    pub fn signature(&self) -> Vec<u8> {
        self.data.signature()
    }

    pub fn height(&self) -> Option<u32> {
        self.data.height
    }

    pub fn is_genesis(&self) -> bool {
        self.is_genesis
    }

    /// Version of the block that may follow this one.
    pub fn next_block_version(&self) -> ChainResult<i32> {
        self.data.height.ok_or(ChainError::MissingHeight)?;
        Ok(BLOCK_VERSION)
    }

    /// Transactions currently held, in block order. Empty for stored blocks not yet loaded.
    pub fn transactions(&self) -> &[TransactionData] {
        self.transactions.as_deref().unwrap_or(&[])
    }

    /// Load a stored block's transactions, checking them against the header count.
    pub fn load_transactions(&mut self, repository: &dyn Repository) -> ChainResult<&[TransactionData]> {
        if self.transactions.is_none() {
            let transactions = repository.block_transactions(&self.signature())?;

            let non_contract = transactions.iter().filter(|tx| !tx.is_contract()).count();
            if non_contract != self.data.transaction_count as usize {
                return Err(ChainError::Inconsistent(format!(
                    "block has {} transactions but header claims {}",
                    non_contract, self.data.transaction_count
                )));
            }

            self.transactions = Some(transactions);
        }

        Ok(self.transactions.as_deref().unwrap_or(&[]))
    }

    /// Contract states claimed by this block. Empty for stored blocks not yet loaded.
    pub fn contract_states(&self) -> &[ContractStateData] {
        self.contract_states.as_deref().unwrap_or(&[])
    }

    /// Load a stored block's contract states, checking them against the header count.
    ///
    /// Initial states saved by deployments at this height are excluded from the
    /// count but kept, so orphaning can remove them.
    pub fn load_contract_states(&mut self, repository: &dyn Repository) -> ChainResult<&[ContractStateData]> {
        if self.contract_states.is_none() {
            let height = self.data.height.ok_or(ChainError::MissingHeight)?;
            let states = repository.contract_states_at(height)?;

            let run_states = states.iter().filter(|state| !state.is_initial).count();
            if run_states != self.data.contract_count as usize {
                return Err(ChainError::Inconsistent(format!(
                    "block has {} contract states but header claims {}",
                    run_states, self.data.contract_count
                )));
            }

            self.contract_states = Some(states);
        }

        Ok(self.contract_states.as_deref().unwrap_or(&[]))
    }

    /// Contract results computed on this node, if contracts have been run.
    pub fn local_contracts(&self) -> Option<&ContractRun> {
        self.local_contracts.as_ref()
    }

    /// Take on contract results computed here: their transactions replace any
    /// contract transactions the block carried, then the list is re-sorted.
    fn adopt_contract_run(&mut self, mut run: ContractRun, consensus: &Consensus) {
        for transaction in &mut run.transactions {
            transaction.approval_status = ApprovalStatus::NotRequired;
        }

        let mut transactions = run.transactions.clone();
        transactions.extend(
            self.transactions
                .take()
                .unwrap_or_default()
                .into_iter()
                .filter(|tx| !tx.is_contract()),
        );
        transactions.sort_by(|a, b| consensus.handler.compare(a, b));

        self.transactions = Some(transactions);
        self.local_contracts = Some(run);
    }

    /// Serialized length counted against `max_block_size`.
    pub fn data_length(&self, handler: &dyn TransactionHandler) -> usize {
        let mut length = BASE_LENGTH;

        length += 4 + self.data.contract_count as usize * CONTRACT_STATE_LENGTH;

        length += 4 + 4 + self.data.encoded_online_accounts.len() + 4;
        if let Some(signatures) = self.data.online_accounts_signatures.as_ref().filter(|s| !s.is_empty()) {
            length += 8 + signatures.len();
        }

        length += self
            .transactions()
            .iter()
            .filter(|tx| !tx.is_contract())
            .map(|tx| 4 + handler.data_length(tx))
            .sum::<usize>();

        length
    }

    /// Online reward-shares named by the bitset, or `None` if any index is unknown.
    pub fn online_reward_shares(&mut self, repository: &dyn Repository) -> ChainResult<Option<Vec<RewardShareData>>> {
        if let Some(shares) = &self.online_reward_shares {
            return Ok(Some(shares.clone()));
        }

        let indexes = match online::decode_online_accounts(&self.data.encoded_online_accounts) {
            Ok(indexes) => indexes,
            Err(e) => {
                return Err(ChainError::Inconsistent(format!("bad online accounts bitset: {e}")));
            }
        };

        let shares = repository.reward_shares_by_indexes(&indexes)?;
        self.online_reward_shares = shares.clone();
        Ok(shares)
    }

    /// Online reward-shares resolved to their accounts. Computed once per block instance.
    pub fn expanded_accounts(&mut self, repository: &dyn Repository) -> ChainResult<Vec<ExpandedAccount>> {
        if let Some(expanded) = &self.expanded_accounts {
            return Ok(expanded.clone());
        }

        let shares = self
            .online_reward_shares(repository)?
            .ok_or_else(|| ChainError::Inconsistent("block names unknown online reward-shares".to_string()))?;

        let expanded = shares
            .into_iter()
            .map(|share| ExpandedAccount::expand(repository, share))
            .collect::<ChainResult<Vec<_>>>()?;

        self.expanded_accounts = Some(expanded.clone());
        Ok(expanded)
    }

    /// Drop cached expanded accounts after account data may have changed.
    pub fn invalidate_expanded_accounts(&mut self) {
        self.expanded_accounts = None;
    }

    fn store_expanded_accounts(&mut self, expanded: Vec<ExpandedAccount>) {
        self.expanded_accounts = Some(expanded);
    }

    /// Set the key used by [`Block::sign`] and for adding transactions.
    pub fn set_minter_key(&mut self, key: SigningKey) {
        self.minter_key = Some(key);
    }

    fn minter_key(&self) -> ChainResult<&SigningKey> {
        if self.is_genesis {
            return Err(ChainError::Signing("the genesis block has no minter key".to_string()));
        }
        self.minter_key
            .as_ref()
            .ok_or_else(|| ChainError::Signing("no minter key".to_string()))
    }

    /// Sign the header then the transactions.
    pub fn sign(&mut self, handler: &dyn TransactionHandler) -> ChainResult<()> {
        let signature = self.minter_key()?.sign(&self.data.minter_signing_bytes());
        self.data.minter_signature = Some(signature.to_bytes().to_vec());

        self.sign_transactions(handler)
    }

    fn transactions_signing_bytes(&self, handler: &dyn TransactionHandler) -> ChainResult<Vec<u8>> {
        let minter_signature = self
            .data
            .minter_signature
            .as_ref()
            .ok_or_else(|| ChainError::Signing("block has no minter signature".to_string()))?;

        let mut bytes = minter_signature.clone();
        for transaction in self.transactions().iter().filter(|tx| !tx.is_contract()) {
            if !handler.is_signature_valid(transaction) {
                return Err(ChainError::Signing(format!(
                    "transaction {} has an invalid signature",
                    hex::encode(transaction.signature())
                )));
            }
            bytes.extend_from_slice(transaction.signature());
        }
        Ok(bytes)
    }

    /// Recompute the transactions signature after the transaction list changed.
    pub fn sign_transactions(&mut self, handler: &dyn TransactionHandler) -> ChainResult<()> {
        let bytes = self.transactions_signing_bytes(handler)?;
        let signature = self.minter_key()?.sign(&bytes).to_bytes().to_vec();
        self.data.transactions_signature = Some(signature);
        Ok(())
    }

    /// Whether both signatures verify against the minter's public key.
    pub fn is_signature_valid(&self, handler: &dyn TransactionHandler) -> bool {
        if self.is_genesis {
            return self.is_genesis_signature_valid();
        }

        let (Some(minter_signature), Some(transactions_signature)) =
            (&self.data.minter_signature, &self.data.transactions_signature)
        else {
            return false;
        };

        let Ok(key) = VerifyingKey::from_bytes(&self.data.minter_public_key) else {
            return false;
        };

        let verifies = |message: &[u8], signature: &[u8]| {
            Signature::from_slice(signature).is_ok_and(|signature| key.verify(message, &signature).is_ok())
        };

        if !verifies(&self.data.minter_signing_bytes(), minter_signature) {
            return false;
        }

        match self.transactions_signing_bytes(handler) {
            Ok(bytes) => verifies(&bytes, transactions_signature),
            Err(_) => false,
        }
    }

    /// Add a signed transaction, keeping canonical order and re-signing.
    ///
    /// Returns `false` if it would push the block over `max_block_size`.
    /// Adding a transaction already present is a no-op that returns `true`.
    pub fn add_transaction(&mut self, transaction: TransactionData, consensus: &Consensus) -> ChainResult<bool> {
        if self.is_genesis {
            return Ok(false);
        }
        self.minter_key()?;
        if self.data.minter_signature.is_none() {
            return Err(ChainError::Signing("block must be signed before adding transactions".to_string()));
        }

        let handler = consensus.handler.as_ref();
        if self
            .transactions()
            .iter()
            .any(|tx| tx.signature() == transaction.signature())
        {
            return Ok(true);
        }

        if self.data_length(handler) + handler.data_length(&transaction) > consensus.settings.max_block_size {
            return Ok(false);
        }

        trace!(
            signature = %hex::encode(&transaction.signature()[..transaction.signature().len().min(8)]),
            "Adding transaction to block"
        );

        self.data.transaction_count += 1;
        self.data.total_fees += transaction.fee;

        let transactions = self.transactions.get_or_insert_with(Vec::new);
        transactions.push(transaction);
        transactions.sort_by(|a, b| handler.compare(a, b));

        self.sign_transactions(handler)?;
        Ok(true)
    }

    /// Remove a transaction by signature and re-sign. Returns `false` if it was not present.
    pub fn delete_transaction(&mut self, signature: &[u8], consensus: &Consensus) -> ChainResult<bool> {
        if self.is_genesis {
            return Ok(false);
        }
        self.minter_key()?;

        let Some(transactions) = self.transactions.as_mut() else {
            return Ok(false);
        };
        let Some(position) = transactions.iter().position(|tx| tx.signature() == signature) else {
            return Ok(false);
        };

        let removed = transactions.remove(position);
        self.data.transaction_count -= 1;
        self.data.total_fees -= removed.fee;

        self.sign_transactions(consensus.handler.as_ref())?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by the block unit tests.

    use super::*;
    use crate::account::Address;
    use crate::contract::{Deployment, Execution, InterpreterFault, MachineFlags, MachinePlatform};
    use crate::transaction::{Payload, TransactionError, TransactionType, TransactionVerdict};
    use std::sync::atomic::{AtomicI64, Ordering};

    pub struct FixedClock(pub AtomicI64);

    impl Clock for FixedClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Contracts that never run; block tests do not deploy any.
    pub struct IdleInterpreter;

    impl Interpreter for IdleInterpreter {
        fn initialize(
            &self,
            _creation_bytes: &[u8],
            _platform: &mut dyn MachinePlatform,
        ) -> Result<Deployment, InterpreterFault> {
            Err(InterpreterFault::InvalidCreation("no contracts in block tests".to_string()))
        }

        fn execute(
            &self,
            _code: &[u8],
            state: &[u8],
            _platform: &mut dyn MachinePlatform,
        ) -> Result<Execution, InterpreterFault> {
            Ok(Execution {
                state: state.to_vec(),
                steps: 0,
                flags: MachineFlags::default(),
            })
        }
    }

    /// Accepts everything; signatures are whatever the test put there.
    pub struct PermissiveHandler;

    impl TransactionHandler for PermissiveHandler {
        fn is_valid(&self, _: &dyn Repository, _: &TransactionData) -> Result<TransactionVerdict, TransactionError> {
            Ok(TransactionVerdict::Valid)
        }

        fn is_processable(
            &self,
            _: &dyn Repository,
            _: &TransactionData,
        ) -> Result<TransactionVerdict, TransactionError> {
            Ok(TransactionVerdict::Valid)
        }

        fn has_valid_reference(&self, _: &dyn Repository, _: &TransactionData) -> Result<bool, TransactionError> {
            Ok(true)
        }

        fn is_signature_valid(&self, transaction: &TransactionData) -> bool {
            transaction.signature.is_some()
        }

        fn process(&self, _: &mut dyn Repository, _: &TransactionData) -> Result<(), TransactionError> {
            Ok(())
        }

        fn orphan(&self, _: &mut dyn Repository, _: &TransactionData) -> Result<(), TransactionError> {
            Ok(())
        }

        fn process_references_and_fees(
            &self,
            _: &mut dyn Repository,
            _: &TransactionData,
        ) -> Result<(), TransactionError> {
            Ok(())
        }

        fn orphan_references_and_fees(
            &self,
            _: &mut dyn Repository,
            _: &TransactionData,
        ) -> Result<(), TransactionError> {
            Ok(())
        }

        fn approval_decision(&self, _: &dyn Repository, _: &TransactionData) -> Result<Option<bool>, TransactionError> {
            Ok(None)
        }

        fn involved_addresses(&self, transaction: &TransactionData) -> Vec<Address> {
            vec![transaction.creator_address()]
        }

        fn bytes_for_signing(&self, transaction: &TransactionData) -> Vec<u8> {
            let mut bytes = transaction.tx_type.value().to_be_bytes().to_vec();
            bytes.extend_from_slice(&transaction.timestamp.to_be_bytes());
            bytes.extend_from_slice(&transaction.creator_public_key);
            bytes
        }

        fn data_length(&self, _: &TransactionData) -> usize {
            100
        }
    }

    pub fn consensus(now: i64) -> Consensus {
        let mut settings = ChainSettings::testchain().expect("testchain settings");
        settings.max_block_size = 1_000;
        Consensus::new(settings, Arc::new(PermissiveHandler), Arc::new(IdleInterpreter))
            .expect("bundled patch")
            .with_clock(Arc::new(FixedClock(AtomicI64::new(now))))
    }

    pub fn payment(timestamp: i64, marker: u8) -> TransactionData {
        let mut tx = TransactionData::new(
            TransactionType::Payment,
            timestamp,
            [marker; 32],
            Payload::Payment {
                recipient: Address::from_public_key(&[0xee; 32]),
                amount: 10,
            },
        );
        tx.fee = 5;
        tx.signature = Some(vec![marker; 64]);
        tx
    }

    pub fn unsigned_block(key: &SigningKey) -> BlockData {
        BlockData {
            version: BLOCK_VERSION,
            reference: vec![9u8; 128],
            transaction_count: 0,
            total_fees: 0,
            transactions_signature: None,
            height: None,
            timestamp: 1_000,
            minter_public_key: key.verifying_key().to_bytes(),
            minter_signature: None,
            contract_count: 0,
            contract_fees: 0,
            encoded_online_accounts: Vec::new(),
            online_accounts_count: 0,
            online_accounts_timestamp: None,
            online_accounts_signatures: None,
        }
    }
}
