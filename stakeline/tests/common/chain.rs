// Copyright (c) 2024 Botho Foundation
//
//! A blockchain over the in-memory repository with a hand-driven clock.

use super::{public_key, LedgerHandler, ScriptedInterpreter, TestClock};
use ed25519_dalek::{Signer, SigningKey};
use stakeline::account::{AccountData, Address, FOUNDER_FLAG, NATIVE_ASSET};
use stakeline::block::online::ONLINE_TIMESTAMP_MODULUS;
use stakeline::block::{Block, BlockData, Consensus, HistoricalPatch, OnlineAccountData};
use stakeline::config::{ChainSettings, GenesisKind, GenesisTransaction};
use stakeline::repository::MemoryRepository;
use stakeline::transaction::{TransactionData, TransactionHandler};
use stakeline::{Blockchain, ImportResult};
use std::sync::{Arc, Mutex};

/// Genesis timestamp used by every test chain.
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000_000;

/// Later than any block timestamp a minter can pick after its parent.
const CLOCK_LEAD: i64 = 120_000;

pub fn address_of(key: &SigningKey) -> Address {
    Address::from_public_key(&public_key(key))
}

fn genesis_entry(creator: Option<&SigningKey>, kind: GenesisKind) -> GenesisTransaction {
    GenesisTransaction {
        timestamp: 0,
        fee: 0,
        creator_public_key: creator.map(|key| hex::encode(public_key(key))),
        kind,
    }
}

pub fn genesis_funds(recipient: Address, amount: i64) -> GenesisTransaction {
    genesis_entry(
        None,
        GenesisKind::Genesis {
            recipient,
            amount,
            asset_id: NATIVE_ASSET,
        },
    )
}

pub fn genesis_level(target: Address, level: u32) -> GenesisTransaction {
    genesis_entry(None, GenesisKind::AccountLevel { target, level })
}

pub fn genesis_founder(target: Address) -> GenesisTransaction {
    genesis_entry(
        None,
        GenesisKind::AccountFlags {
            target,
            and_mask: -1,
            or_mask: FOUNDER_FLAG,
            xor_mask: 0,
        },
    )
}

pub fn genesis_reward_share(
    minter: &SigningKey,
    recipient: Address,
    reward_share_key: &SigningKey,
    share_percent: i64,
) -> GenesisTransaction {
    genesis_entry(
        Some(minter),
        GenesisKind::RewardShare {
            recipient,
            reward_share_public_key: hex::encode(public_key(reward_share_key)),
            share_percent,
        },
    )
}

/// Test chain settings with the given genesis transactions.
pub fn test_settings(is_test_chain: bool, genesis: Vec<GenesisTransaction>) -> ChainSettings {
    let mut settings = ChainSettings::testchain().expect("bundled settings");
    settings.is_test_chain = is_test_chain;
    settings.genesis.timestamp = GENESIS_TIMESTAMP;
    settings.genesis.transactions = genesis;
    settings.fix_up().expect("fix up settings");
    settings
}

pub struct TestChain {
    pub chain: Blockchain,
    pub clock: Arc<TestClock>,
    online_keys: Mutex<Vec<SigningKey>>,
}

impl TestChain {
    /// A chain with the genesis block processed.
    pub fn new(settings: ChainSettings) -> Self {
        Self::build(settings, None)
    }

    /// As [`TestChain::new`] but with its own balance correction in place of the bundled one.
    pub fn with_patch(settings: ChainSettings, patch: HistoricalPatch) -> Self {
        Self::build(settings, Some(patch))
    }

    fn build(settings: ChainSettings, patch: Option<HistoricalPatch>) -> Self {
        let clock = Arc::new(TestClock::new(GENESIS_TIMESTAMP));
        let handler = Arc::new(LedgerHandler::new(settings.cumulative_blocks_by_level().to_vec()));

        let mut consensus = Consensus::new(settings, handler, Arc::new(ScriptedInterpreter))
            .expect("bundled patch")
            .with_clock(clock.clone());
        if let Some(patch) = patch {
            consensus.patch = patch;
        }

        let chain = Blockchain::new(Box::new(MemoryRepository::new()), consensus);
        chain.validate().expect("genesis");

        Self {
            chain,
            clock,
            online_keys: Mutex::new(Vec::new()),
        }
    }

    /// One minter at `level` (or a founder) sharing with itself through `reward_share_key`, funded with 1000.
    pub fn single_minter(minter: &SigningKey, reward_share_key: &SigningKey, founder: bool, is_test_chain: bool) -> Self {
        let address = address_of(minter);
        let mut genesis = vec![genesis_funds(address, 1_000 * stk_util_amounts::MULTIPLIER)];
        if founder {
            genesis.push(genesis_founder(address));
        } else {
            genesis.push(genesis_level(address, 1));
        }
        genesis.push(genesis_reward_share(minter, address, reward_share_key, 0));

        let chain = Self::new(test_settings(is_test_chain, genesis));
        chain.set_online_keys(vec![reward_share_key.clone()]);
        chain
    }

    pub fn consensus(&self) -> &Consensus {
        self.chain.consensus()
    }

    pub fn handler(&self) -> &dyn TransactionHandler {
        self.consensus().handler.as_ref()
    }

    /// Reward-share keys reported online before each block.
    pub fn set_online_keys(&self, keys: Vec<SigningKey>) {
        *self.online_keys.lock().expect("online keys") = keys;
    }

    pub fn tip(&self) -> BlockData {
        self.chain.lock().last_block().expect("last block").expect("chain not empty")
    }

    pub fn height(&self) -> u32 {
        self.chain.lock().chain_height().expect("chain height")
    }

    pub fn balance(&self, address: &Address) -> i64 {
        self.chain.lock().balance(address, NATIVE_ASSET).expect("balance")
    }

    pub fn account(&self, address: &Address) -> Option<AccountData> {
        self.chain.lock().account(address).expect("account")
    }

    /// Move the clock past the next block's timestamp and refresh online accounts.
    fn prepare_next_block(&self) {
        self.clock.set(self.tip().timestamp + CLOCK_LEAD);

        let now = self.consensus().now();
        let timestamp = now - now % ONLINE_TIMESTAMP_MODULUS;
        let online = self
            .online_keys
            .lock()
            .expect("online keys")
            .iter()
            .map(|key| {
                let signature = key.sign(&timestamp.to_be_bytes()).to_bytes().to_vec();
                OnlineAccountData::new(timestamp, signature, public_key(key))
            })
            .collect();
        self.consensus().online_accounts.set_current(online);
    }

    /// Mint and apply an empty block.
    pub fn mint(&self, reward_share_key: &SigningKey) -> BlockData {
        self.prepare_next_block();
        self.chain
            .mint(reward_share_key.clone())
            .expect("mint")
            .expect("minter can mint")
    }

    /// Mint a signed block on the tip holding `transactions`, without applying it.
    pub fn build_block(&self, reward_share_key: &SigningKey, transactions: Vec<TransactionData>) -> Block {
        self.prepare_next_block();

        let parent = self.tip();
        let mut block = {
            let repository = self.chain.lock();
            Block::mint(&**repository, self.consensus(), &parent, reward_share_key.clone())
                .expect("mint")
                .expect("minter can mint")
        };
        block.sign(self.handler()).expect("sign");

        for transaction in transactions {
            assert!(block.add_transaction(transaction, self.consensus()).expect("add transaction"));
        }
        block
    }

    pub fn import(&self, block: Block) -> ImportResult {
        self.chain.import_block(block).expect("import")
    }
}
