// Copyright (c) 2024 Botho Foundation
//
//! Contract Integration Tests
//!
//! Deploys scripted contracts on a single-founder test chain and checks:
//! - The state snapshot, fees and refund of a contract's run
//! - Peers re-running contracts and comparing states
//! - Identical runs from identical chain state
//! - Orphaning contract runs and deployments

mod common;

use common::*;
use ed25519_dalek::SigningKey;
use stakeline::account::Address;
use stakeline::block::{Block, ValidationResult};
use stakeline::contract::execute_contracts;
use stakeline::transaction::Payload;
use stakeline::ImportResult;
use stk_util_amounts::MULTIPLIER;

// ============================================================================
// Constants
// ============================================================================

const BLOCK_REWARD: i64 = 5 * MULTIPLIER;

/// Funds sent to each deployed contract
const CONTRACT_FUNDS: i64 = 10 * MULTIPLIER;

/// Steps burned per round by the scripted contracts
const STEPS: u8 = 50;

// ============================================================================
// Helper Functions
// ============================================================================

/// A founder chain with a contract deployed in block 2.
fn chain_with_contract(seed: u64, rounds: u8) -> (TestChain, SigningKey, Address) {
    let key = seeded_keys(seed, 1).remove(0);
    let chain = TestChain::single_minter(&key, &key, true, true);
    let address = deploy(&chain, &key, rounds);
    (chain, key, address)
}

fn deploy(chain: &TestChain, key: &SigningKey, rounds: u8) -> Address {
    let deployment = signed_deploy(
        chain.handler(),
        key,
        scripted_contract(STEPS, rounds),
        CONTRACT_FUNDS,
        chain.tip().timestamp + 1,
    );
    let address = Address::contract(deployment.signature());

    let block = chain.build_block(key, vec![deployment]);
    assert_eq!(chain.import(block), ImportResult::Imported);
    address
}

fn fee_per_step(chain: &TestChain) -> i64 {
    chain.consensus().settings.contracts.fee_per_step
}

// ============================================================================
// Contract runs
// ============================================================================

#[test]
fn test_deploy_funds_contract() {
    let (chain, _, address) = chain_with_contract(1, 1);

    assert_eq!(chain.balance(&address), CONTRACT_FUNDS);

    let repository = chain.chain.lock();
    let contract = repository.contract(&address).unwrap().unwrap();
    assert!(!contract.flags.is_finished);

    let states = repository.contract_states_at(2).unwrap();
    assert_eq!(states.len(), 1);
    assert!(states[0].is_initial);
}

#[test]
fn test_finished_contract_refunds_creator() {
    let (chain, key, address) = chain_with_contract(2, 1);
    let creator = address_of(&key);
    let before = chain.balance(&creator);
    let fees = i64::from(STEPS) * fee_per_step(&chain);

    let block = chain.mint(&key);

    assert_eq!(block.contract_count, 1);
    assert_eq!(block.contract_fees, fees);
    assert_eq!(block.transaction_count, 0);

    // Founder collects the run's fees along with the refund
    assert_eq!(chain.balance(&address), 0);
    assert_eq!(chain.balance(&creator), before + CONTRACT_FUNDS + BLOCK_REWARD);

    let repository = chain.chain.lock();
    let states = repository.contract_states_at(3).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].fees, fees);
    assert!(states[0].flags.is_finished);
    assert!(repository.contract(&address).unwrap().unwrap().flags.is_finished);

    let transactions = repository.block_transactions(&block.signature()).unwrap();
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].is_contract());
    match &transactions[0].payload {
        Payload::Contract { recipient, amount, .. } => {
            assert_eq!(*recipient, creator);
            assert_eq!(*amount, Some(CONTRACT_FUNDS - fees));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_running_contract_pays_fees_each_block() {
    let (chain, key, address) = chain_with_contract(3, 3);
    let fees = i64::from(STEPS) * fee_per_step(&chain);

    chain.mint(&key);
    chain.mint(&key);

    assert_eq!(chain.balance(&address), CONTRACT_FUNDS - 2 * fees);
    let repository = chain.chain.lock();
    assert!(!repository.contract(&address).unwrap().unwrap().flags.is_finished);
    assert_eq!(repository.latest_contract_state(&address).unwrap().unwrap().state, vec![2]);
}

#[test]
fn test_finished_contract_stops_running() {
    let (chain, key, _) = chain_with_contract(4, 1);

    chain.mint(&key);
    let block = chain.mint(&key);

    assert_eq!(block.contract_count, 0);
    assert_eq!(block.contract_fees, 0);
}

#[test]
fn test_contract_runs_are_deterministic() {
    let (chain, _, _) = chain_with_contract(5, 2);
    let consensus = chain.consensus();
    let tip = chain.tip();
    let height = tip.height.unwrap() + 1;
    let timestamp = tip.timestamp + 60_000;

    let repository = chain.chain.lock();
    let run = |repository: &dyn stakeline::repository::Repository| {
        execute_contracts(
            repository,
            &consensus.settings,
            consensus.interpreter.as_ref(),
            height,
            timestamp,
        )
        .unwrap()
    };

    let first = run(&**repository);
    let second = run(&**repository);
    assert_eq!(first.states.len(), 1);
    assert_eq!(first, second);
}

// ============================================================================
// Peers
// ============================================================================

#[test]
fn test_peer_reruns_contracts() {
    let key = seeded_keys(6, 1).remove(0);
    let ours = TestChain::single_minter(&key, &key, true, true);
    let theirs = TestChain::single_minter(&key, &key, true, true);

    let deployment = signed_deploy(
        ours.handler(),
        &key,
        scripted_contract(STEPS, 1),
        CONTRACT_FUNDS,
        ours.tip().timestamp + 1,
    );
    let block = ours.build_block(&key, vec![deployment]);
    let received = Block::new(block.data().clone(), block.transactions().to_vec(), Vec::new());
    assert_eq!(ours.import(block), ImportResult::Imported);
    assert_eq!(theirs.import(received), ImportResult::Imported);

    let block = ours.build_block(&key, Vec::new());
    assert_eq!(block.contract_states().len(), 1);

    let received = Block::new(
        block.data().clone(),
        block.transactions().to_vec(),
        block.contract_states().to_vec(),
    );
    assert_eq!(theirs.import(received), ImportResult::Imported);
    assert_eq!(ours.import(block), ImportResult::Imported);

    assert_eq!(ours.tip().signature(), theirs.tip().signature());
    assert_eq!(ours.balance(&address_of(&key)), theirs.balance(&address_of(&key)));
}

#[test]
fn test_mismatched_contract_state_is_rejected() {
    let (chain, key, _) = chain_with_contract(7, 2);

    let block = chain.build_block(&key, Vec::new());
    let mut states = block.contract_states().to_vec();
    states[0].state_hash = [0xffu8; 32];

    let received = Block::new(block.data().clone(), block.transactions().to_vec(), states);
    assert_eq!(
        chain.import(received),
        ImportResult::Rejected(ValidationResult::ContractStatesMismatch)
    );

    let repository = chain.chain.lock();
    assert_eq!(repository.chain_height().unwrap(), 2);
}

// ============================================================================
// Orphaning
// ============================================================================

#[test]
fn test_orphan_contract_run() {
    let (chain, key, address) = chain_with_contract(8, 1);
    let creator = address_of(&key);
    let before = chain.balance(&creator);

    chain.mint(&key);
    assert!(chain.chain.orphan_to(2).unwrap());

    assert_eq!(chain.balance(&address), CONTRACT_FUNDS);
    assert_eq!(chain.balance(&creator), before);
    {
        let repository = chain.chain.lock();
        assert!(repository.contract_states_at(3).unwrap().is_empty());
        assert!(!repository.contract(&address).unwrap().unwrap().flags.is_finished);
    }

    // The contract runs again on the next block
    let block = chain.mint(&key);
    assert_eq!(block.contract_count, 1);
    assert_eq!(chain.balance(&address), 0);
}

#[test]
fn test_orphan_deployment() {
    let key = seeded_keys(9, 1).remove(0);
    let chain = TestChain::single_minter(&key, &key, true, true);
    let creator = address_of(&key);
    let before = chain.balance(&creator);

    let address = deploy(&chain, &key, 1);
    assert!(chain.chain.orphan_to(1).unwrap());

    assert_eq!(chain.balance(&creator), before);
    assert_eq!(chain.balance(&address), 0);

    let repository = chain.chain.lock();
    assert!(repository.contract(&address).unwrap().is_none());
    assert!(repository.contract_states_at(2).unwrap().is_empty());
}
