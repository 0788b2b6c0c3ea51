// Copyright (c) 2024 Botho Foundation

//! Contract lifecycle: deploy, run once per block, persist and revert states.
//!
//! Contracts run in creation order because a later contract may see the
//! transactions an earlier one generated in the same block. Each run yields
//! one [`ContractStateData`] per contract; fees are `steps * fee_per_step`.
//!
//! Contract timestamps are not wall-clock times but `(height << 32) | sequence`
//! cursors into the chain's transactions.

mod adapter;
mod interpreter;

pub use adapter::{contract_transaction_signature, ContractPlatform, PlatformError, MESSAGE_TYPE, PAYMENT_TYPE};
pub use interpreter::{
    Deployment, Execution, Interpreter, InterpreterFault, MachineFlags, MachinePlatform, RandomDraw,
    Register,
};

use crate::account::{Address, NATIVE_ASSET};
use crate::config::ChainSettings;
use crate::error::{ChainError, ChainResult};
use crate::repository::{AccountBalance, Repository};
use crate::transaction::{Payload, TransactionData};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

/// A deployed contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractData {
    pub address: Address,
    pub creator_public_key: [u8; 32],
    /// Timestamp of the deploying transaction
    pub creation: i64,
    pub version: i32,
    pub asset_id: i64,
    pub code: Vec<u8>,
    pub code_hash: [u8; 32],
    /// Mirrored from the latest state
    pub flags: MachineFlags,
}

impl ContractData {
    /// Whether the contract takes part in the block at `height`.
    pub fn is_executable_at(&self, height: u32) -> bool {
        if self.flags.is_finished {
            return false;
        }
        if !self.flags.is_sleeping {
            return true;
        }
        self.flags
            .sleep_until_height
            .is_some_and(|until| until <= height)
    }
}

/// One contract's state after the block at `height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractStateData {
    pub address: Address,
    pub height: u32,
    pub state: Vec<u8>,
    pub state_hash: [u8; 32],
    pub fees: i64,
    /// Produced by deployment rather than by a run
    pub is_initial: bool,
    pub flags: MachineFlags,
}

/// Everything the contracts produced for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractRun {
    pub transactions: Vec<TransactionData>,
    pub states: Vec<ContractStateData>,
    pub fees: i64,
}

pub fn contract_timestamp(height: u32, sequence: u32) -> i64 {
    (i64::from(height) << 32) | i64::from(sequence)
}

pub fn timestamp_height(timestamp: i64) -> u32 {
    (timestamp >> 32) as u32
}

pub fn timestamp_sequence(timestamp: i64) -> u32 {
    timestamp as u32
}

fn state_hash(state: &[u8]) -> [u8; 32] {
    Sha256::digest(state).into()
}

/// Run every executable contract for the block at `height`.
pub fn execute_contracts(
    repository: &dyn Repository,
    settings: &ChainSettings,
    interpreter: &dyn Interpreter,
    height: u32,
    block_timestamp: i64,
) -> ChainResult<ContractRun> {
    let mut run = ContractRun::default();

    for contract in repository.executable_contracts(height)? {
        let (transactions, state) =
            run_contract(repository, settings, interpreter, &contract, height, block_timestamp)?;

        run.fees = run
            .fees
            .checked_add(state.fees)
            .ok_or_else(|| ChainError::Inconsistent("contract fees overflow".to_string()))?;
        run.transactions.extend(transactions);
        run.states.push(state);
    }

    debug!(
        height,
        contracts = run.states.len(),
        transactions = run.transactions.len(),
        fees = run.fees,
        "Executed contracts"
    );
    Ok(run)
}

fn run_contract(
    repository: &dyn Repository,
    settings: &ChainSettings,
    interpreter: &dyn Interpreter,
    contract: &ContractData,
    height: u32,
    block_timestamp: i64,
) -> ChainResult<(Vec<TransactionData>, ContractStateData)> {
    let latest = repository
        .latest_contract_state(&contract.address)?
        .ok_or_else(|| ChainError::MissingContractState(contract.address.to_string()))?;

    let mut platform = ContractPlatform::new(repository, settings, contract, block_timestamp);

    match interpreter.execute(&contract.code, &latest.state, &mut platform) {
        Ok(execution) => {
            let steps = i64::try_from(execution.steps)
                .map_err(|_| ChainError::Inconsistent("contract step count overflow".to_string()))?;
            let fees = steps
                .checked_mul(settings.contracts.fee_per_step)
                .ok_or_else(|| ChainError::Inconsistent("contract fees overflow".to_string()))?;

            trace!(
                contract = %contract.address,
                steps = execution.steps,
                fees,
                finished = execution.flags.is_finished,
                "Ran contract"
            );

            let state = ContractStateData {
                address: contract.address,
                height,
                state_hash: state_hash(&execution.state),
                state: execution.state,
                fees,
                is_initial: false,
                flags: execution.flags,
            };
            Ok((platform.into_transactions(), state))
        }
        Err(fault) => {
            warn!(contract = %contract.address, height, error = %fault, "Contract suffered fatal error");

            let flags = MachineFlags {
                is_finished: true,
                had_fatal_error: true,
                is_sleeping: false,
                sleep_until_height: None,
                ..latest.flags
            };
            let state = ContractStateData {
                address: contract.address,
                height,
                state_hash: state_hash(&latest.state),
                state: latest.state,
                fees: 0,
                is_initial: false,
                flags,
            };
            Ok((Vec::new(), state))
        }
    }
}

/// Create a contract from a deploy transaction being processed in the next block.
///
/// Saves the contract and its initial state at the deploying height.
pub fn deploy(
    repository: &mut dyn Repository,
    settings: &ChainSettings,
    interpreter: &dyn Interpreter,
    deploy_transaction: &TransactionData,
) -> ChainResult<Address> {
    let Payload::DeployContract {
        creation_bytes,
        asset_id,
        ..
    } = &deploy_transaction.payload
    else {
        return Err(ChainError::Inconsistent(
            "deploy needs a deploy-contract transaction".to_string(),
        ));
    };

    let address = Address::contract(deploy_transaction.signature());
    let height = repository.chain_height()? + 1;

    let mut contract = ContractData {
        address,
        creator_public_key: deploy_transaction.creator_public_key,
        creation: deploy_transaction.timestamp,
        version: 0,
        asset_id: *asset_id,
        code: Vec::new(),
        code_hash: [0u8; 32],
        flags: MachineFlags::default(),
    };

    let deployment = {
        let mut platform =
            ContractPlatform::new(&*repository, settings, &contract, contract_timestamp(height, 0));
        interpreter.initialize(creation_bytes, &mut platform)?
    };

    contract.version = deployment.version;
    contract.code_hash = Sha256::digest(&deployment.code).into();
    contract.code = deployment.code;
    contract.flags = deployment.flags;

    let initial = ContractStateData {
        address,
        height,
        state_hash: state_hash(&deployment.state),
        state: deployment.state,
        fees: 0,
        is_initial: true,
        flags: deployment.flags,
    };

    repository.save_contract(&contract)?;
    repository.save_contract_state(&initial)?;

    debug!(contract = %address, height, "Deployed contract");
    Ok(address)
}

/// Remove a contract deployed by an orphaned transaction.
pub fn undeploy(repository: &mut dyn Repository, deploy_transaction: &TransactionData) -> ChainResult<()> {
    let address = Address::contract(deploy_transaction.signature());
    repository.delete_contract(&address)?;
    Ok(())
}

fn mirror_flags(repository: &mut dyn Repository, address: &Address, flags: MachineFlags) -> ChainResult<()> {
    let mut contract = repository
        .contract(address)?
        .ok_or_else(|| ChainError::Inconsistent(format!("unknown contract {address}")))?;
    contract.flags = flags;
    repository.save_contract(&contract)?;
    Ok(())
}

/// Charge a run's fees to the contract, save its state and mirror its flags.
pub fn apply_state(repository: &mut dyn Repository, state: &ContractStateData) -> ChainResult<()> {
    repository.modify_balances(&[AccountBalance {
        address: state.address,
        asset_id: NATIVE_ASSET,
        amount: -state.fees,
    }])?;

    repository.save_contract_state(state)?;
    mirror_flags(repository, &state.address, state.flags)
}

/// Undo [`apply_state`] for the block at `height`.
pub fn revert_state(repository: &mut dyn Repository, state: &ContractStateData, height: u32) -> ChainResult<()> {
    repository.modify_balances(&[AccountBalance {
        address: state.address,
        asset_id: NATIVE_ASSET,
        amount: state.fees,
    }])?;

    repository.delete_contract_state(&state.address, height)?;

    if state.is_initial {
        return Ok(());
    }

    let previous = repository
        .latest_contract_state(&state.address)?
        .ok_or_else(|| ChainError::MissingContractState(state.address.to_string()))?;
    mirror_flags(repository, &state.address, previous.flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AccountStore, ContractStore, MemoryRepository};
    use crate::transaction::TransactionType;

    /// Burns `code[0]` steps per round and finishes once the state counter reaches `code[1]`.
    struct CountingInterpreter;

    impl Interpreter for CountingInterpreter {
        fn initialize(
            &self,
            creation_bytes: &[u8],
            _platform: &mut dyn MachinePlatform,
        ) -> Result<Deployment, InterpreterFault> {
            if creation_bytes.len() != 2 {
                return Err(InterpreterFault::InvalidCreation("need two bytes".to_string()));
            }
            Ok(Deployment {
                version: 2,
                code: creation_bytes.to_vec(),
                state: vec![0],
                flags: MachineFlags::default(),
            })
        }

        fn execute(
            &self,
            code: &[u8],
            state: &[u8],
            platform: &mut dyn MachinePlatform,
        ) -> Result<Execution, InterpreterFault> {
            let counter = state.first().copied().unwrap_or(0);
            if counter == 0xff {
                return Err(InterpreterFault::Execution("boom".to_string()));
            }
            let counter = counter + 1;
            let is_finished = counter >= code[1];
            if is_finished {
                let balance = platform.current_balance()?;
                platform.on_finished(balance)?;
            }
            Ok(Execution {
                state: vec![counter],
                steps: u64::from(code[0]),
                flags: MachineFlags {
                    is_finished,
                    ..MachineFlags::default()
                },
            })
        }
    }

    fn deploy_tx(creation_bytes: Vec<u8>) -> TransactionData {
        let mut tx = TransactionData::new(
            TransactionType::DeployContract,
            5_000,
            [3u8; 32],
            Payload::DeployContract {
                name: "counter".to_string(),
                creation_bytes,
                amount: 0,
                asset_id: NATIVE_ASSET,
            },
        );
        tx.signature = Some(vec![0x42; 64]);
        tx
    }

    #[test]
    fn test_timestamp_packing() {
        let timestamp = contract_timestamp(123_456, 7);
        assert_eq!(timestamp_height(timestamp), 123_456);
        assert_eq!(timestamp_sequence(timestamp), 7);
    }

    #[test]
    fn test_sleeping_contract_wakes_at_height() {
        let mut contract = ContractData {
            address: Address::contract(&[1u8; 64]),
            creator_public_key: [0u8; 32],
            creation: 0,
            version: 2,
            asset_id: NATIVE_ASSET,
            code: Vec::new(),
            code_hash: [0u8; 32],
            flags: MachineFlags {
                is_sleeping: true,
                sleep_until_height: Some(10),
                ..MachineFlags::default()
            },
        };
        assert!(!contract.is_executable_at(9));
        assert!(contract.is_executable_at(10));

        contract.flags.is_finished = true;
        assert!(!contract.is_executable_at(10));
    }

    #[test]
    fn test_deploy_then_run_charges_steps() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let tx = deploy_tx(vec![7, 3]);

        let address = deploy(&mut repository, &settings, &CountingInterpreter, &tx).unwrap();
        let initial = repository.latest_contract_state(&address).unwrap().unwrap();
        assert!(initial.is_initial);
        assert_eq!(initial.height, 1);

        let run = execute_contracts(&repository, &settings, &CountingInterpreter, 2, 0).unwrap();
        assert_eq!(run.states.len(), 1);
        assert_eq!(run.fees, 7 * settings.contracts.fee_per_step);
        assert_eq!(run.states[0].state, vec![1]);
        assert!(run.transactions.is_empty());
    }

    #[test]
    fn test_execution_is_deterministic() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        deploy(&mut repository, &settings, &CountingInterpreter, &deploy_tx(vec![4, 9])).unwrap();

        let first = execute_contracts(&repository, &settings, &CountingInterpreter, 2, 10).unwrap();
        let second = execute_contracts(&repository, &settings, &CountingInterpreter, 2, 10).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fault_marks_contract_finished() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let address = deploy(&mut repository, &settings, &CountingInterpreter, &deploy_tx(vec![1, 2])).unwrap();

        let mut broken = repository.latest_contract_state(&address).unwrap().unwrap();
        broken.state = vec![0xff];
        broken.height = 2;
        broken.is_initial = false;
        repository.save_contract_state(&broken).unwrap();

        let run = execute_contracts(&repository, &settings, &CountingInterpreter, 3, 0).unwrap();
        let state = &run.states[0];
        assert_eq!(state.fees, 0);
        assert_eq!(state.state, vec![0xff]);
        assert!(state.flags.had_fatal_error);
        assert!(state.flags.is_finished);
    }

    #[test]
    fn test_apply_and_revert_state() {
        let settings = ChainSettings::testchain().unwrap();
        let mut repository = MemoryRepository::new();
        let address = deploy(&mut repository, &settings, &CountingInterpreter, &deploy_tx(vec![5, 1])).unwrap();
        repository
            .modify_balances(&[AccountBalance {
                address,
                asset_id: NATIVE_ASSET,
                amount: 1_000,
            }])
            .unwrap();

        let run = execute_contracts(&repository, &settings, &CountingInterpreter, 2, 0).unwrap();
        let state = run.states[0].clone();
        assert!(state.flags.is_finished);
        // Finishing refunds the balance to the creator
        assert_eq!(run.transactions.len(), 1);

        apply_state(&mut repository, &state).unwrap();
        assert!(repository.contract(&address).unwrap().unwrap().flags.is_finished);
        assert_eq!(
            repository.balance(&address, NATIVE_ASSET).unwrap(),
            1_000 - state.fees
        );

        revert_state(&mut repository, &state, 2).unwrap();
        assert!(!repository.contract(&address).unwrap().unwrap().flags.is_finished);
        assert_eq!(repository.balance(&address, NATIVE_ASSET).unwrap(), 1_000);
        assert!(repository.latest_contract_state(&address).unwrap().unwrap().is_initial);
    }
}
