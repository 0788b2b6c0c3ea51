// Copyright (c) 2024 Botho Foundation
//
//! A scripted contract interpreter.

use stakeline::contract::{Deployment, Execution, Interpreter, InterpreterFault, MachineFlags, MachinePlatform};

/// Creation bytes `[steps, rounds]`: burns `steps` steps per round and
/// finishes after `rounds` rounds, refunding whatever its fees leave.
///
/// The state is a single round counter.
pub struct ScriptedInterpreter;

pub fn scripted_contract(steps: u8, rounds: u8) -> Vec<u8> {
    vec![steps, rounds]
}

impl Interpreter for ScriptedInterpreter {
    fn initialize(
        &self,
        creation_bytes: &[u8],
        _platform: &mut dyn MachinePlatform,
    ) -> Result<Deployment, InterpreterFault> {
        if creation_bytes.len() != 2 {
            return Err(InterpreterFault::InvalidCreation(format!(
                "expected 2 creation bytes, got {}",
                creation_bytes.len()
            )));
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
        let (Some(steps), Some(rounds)) = (code.first().copied(), code.get(1).copied()) else {
            return Err(InterpreterFault::CorruptState("short code".to_string()));
        };
        let round = state.first().copied().unwrap_or(0).saturating_add(1);
        let is_finished = round >= rounds;

        if is_finished {
            let fees = i64::from(steps) * platform.fee_per_step();
            let balance = platform.current_balance()?;
            platform.on_finished(balance - fees)?;
        }

        Ok(Execution {
            state: vec![round],
            steps: u64::from(steps),
            flags: MachineFlags {
                is_finished,
                ..MachineFlags::default()
            },
        })
    }
}
