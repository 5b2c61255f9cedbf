//! The bytecode interpreter.
//!
//! Executes a linear opcode sequence against the typed memory machine and
//! the state journal. Gas is charged before every opcode; when the remaining
//! gas does not cover the next cost the call halts with `OutOfGas` and its
//! gas clamped to exactly zero. Recoverable errors convert into a revert of
//! the current call only; the caller observes a failed [`CallResult`] and
//! continues. Nested calls fork the journal and merge or reject it depending
//! on the child's outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use ethereum_types::U256;
use itertools::Itertools;
use log::{debug, trace};

use crate::env::{ExecutionEnvironment, Gas};
use crate::errors::{AvmError, AvmResult};
use crate::journal::StateManager;
use crate::memory::{MemoryTag, TaggedMemory, TaggedValue};
use crate::opcode::{EnvVar, Opcode, COPY_PER_ELEMENT, LOG_PER_FIELD};
use crate::world::{ContractStore, WorldStateStore};

/// The outcome of one call frame.
#[derive(Clone, Debug)]
pub struct CallResult {
    /// Whether the call reverted.
    pub reverted: bool,
    /// Return data (revert data for reverted calls; nested callers see an
    /// empty fallback instead).
    pub output: Vec<U256>,
    /// Gas remaining when the call halted.
    pub gas_left: Gas,
    /// The error that caused the revert, if any.
    pub revert_reason: Option<AvmError>,
}

impl CallResult {
    fn success(output: Vec<U256>, gas_left: Gas) -> Self {
        Self {
            reverted: false,
            output,
            gas_left,
            revert_reason: None,
        }
    }

    fn reverted(output: Vec<U256>, gas_left: Gas, reason: AvmError) -> Self {
        Self {
            reverted: true,
            output,
            gas_left,
            revert_reason: Some(reason),
        }
    }
}

/// The mutable per-call machine registers.
#[derive(Debug)]
pub struct MachineState {
    /// Program counter: an index into the opcode sequence.
    pub pc: usize,
    /// Gas remaining, never negative.
    pub gas_left: Gas,
    /// The call's tagged memory.
    pub memory: TaggedMemory,
    /// Return data of the most recent nested call (empty after a reverted
    /// one).
    pub returndata: Vec<U256>,
}

impl MachineState {
    fn new(gas: Gas) -> Self {
        Self {
            pc: 0,
            gas_left: gas,
            memory: TaggedMemory::new(),
            returndata: Vec::new(),
        }
    }

    /// Charges `cost`, clamping gas to zero and failing with `OutOfGas` when
    /// it is not covered.
    fn charge(&mut self, cost: Gas) -> AvmResult<()> {
        if !self.gas_left.covers(cost) {
            self.gas_left = Gas::ZERO;
            return Err(AvmError::OutOfGas);
        }
        self.gas_left = self.gas_left.saturating_sub(cost);
        Ok(())
    }
}

enum StepOutcome {
    Continue,
    Halt(CallResult),
}

fn saturating_u64(value: U256) -> u64 {
    if value.bits() > 64 {
        u64::MAX
    } else {
        value.low_u64()
    }
}

/// Executes bytecode against a borrowed state journal.
#[derive(Debug)]
pub struct Interpreter<'a, S> {
    journal: &'a mut StateManager<S>,
    opcode_counts: HashMap<&'static str, u64>,
}

impl<'a, S: WorldStateStore + ContractStore> Interpreter<'a, S> {
    /// Wraps a journal for execution.
    pub fn new(journal: &'a mut StateManager<S>) -> Self {
        Self {
            journal,
            opcode_counts: HashMap::new(),
        }
    }

    /// How many times each opcode ran, including in nested calls.
    pub fn opcode_counts(&self) -> &HashMap<&'static str, u64> {
        &self.opcode_counts
    }

    /// Runs `bytecode` to completion. Recoverable errors become a reverted
    /// [`CallResult`]; only fatal world-state errors surface as `Err`.
    pub async fn execute_bytecode(
        &mut self,
        bytecode: &[Opcode],
        env: &ExecutionEnvironment,
        gas: Gas,
    ) -> AvmResult<CallResult> {
        debug!(
            "Executing {} opcodes at {:x} (depth {}, static {})",
            bytecode.len(),
            env.address,
            env.depth,
            env.is_static_call
        );
        let mut machine = MachineState::new(gas);
        match self.run(bytecode, env, &mut machine).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_recoverable() => {
                debug!("Call at {:x} reverted: {e}", env.address);
                Ok(CallResult::reverted(Vec::new(), machine.gas_left, e))
            }
            Err(e) => Err(e),
        }
    }

    async fn run(
        &mut self,
        bytecode: &[Opcode],
        env: &ExecutionEnvironment,
        machine: &mut MachineState,
    ) -> AvmResult<CallResult> {
        loop {
            let Some(op) = bytecode.get(machine.pc) else {
                // Implicit end of bytecode: a successful empty return.
                return Ok(CallResult::success(Vec::new(), machine.gas_left));
            };
            let op = *op;
            machine.charge(self.cost_of(&op))?;
            *self.opcode_counts.entry(op.name()).or_insert(0) += 1;
            trace!("pc {} {}", machine.pc, op.name());

            match self.step(op, bytecode, env, machine).await? {
                StepOutcome::Halt(result) => return Ok(result),
                StepOutcome::Continue => {}
            }
        }
    }

    fn cost_of(&self, op: &Opcode) -> Gas {
        let dynamic = match op {
            Opcode::CalldataCopy { count, .. } | Opcode::ReturndataCopy { count, .. } => {
                COPY_PER_ELEMENT.scaled(*count)
            }
            Opcode::EmitPublicLog { size, .. } => LOG_PER_FIELD.scaled(*size),
            _ => Gas::ZERO,
        };
        op.base_cost().saturating_add(dynamic)
    }

    fn require_mutable(env: &ExecutionEnvironment, what: &'static str) -> AvmResult<()> {
        if env.is_static_call {
            return Err(AvmError::StaticCallViolation(what));
        }
        Ok(())
    }

    async fn step(
        &mut self,
        op: Opcode,
        bytecode: &[Opcode],
        env: &ExecutionEnvironment,
        machine: &mut MachineState,
    ) -> AvmResult<StepOutcome> {
        let mut next_pc = machine.pc + 1;
        match op {
            Opcode::Add { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::add)?,
            Opcode::Sub { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::sub)?,
            Opcode::Mul { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::mul)?,
            Opcode::Div { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::div)?,
            Opcode::And { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::and)?,
            Opcode::Or { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::or)?,
            Opcode::Xor { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::xor)?,
            Opcode::Shl { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::shl)?,
            Opcode::Shr { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::shr)?,
            Opcode::Eq { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::eq_op)?,
            Opcode::Lt { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::lt)?,
            Opcode::Lte { a, b, dst } => self.binary(machine, a, b, dst, TaggedValue::lte)?,
            Opcode::Not { a, dst } => {
                let value = machine.memory.read(a)?.not()?;
                machine.memory.write(dst, value)?;
            }
            Opcode::Set {
                value,
                tag,
                dst,
                indirect,
            } => {
                let dst = self.resolve(machine, dst, indirect)?;
                machine.memory.write(dst, TaggedValue::new(tag, value)?)?;
            }
            Opcode::Mov { src, dst, indirect } => {
                let src = self.resolve(machine, src, indirect)?;
                let dst = self.resolve(machine, dst, indirect)?;
                let value = machine.memory.read(src)?;
                machine.memory.write(dst, value)?;
            }
            Opcode::Cast { src, dst, tag } => {
                let value = machine.memory.read(src)?.cast(tag);
                machine.memory.write(dst, value)?;
            }
            Opcode::CalldataCopy {
                cd_offset,
                count,
                dst,
                indirect,
            } => {
                let dst = self.resolve(machine, dst, indirect)?;
                machine
                    .memory
                    .calldata_copy(&env.calldata, cd_offset, count, dst)?;
            }
            Opcode::ReturndataCopy {
                rd_offset,
                count,
                dst,
            } => {
                let returndata = std::mem::take(&mut machine.returndata);
                let copied = machine.memory.calldata_copy(&returndata, rd_offset, count, dst);
                machine.returndata = returndata;
                copied?;
            }
            Opcode::GetEnvVar { var, dst } => {
                let value = self.env_var(var, env, machine);
                machine.memory.write(dst, value)?;
            }
            Opcode::Jump { target } => {
                next_pc = self.jump_target(bytecode, target)?;
            }
            Opcode::JumpIf { cond, target } => {
                if !machine.memory.read(cond)?.value.is_zero() {
                    next_pc = self.jump_target(bytecode, target)?;
                }
            }
            Opcode::SLoad { slot, dst } => {
                let slot = machine.memory.read(slot)?.value;
                let value = self.journal.read_storage(env.address, slot).await?;
                machine.memory.write(dst, TaggedValue::field(value))?;
            }
            Opcode::SStore { slot, value } => {
                Self::require_mutable(env, "SSTORE")?;
                let slot = machine.memory.read(slot)?.value;
                let value = machine.memory.read(value)?.value;
                self.journal.write_storage(env.address, slot, value).await?;
            }
            Opcode::NoteHashExists {
                note_hash,
                leaf_index,
                dst,
            } => {
                let note_hash = machine.memory.read(note_hash)?.value;
                let index = saturating_u64(machine.memory.read(leaf_index)?.value);
                let exists = self.journal.check_note_hash_exists(note_hash, index).await?;
                machine.memory.write(dst, TaggedValue::bit(exists))?;
            }
            Opcode::EmitNoteHash { note_hash } => {
                Self::require_mutable(env, "EMITNOTEHASH")?;
                let note_hash = machine.memory.read(note_hash)?.value;
                self.journal.write_note_hash(env.address, note_hash).await?;
            }
            Opcode::NullifierExists {
                nullifier,
                address,
                dst,
            } => {
                let nullifier = machine.memory.read(nullifier)?.value;
                let address = machine.memory.read(address)?.value;
                let exists = self
                    .journal
                    .check_nullifier_exists(address, nullifier)
                    .await?;
                machine.memory.write(dst, TaggedValue::bit(exists))?;
            }
            Opcode::EmitNullifier { nullifier } => {
                Self::require_mutable(env, "EMITNULLIFIER")?;
                let nullifier = machine.memory.read(nullifier)?.value;
                self.journal.write_nullifier(env.address, nullifier).await?;
            }
            Opcode::L1ToL2MsgExists {
                msg_hash,
                leaf_index,
                dst,
            } => {
                let msg_hash = machine.memory.read(msg_hash)?.value;
                let index = saturating_u64(machine.memory.read(leaf_index)?.value);
                let exists = self
                    .journal
                    .check_l1_to_l2_message_exists(msg_hash, index)
                    .await?;
                machine.memory.write(dst, TaggedValue::bit(exists))?;
            }
            Opcode::SendL2ToL1Msg { recipient, content } => {
                Self::require_mutable(env, "SENDL2TOL1MSG")?;
                let recipient = machine.memory.read(recipient)?.value;
                let content = machine.memory.read(content)?.value;
                self.journal.write_l2_to_l1_message(recipient, content);
            }
            Opcode::EmitPublicLog { offset, size } => {
                Self::require_mutable(env, "EMITPUBLICLOG")?;
                let fields = machine
                    .memory
                    .read_slice(offset, size)?
                    .iter()
                    .map(|v| v.value)
                    .collect();
                self.journal.write_public_log(env.address, fields);
            }
            Opcode::GetContractInstance { address, dst, member } => {
                let address = machine.memory.read(address)?.value;
                let instance = self.journal.get_contract_instance(address).await?;
                let member_value = match (&instance, member) {
                    (Some(i), 0) => i.deployer,
                    (Some(i), 1) => i.class_id,
                    (Some(i), 2) => i.initialization_hash,
                    (None, 0..=2) => U256::zero(),
                    _ => {
                        return Err(AvmError::InvalidBytecode(format!(
                            "unknown contract-instance member {member}"
                        )))
                    }
                };
                machine
                    .memory
                    .write(dst, TaggedValue::bit(instance.is_some()))?;
                machine.memory.write(dst + 1, TaggedValue::field(member_value))?;
            }
            Opcode::Call {
                gas_offset,
                addr_offset,
                args_offset,
                args_size,
                success_offset,
            } => {
                self.nested_call(
                    machine,
                    env,
                    false,
                    gas_offset,
                    addr_offset,
                    args_offset,
                    args_size,
                    success_offset,
                )
                .await?;
            }
            Opcode::StaticCall {
                gas_offset,
                addr_offset,
                args_offset,
                args_size,
                success_offset,
            } => {
                self.nested_call(
                    machine,
                    env,
                    true,
                    gas_offset,
                    addr_offset,
                    args_offset,
                    args_size,
                    success_offset,
                )
                .await?;
            }
            Opcode::Return {
                ret_offset,
                ret_size,
            } => {
                let output = machine
                    .memory
                    .read_slice(ret_offset, ret_size)?
                    .iter()
                    .map(|v| v.value)
                    .collect_vec();
                return Ok(StepOutcome::Halt(CallResult::success(
                    output,
                    machine.gas_left,
                )));
            }
            Opcode::Revert {
                ret_offset,
                ret_size,
            } => {
                let output = machine
                    .memory
                    .read_slice(ret_offset, ret_size)?
                    .iter()
                    .map(|v| v.value)
                    .collect_vec();
                return Ok(StepOutcome::Halt(CallResult::reverted(
                    output,
                    machine.gas_left,
                    AvmError::AssertionFailure("explicit revert".into()),
                )));
            }
        }
        machine.pc = next_pc;
        Ok(StepOutcome::Continue)
    }

    fn binary(
        &self,
        machine: &mut MachineState,
        a: u64,
        b: u64,
        dst: u64,
        op: fn(TaggedValue, TaggedValue) -> AvmResult<TaggedValue>,
    ) -> AvmResult<()> {
        let lhs = machine.memory.read(a)?;
        let rhs = machine.memory.read(b)?;
        machine.memory.write(dst, op(lhs, rhs)?)
    }

    fn resolve(&self, machine: &MachineState, offset: u64, indirect: bool) -> AvmResult<u64> {
        if indirect {
            machine.memory.resolve_indirect(offset)
        } else {
            Ok(offset)
        }
    }

    fn jump_target(&self, bytecode: &[Opcode], target: u64) -> AvmResult<usize> {
        let target = usize::try_from(target).unwrap_or(usize::MAX);
        if target >= bytecode.len() {
            return Err(AvmError::InvalidBytecode(format!(
                "jump target {target} outside program of {} opcodes",
                bytecode.len()
            )));
        }
        Ok(target)
    }

    fn env_var(
        &self,
        var: EnvVar,
        env: &ExecutionEnvironment,
        machine: &MachineState,
    ) -> TaggedValue {
        match var {
            EnvVar::Address => TaggedValue::field(env.address),
            EnvVar::Sender => TaggedValue::field(env.sender),
            EnvVar::ChainId => TaggedValue::field(env.globals.chain_id),
            EnvVar::Version => TaggedValue::field(env.globals.version),
            EnvVar::BlockNumber => TaggedValue::field(U256::from(env.globals.block_number)),
            EnvVar::Timestamp => TaggedValue::field(U256::from(env.globals.timestamp)),
            EnvVar::FeePerL2Gas => TaggedValue::field(U256::from(env.globals.fee_per_l2_gas)),
            EnvVar::FeePerDaGas => TaggedValue::field(U256::from(env.globals.fee_per_da_gas)),
            EnvVar::IsStaticCall => TaggedValue::bit(env.is_static_call),
            EnvVar::L2GasLeft => TaggedValue::u64_of(machine.gas_left.l2),
            EnvVar::DaGasLeft => TaggedValue::u64_of(machine.gas_left.da),
            EnvVar::FunctionSelector => TaggedValue::u32_of(env.function_selector),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn nested_call(
        &mut self,
        machine: &mut MachineState,
        env: &ExecutionEnvironment,
        is_static: bool,
        gas_offset: u64,
        addr_offset: u64,
        args_offset: u64,
        args_size: u64,
        success_offset: u64,
    ) -> AvmResult<()> {
        let requested = Gas::new(
            saturating_u64(machine.memory.read(gas_offset)?.value),
            saturating_u64(machine.memory.read(gas_offset + 1)?.value),
        );
        let child_gas = requested.min(machine.gas_left);
        let callee = machine.memory.read(addr_offset)?.value;
        let calldata = machine
            .memory
            .read_slice(args_offset, args_size)?
            .iter()
            .map(|v| v.value)
            .collect_vec();
        let child_env = if is_static {
            env.nested_static(callee, calldata, 0)
        } else {
            env.nested(callee, calldata, 0)
        };

        let mut child_journal = self.journal.fork().await?;
        let bytecode = child_journal.get_bytecode(callee).await?;

        let result = match bytecode {
            None => {
                // A missing callee reverts the nested call only.
                debug!("No bytecode at {callee:x}, nested call reverts");
                CallResult::reverted(
                    Vec::new(),
                    child_gas,
                    AvmError::InvalidBytecode(format!("no bytecode at address {callee:x}")),
                )
            }
            Some(code) => {
                let (result, child_counts) = {
                    let mut child = Interpreter::new(&mut child_journal);
                    let fut: Pin<Box<dyn Future<Output = AvmResult<CallResult>> + '_>> =
                        Box::pin(child.execute_bytecode(&code, &child_env, child_gas));
                    let result = fut.await;
                    (result, child.opcode_counts)
                };
                for (name, count) in child_counts {
                    *self.opcode_counts.entry(name).or_insert(0) += count;
                }
                result?
            }
        };

        if result.reverted {
            self.journal.reject(child_journal).await?;
        } else {
            self.journal.merge(child_journal).await?;
        }

        let consumed = child_gas.saturating_sub(result.gas_left);
        machine.gas_left = machine.gas_left.saturating_sub(consumed);
        machine.returndata = if result.reverted {
            Vec::new()
        } else {
            result.output
        };
        machine
            .memory
            .write(success_offset, TaggedValue::bit(!result.reverted))?;
        Ok(())
    }
}
