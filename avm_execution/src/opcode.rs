//! The structured instruction set of the execution engine.
//!
//! Bytecode is a sequence of [`Opcode`] values; the program counter indexes
//! into that sequence, so jump targets are opcode indices rather than byte
//! offsets. Each opcode carries a static base cost in both gas dimensions;
//! opcodes that touch a variable number of elements additionally charge a
//! per-element cost in the interpreter.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::env::Gas;
use crate::memory::MemoryTag;

/// An environment getter, read via [`Opcode::GetEnvVar`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum EnvVar {
    /// The executing contract's address.
    Address,
    /// The calling contract's address.
    Sender,
    /// The chain id.
    ChainId,
    /// The rollup version.
    Version,
    /// The block number.
    BlockNumber,
    /// The block timestamp.
    Timestamp,
    /// Base fee per unit of L2 gas.
    FeePerL2Gas,
    /// Base fee per unit of DA gas.
    FeePerDaGas,
    /// Whether the current frame is static.
    IsStaticCall,
    /// L2 gas remaining after this opcode's own charge.
    L2GasLeft,
    /// DA gas remaining after this opcode's own charge.
    DaGasLeft,
    /// The invoked function selector.
    FunctionSelector,
}

/// A single instruction. Operands named `*_offset` are memory offsets;
/// `indirect` operands are resolved through a `U32`-tagged cell first.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Opcode {
    /// `mem[dst] = mem[a] + mem[b]` (tag-checked).
    Add {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// `mem[dst] = mem[a] - mem[b]` (tag-checked).
    Sub {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// `mem[dst] = mem[a] * mem[b]` (tag-checked).
    Mul {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// `mem[dst] = mem[a] / mem[b]`; division by zero yields zero.
    Div {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Bitwise AND (integral tags only).
    And {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Bitwise OR (integral tags only).
    Or {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Bitwise XOR (integral tags only).
    Xor {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Bitwise NOT within the operand's tag width.
    Not {
        /// Operand offset.
        a: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Left shift, truncating into the operand's tag width.
    Shl {
        /// Value offset.
        a: u64,
        /// Shift-amount offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Right shift.
    Shr {
        /// Value offset.
        a: u64,
        /// Shift-amount offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Tag-checked equality; writes a `U1`.
    Eq {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Tag-checked less-than; writes a `U1`.
    Lt {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Tag-checked less-than-or-equal; writes a `U1`.
    Lte {
        /// Left operand offset.
        a: u64,
        /// Right operand offset.
        b: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Writes an immediate constant with the given tag.
    Set {
        /// The constant (must fit `tag`).
        value: U256,
        /// The destination cell's tag.
        tag: MemoryTag,
        /// Destination offset.
        dst: u64,
        /// Resolve `dst` through a `U32` cell first.
        indirect: bool,
    },
    /// Copies one cell, tag included.
    Mov {
        /// Source offset.
        src: u64,
        /// Destination offset.
        dst: u64,
        /// Resolve both offsets through `U32` cells first.
        indirect: bool,
    },
    /// Re-tags a cell, truncating into the target range.
    Cast {
        /// Source offset.
        src: u64,
        /// Destination offset.
        dst: u64,
        /// The target tag.
        tag: MemoryTag,
    },
    /// Copies a calldata range into memory as `Field` cells.
    CalldataCopy {
        /// First calldata element to copy.
        cd_offset: u64,
        /// Number of elements.
        count: u64,
        /// Destination offset.
        dst: u64,
        /// Resolve `dst` through a `U32` cell first.
        indirect: bool,
    },
    /// Copies a range of the last nested call's returndata into memory.
    ReturndataCopy {
        /// First returndata element to copy.
        rd_offset: u64,
        /// Number of elements.
        count: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Reads an environment getter; writes a `Field` (or `U1` for
    /// `IsStaticCall`).
    GetEnvVar {
        /// Which getter.
        var: EnvVar,
        /// Destination offset.
        dst: u64,
    },
    /// Unconditional jump to an opcode index.
    Jump {
        /// Target opcode index.
        target: u64,
    },
    /// Jumps iff the condition cell is nonzero.
    JumpIf {
        /// Condition offset.
        cond: u64,
        /// Target opcode index.
        target: u64,
    },
    /// Reads public storage at the (unsiloed) slot in `mem[slot]` into
    /// `mem[dst]`.
    SLoad {
        /// Slot offset.
        slot: u64,
        /// Destination offset.
        dst: u64,
    },
    /// Writes `mem[value]` to public storage at the slot in `mem[slot]`.
    SStore {
        /// Slot offset.
        slot: u64,
        /// Value offset.
        value: u64,
    },
    /// Checks note-hash membership at a given leaf index; writes a `U1`.
    NoteHashExists {
        /// Note-hash offset.
        note_hash: u64,
        /// Leaf-index offset.
        leaf_index: u64,
        /// Destination offset for the existence bit.
        dst: u64,
    },
    /// Emits a new note hash.
    EmitNoteHash {
        /// Note-hash offset.
        note_hash: u64,
    },
    /// Checks nullifier existence for a given contract; writes a `U1`.
    NullifierExists {
        /// Nullifier offset.
        nullifier: u64,
        /// Contract-address offset.
        address: u64,
        /// Destination offset for the existence bit.
        dst: u64,
    },
    /// Emits a new nullifier; duplicates revert the call.
    EmitNullifier {
        /// Nullifier offset.
        nullifier: u64,
    },
    /// Checks L1-to-L2 message membership at a leaf index; writes a `U1`.
    L1ToL2MsgExists {
        /// Message-hash offset.
        msg_hash: u64,
        /// Leaf-index offset.
        leaf_index: u64,
        /// Destination offset for the existence bit.
        dst: u64,
    },
    /// Queues an L2-to-L1 message.
    SendL2ToL1Msg {
        /// Recipient (L1 address) offset.
        recipient: u64,
        /// Content offset.
        content: u64,
    },
    /// Emits a public log of `size` fields starting at `offset`.
    EmitPublicLog {
        /// First log field offset.
        offset: u64,
        /// Number of fields.
        size: u64,
    },
    /// Looks up a deployed contract instance; writes an existence `U1` and,
    /// on success, the requested member.
    GetContractInstance {
        /// Contract-address offset.
        address: u64,
        /// Destination offset (existence bit at `dst`, member at `dst + 1`).
        dst: u64,
        /// Which member to read: 0 deployer, 1 class id, 2 initialization
        /// hash.
        member: u8,
    },
    /// A nested call.
    Call {
        /// Offset of two consecutive `Field` cells holding the L2 and DA gas
        /// allocations.
        gas_offset: u64,
        /// Callee-address offset.
        addr_offset: u64,
        /// First calldata cell offset.
        args_offset: u64,
        /// Number of calldata cells.
        args_size: u64,
        /// Destination offset for the success `U1`.
        success_offset: u64,
    },
    /// A nested call that cannot mutate state.
    StaticCall {
        /// Offset of two consecutive `Field` cells holding the L2 and DA gas
        /// allocations.
        gas_offset: u64,
        /// Callee-address offset.
        addr_offset: u64,
        /// First calldata cell offset.
        args_offset: u64,
        /// Number of calldata cells.
        args_size: u64,
        /// Destination offset for the success `U1`.
        success_offset: u64,
    },
    /// Halts the call successfully, returning a memory range.
    Return {
        /// First returned cell offset.
        ret_offset: u64,
        /// Number of returned cells.
        ret_size: u64,
    },
    /// Halts the call with a revert, returning a memory range as revert data.
    Revert {
        /// First returned cell offset.
        ret_offset: u64,
        /// Number of returned cells.
        ret_size: u64,
    },
}

/// Per-element cost of opcodes that move a variable number of cells.
pub const COPY_PER_ELEMENT: Gas = Gas::new(2, 1);

/// Per-field DA surcharge of a public log.
pub const LOG_PER_FIELD: Gas = Gas::new(5, 10);

impl Opcode {
    /// The opcode's mnemonic, for logging and execution counters.
    pub const fn name(&self) -> &'static str {
        match self {
            Opcode::Add { .. } => "ADD",
            Opcode::Sub { .. } => "SUB",
            Opcode::Mul { .. } => "MUL",
            Opcode::Div { .. } => "DIV",
            Opcode::And { .. } => "AND",
            Opcode::Or { .. } => "OR",
            Opcode::Xor { .. } => "XOR",
            Opcode::Not { .. } => "NOT",
            Opcode::Shl { .. } => "SHL",
            Opcode::Shr { .. } => "SHR",
            Opcode::Eq { .. } => "EQ",
            Opcode::Lt { .. } => "LT",
            Opcode::Lte { .. } => "LTE",
            Opcode::Set { .. } => "SET",
            Opcode::Mov { .. } => "MOV",
            Opcode::Cast { .. } => "CAST",
            Opcode::CalldataCopy { .. } => "CALLDATACOPY",
            Opcode::ReturndataCopy { .. } => "RETURNDATACOPY",
            Opcode::GetEnvVar { .. } => "GETENVVAR",
            Opcode::Jump { .. } => "JUMP",
            Opcode::JumpIf { .. } => "JUMPIF",
            Opcode::SLoad { .. } => "SLOAD",
            Opcode::SStore { .. } => "SSTORE",
            Opcode::NoteHashExists { .. } => "NOTEHASHEXISTS",
            Opcode::EmitNoteHash { .. } => "EMITNOTEHASH",
            Opcode::NullifierExists { .. } => "NULLIFIEREXISTS",
            Opcode::EmitNullifier { .. } => "EMITNULLIFIER",
            Opcode::L1ToL2MsgExists { .. } => "L1TOL2MSGEXISTS",
            Opcode::SendL2ToL1Msg { .. } => "SENDL2TOL1MSG",
            Opcode::EmitPublicLog { .. } => "EMITPUBLICLOG",
            Opcode::GetContractInstance { .. } => "GETCONTRACTINSTANCE",
            Opcode::Call { .. } => "CALL",
            Opcode::StaticCall { .. } => "STATICCALL",
            Opcode::Return { .. } => "RETURN",
            Opcode::Revert { .. } => "REVERT",
        }
    }

    /// The opcode's static base cost. Dynamic components (per element, per
    /// log field) are charged separately by the interpreter.
    pub const fn base_cost(&self) -> Gas {
        match self {
            Opcode::Add { .. }
            | Opcode::Sub { .. }
            | Opcode::Mul { .. }
            | Opcode::Div { .. }
            | Opcode::And { .. }
            | Opcode::Or { .. }
            | Opcode::Xor { .. }
            | Opcode::Not { .. }
            | Opcode::Shl { .. }
            | Opcode::Shr { .. }
            | Opcode::Eq { .. }
            | Opcode::Lt { .. }
            | Opcode::Lte { .. } => Gas::new(10, 0),

            Opcode::Set { .. } | Opcode::Mov { .. } | Opcode::Cast { .. } => Gas::new(5, 0),

            Opcode::CalldataCopy { .. } | Opcode::ReturndataCopy { .. } => Gas::new(10, 0),

            Opcode::GetEnvVar { .. } => Gas::new(5, 0),

            Opcode::Jump { .. } | Opcode::JumpIf { .. } => Gas::new(10, 0),

            Opcode::SLoad { .. } => Gas::new(200, 0),
            Opcode::SStore { .. } => Gas::new(200, 64),

            Opcode::NoteHashExists { .. }
            | Opcode::NullifierExists { .. }
            | Opcode::L1ToL2MsgExists { .. } => Gas::new(200, 0),

            Opcode::EmitNoteHash { .. } => Gas::new(300, 64),
            Opcode::EmitNullifier { .. } => Gas::new(300, 64),
            Opcode::SendL2ToL1Msg { .. } => Gas::new(200, 128),
            Opcode::EmitPublicLog { .. } => Gas::new(100, 0),

            Opcode::GetContractInstance { .. } => Gas::new(200, 0),

            Opcode::Call { .. } | Opcode::StaticCall { .. } => Gas::new(500, 0),

            Opcode::Return { .. } | Opcode::Revert { .. } => Gas::new(20, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_writes_carry_da_cost() {
        let sstore = Opcode::SStore { slot: 0, value: 1 };
        assert!(sstore.base_cost().da > 0);

        let add = Opcode::Add { a: 0, b: 1, dst: 2 };
        assert_eq!(add.base_cost().da, 0);
    }

    #[test]
    fn calls_cost_more_than_arithmetic() {
        let call = Opcode::Call {
            gas_offset: 0,
            addr_offset: 2,
            args_offset: 3,
            args_size: 0,
            success_offset: 10,
        };
        let add = Opcode::Add { a: 0, b: 1, dst: 2 };
        assert!(call.base_cost().l2 > add.base_cost().l2);
    }
}
