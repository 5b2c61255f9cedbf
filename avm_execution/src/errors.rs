//! Error taxonomy for the execution engine.
//!
//! Almost everything that can go wrong during execution is *recoverable*: it
//! converts into a revert of the current call only, and the caller continues.
//! The exception is [`WorldStateError`]: a backing store breaking its
//! contract means external state is corrupt, and no amount of reverting fixes
//! that, so those errors propagate to the transaction processor.

use ethereum_types::U256;
use indexed_tree::ephemeral::TreeOpError;
use thiserror::Error;

use crate::memory::MemoryTag;

/// Stores the result of execution-engine operations.
pub type AvmResult<T> = Result<T, AvmError>;

/// An error raised by the backing world-state store or the tree layer.
/// Always fatal for the whole transaction.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum WorldStateError {
    /// The store violated an invariant of its interface, e.g. returned no
    /// result for a previous-value query on a sentinel-seeded indexed tree.
    #[error("backing store invariant violated: {0}")]
    InvariantViolation(String),

    /// A tree operation failed in a way hydration cannot repair.
    #[error(transparent)]
    Tree(#[from] TreeOpError),
}

/// An error raised while executing bytecode or applying state operations.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum AvmError {
    /// An opcode received operands of incompatible memory tags.
    #[error("tag mismatch: expected {expected:?}, found {found:?}")]
    TagMismatch {
        /// The tag the opcode required.
        expected: MemoryTag,
        /// The tag actually found in memory.
        found: MemoryTag,
    },

    /// A fixed-width arithmetic result (or an ill-fitting constant) exceeded
    /// its tag's range.
    #[error("value {value} overflows tag {tag:?}")]
    Overflow {
        /// The target tag.
        tag: MemoryTag,
        /// The offending value.
        value: U256,
    },

    /// A memory or calldata access fell outside the addressable range.
    #[error("memory access out of bounds at offset {offset} (size {size})")]
    MemoryOutOfBounds {
        /// First offset of the access.
        offset: u64,
        /// Number of cells accessed.
        size: u64,
    },

    /// Gas was insufficient for the next opcode. The call halts with its gas
    /// clamped to exactly zero.
    #[error("out of gas")]
    OutOfGas,

    /// A state mutation was attempted under a static call.
    #[error("static call violation: {0}")]
    StaticCallViolation(&'static str),

    /// The same nullifier was inserted twice within one call tree.
    #[error("nullifier collision: {nullifier:x} already exists")]
    NullifierCollision {
        /// The (siloed) duplicate nullifier.
        nullifier: U256,
    },

    /// An explicit program-level revert.
    #[error("assertion failed: {0}")]
    AssertionFailure(String),

    /// Malformed bytecode: a jump outside the program, a missing callee, or
    /// similar structural problems.
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),

    /// A fatal failure of an external collaborator.
    #[error(transparent)]
    WorldState(#[from] WorldStateError),
}

impl AvmError {
    /// Whether the error converts into a revert of the current call (as
    /// opposed to aborting the whole transaction).
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, AvmError::WorldState(_))
    }
}

impl From<TreeOpError> for AvmError {
    fn from(e: TreeOpError) -> Self {
        AvmError::WorldState(WorldStateError::Tree(e))
    }
}
