//! Execution engine for a rollup's public-state virtual machine.
//!
//! A gas-metered bytecode interpreter over tagged field-element memory,
//! backed by a transactional, forkable view of the world-state Merkle trees.
//! Nested calls fork the journal; successful returns merge it back, reverts
//! reject it. Every state operation leaves a trace entry rich enough to
//! later build a proof witness.
//!
//! The crate is a library: the surrounding transaction-processing pipeline
//! owns the backing store, wraps a [`journal::StateManager`] in an
//! [`interpreter::Interpreter`] and runs bytecode through it.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

pub mod env;
pub mod errors;
pub mod interpreter;
pub mod journal;
pub mod memory;
pub mod opcode;
pub mod silo;
pub mod trace;
pub mod world;
