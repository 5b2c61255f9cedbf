//! Types and algorithms for partially-materialized indexed Merkle trees.
//!
//! An *indexed* Merkle tree stores, alongside each leaf's key, a pointer to
//! the leaf holding the next-largest key, turning the leaves into a sorted
//! singly-linked list. This allows both membership and non-membership to be
//! proven with a single sibling path (see [`leaf::IndexedLeaf`]).
//!
//! The core type is the [`EphemeralMerkleTree`][ephemeral::EphemeralMerkleTree]:
//! an in-memory binary Merkle tree that only materializes the nodes touched by
//! the current session. Nodes it does not hold are either provably-empty
//! subtrees (resolved against a per-level zero-hash chain) or live in an
//! external backing store; the tree never performs I/O itself and instead
//! reports the missing position so a caller can hydrate it via
//! [`insert_sibling_path`][ephemeral::EphemeralMerkleTree::insert_sibling_path].
//!
//! The [`forest`] module layers the indexed-tree bookkeeping (touched-leaf
//! preimages and a sorted key index) on top of the ephemeral trees.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod ephemeral;
pub mod forest;
pub mod hashing;
pub mod leaf;
pub mod path;
