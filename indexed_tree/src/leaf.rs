//! Leaf preimage types for the rollup's world-state trees.
//!
//! The nullifier and public-data trees are *indexed*: each leaf carries a
//! `(key, next_key, next_index)` triple encoding a sorted linked list over
//! the keys present in the tree. A leaf whose `next_key` and `next_index`
//! are both zero holds the current maximum key ("no next"). Every indexed
//! tree is seeded with an all-zero sentinel leaf at index 0, so a low-leaf
//! query always has an answer.
//!
//! The note-hash and L1-to-L2 message trees are plain append-only trees whose
//! leaves are bare hashes.

use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::hashing::hash_fields;

/// The world-state trees managed by the execution engine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum TreeKind {
    /// Append-only tree of (unique, siloed) note hashes.
    NoteHash,
    /// Indexed tree of siloed nullifiers.
    Nullifier,
    /// Indexed tree of public storage slots.
    PublicData,
    /// Append-only tree of L1-to-L2 message hashes (read-only here).
    L1ToL2Message,
}

impl TreeKind {
    /// The fixed depth of the tree.
    pub const fn depth(self) -> usize {
        match self {
            TreeKind::NoteHash => 40,
            TreeKind::Nullifier => 40,
            TreeKind::PublicData => 40,
            TreeKind::L1ToL2Message => 39,
        }
    }

    /// Whether the tree's leaves carry indexed (linked-list) preimages.
    pub const fn is_indexed(self) -> bool {
        matches!(self, TreeKind::Nullifier | TreeKind::PublicData)
    }
}

/// A leaf preimage participating in an indexed tree's sorted linked list.
pub trait IndexedLeaf:
    Clone + core::fmt::Debug + Default + Eq + Serialize + for<'de> Deserialize<'de>
{
    /// The tree this leaf shape belongs to.
    const TREE: TreeKind;

    /// The leaf's key in the sorted list.
    fn key(&self) -> U256;

    /// The next-largest key in the tree, or zero if this leaf is the maximum.
    fn next_key(&self) -> U256;

    /// The index of the leaf holding [`next_key`](Self::next_key), or zero.
    fn next_index(&self) -> u64;

    /// Repoints the leaf's successor.
    fn set_next(&mut self, next_key: U256, next_index: u64);

    /// Whether this is the all-zero (sentinel/empty) preimage.
    fn is_empty(&self) -> bool;

    /// Hashes the preimage. Empty preimages hash to [`H256::zero`] so that
    /// empty leaves agree with the zero-hash chain.
    fn hash(&self) -> H256;

    /// Extracts this leaf shape from a transported [`LeafPreimage`], if the
    /// variant matches.
    fn from_preimage(preimage: &LeafPreimage) -> Option<Self>;

    /// Wraps the leaf for transport.
    fn to_preimage(&self) -> LeafPreimage;
}

/// Preimage of a nullifier-tree leaf.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NullifierLeaf {
    /// The (siloed) nullifier value.
    pub nullifier: U256,
    /// The next-largest nullifier in the tree, or zero.
    pub next_nullifier: U256,
    /// The index of the leaf holding `next_nullifier`, or zero.
    pub next_index: u64,
}

impl NullifierLeaf {
    /// A leaf for a freshly inserted nullifier, successor not yet linked.
    pub fn new(nullifier: U256) -> Self {
        Self {
            nullifier,
            next_nullifier: U256::zero(),
            next_index: 0,
        }
    }
}

impl IndexedLeaf for NullifierLeaf {
    const TREE: TreeKind = TreeKind::Nullifier;

    fn key(&self) -> U256 {
        self.nullifier
    }

    fn next_key(&self) -> U256 {
        self.next_nullifier
    }

    fn next_index(&self) -> u64 {
        self.next_index
    }

    fn set_next(&mut self, next_key: U256, next_index: u64) {
        self.next_nullifier = next_key;
        self.next_index = next_index;
    }

    fn is_empty(&self) -> bool {
        self.nullifier.is_zero() && self.next_nullifier.is_zero() && self.next_index == 0
    }

    fn hash(&self) -> H256 {
        if self.is_empty() {
            return H256::zero();
        }
        hash_fields(&[
            self.nullifier,
            self.next_nullifier,
            U256::from(self.next_index),
        ])
    }

    fn from_preimage(preimage: &LeafPreimage) -> Option<Self> {
        match preimage {
            LeafPreimage::Nullifier(leaf) => Some(*leaf),
            _ => None,
        }
    }

    fn to_preimage(&self) -> LeafPreimage {
        LeafPreimage::Nullifier(*self)
    }
}

/// Preimage of a public-data-tree leaf.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublicDataLeaf {
    /// The (siloed) storage slot.
    pub slot: U256,
    /// The value stored at the slot.
    pub value: U256,
    /// The next-largest slot in the tree, or zero.
    pub next_slot: U256,
    /// The index of the leaf holding `next_slot`, or zero.
    pub next_index: u64,
}

impl PublicDataLeaf {
    /// A leaf for a freshly written slot, successor not yet linked.
    pub fn new(slot: U256, value: U256) -> Self {
        Self {
            slot,
            value,
            next_slot: U256::zero(),
            next_index: 0,
        }
    }
}

impl IndexedLeaf for PublicDataLeaf {
    const TREE: TreeKind = TreeKind::PublicData;

    fn key(&self) -> U256 {
        self.slot
    }

    fn next_key(&self) -> U256 {
        self.next_slot
    }

    fn next_index(&self) -> u64 {
        self.next_index
    }

    fn set_next(&mut self, next_key: U256, next_index: u64) {
        self.next_slot = next_key;
        self.next_index = next_index;
    }

    fn is_empty(&self) -> bool {
        self.slot.is_zero()
            && self.value.is_zero()
            && self.next_slot.is_zero()
            && self.next_index == 0
    }

    fn hash(&self) -> H256 {
        if self.is_empty() {
            return H256::zero();
        }
        hash_fields(&[
            self.slot,
            self.value,
            self.next_slot,
            U256::from(self.next_index),
        ])
    }

    fn from_preimage(preimage: &LeafPreimage) -> Option<Self> {
        match preimage {
            LeafPreimage::PublicData(leaf) => Some(*leaf),
            _ => None,
        }
    }

    fn to_preimage(&self) -> LeafPreimage {
        LeafPreimage::PublicData(*self)
    }
}

/// A leaf preimage of any tree kind, for transport through store interfaces
/// and trace entries. Indexed-tree algorithms work with the concrete leaf
/// types; this closed enum exists so heterogeneous collections (traces,
/// store responses) need no runtime type inspection beyond a `match`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LeafPreimage {
    /// A nullifier-tree leaf.
    Nullifier(NullifierLeaf),
    /// A public-data-tree leaf.
    PublicData(PublicDataLeaf),
    /// A bare-hash leaf of an append-only tree.
    Hash(H256),
}

impl LeafPreimage {
    /// The hash this preimage commits to.
    pub fn hash(&self) -> H256 {
        match self {
            LeafPreimage::Nullifier(leaf) => leaf.hash(),
            LeafPreimage::PublicData(leaf) => leaf.hash(),
            LeafPreimage::Hash(h) => *h,
        }
    }
}

impl From<NullifierLeaf> for LeafPreimage {
    fn from(leaf: NullifierLeaf) -> Self {
        Self::Nullifier(leaf)
    }
}

impl From<PublicDataLeaf> for LeafPreimage {
    fn from(leaf: PublicDataLeaf) -> Self {
        Self::PublicData(leaf)
    }
}
