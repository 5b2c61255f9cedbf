//! The per-tree-kind forest: ephemeral trees plus the indexed-tree session
//! bookkeeping.
//!
//! For each indexed tree the forest tracks, in addition to the
//! [`EphemeralMerkleTree`], the preimages of every leaf touched this session
//! and an always-sorted key index over those leaves. Lookups consult the
//! local index first; everything else is the backing store's business (the
//! async layer alternates the pure primitives here with store fetches).

use std::collections::HashMap;

use ethereum_types::U256;
use log::trace;

use crate::ephemeral::{EphemeralMerkleTree, TreeOpResult};
use crate::leaf::{IndexedLeaf, NullifierLeaf, PublicDataLeaf};
use crate::path::SiblingPath;

/// The result of a low-leaf query: either the exact leaf for the queried key
/// (`already_present`), or the leaf with the greatest key below it, whose
/// `next` pointer proves the queried key absent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LowLeafInfo<L> {
    /// The matching or low-leaf preimage.
    pub preimage: L,
    /// The leaf's index in the tree.
    pub index: u64,
    /// Whether the queried key is exactly present.
    pub already_present: bool,
}

/// An indexed tree together with the session-local leaves and sorted key
/// index over them.
#[derive(Clone, Debug)]
pub struct IndexedTreeState<L: IndexedLeaf> {
    /// The underlying ephemeral tree.
    pub tree: EphemeralMerkleTree,
    updates: HashMap<u64, L>,
    sorted_keys: Vec<(U256, u64)>,
}

impl<L: IndexedLeaf> IndexedTreeState<L> {
    /// Wraps an ephemeral tree with empty session state.
    pub fn new(tree: EphemeralMerkleTree) -> Self {
        Self {
            tree,
            updates: HashMap::new(),
            sorted_keys: Vec::new(),
        }
    }

    /// The greatest locally-touched key `<= key`, with its leaf index.
    /// `None` means no touched leaf is relevant and the backing store must
    /// answer the low-leaf query instead.
    pub fn local_low_entry(&self, key: U256) -> Option<(U256, u64)> {
        match self.sorted_keys.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(pos) => Some(self.sorted_keys[pos]),
            Err(0) => None,
            Err(pos) => Some(self.sorted_keys[pos - 1]),
        }
    }

    /// The locally-cached preimage at a leaf index, if this session touched
    /// it.
    pub fn preimage_at(&self, index: u64) -> Option<&L> {
        self.updates.get(&index)
    }

    /// Records a touched leaf in both the preimage cache and the sorted key
    /// index, keeping the two in lockstep.
    pub fn record_update(&mut self, index: u64, leaf: L) {
        let key = leaf.key();
        match self.sorted_keys.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(pos) => debug_assert_eq!(self.sorted_keys[pos].1, index),
            Err(pos) => self.sorted_keys.insert(pos, (key, index)),
        }
        self.updates.insert(index, leaf);
    }

    /// Chained low-leaf update + append: repoints the low leaf at
    /// `low_index` to the new leaf, appends the new leaf at `leaf_count`
    /// (post-increment), records both in the session index, and returns the
    /// new leaf's index and sibling path.
    ///
    /// The new leaf inherits the low leaf's old successor, preserving the
    /// sorted linked list.
    pub fn append_indexed(
        &mut self,
        low_index: u64,
        mut low_leaf: L,
        mut new_leaf: L,
    ) -> TreeOpResult<(u64, SiblingPath)> {
        let new_index = self.tree.leaf_count();
        new_leaf.set_next(low_leaf.next_key(), low_leaf.next_index());
        low_leaf.set_next(new_leaf.key(), new_index);

        self.tree.update_leaf(low_index, low_leaf.hash())?;
        let appended = self.tree.append_leaf(new_leaf.hash())?;
        debug_assert_eq!(appended, new_index);

        trace!(
            "Indexed insert: key {:x} at index {}, low leaf {} repointed",
            new_leaf.key(),
            new_index,
            low_index
        );

        self.record_update(low_index, low_leaf);
        self.record_update(new_index, new_leaf.clone());

        let path = self.tree.sibling_path(new_index)?;
        Ok((new_index, path))
    }

    /// Overwrites the leaf at an existing index (the public-data "update"
    /// half of an upsert). No tree growth, but the root changes.
    pub fn update_in_place(&mut self, index: u64, leaf: L) -> TreeOpResult<SiblingPath> {
        self.tree.update_leaf(index, leaf.hash())?;
        self.record_update(index, leaf);
        self.tree.sibling_path(index)
    }

    /// The session's sorted key index (ascending), for diagnostics and
    /// tests.
    pub fn sorted_keys(&self) -> &[(U256, u64)] {
        &self.sorted_keys
    }

    /// Upper bound on forward-walk iterations during a low-leaf search:
    /// no chain of `next` pointers can be longer than the leaf capacity.
    pub fn walk_bound(&self) -> u64 {
        u64::try_from(self.tree.capacity() - 1).unwrap_or(u64::MAX)
    }
}

/// One ephemeral tree per world-state tree kind, with indexed bookkeeping
/// where the tree is indexed. Exclusively owned by the call frame that
/// created it; forking is a structural clone.
#[derive(Clone, Debug)]
pub struct Forest {
    /// The nullifier tree and its session state.
    pub nullifier: IndexedTreeState<NullifierLeaf>,
    /// The public-data tree and its session state.
    pub public_data: IndexedTreeState<PublicDataLeaf>,
    /// The append-only note-hash tree.
    pub note_hash: EphemeralMerkleTree,
    /// The L1-to-L2 message tree (read-only in this engine).
    pub l1_to_l2_message: EphemeralMerkleTree,
}

impl Forest {
    /// Assembles a forest from per-kind ephemeral trees (typically built via
    /// [`EphemeralMerkleTree::from_frontier`] against a backing store).
    pub fn new(
        nullifier: EphemeralMerkleTree,
        public_data: EphemeralMerkleTree,
        note_hash: EphemeralMerkleTree,
        l1_to_l2_message: EphemeralMerkleTree,
    ) -> Self {
        Self {
            nullifier: IndexedTreeState::new(nullifier),
            public_data: IndexedTreeState::new(public_data),
            note_hash,
            l1_to_l2_message,
        }
    }
}
