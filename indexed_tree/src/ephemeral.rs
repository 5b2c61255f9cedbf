//! The ephemeral forkable Merkle tree.
//!
//! An [`EphemeralMerkleTree`] is a partially-materialized binary Merkle tree:
//! it holds only the nodes touched (or hydrated) during the current session.
//! A node it does not hold is either the root of a provably-empty subtree,
//! which resolves against the zero-hash chain, or known only to an external
//! backing store. The tree performs no I/O: when an operation needs a node
//! that is neither local nor empty it fails with
//! [`TreeOpError::NodeNotMaterialized`], and the caller hydrates the relevant
//! sibling path (fetched from the store) via
//! [`insert_sibling_path`](EphemeralMerkleTree::insert_sibling_path) and
//! retries. Locally-known nodes always win over hydrated ones, since local
//! data reflects mutations the store has not seen.
//!
//! Levels are counted from the root: level `0` is the root, level `depth`
//! holds the leaves. The tree never shrinks.

use std::collections::HashMap;

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::hashing::{hash_pair, ZeroHashes, MAX_TREE_DEPTH};
use crate::path::SiblingPath;

/// Stores the result of tree operations. Returns a [`TreeOpError`] upon
/// failure.
pub type TreeOpResult<T> = Result<T, TreeOpError>;

/// An error type for ephemeral-tree operations.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum TreeOpError {
    /// A node needed by the operation is neither materialized locally nor the
    /// root of an empty subtree. The caller should hydrate a sibling path
    /// covering this position from the backing store and retry.
    #[error("node at level {level}, index {index} is not materialized in the ephemeral tree")]
    NodeNotMaterialized {
        /// Level of the missing node (0 is the root).
        level: usize,
        /// Index of the missing node within its level.
        index: u64,
    },

    /// A leaf index beyond the current leaf count was addressed by an
    /// update-style operation.
    #[error("leaf index {index} is out of range for a tree with {leaf_count} leaves")]
    LeafIndexOutOfRange {
        /// The offending leaf index.
        index: u64,
        /// The tree's current leaf count.
        leaf_count: u64,
    },

    /// An append was attempted on a tree whose leaf capacity is exhausted.
    #[error("tree of depth {depth} is full")]
    TreeFull {
        /// The tree's depth.
        depth: usize,
    },

    /// A `(level, index)` pair does not exist in a tree of this depth.
    #[error("invalid node position (level {level}, index {index}) for a tree of depth {depth}")]
    InvalidNodePosition {
        /// Level of the offending position.
        level: usize,
        /// Index of the offending position.
        index: u64,
        /// The tree's depth.
        depth: usize,
    },

    /// A sibling path of the wrong length was supplied.
    #[error("sibling path of length {actual} does not match tree depth {expected}")]
    PathLengthMismatch {
        /// The tree depth the path must match.
        expected: usize,
        /// The supplied path length.
        actual: usize,
    },

    /// The requested depth exceeds [`MAX_TREE_DEPTH`].
    #[error("tree depth {0} exceeds the maximum supported depth")]
    DepthTooLarge(usize),
}

/// An in-memory, partially-materialized binary Merkle tree keyed by
/// `(level, index)`.
///
/// Forking is a plain [`Clone`]: the node map is flat, so there is no pointer
/// graph to deep-copy and no aliasing between the fork and its parent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EphemeralMerkleTree {
    depth: usize,
    leaf_count: u64,
    nodes: HashMap<(usize, u64), H256>,
    zero_hashes: ZeroHashes,
}

impl EphemeralMerkleTree {
    /// Creates a tree of the given depth that already contains `leaf_count`
    /// leaves, none of them materialized.
    pub fn new(depth: usize, leaf_count: u64) -> TreeOpResult<Self> {
        if depth == 0 || depth >= MAX_TREE_DEPTH {
            return Err(TreeOpError::DepthTooLarge(depth));
        }
        if u128::from(leaf_count) > (1u128 << depth) {
            return Err(TreeOpError::LeafIndexOutOfRange {
                index: leaf_count,
                leaf_count: 0,
            });
        }
        Ok(Self {
            depth,
            leaf_count,
            nodes: HashMap::new(),
            zero_hashes: ZeroHashes::new(depth),
        })
    }

    /// Replays a backing store's frontier: given the sibling path of the
    /// first *empty* leaf slot (index `leaf_count`), materializes exactly the
    /// right-edge nodes needed for future appends, plus the spine up to the
    /// root (so [`root`](Self::root) immediately agrees with the store).
    pub fn from_frontier(
        depth: usize,
        leaf_count: u64,
        frontier_path: &SiblingPath,
    ) -> TreeOpResult<Self> {
        let mut tree = Self::new(depth, leaf_count)?;
        if u128::from(leaf_count) >= tree.capacity() {
            return Err(TreeOpError::TreeFull { depth });
        }
        tree.insert_sibling_path(leaf_count, frontier_path)?;

        // Fold the empty leaf at `leaf_count` up to the root, materializing
        // the spine as we go.
        let mut node = H256::zero();
        let mut index = leaf_count;
        for height in 0..depth {
            let level = depth - height;
            let sibling = tree
                .node(level, index ^ 1)
                .ok_or(TreeOpError::NodeNotMaterialized {
                    level,
                    index: index ^ 1,
                })?;
            node = if index & 1 == 0 {
                hash_pair(node, sibling)
            } else {
                hash_pair(sibling, node)
            };
            index >>= 1;
            tree.nodes.insert((level - 1, index), node);
        }
        Ok(tree)
    }

    /// The tree's depth.
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// The number of leaves currently in the tree (materialized or not).
    pub const fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// The maximum number of leaves the tree can hold.
    pub const fn capacity(&self) -> u128 {
        1u128 << self.depth
    }

    /// Resolves a node: a locally-materialized hash, or the zero hash if the
    /// node's subtree lies entirely beyond the leaf count. `None` means the
    /// node is only known to the backing store.
    pub fn node(&self, level: usize, index: u64) -> Option<H256> {
        if let Some(h) = self.nodes.get(&(level, index)) {
            return Some(*h);
        }
        let height = self.depth - level;
        let first_leaf = index << height;
        (first_leaf >= self.leaf_count).then(|| self.zero_hashes.get(height))
    }

    /// The current root.
    pub fn root(&self) -> TreeOpResult<H256> {
        self.node(0, 0)
            .ok_or(TreeOpError::NodeNotMaterialized { level: 0, index: 0 })
    }

    /// Materializes a single node hydrated from the backing store. A node
    /// already known locally is left untouched: local data is provably
    /// fresher than whatever the store had when it was read.
    pub fn insert_node(&mut self, level: usize, index: u64, hash: H256) -> TreeOpResult<()> {
        if level > self.depth || u128::from(index) >= (1u128 << level) {
            return Err(TreeOpError::InvalidNodePosition {
                level,
                index,
                depth: self.depth,
            });
        }
        if let Some(local) = self.nodes.get(&(level, index)) {
            if *local != hash {
                trace!(
                    "Discarding stale store node at ({}, {}): local {:x} wins over {:x}",
                    level,
                    index,
                    local,
                    hash
                );
            }
            return Ok(());
        }
        self.nodes.insert((level, index), hash);
        Ok(())
    }

    /// Hydrates every sibling along the path of `leaf_index` with hashes
    /// fetched from the backing store, reconciling staleness in favor of
    /// local data.
    pub fn insert_sibling_path(
        &mut self,
        leaf_index: u64,
        path: &SiblingPath,
    ) -> TreeOpResult<()> {
        if path.len() != self.depth {
            return Err(TreeOpError::PathLengthMismatch {
                expected: self.depth,
                actual: path.len(),
            });
        }
        for (height, sibling) in path.hashes().iter().enumerate() {
            let level = self.depth - height;
            let index = (leaf_index >> height) ^ 1;
            self.insert_node(level, index, *sibling)?;
        }
        Ok(())
    }

    /// Appends a leaf at index `leaf_count` (post-increment) and recomputes
    /// the spine to the root. Requires the frontier (left siblings of the
    /// append path) to be materialized.
    pub fn append_leaf(&mut self, hash: H256) -> TreeOpResult<u64> {
        if u128::from(self.leaf_count) >= self.capacity() {
            return Err(TreeOpError::TreeFull { depth: self.depth });
        }
        let index = self.leaf_count;

        // Left siblings of the append path must be present before we mutate.
        let mut cursor = index;
        for height in 0..self.depth {
            let level = self.depth - height;
            if cursor & 1 == 1 && self.node(level, cursor ^ 1).is_none() {
                return Err(TreeOpError::NodeNotMaterialized {
                    level,
                    index: cursor ^ 1,
                });
            }
            cursor >>= 1;
        }

        self.leaf_count += 1;
        self.nodes.insert((self.depth, index), hash);
        self.recompute_spine(index)?;
        trace!("Appended leaf {:x} at index {}", hash, index);
        Ok(index)
    }

    /// Overwrites the leaf at `index` and recomputes the spine to the root.
    /// The leaf's full sibling path must be resolvable locally; hydrate it
    /// first if the leaf was never touched in this session.
    pub fn update_leaf(&mut self, index: u64, hash: H256) -> TreeOpResult<()> {
        if index >= self.leaf_count {
            return Err(TreeOpError::LeafIndexOutOfRange {
                index,
                leaf_count: self.leaf_count,
            });
        }
        // Check the whole path before mutating anything.
        self.require_path(index)?;

        self.nodes.insert((self.depth, index), hash);
        self.recompute_spine(index)?;
        trace!("Updated leaf {} to {:x}", index, hash);
        Ok(())
    }

    /// Derives the sibling path of a leaf from local data. Fails with the
    /// first unmaterialized position, which tells the caller what to fetch.
    pub fn sibling_path(&self, leaf_index: u64) -> TreeOpResult<SiblingPath> {
        if u128::from(leaf_index) >= self.capacity() {
            return Err(TreeOpError::InvalidNodePosition {
                level: self.depth,
                index: leaf_index,
                depth: self.depth,
            });
        }
        let mut hashes = Vec::with_capacity(self.depth);
        for height in 0..self.depth {
            let level = self.depth - height;
            let index = (leaf_index >> height) ^ 1;
            let hash = self
                .node(level, index)
                .ok_or(TreeOpError::NodeNotMaterialized { level, index })?;
            hashes.push(hash);
        }
        Ok(SiblingPath::new(hashes))
    }

    /// Whether the leaf's sibling path can be derived without hydration.
    pub fn is_path_materialized(&self, leaf_index: u64) -> bool {
        self.require_path(leaf_index).is_ok()
    }

    fn require_path(&self, leaf_index: u64) -> TreeOpResult<()> {
        for height in 0..self.depth {
            let level = self.depth - height;
            let index = (leaf_index >> height) ^ 1;
            if self.node(level, index).is_none() {
                return Err(TreeOpError::NodeNotMaterialized { level, index });
            }
        }
        Ok(())
    }

    /// Recomputes every ancestor of `leaf_index` from its (now resolvable)
    /// children.
    fn recompute_spine(&mut self, leaf_index: u64) -> TreeOpResult<()> {
        let mut index = leaf_index;
        for height in 0..self.depth {
            let level = self.depth - height;
            let node = self
                .node(level, index)
                .ok_or(TreeOpError::NodeNotMaterialized { level, index })?;
            let sibling = self
                .node(level, index ^ 1)
                .ok_or(TreeOpError::NodeNotMaterialized {
                    level,
                    index: index ^ 1,
                })?;
            let parent = if index & 1 == 0 {
                hash_pair(node, sibling)
            } else {
                hash_pair(sibling, node)
            };
            index >>= 1;
            self.nodes.insert((level - 1, index), parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_fields;
    use ethereum_types::U256;

    const TEST_DEPTH: usize = 5;

    fn leaf(i: u64) -> H256 {
        hash_fields(&[U256::from(i + 1)])
    }

    /// Recomputes the root of a fully-known tree the slow way.
    fn naive_root(leaves: &[H256], depth: usize) -> H256 {
        let mut level: Vec<H256> = leaves.to_vec();
        level.resize(1 << depth, H256::zero());
        for _ in 0..depth {
            level = level
                .chunks(2)
                .map(|pair| hash_pair(pair[0], pair[1]))
                .collect();
        }
        level[0]
    }

    fn tree_with_leaves(n: u64) -> (EphemeralMerkleTree, Vec<H256>) {
        let _ = pretty_env_logger::try_init();
        let mut tree = EphemeralMerkleTree::new(TEST_DEPTH, 0).unwrap();
        let leaves: Vec<_> = (0..n).map(leaf).collect();
        for (i, l) in leaves.iter().enumerate() {
            let idx = tree.append_leaf(*l).unwrap();
            assert_eq!(idx, i as u64);
        }
        (tree, leaves)
    }

    #[test]
    fn empty_tree_root_is_zero_subtree_hash() {
        let tree = EphemeralMerkleTree::new(TEST_DEPTH, 0).unwrap();
        assert_eq!(tree.root().unwrap(), ZeroHashes::new(TEST_DEPTH).get(TEST_DEPTH));
    }

    #[test]
    fn append_matches_naive_root() {
        for n in [1u64, 2, 3, 7, 8, 13] {
            let (tree, leaves) = tree_with_leaves(n);
            assert_eq!(tree.root().unwrap(), naive_root(&leaves, TEST_DEPTH), "n = {n}");
        }
    }

    #[test]
    fn update_matches_naive_root() {
        let (mut tree, mut leaves) = tree_with_leaves(6);
        let new = leaf(100);
        tree.update_leaf(2, new).unwrap();
        leaves[2] = new;
        assert_eq!(tree.root().unwrap(), naive_root(&leaves, TEST_DEPTH));
    }

    #[test]
    fn sibling_path_recomputes_root() {
        let (tree, leaves) = tree_with_leaves(5);
        for (i, l) in leaves.iter().enumerate() {
            let path = tree.sibling_path(i as u64).unwrap();
            assert_eq!(path.root_from(*l, i as u64), tree.root().unwrap());
        }
    }

    #[test]
    fn update_beyond_leaf_count_is_rejected() {
        let (mut tree, _) = tree_with_leaves(3);
        assert_eq!(
            tree.update_leaf(3, leaf(99)),
            Err(TreeOpError::LeafIndexOutOfRange {
                index: 3,
                leaf_count: 3
            })
        );
    }

    #[test]
    fn frontier_construction_tracks_full_tree() {
        let (full, leaves) = tree_with_leaves(11);
        let frontier = full.sibling_path(11).unwrap();

        let mut sparse = EphemeralMerkleTree::from_frontier(TEST_DEPTH, 11, &frontier).unwrap();
        assert_eq!(sparse.root().unwrap(), full.root().unwrap());

        // Appends on the sparse tree agree with a fully-known tree.
        let mut full = full;
        let mut leaves = leaves;
        for i in 11..14 {
            let l = leaf(i);
            assert_eq!(sparse.append_leaf(l).unwrap(), i);
            full.append_leaf(l).unwrap();
            leaves.push(l);
        }
        assert_eq!(sparse.root().unwrap(), full.root().unwrap());
        assert_eq!(sparse.root().unwrap(), naive_root(&leaves, TEST_DEPTH));
    }

    #[test]
    fn untouched_leaf_update_requires_hydration() {
        let (full, mut leaves) = tree_with_leaves(9);
        let frontier = full.sibling_path(9).unwrap();
        let mut sparse = EphemeralMerkleTree::from_frontier(TEST_DEPTH, 9, &frontier).unwrap();

        // Leaf 2 was never touched in this session.
        let new = leaf(42);
        assert!(matches!(
            sparse.update_leaf(2, new),
            Err(TreeOpError::NodeNotMaterialized { .. })
        ));

        // Hydrate its path from the "store" (the fully-known tree) and retry.
        sparse
            .insert_sibling_path(2, &full.sibling_path(2).unwrap())
            .unwrap();
        sparse.insert_node(TEST_DEPTH, 2, leaves[2]).unwrap();
        sparse.update_leaf(2, new).unwrap();

        leaves[2] = new;
        assert_eq!(sparse.root().unwrap(), naive_root(&leaves, TEST_DEPTH));
    }

    #[test]
    fn stale_store_data_never_overwrites_local_nodes() {
        let (mut tree, mut leaves) = tree_with_leaves(4);
        let stale_path = tree.sibling_path(2).unwrap();

        // Mutate locally, then hydrate with the pre-mutation path.
        let new = leaf(77);
        tree.update_leaf(3, new).unwrap();
        leaves[3] = new;
        let root_after_update = tree.root().unwrap();

        tree.insert_sibling_path(2, &stale_path).unwrap();
        assert_eq!(tree.root().unwrap(), root_after_update);
        assert_eq!(tree.root().unwrap(), naive_root(&leaves, TEST_DEPTH));
    }

    #[test]
    fn random_append_update_interleaving_matches_naive_root() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xe9);

        let (mut tree, mut leaves) = tree_with_leaves(1);
        for _ in 0..100 {
            if rng.gen_bool(0.5) && (leaves.len() as u128) < tree.capacity() {
                let l = leaf(rng.gen());
                tree.append_leaf(l).unwrap();
                leaves.push(l);
            } else {
                let i = rng.gen_range(0..leaves.len());
                let l = leaf(rng.gen());
                tree.update_leaf(i as u64, l).unwrap();
                leaves[i] = l;
            }
            assert_eq!(tree.root().unwrap(), naive_root(&leaves, TEST_DEPTH));
        }
    }

    #[test]
    fn append_to_full_tree_fails() {
        let mut tree = EphemeralMerkleTree::new(2, 0).unwrap();
        for i in 0..4 {
            tree.append_leaf(leaf(i)).unwrap();
        }
        assert_eq!(
            tree.append_leaf(leaf(4)),
            Err(TreeOpError::TreeFull { depth: 2 })
        );
    }
}
