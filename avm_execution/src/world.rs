//! The backing world-state boundary.
//!
//! [`WorldStateStore`] is the async interface to whatever holds the canonical
//! trees (a database service in production); [`ContractStore`] resolves
//! deployed contract instances and their bytecode. The journal layer keeps
//! its tree algorithms pure and synchronous, and only awaits these traits
//! when it needs data it has not yet materialized.
//!
//! [`MemoryWorldState`] is a complete in-memory implementation of both
//! traits, used by tests and by anyone running the engine without an
//! external state service. It stores full leaf-preimage vectors per tree and
//! computes Merkle nodes on demand with zero-subtree pruning, so it stays
//! honest about paths and roots without materializing 2^40 nodes.

use std::collections::HashMap;
use std::sync::Arc;

use ethereum_types::{H256, U256};
use indexed_tree::hashing::{hash_pair, ZeroHashes};
use indexed_tree::leaf::{LeafPreimage, TreeKind};
use indexed_tree::path::SiblingPath;
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::WorldStateError;
use crate::opcode::Opcode;

/// Stores the result of store operations.
pub type StoreResult<T> = Result<T, WorldStateError>;

/// Size and shape of one backing tree.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TreeInfo {
    /// Number of leaves present.
    pub size: u64,
    /// The tree's depth.
    pub depth: usize,
}

/// Answer to a low-leaf query against an indexed tree: the leaf whose key is
/// the greatest key `<=` the queried one.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PreviousValueIndex {
    /// Index of the matching or low leaf.
    pub index: u64,
    /// Whether the queried key is exactly present.
    pub already_present: bool,
}

/// A deployed contract instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContractInstance {
    /// The instance's address.
    pub address: U256,
    /// The deploying address.
    pub deployer: U256,
    /// The contract class the instance belongs to.
    pub class_id: U256,
    /// Hash of the constructor arguments.
    pub initialization_hash: U256,
}

/// The async interface to the canonical world-state trees.
///
/// Every indexed tree a store serves must be seeded with the zero sentinel
/// leaf at index 0, so [`get_previous_value_index`] always has an answer.
///
/// [`get_previous_value_index`]: WorldStateStore::get_previous_value_index
#[allow(async_fn_in_trait)]
pub trait WorldStateStore {
    /// The leaf with the greatest key `<=` `key` in an indexed tree.
    async fn get_previous_value_index(
        &self,
        tree: TreeKind,
        key: U256,
    ) -> StoreResult<PreviousValueIndex>;

    /// The preimage of the leaf at `index`, or `None` if the slot is empty.
    async fn get_leaf_preimage(
        &self,
        tree: TreeKind,
        index: u64,
    ) -> StoreResult<Option<LeafPreimage>>;

    /// The sibling path of the leaf at `index` (valid also for the first
    /// empty slot, which is how frontiers are fetched).
    async fn get_sibling_path(&self, tree: TreeKind, index: u64) -> StoreResult<SiblingPath>;

    /// Current size and depth of a tree.
    async fn get_tree_info(&self, tree: TreeKind) -> StoreResult<TreeInfo>;

    /// Inserts keyed leaves into an indexed tree, maintaining the sorted
    /// linked list (public-data keys upsert in place; duplicate nullifier
    /// keys are an invariant violation).
    async fn sequential_insert(&self, tree: TreeKind, leaves: &[LeafPreimage]) -> StoreResult<()>;

    /// Appends bare-hash leaves to an append-only tree.
    async fn append_leaves(&self, tree: TreeKind, leaves: &[H256]) -> StoreResult<()>;

    /// Pushes a checkpoint onto the store's checkpoint stack.
    async fn create_checkpoint(&self) -> StoreResult<()>;

    /// Pops the newest checkpoint, keeping all changes made since.
    async fn commit_checkpoint(&self) -> StoreResult<()>;

    /// Pops the newest checkpoint, discarding all changes made since.
    async fn revert_checkpoint(&self) -> StoreResult<()>;
}

/// Resolution of contract instances and bytecode.
#[allow(async_fn_in_trait)]
pub trait ContractStore {
    /// The instance deployed at `address`, if any.
    async fn get_contract_instance(&self, address: U256) -> StoreResult<Option<ContractInstance>>;

    /// The bytecode of the contract at `address`, if any.
    async fn get_bytecode(&self, address: U256) -> StoreResult<Option<Arc<Vec<Opcode>>>>;
}

#[derive(Clone, Debug, Default)]
struct TreeLeaves {
    leaves: Vec<LeafPreimage>,
}

#[derive(Clone, Debug, Default)]
struct WorldSnapshot {
    trees: HashMap<TreeKind, TreeLeaves>,
}

/// An in-memory world state holding full leaf-preimage vectors per tree,
/// with a snapshot-stack checkpoint discipline. `Clone`-snapshot checkpoints
/// are fine at test scale; a production store would journal instead.
#[derive(Debug)]
pub struct MemoryWorldState {
    inner: RwLock<MemoryWorldStateInner>,
}

#[derive(Debug, Default)]
struct MemoryWorldStateInner {
    trees: HashMap<TreeKind, TreeLeaves>,
    checkpoints: Vec<WorldSnapshot>,
    contracts: HashMap<U256, ContractInstance>,
    bytecode: HashMap<U256, Arc<Vec<Opcode>>>,
}

const ALL_TREES: [TreeKind; 4] = [
    TreeKind::NoteHash,
    TreeKind::Nullifier,
    TreeKind::PublicData,
    TreeKind::L1ToL2Message,
];

fn preimage_key(preimage: &LeafPreimage) -> Option<U256> {
    match preimage {
        LeafPreimage::Nullifier(leaf) => Some(leaf.nullifier),
        LeafPreimage::PublicData(leaf) => Some(leaf.slot),
        LeafPreimage::Hash(_) => None,
    }
}

fn set_next(preimage: &mut LeafPreimage, next_key: U256, next_index: u64) {
    match preimage {
        LeafPreimage::Nullifier(leaf) => {
            leaf.next_nullifier = next_key;
            leaf.next_index = next_index;
        }
        LeafPreimage::PublicData(leaf) => {
            leaf.next_slot = next_key;
            leaf.next_index = next_index;
        }
        LeafPreimage::Hash(_) => {}
    }
}

fn next_of(preimage: &LeafPreimage) -> (U256, u64) {
    match preimage {
        LeafPreimage::Nullifier(leaf) => (leaf.next_nullifier, leaf.next_index),
        LeafPreimage::PublicData(leaf) => (leaf.next_slot, leaf.next_index),
        LeafPreimage::Hash(_) => (U256::zero(), 0),
    }
}

impl Default for MemoryWorldState {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorldState {
    /// A fresh world state with every indexed tree seeded with its zero
    /// sentinel leaf.
    pub fn new() -> Self {
        let mut trees = HashMap::new();
        for kind in ALL_TREES {
            let mut tree = TreeLeaves::default();
            if kind.is_indexed() {
                tree.leaves.push(match kind {
                    TreeKind::Nullifier => {
                        LeafPreimage::Nullifier(indexed_tree::leaf::NullifierLeaf::default())
                    }
                    TreeKind::PublicData => {
                        LeafPreimage::PublicData(indexed_tree::leaf::PublicDataLeaf::default())
                    }
                    _ => unreachable!(),
                });
            }
            trees.insert(kind, tree);
        }
        Self {
            inner: RwLock::new(MemoryWorldStateInner {
                trees,
                checkpoints: Vec::new(),
                contracts: HashMap::new(),
                bytecode: HashMap::new(),
            }),
        }
    }

    /// Registers a deployed contract instance.
    pub fn register_contract(&self, instance: ContractInstance) {
        self.inner.write().contracts.insert(instance.address, instance);
    }

    /// Registers bytecode for a contract address.
    pub fn register_bytecode(&self, address: U256, bytecode: Vec<Opcode>) {
        self.inner.write().bytecode.insert(address, Arc::new(bytecode));
    }

    /// Depth of the current checkpoint stack.
    pub fn checkpoint_depth(&self) -> usize {
        self.inner.read().checkpoints.len()
    }

    /// Hash of a node at `(level, index)`, with empty subtrees resolved
    /// against the zero-hash chain instead of recursing.
    fn node_hash(
        leaves: &[LeafPreimage],
        zero_hashes: &ZeroHashes,
        depth: usize,
        level: usize,
        index: u64,
    ) -> H256 {
        let height = depth - level;
        let first_leaf = index << height;
        if first_leaf >= leaves.len() as u64 {
            return zero_hashes.get(height);
        }
        if level == depth {
            return leaves[index as usize].hash();
        }
        let left = Self::node_hash(leaves, zero_hashes, depth, level + 1, 2 * index);
        let right = Self::node_hash(leaves, zero_hashes, depth, level + 1, 2 * index + 1);
        hash_pair(left, right)
    }

    /// The root of one tree (tests compare this against the journal's
    /// ephemeral roots).
    pub fn root(&self, tree: TreeKind) -> H256 {
        let inner = self.inner.read();
        let leaves = &inner.trees[&tree].leaves;
        let depth = tree.depth();
        Self::node_hash(leaves, &ZeroHashes::new(depth), depth, 0, 0)
    }
}

impl WorldStateStore for MemoryWorldState {
    async fn get_previous_value_index(
        &self,
        tree: TreeKind,
        key: U256,
    ) -> StoreResult<PreviousValueIndex> {
        let inner = self.inner.read();
        let leaves = &inner.trees[&tree].leaves;
        let mut best: Option<(U256, u64)> = None;
        for (i, preimage) in leaves.iter().enumerate() {
            let Some(leaf_key) = preimage_key(preimage) else {
                return Err(WorldStateError::InvariantViolation(format!(
                    "low-leaf query against non-indexed tree {tree:?}"
                )));
            };
            if leaf_key == key {
                return Ok(PreviousValueIndex {
                    index: i as u64,
                    already_present: true,
                });
            }
            if leaf_key < key && best.map_or(true, |(k, _)| leaf_key > k) {
                best = Some((leaf_key, i as u64));
            }
        }
        // The sentinel leaf's zero key is <= every key, so `best` is always
        // set for a properly seeded tree.
        best.map(|(_, index)| PreviousValueIndex {
            index,
            already_present: false,
        })
        .ok_or_else(|| {
            WorldStateError::InvariantViolation(format!("tree {tree:?} has no sentinel leaf"))
        })
    }

    async fn get_leaf_preimage(
        &self,
        tree: TreeKind,
        index: u64,
    ) -> StoreResult<Option<LeafPreimage>> {
        let inner = self.inner.read();
        Ok(inner.trees[&tree].leaves.get(index as usize).copied())
    }

    async fn get_sibling_path(&self, tree: TreeKind, index: u64) -> StoreResult<SiblingPath> {
        let inner = self.inner.read();
        let leaves = &inner.trees[&tree].leaves;
        let depth = tree.depth();
        let zero_hashes = ZeroHashes::new(depth);
        let mut hashes = Vec::with_capacity(depth);
        for height in 0..depth {
            let level = depth - height;
            let sibling = (index >> height) ^ 1;
            hashes.push(Self::node_hash(leaves, &zero_hashes, depth, level, sibling));
        }
        Ok(SiblingPath::new(hashes))
    }

    async fn get_tree_info(&self, tree: TreeKind) -> StoreResult<TreeInfo> {
        let inner = self.inner.read();
        Ok(TreeInfo {
            size: inner.trees[&tree].leaves.len() as u64,
            depth: tree.depth(),
        })
    }

    async fn sequential_insert(&self, tree: TreeKind, leaves: &[LeafPreimage]) -> StoreResult<()> {
        if !tree.is_indexed() {
            return Err(WorldStateError::InvariantViolation(format!(
                "sequential insert into non-indexed tree {tree:?}"
            )));
        }
        let mut inner = self.inner.write();
        for new_leaf in leaves {
            let key = preimage_key(new_leaf).ok_or_else(|| {
                WorldStateError::InvariantViolation("keyless leaf in sequential insert".into())
            })?;
            let existing = &mut inner.trees.get_mut(&tree).expect("tree seeded").leaves;

            let mut low: Option<(U256, usize)> = None;
            let mut exact = None;
            for (i, p) in existing.iter().enumerate() {
                let k = preimage_key(p).expect("indexed tree holds keyed leaves");
                if k == key {
                    exact = Some(i);
                    break;
                }
                if k < key && low.map_or(true, |(lk, _)| k > lk) {
                    low = Some((k, i));
                }
            }

            if let Some(i) = exact {
                match (tree, new_leaf) {
                    (TreeKind::PublicData, LeafPreimage::PublicData(incoming)) => {
                        let LeafPreimage::PublicData(current) = &mut existing[i] else {
                            unreachable!()
                        };
                        current.value = incoming.value;
                    }
                    _ => {
                        return Err(WorldStateError::InvariantViolation(format!(
                            "duplicate key {key:x} in {tree:?} sequential insert"
                        )))
                    }
                }
                continue;
            }

            let (_, low_index) = low.ok_or_else(|| {
                WorldStateError::InvariantViolation(format!("tree {tree:?} has no sentinel leaf"))
            })?;
            let new_index = existing.len() as u64;
            let (next_key, next_index) = next_of(&existing[low_index]);
            let mut new_leaf = *new_leaf;
            set_next(&mut new_leaf, next_key, next_index);
            set_next(&mut existing[low_index], key, new_index);
            existing.push(new_leaf);
        }
        Ok(())
    }

    async fn append_leaves(&self, tree: TreeKind, leaves: &[H256]) -> StoreResult<()> {
        if tree.is_indexed() {
            return Err(WorldStateError::InvariantViolation(format!(
                "bare-hash append into indexed tree {tree:?}"
            )));
        }
        let mut inner = self.inner.write();
        let existing = &mut inner.trees.get_mut(&tree).expect("tree seeded").leaves;
        existing.extend(leaves.iter().map(|h| LeafPreimage::Hash(*h)));
        Ok(())
    }

    async fn create_checkpoint(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let snapshot = WorldSnapshot {
            trees: inner.trees.clone(),
        };
        inner.checkpoints.push(snapshot);
        debug!("Created checkpoint, stack depth {}", inner.checkpoints.len());
        Ok(())
    }

    async fn commit_checkpoint(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.checkpoints.pop().ok_or_else(|| {
            WorldStateError::InvariantViolation("commit with empty checkpoint stack".into())
        })?;
        Ok(())
    }

    async fn revert_checkpoint(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let snapshot = inner.checkpoints.pop().ok_or_else(|| {
            WorldStateError::InvariantViolation("revert with empty checkpoint stack".into())
        })?;
        inner.trees = snapshot.trees;
        Ok(())
    }
}

impl ContractStore for MemoryWorldState {
    async fn get_contract_instance(&self, address: U256) -> StoreResult<Option<ContractInstance>> {
        Ok(self.inner.read().contracts.get(&address).copied())
    }

    async fn get_bytecode(&self, address: U256) -> StoreResult<Option<Arc<Vec<Opcode>>>> {
        Ok(self.inner.read().bytecode.get(&address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexed_tree::ephemeral::EphemeralMerkleTree;
    use indexed_tree::leaf::NullifierLeaf;

    fn nullifier(key: u64) -> LeafPreimage {
        LeafPreimage::Nullifier(NullifierLeaf::new(U256::from(key)))
    }

    #[tokio::test]
    async fn sequential_insert_maintains_linked_list() {
        let store = MemoryWorldState::new();
        store
            .sequential_insert(TreeKind::Nullifier, &[nullifier(5), nullifier(3), nullifier(9)])
            .await
            .unwrap();

        // 5 < 7 < 9: the low leaf for 7 holds key 5 and points at 9.
        let low = store
            .get_previous_value_index(TreeKind::Nullifier, U256::from(7))
            .await
            .unwrap();
        assert!(!low.already_present);
        let Some(LeafPreimage::Nullifier(leaf)) = store
            .get_leaf_preimage(TreeKind::Nullifier, low.index)
            .await
            .unwrap()
        else {
            panic!("low leaf missing");
        };
        assert_eq!(leaf.nullifier, U256::from(5));
        assert_eq!(leaf.next_nullifier, U256::from(9));

        let exact = store
            .get_previous_value_index(TreeKind::Nullifier, U256::from(9))
            .await
            .unwrap();
        assert!(exact.already_present);
    }

    #[tokio::test]
    async fn duplicate_nullifier_insert_is_rejected() {
        let store = MemoryWorldState::new();
        store
            .sequential_insert(TreeKind::Nullifier, &[nullifier(5)])
            .await
            .unwrap();
        assert!(store
            .sequential_insert(TreeKind::Nullifier, &[nullifier(5)])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sibling_paths_agree_with_roots() {
        let store = MemoryWorldState::new();
        store
            .append_leaves(
                TreeKind::NoteHash,
                &[H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3)],
            )
            .await
            .unwrap();

        let root = store.root(TreeKind::NoteHash);
        for i in 0..3u64 {
            let path = store.get_sibling_path(TreeKind::NoteHash, i).await.unwrap();
            let Some(LeafPreimage::Hash(leaf)) = store
                .get_leaf_preimage(TreeKind::NoteHash, i)
                .await
                .unwrap()
            else {
                panic!("leaf missing");
            };
            assert_eq!(path.root_from(leaf, i), root);
        }
    }

    #[tokio::test]
    async fn frontier_path_reconstructs_ephemeral_root() {
        let store = MemoryWorldState::new();
        store
            .append_leaves(TreeKind::NoteHash, &[H256::repeat_byte(7), H256::repeat_byte(8)])
            .await
            .unwrap();

        let info = store.get_tree_info(TreeKind::NoteHash).await.unwrap();
        let frontier = store
            .get_sibling_path(TreeKind::NoteHash, info.size)
            .await
            .unwrap();
        let tree = EphemeralMerkleTree::from_frontier(info.depth, info.size, &frontier).unwrap();
        assert_eq!(tree.root().unwrap(), store.root(TreeKind::NoteHash));
    }

    #[tokio::test]
    async fn revert_restores_snapshot_commit_keeps_changes() {
        let store = MemoryWorldState::new();
        store.create_checkpoint().await.unwrap();
        store
            .sequential_insert(TreeKind::Nullifier, &[nullifier(11)])
            .await
            .unwrap();
        let root_inside = store.root(TreeKind::Nullifier);

        store.create_checkpoint().await.unwrap();
        store
            .sequential_insert(TreeKind::Nullifier, &[nullifier(22)])
            .await
            .unwrap();
        store.revert_checkpoint().await.unwrap();
        assert_eq!(store.root(TreeKind::Nullifier), root_inside);

        store.commit_checkpoint().await.unwrap();
        assert_eq!(store.root(TreeKind::Nullifier), root_inside);
        assert_eq!(store.checkpoint_depth(), 0);
    }

    #[tokio::test]
    async fn contract_registry_round_trip() {
        let store = MemoryWorldState::new();
        let address = U256::from(0xabcd);
        store.register_contract(ContractInstance {
            address,
            deployer: U256::from(1),
            class_id: U256::from(2),
            initialization_hash: U256::from(3),
        });

        let found = store.get_contract_instance(address).await.unwrap().unwrap();
        assert_eq!(found.class_id, U256::from(2));
        assert!(store
            .get_contract_instance(U256::from(0x9999))
            .await
            .unwrap()
            .is_none());
        assert!(store.get_bytecode(address).await.unwrap().is_none());
    }
}
