//! The persistable state manager: the transactional façade over the forest
//! and the backing store.
//!
//! A [`StateManager`] is created once per top-level transaction and forked
//! around every nested call. Forking snapshots the caches and pushes a
//! backing-store checkpoint; exactly one of [`merge`](StateManager::merge) or
//! [`reject`](StateManager::reject) consumes each forked child, so reusing a
//! finished child is a compile error rather than a runtime assertion.
//!
//! Two execution modes share one interface. `CachedOnly` writes through the
//! caches and the backing store directly and records logical trace values,
//! which is enough for simulation. `FullWitness` routes every tree mutation
//! through the session's [`Forest`] and attaches full Merkle hints (leaf
//! index, preimage, sibling path) to the trace, which is what the proving
//! pipeline consumes. All tree algorithms stay synchronous; the async
//! boundary is exactly the backing-store fetches interleaved between them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethereum_types::{H256, U256};
use indexed_tree::ephemeral::EphemeralMerkleTree;
use indexed_tree::forest::{Forest, IndexedTreeState, LowLeafInfo};
use indexed_tree::leaf::{IndexedLeaf, NullifierLeaf, PublicDataLeaf, TreeKind};
use indexed_tree::path::SiblingPath;
use log::{debug, trace};

use crate::errors::{AvmError, AvmResult, WorldStateError};
use crate::silo::{
    compute_note_nonce, compute_public_data_slot, field_to_h256, make_unique_note_hash,
    silo_note_hash, silo_nullifier,
};
use crate::trace::{ExecutionTrace, MerkleHint, TraceEntry};
use crate::world::{ContractInstance, ContractStore, WorldStateStore};

/// How the manager backs its tree operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    /// Write through caches and the backing store; trace logical values only.
    CachedOnly,
    /// Route mutations through the session forest; trace full Merkle hints.
    FullWitness,
}

fn invariant(msg: impl Into<String>) -> AvmError {
    WorldStateError::InvariantViolation(msg.into()).into()
}

async fn fetch_leaf<L, S>(store: &S, index: u64) -> AvmResult<L>
where
    L: IndexedLeaf,
    S: WorldStateStore,
{
    let preimage = store
        .get_leaf_preimage(L::TREE, index)
        .await?
        .ok_or_else(|| invariant(format!("missing leaf preimage at index {index}")))?;
    L::from_preimage(&preimage)
        .ok_or_else(|| invariant(format!("leaf preimage at index {index} has the wrong shape")))
}

/// The low-leaf query over mixed local/remote state: binary-search the
/// session's sorted keys, delegate to the store when nothing local is
/// relevant, and otherwise walk `next` pointers forward (preferring local
/// preimages, fetching the rest) until an exact match or the sandwich
/// condition identifies the low leaf. The walk is bounded by the tree's leaf
/// capacity; exceeding the bound means the linked list is corrupt.
pub async fn get_leaf_or_low_leaf<L, S>(
    state: &IndexedTreeState<L>,
    store: &S,
    key: U256,
) -> AvmResult<LowLeafInfo<L>>
where
    L: IndexedLeaf,
    S: WorldStateStore,
{
    let (mut index, mut current) = match state.local_low_entry(key) {
        None => {
            // Nothing touched this session is <= key; the store's answer is
            // authoritative and cannot have been repointed locally.
            let prev = store.get_previous_value_index(L::TREE, key).await?;
            let preimage = fetch_leaf::<L, S>(store, prev.index).await?;
            return Ok(LowLeafInfo {
                preimage,
                index: prev.index,
                already_present: prev.already_present,
            });
        }
        Some((local_key, index)) => {
            let preimage = state
                .preimage_at(index)
                .cloned()
                .ok_or_else(|| invariant("sorted-key entry without a cached preimage"))?;
            if local_key == key {
                return Ok(LowLeafInfo {
                    preimage,
                    index,
                    already_present: true,
                });
            }
            (index, preimage)
        }
    };

    for _ in 0..state.walk_bound() {
        if current.key() == key {
            return Ok(LowLeafInfo {
                preimage: current,
                index,
                already_present: true,
            });
        }
        if current.key() < key && (current.next_index() == 0 || current.next_key() > key) {
            return Ok(LowLeafInfo {
                preimage: current,
                index,
                already_present: false,
            });
        }
        let next = current.next_index();
        current = match state.preimage_at(next) {
            Some(leaf) => leaf.clone(),
            None => fetch_leaf::<L, S>(store, next).await?,
        };
        index = next;
    }
    Err(invariant(format!(
        "next-pointer walk for key {key:x} exceeded the leaf capacity of {:?}",
        L::TREE
    )))
}

/// Makes a leaf's sibling path locally derivable, hydrating it from the
/// store on a miss. Local nodes win over fetched ones, so hydrating with a
/// path the store computed before this session's mutations is safe.
async fn ensure_leaf_path<S: WorldStateStore>(
    tree: &mut EphemeralMerkleTree,
    store: &S,
    kind: TreeKind,
    index: u64,
) -> AvmResult<()> {
    if !tree.is_path_materialized(index) {
        let path = store.get_sibling_path(kind, index).await?;
        tree.insert_sibling_path(index, &path)?;
    }
    Ok(())
}

/// Resolves an append-only tree's leaf hash, hydrating the leaf and its path
/// from the store when the session never touched it.
async fn resolve_plain_leaf<S: WorldStateStore>(
    tree: &mut EphemeralMerkleTree,
    store: &S,
    kind: TreeKind,
    index: u64,
) -> AvmResult<(H256, SiblingPath)> {
    let leaf_hash = match tree.node(tree.depth(), index) {
        Some(hash) => hash,
        None => {
            let hash = store
                .get_leaf_preimage(kind, index)
                .await?
                .map(|p| p.hash())
                .unwrap_or_default();
            tree.insert_node(tree.depth(), index, hash)?;
            hash
        }
    };
    ensure_leaf_path(tree, store, kind, index).await?;
    let path = tree.sibling_path(index)?;
    Ok((leaf_hash, path))
}

/// The transactional state journal of one call frame.
#[derive(Debug)]
pub struct StateManager<S> {
    store: Arc<S>,
    mode: ExecutionMode,
    /// `Some` exactly in `FullWitness` mode.
    forest: Option<Forest>,
    /// Siloed slot -> value, for every write this call tree performed.
    storage_writes: HashMap<U256, U256>,
    /// Siloed nullifiers emitted by this call tree.
    nullifiers: HashSet<U256>,
    /// Unique note hashes emitted by this call tree, in emission order.
    note_hashes: Vec<U256>,
    notes_emitted: u64,
    first_nullifier: U256,
    l2_to_l1_messages: Vec<(U256, U256)>,
    public_logs: Vec<(U256, Vec<U256>)>,
    trace: ExecutionTrace,
}

async fn frontier_tree<S: WorldStateStore>(
    store: &S,
    kind: TreeKind,
) -> AvmResult<EphemeralMerkleTree> {
    let info = store.get_tree_info(kind).await?;
    let frontier = store.get_sibling_path(kind, info.size).await?;
    Ok(EphemeralMerkleTree::from_frontier(
        info.depth, info.size, &frontier,
    )?)
}

impl<S: WorldStateStore + ContractStore> StateManager<S> {
    /// Creates the top-level manager of a transaction. In `FullWitness` mode
    /// this fetches every tree's frontier so the session forest starts in
    /// agreement with the store.
    pub async fn create(
        store: Arc<S>,
        mode: ExecutionMode,
        first_nullifier: U256,
    ) -> AvmResult<Self> {
        let forest = match mode {
            ExecutionMode::CachedOnly => None,
            ExecutionMode::FullWitness => Some(Forest::new(
                frontier_tree(store.as_ref(), TreeKind::Nullifier).await?,
                frontier_tree(store.as_ref(), TreeKind::PublicData).await?,
                frontier_tree(store.as_ref(), TreeKind::NoteHash).await?,
                frontier_tree(store.as_ref(), TreeKind::L1ToL2Message).await?,
            )),
        };
        Ok(Self {
            store,
            mode,
            forest,
            storage_writes: HashMap::new(),
            nullifiers: HashSet::new(),
            note_hashes: Vec::new(),
            notes_emitted: 0,
            first_nullifier,
            l2_to_l1_messages: Vec::new(),
            public_logs: Vec::new(),
            trace: ExecutionTrace::new(),
        })
    }

    /// The manager's execution mode.
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The trace accumulated so far (this frame's segment plus every
    /// finished child's).
    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    /// Consumes the manager, yielding the complete trace.
    pub fn into_trace(self) -> ExecutionTrace {
        self.trace
    }

    /// Unique note hashes emitted by this call tree so far.
    pub fn note_hashes(&self) -> &[U256] {
        &self.note_hashes
    }

    /// Queued L2-to-L1 messages as `(recipient, content)` pairs.
    pub fn l2_to_l1_messages(&self) -> &[(U256, U256)] {
        &self.l2_to_l1_messages
    }

    /// Emitted public logs as `(address, fields)` pairs.
    pub fn public_logs(&self) -> &[(U256, Vec<U256>)] {
        &self.public_logs
    }

    /// The session root of a tree. Only meaningful in `FullWitness` mode,
    /// where the forest tracks every mutation.
    pub fn tree_root(&self, kind: TreeKind) -> AvmResult<H256> {
        let forest = self
            .forest
            .as_ref()
            .ok_or_else(|| invariant("tree roots are only tracked in full-witness mode"))?;
        let tree = match kind {
            TreeKind::Nullifier => &forest.nullifier.tree,
            TreeKind::PublicData => &forest.public_data.tree,
            TreeKind::NoteHash => &forest.note_hash,
            TreeKind::L1ToL2Message => &forest.l1_to_l2_message,
        };
        Ok(tree.root()?)
    }

    /// Forks the manager for a nested call: pushes a backing-store
    /// checkpoint and clones caches and forest. The child's trace segment
    /// starts empty.
    pub async fn fork(&self) -> AvmResult<Self> {
        self.store.create_checkpoint().await?;
        debug!("Forked state manager");
        Ok(Self {
            store: Arc::clone(&self.store),
            mode: self.mode,
            forest: self.forest.clone(),
            storage_writes: self.storage_writes.clone(),
            nullifiers: self.nullifiers.clone(),
            note_hashes: self.note_hashes.clone(),
            notes_emitted: self.notes_emitted,
            first_nullifier: self.first_nullifier,
            l2_to_l1_messages: self.l2_to_l1_messages.clone(),
            public_logs: self.public_logs.clone(),
            trace: self.trace.fork(),
        })
    }

    /// Folds a successful child back in: commits the store checkpoint and
    /// adopts the child's caches and forest (supersets of the parent's).
    pub async fn merge(&mut self, child: Self) -> AvmResult<()> {
        self.store.commit_checkpoint().await?;
        self.forest = child.forest;
        self.storage_writes = child.storage_writes;
        self.nullifiers = child.nullifiers;
        self.note_hashes = child.note_hashes;
        self.notes_emitted = child.notes_emitted;
        self.l2_to_l1_messages = child.l2_to_l1_messages;
        self.public_logs = child.public_logs;
        self.trace.absorb(child.trace);
        debug!("Merged child state manager");
        Ok(())
    }

    /// Discards a reverted child's state: rolls the store checkpoint back
    /// and keeps only the child's trace (failed attempts are provable).
    pub async fn reject(&mut self, child: Self) -> AvmResult<()> {
        self.store.revert_checkpoint().await?;
        self.trace.absorb(child.trace);
        debug!("Rejected child state manager");
        Ok(())
    }

    /// Reads public storage for `(address, slot)`; never-written slots read
    /// as zero.
    pub async fn read_storage(&mut self, address: U256, slot: U256) -> AvmResult<U256> {
        let siloed = compute_public_data_slot(address, slot);
        let (value, hint) = match self.forest.as_mut() {
            None => {
                let value = if let Some(cached) = self.storage_writes.get(&siloed) {
                    *cached
                } else {
                    let prev = self
                        .store
                        .get_previous_value_index(TreeKind::PublicData, siloed)
                        .await?;
                    if prev.already_present {
                        fetch_leaf::<PublicDataLeaf, S>(self.store.as_ref(), prev.index)
                            .await?
                            .value
                    } else {
                        U256::zero()
                    }
                };
                (value, None)
            }
            // Even slots this call tree wrote go through the forest: the
            // walk finds the session leaf, and the read still needs its
            // hint in the witness.
            Some(forest) => {
                let info =
                    get_leaf_or_low_leaf(&forest.public_data, self.store.as_ref(), siloed).await?;
                let value = if info.already_present {
                    info.preimage.value
                } else {
                    U256::zero()
                };
                ensure_leaf_path(
                    &mut forest.public_data.tree,
                    self.store.as_ref(),
                    TreeKind::PublicData,
                    info.index,
                )
                .await?;
                let path = forest.public_data.tree.sibling_path(info.index)?;
                let hint = MerkleHint {
                    leaf_index: info.index,
                    sibling_path: path,
                    preimage: info.preimage.to_preimage(),
                };
                (value, Some(hint))
            }
        };
        trace!("Storage read {siloed:x} -> {value:x}");
        self.trace.record(TraceEntry::StorageRead {
            slot: siloed,
            value,
            hint,
        });
        Ok(value)
    }

    /// Writes public storage for `(address, slot)`: an upsert into the
    /// public-data tree.
    pub async fn write_storage(&mut self, address: U256, slot: U256, value: U256) -> AvmResult<()> {
        let siloed = compute_public_data_slot(address, slot);
        let hint = match self.forest.as_mut() {
            None => {
                self.store
                    .sequential_insert(
                        TreeKind::PublicData,
                        &[PublicDataLeaf::new(siloed, value).to_preimage()],
                    )
                    .await?;
                None
            }
            Some(forest) => {
                let info =
                    get_leaf_or_low_leaf(&forest.public_data, self.store.as_ref(), siloed).await?;
                ensure_leaf_path(
                    &mut forest.public_data.tree,
                    self.store.as_ref(),
                    TreeKind::PublicData,
                    info.index,
                )
                .await?;
                let (index, path) = if info.already_present {
                    let mut leaf = info.preimage;
                    leaf.value = value;
                    let path = forest.public_data.update_in_place(info.index, leaf)?;
                    (info.index, path)
                } else {
                    forest.public_data.append_indexed(
                        info.index,
                        info.preimage,
                        PublicDataLeaf::new(siloed, value),
                    )?
                };
                let preimage = forest
                    .public_data
                    .preimage_at(index)
                    .ok_or_else(|| invariant("freshly written leaf missing from session cache"))?;
                Some(MerkleHint {
                    leaf_index: index,
                    sibling_path: path,
                    preimage: preimage.to_preimage(),
                })
            }
        };
        self.storage_writes.insert(siloed, value);
        trace!("Storage write {siloed:x} <- {value:x}");
        self.trace.record(TraceEntry::StorageWrite {
            slot: siloed,
            value,
            hint,
        });
        Ok(())
    }

    async fn nullifier_lookup(
        &mut self,
        siloed: U256,
    ) -> AvmResult<(bool, Option<MerkleHint>)> {
        match self.forest.as_mut() {
            None => {
                let exists = if self.nullifiers.contains(&siloed) {
                    true
                } else {
                    self.store
                        .get_previous_value_index(TreeKind::Nullifier, siloed)
                        .await?
                        .already_present
                };
                Ok((exists, None))
            }
            Some(forest) => {
                let info =
                    get_leaf_or_low_leaf(&forest.nullifier, self.store.as_ref(), siloed).await?;
                ensure_leaf_path(
                    &mut forest.nullifier.tree,
                    self.store.as_ref(),
                    TreeKind::Nullifier,
                    info.index,
                )
                .await?;
                let path = forest.nullifier.tree.sibling_path(info.index)?;
                let hint = MerkleHint {
                    leaf_index: info.index,
                    sibling_path: path,
                    preimage: info.preimage.to_preimage(),
                };
                Ok((info.already_present, Some(hint)))
            }
        }
    }

    /// Checks whether `nullifier`, siloed to `address`, exists.
    pub async fn check_nullifier_exists(
        &mut self,
        address: U256,
        nullifier: U256,
    ) -> AvmResult<bool> {
        let siloed = silo_nullifier(address, nullifier);
        let (exists, hint) = self.nullifier_lookup(siloed).await?;
        self.trace.record(TraceEntry::NullifierCheck {
            nullifier: siloed,
            exists,
            hint,
        });
        Ok(exists)
    }

    /// Emits a nullifier siloed to `address`. A duplicate fails with
    /// [`AvmError::NullifierCollision`]; the check that discovered the
    /// collision is still traced.
    pub async fn write_nullifier(&mut self, address: U256, nullifier: U256) -> AvmResult<()> {
        let siloed = silo_nullifier(address, nullifier);
        let (exists, check_hint) = self.nullifier_lookup(siloed).await?;
        if exists {
            self.trace.record(TraceEntry::NullifierCheck {
                nullifier: siloed,
                exists: true,
                hint: check_hint,
            });
            return Err(AvmError::NullifierCollision { nullifier: siloed });
        }

        let hint = match self.forest.as_mut() {
            None => {
                self.store
                    .sequential_insert(
                        TreeKind::Nullifier,
                        &[NullifierLeaf::new(siloed).to_preimage()],
                    )
                    .await?;
                None
            }
            Some(forest) => {
                let info =
                    get_leaf_or_low_leaf(&forest.nullifier, self.store.as_ref(), siloed).await?;
                ensure_leaf_path(
                    &mut forest.nullifier.tree,
                    self.store.as_ref(),
                    TreeKind::Nullifier,
                    info.index,
                )
                .await?;
                let (index, path) = forest.nullifier.append_indexed(
                    info.index,
                    info.preimage,
                    NullifierLeaf::new(siloed),
                )?;
                let preimage = forest
                    .nullifier
                    .preimage_at(index)
                    .ok_or_else(|| invariant("freshly inserted leaf missing from session cache"))?;
                Some(MerkleHint {
                    leaf_index: index,
                    sibling_path: path,
                    preimage: preimage.to_preimage(),
                })
            }
        };
        self.nullifiers.insert(siloed);
        trace!("Nullifier inserted: {siloed:x}");
        self.trace.record(TraceEntry::NullifierWrite {
            nullifier: siloed,
            hint,
        });
        Ok(())
    }

    /// Checks whether the note-hash tree holds `note_hash` (a unique leaf
    /// value) at `leaf_index`.
    pub async fn check_note_hash_exists(
        &mut self,
        note_hash: U256,
        leaf_index: u64,
    ) -> AvmResult<bool> {
        let expected = field_to_h256(note_hash);
        let (exists, hint) = match self.forest.as_mut() {
            None => {
                let leaf = self
                    .store
                    .get_leaf_preimage(TreeKind::NoteHash, leaf_index)
                    .await?;
                (leaf.map(|p| p.hash()) == Some(expected), None)
            }
            // An index beyond the tree's capacity is hostile program input,
            // not store corruption: the check simply misses.
            Some(forest) if u128::from(leaf_index) >= forest.note_hash.capacity() => {
                (false, None)
            }
            Some(forest) => {
                let (leaf_hash, path) = resolve_plain_leaf(
                    &mut forest.note_hash,
                    self.store.as_ref(),
                    TreeKind::NoteHash,
                    leaf_index,
                )
                .await?;
                let in_range = leaf_index < forest.note_hash.leaf_count();
                let hint = MerkleHint {
                    leaf_index,
                    sibling_path: path,
                    preimage: indexed_tree::leaf::LeafPreimage::Hash(leaf_hash),
                };
                (in_range && leaf_hash == expected, Some(hint))
            }
        };
        self.trace.record(TraceEntry::NoteHashCheck {
            note_hash,
            leaf_index,
            exists,
            hint,
        });
        Ok(exists)
    }

    /// Emits a note hash: silos it to `address`, makes it unique with the
    /// transaction's note nonce, and appends it to the note-hash tree.
    pub async fn write_note_hash(&mut self, address: U256, note_hash: U256) -> AvmResult<()> {
        let siloed = silo_note_hash(address, note_hash);
        let nonce = compute_note_nonce(self.first_nullifier, self.notes_emitted);
        let unique = make_unique_note_hash(nonce, siloed);
        self.notes_emitted += 1;
        self.note_hashes.push(unique);

        let hint = match self.forest.as_mut() {
            None => {
                self.store
                    .append_leaves(TreeKind::NoteHash, &[field_to_h256(unique)])
                    .await?;
                None
            }
            Some(forest) => {
                let index = forest.note_hash.append_leaf(field_to_h256(unique))?;
                let path = forest.note_hash.sibling_path(index)?;
                Some(MerkleHint {
                    leaf_index: index,
                    sibling_path: path,
                    preimage: indexed_tree::leaf::LeafPreimage::Hash(field_to_h256(unique)),
                })
            }
        };
        trace!("Note hash emitted: {unique:x}");
        self.trace.record(TraceEntry::NoteHashWrite {
            note_hash: unique,
            hint,
        });
        Ok(())
    }

    /// Checks whether the L1-to-L2 message tree holds `msg_hash` at
    /// `leaf_index`. The tree is read-only in this engine.
    pub async fn check_l1_to_l2_message_exists(
        &mut self,
        msg_hash: U256,
        leaf_index: u64,
    ) -> AvmResult<bool> {
        let expected = field_to_h256(msg_hash);
        let (exists, hint) = match self.forest.as_mut() {
            None => {
                let leaf = self
                    .store
                    .get_leaf_preimage(TreeKind::L1ToL2Message, leaf_index)
                    .await?;
                (leaf.map(|p| p.hash()) == Some(expected), None)
            }
            Some(forest) if u128::from(leaf_index) >= forest.l1_to_l2_message.capacity() => {
                (false, None)
            }
            Some(forest) => {
                let (leaf_hash, path) = resolve_plain_leaf(
                    &mut forest.l1_to_l2_message,
                    self.store.as_ref(),
                    TreeKind::L1ToL2Message,
                    leaf_index,
                )
                .await?;
                let in_range = leaf_index < forest.l1_to_l2_message.leaf_count();
                let hint = MerkleHint {
                    leaf_index,
                    sibling_path: path,
                    preimage: indexed_tree::leaf::LeafPreimage::Hash(leaf_hash),
                };
                (in_range && leaf_hash == expected, Some(hint))
            }
        };
        self.trace.record(TraceEntry::L1ToL2MessageCheck {
            msg_hash,
            leaf_index,
            exists,
            hint,
        });
        Ok(exists)
    }

    /// Queues an L2-to-L1 message for the outbox.
    pub fn write_l2_to_l1_message(&mut self, recipient: U256, content: U256) {
        self.l2_to_l1_messages.push((recipient, content));
        self.trace
            .record(TraceEntry::L2ToL1MessageSent { recipient, content });
    }

    /// Emits a public log.
    pub fn write_public_log(&mut self, address: U256, fields: Vec<U256>) {
        self.public_logs.push((address, fields.clone()));
        self.trace.record(TraceEntry::PublicLog { address, fields });
    }

    /// Resolves a deployed contract instance.
    pub async fn get_contract_instance(
        &mut self,
        address: U256,
    ) -> AvmResult<Option<ContractInstance>> {
        let instance = self.store.get_contract_instance(address).await?;
        self.trace.record(TraceEntry::ContractInstanceRead {
            address,
            exists: instance.is_some(),
        });
        Ok(instance)
    }

    /// Resolves a contract's bytecode.
    pub async fn get_bytecode(
        &mut self,
        address: U256,
    ) -> AvmResult<Option<Arc<Vec<crate::opcode::Opcode>>>> {
        Ok(self.store.get_bytecode(address).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::MemoryWorldState;

    async fn manager(mode: ExecutionMode) -> (Arc<MemoryWorldState>, StateManager<MemoryWorldState>)
    {
        let _ = pretty_env_logger::try_init();
        let store = Arc::new(MemoryWorldState::new());
        let mgr = StateManager::create(Arc::clone(&store), mode, U256::from(0x1234))
            .await
            .unwrap();
        (store, mgr)
    }

    #[tokio::test]
    async fn storage_write_then_read_round_trip() {
        for mode in [ExecutionMode::CachedOnly, ExecutionMode::FullWitness] {
            let (_store, mut mgr) = manager(mode).await;
            let addr = U256::from(0x1);
            mgr.write_storage(addr, U256::from(5), U256::from(42))
                .await
                .unwrap();
            assert_eq!(
                mgr.read_storage(addr, U256::from(5)).await.unwrap(),
                U256::from(42),
                "{mode:?}"
            );
            // Unwritten slots read as zero.
            assert_eq!(
                mgr.read_storage(addr, U256::from(6)).await.unwrap(),
                U256::zero()
            );
        }
    }

    #[tokio::test]
    async fn storage_fork_merge_is_visible_fork_reject_is_not() {
        for mode in [ExecutionMode::CachedOnly, ExecutionMode::FullWitness] {
            let (_store, mut mgr) = manager(mode).await;
            let addr = U256::from(0x1);

            let mut child = mgr.fork().await.unwrap();
            child
                .write_storage(addr, U256::from(5), U256::from(42))
                .await
                .unwrap();
            mgr.merge(child).await.unwrap();
            assert_eq!(
                mgr.read_storage(addr, U256::from(5)).await.unwrap(),
                U256::from(42)
            );

            let mut child = mgr.fork().await.unwrap();
            child
                .write_storage(addr, U256::from(9), U256::from(7))
                .await
                .unwrap();
            mgr.reject(child).await.unwrap();
            assert_eq!(
                mgr.read_storage(addr, U256::from(9)).await.unwrap(),
                U256::zero(),
                "{mode:?}"
            );
        }
    }

    #[tokio::test]
    async fn rejected_fork_restores_tree_root() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let root_before = mgr.tree_root(TreeKind::Nullifier).unwrap();

        let mut child = mgr.fork().await.unwrap();
        child
            .write_nullifier(U256::from(0x1), U256::from(77))
            .await
            .unwrap();
        assert_ne!(child.tree_root(TreeKind::Nullifier).unwrap(), root_before);
        mgr.reject(child).await.unwrap();

        assert_eq!(mgr.tree_root(TreeKind::Nullifier).unwrap(), root_before);
    }

    #[tokio::test]
    async fn nullifier_collision_and_sibling_frame_reinsertion() {
        for mode in [ExecutionMode::CachedOnly, ExecutionMode::FullWitness] {
            let (_store, mut mgr) = manager(mode).await;
            let addr = U256::from(0xa);
            let value = U256::from(55);

            // Collision within one call tree (no intervening revert).
            let mut child = mgr.fork().await.unwrap();
            child.write_nullifier(addr, value).await.unwrap();
            assert!(matches!(
                child.write_nullifier(addr, value).await,
                Err(AvmError::NullifierCollision { .. })
            ));
            mgr.reject(child).await.unwrap();

            // After the reject, a sibling frame can insert the same value.
            let mut sibling = mgr.fork().await.unwrap();
            sibling.write_nullifier(addr, value).await.unwrap();
            mgr.merge(sibling).await.unwrap();
            assert!(mgr.check_nullifier_exists(addr, value).await.unwrap());
        }
    }

    #[tokio::test]
    async fn merged_nullifier_collides_in_later_frame() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let addr = U256::from(0xa);

        let mut child = mgr.fork().await.unwrap();
        child.write_nullifier(addr, U256::from(1)).await.unwrap();
        mgr.merge(child).await.unwrap();

        let mut later = mgr.fork().await.unwrap();
        assert!(matches!(
            later.write_nullifier(addr, U256::from(1)).await,
            Err(AvmError::NullifierCollision { .. })
        ));
        mgr.reject(later).await.unwrap();
    }

    #[tokio::test]
    async fn low_leaf_walk_mixes_store_and_session_leaves() {
        let store = Arc::new(MemoryWorldState::new());
        // Pre-existing state: nullifiers 5, 3, 9 inserted before the tx.
        store
            .sequential_insert(
                TreeKind::Nullifier,
                &[
                    NullifierLeaf::new(U256::from(5)).to_preimage(),
                    NullifierLeaf::new(U256::from(3)).to_preimage(),
                    NullifierLeaf::new(U256::from(9)).to_preimage(),
                ],
            )
            .await
            .unwrap();

        let mgr = StateManager::create(
            Arc::clone(&store),
            ExecutionMode::FullWitness,
            U256::from(0x1),
        )
        .await
        .unwrap();
        let forest = mgr.forest.as_ref().unwrap();

        // 5 < 7 < 9: low leaf holds key 5, not present.
        let info = get_leaf_or_low_leaf(&forest.nullifier, store.as_ref(), U256::from(7))
            .await
            .unwrap();
        assert!(!info.already_present);
        assert_eq!(info.preimage.nullifier, U256::from(5));
        assert_eq!(info.preimage.next_nullifier, U256::from(9));

        let info = get_leaf_or_low_leaf(&forest.nullifier, store.as_ref(), U256::from(9))
            .await
            .unwrap();
        assert!(info.already_present);
    }

    #[tokio::test]
    async fn lookup_after_session_insert_is_present() {
        let (store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let addr = U256::from(0x2);
        mgr.write_nullifier(addr, U256::from(7)).await.unwrap();

        let siloed = silo_nullifier(addr, U256::from(7));
        let forest = mgr.forest.as_ref().unwrap();
        let info = get_leaf_or_low_leaf(&forest.nullifier, store.as_ref(), siloed)
            .await
            .unwrap();
        assert!(info.already_present);
        assert_eq!(info.preimage.nullifier, siloed);
    }

    #[tokio::test]
    async fn note_hashes_are_unique_per_emission() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let addr = U256::from(0x3);
        mgr.write_note_hash(addr, U256::from(10)).await.unwrap();
        mgr.write_note_hash(addr, U256::from(10)).await.unwrap();

        let notes = mgr.note_hashes().to_vec();
        assert_eq!(notes.len(), 2);
        assert_ne!(notes[0], notes[1]);

        // Both leaves are probeable at their indices.
        assert!(mgr.check_note_hash_exists(notes[0], 0).await.unwrap());
        assert!(mgr.check_note_hash_exists(notes[1], 1).await.unwrap());
        assert!(!mgr.check_note_hash_exists(notes[0], 1).await.unwrap());
    }

    #[tokio::test]
    async fn l1_to_l2_message_membership() {
        let store = Arc::new(MemoryWorldState::new());
        let msg = U256::from(0xbeef);
        store
            .append_leaves(TreeKind::L1ToL2Message, &[field_to_h256(msg)])
            .await
            .unwrap();

        for mode in [ExecutionMode::CachedOnly, ExecutionMode::FullWitness] {
            let mut mgr = StateManager::create(Arc::clone(&store), mode, U256::one())
                .await
                .unwrap();
            assert!(mgr.check_l1_to_l2_message_exists(msg, 0).await.unwrap());
            assert!(!mgr.check_l1_to_l2_message_exists(msg, 1).await.unwrap());
            assert!(!mgr
                .check_l1_to_l2_message_exists(U256::from(0xdead), 0)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn existence_check_beyond_capacity_is_a_clean_miss() {
        // A program can put any u64 in memory; an index past the end of the
        // tree must read as absent, not abort the transaction.
        for mode in [ExecutionMode::CachedOnly, ExecutionMode::FullWitness] {
            let (_store, mut mgr) = manager(mode).await;
            assert!(
                !mgr.check_note_hash_exists(U256::from(7), u64::MAX)
                    .await
                    .unwrap(),
                "{mode:?}"
            );
            assert!(!mgr
                .check_l1_to_l2_message_exists(U256::from(7), u64::MAX)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn full_witness_read_of_session_written_slot_carries_a_hint() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let addr = U256::from(0x1);
        mgr.write_storage(addr, U256::from(5), U256::from(42))
            .await
            .unwrap();
        assert_eq!(
            mgr.read_storage(addr, U256::from(5)).await.unwrap(),
            U256::from(42)
        );

        let Some(TraceEntry::StorageRead {
            hint: Some(hint), ..
        }) = mgr.trace().entries().last()
        else {
            panic!("full-witness storage read traced without a Merkle hint");
        };
        assert_eq!(
            hint.sibling_path
                .root_from(hint.preimage.hash(), hint.leaf_index),
            mgr.tree_root(TreeKind::PublicData).unwrap()
        );
    }

    #[tokio::test]
    async fn rejected_child_trace_is_retained() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        let mut child = mgr.fork().await.unwrap();
        child
            .write_storage(U256::from(0x1), U256::from(5), U256::from(42))
            .await
            .unwrap();
        let child_len = child.trace().len();
        assert!(child_len > 0);

        let parent_len = mgr.trace().len();
        mgr.reject(child).await.unwrap();
        assert_eq!(mgr.trace().len(), parent_len + child_len);
    }

    #[tokio::test]
    async fn full_witness_hints_recompute_the_root() {
        let (_store, mut mgr) = manager(ExecutionMode::FullWitness).await;
        mgr.write_nullifier(U256::from(0x1), U256::from(5))
            .await
            .unwrap();

        let root = mgr.tree_root(TreeKind::Nullifier).unwrap();
        let Some(TraceEntry::NullifierWrite {
            hint: Some(hint), ..
        }) = mgr.trace().entries().last()
        else {
            panic!("nullifier write not traced with a hint");
        };
        assert_eq!(
            hint.sibling_path
                .root_from(hint.preimage.hash(), hint.leaf_index),
            root
        );
    }

    #[tokio::test]
    async fn cached_only_writes_reach_the_store() {
        let (store, mut mgr) = manager(ExecutionMode::CachedOnly).await;
        mgr.write_nullifier(U256::from(0x1), U256::from(5))
            .await
            .unwrap();

        let siloed = silo_nullifier(U256::from(0x1), U256::from(5));
        let prev = store
            .get_previous_value_index(TreeKind::Nullifier, siloed)
            .await
            .unwrap();
        assert!(prev.already_present);
    }

    #[tokio::test]
    async fn modes_agree_on_nullifier_roots() {
        // The same operations in both modes must produce the same tree,
        // whether tracked in the session forest or written through.
        let cached_store = Arc::new(MemoryWorldState::new());
        let mut cached = StateManager::create(
            Arc::clone(&cached_store),
            ExecutionMode::CachedOnly,
            U256::one(),
        )
        .await
        .unwrap();

        let (_witness_store, mut witness) = manager(ExecutionMode::FullWitness).await;

        for n in [5u64, 3, 9] {
            cached
                .write_nullifier(U256::from(0x1), U256::from(n))
                .await
                .unwrap();
            witness
                .write_nullifier(U256::from(0x1), U256::from(n))
                .await
                .unwrap();
        }

        assert_eq!(
            cached_store.root(TreeKind::Nullifier),
            witness.tree_root(TreeKind::Nullifier).unwrap()
        );
    }
}
