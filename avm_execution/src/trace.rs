//! The proof-witness trace.
//!
//! Every state operation the journal performs appends one [`TraceEntry`]
//! describing the operation, its outcome, and (in full-witness mode) the
//! Merkle data a downstream prover needs to verify it: the touched leaf's
//! index, preimage and sibling path. In cached-only mode the hints are
//! absent but the operation sequence is still recorded.
//!
//! Traces follow the journal's fork discipline: a fork starts an empty child
//! segment, and both merge and reject append the child's entries to the
//! parent's. A reverted call's reads and writes still have to be proven, so
//! rejection discards cached state but never trace entries.

use ethereum_types::U256;
use indexed_tree::leaf::{LeafPreimage, TreeKind};
use indexed_tree::path::SiblingPath;
use serde::{Deserialize, Serialize};

/// Merkle data accompanying a traced operation in full-witness mode.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MerkleHint {
    /// Index of the touched leaf.
    pub leaf_index: u64,
    /// Sibling path of the touched leaf, after the operation for writes and
    /// as-read for lookups.
    pub sibling_path: SiblingPath,
    /// Preimage of the touched leaf.
    pub preimage: LeafPreimage,
}

/// One recorded state operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TraceEntry {
    /// A public-storage read.
    StorageRead {
        /// The siloed slot.
        slot: U256,
        /// The value read (zero for never-written slots).
        value: U256,
        /// Low-leaf or exact-match hint.
        hint: Option<MerkleHint>,
    },
    /// A public-storage write.
    StorageWrite {
        /// The siloed slot.
        slot: U256,
        /// The value written.
        value: U256,
        /// Hint for the updated or appended leaf.
        hint: Option<MerkleHint>,
    },
    /// A nullifier existence check.
    NullifierCheck {
        /// The siloed nullifier.
        nullifier: U256,
        /// Whether it exists.
        exists: bool,
        /// Membership or low-leaf (non-membership) hint.
        hint: Option<MerkleHint>,
    },
    /// A nullifier insertion. Recorded even when the insertion collides and
    /// the call reverts.
    NullifierWrite {
        /// The siloed nullifier.
        nullifier: U256,
        /// Hint for the appended leaf.
        hint: Option<MerkleHint>,
    },
    /// A note-hash membership check at a specific leaf index.
    NoteHashCheck {
        /// The unique (siloed, nonced) note hash probed for.
        note_hash: U256,
        /// The probed leaf index.
        leaf_index: u64,
        /// Whether the leaf holds the hash.
        exists: bool,
        /// Hint for the probed leaf.
        hint: Option<MerkleHint>,
    },
    /// A note-hash insertion.
    NoteHashWrite {
        /// The unique note hash inserted.
        note_hash: U256,
        /// Hint for the appended leaf.
        hint: Option<MerkleHint>,
    },
    /// An L1-to-L2 message membership check.
    L1ToL2MessageCheck {
        /// The message hash probed for.
        msg_hash: U256,
        /// The probed leaf index.
        leaf_index: u64,
        /// Whether the leaf holds the hash.
        exists: bool,
        /// Hint for the probed leaf.
        hint: Option<MerkleHint>,
    },
    /// An L2-to-L1 message enqueued for the outbox.
    L2ToL1MessageSent {
        /// The L1 recipient.
        recipient: U256,
        /// The message content.
        content: U256,
    },
    /// A public log emission.
    PublicLog {
        /// The emitting contract.
        address: U256,
        /// The log fields.
        fields: Vec<U256>,
    },
    /// A contract-instance lookup.
    ContractInstanceRead {
        /// The queried address.
        address: U256,
        /// Whether an instance exists there.
        exists: bool,
    },
}

impl TraceEntry {
    /// The tree this entry touches, if any.
    pub const fn tree(&self) -> Option<TreeKind> {
        match self {
            TraceEntry::StorageRead { .. } | TraceEntry::StorageWrite { .. } => {
                Some(TreeKind::PublicData)
            }
            TraceEntry::NullifierCheck { .. } | TraceEntry::NullifierWrite { .. } => {
                Some(TreeKind::Nullifier)
            }
            TraceEntry::NoteHashCheck { .. } | TraceEntry::NoteHashWrite { .. } => {
                Some(TreeKind::NoteHash)
            }
            TraceEntry::L1ToL2MessageCheck { .. } => Some(TreeKind::L1ToL2Message),
            TraceEntry::L2ToL1MessageSent { .. }
            | TraceEntry::PublicLog { .. }
            | TraceEntry::ContractInstanceRead { .. } => None,
        }
    }
}

/// An append-only sequence of traced operations.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    /// An empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// The empty trace segment of a forked child journal.
    pub fn fork(&self) -> Self {
        Self::new()
    }

    /// Appends a finished child segment, merged or rejected alike.
    pub fn absorb(&mut self, child: Self) {
        self.entries.extend(child.entries);
    }

    /// The recorded entries, in operation order.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_read(slot: u64) -> TraceEntry {
        TraceEntry::StorageRead {
            slot: U256::from(slot),
            value: U256::zero(),
            hint: None,
        }
    }

    #[test]
    fn absorb_keeps_operation_order() {
        let mut parent = ExecutionTrace::new();
        parent.record(storage_read(1));

        let mut child = parent.fork();
        assert!(child.is_empty());
        child.record(storage_read(2));
        child.record(storage_read(3));

        parent.absorb(child);
        parent.record(storage_read(4));

        let slots: Vec<_> = parent
            .entries()
            .iter()
            .map(|e| match e {
                TraceEntry::StorageRead { slot, .. } => slot.low_u64(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![1, 2, 3, 4]);
    }

    #[test]
    fn trace_survives_json_serialization() {
        use indexed_tree::leaf::NullifierLeaf;

        let mut trace = ExecutionTrace::new();
        trace.record(TraceEntry::NullifierWrite {
            nullifier: U256::from(5),
            hint: Some(MerkleHint {
                leaf_index: 1,
                sibling_path: SiblingPath::new(vec![ethereum_types::H256::repeat_byte(7)]),
                preimage: LeafPreimage::Nullifier(NullifierLeaf::new(U256::from(5))),
            }),
        });

        let json = serde_json::to_string(&trace).unwrap();
        let decoded: ExecutionTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, trace);
    }

    #[test]
    fn entries_know_their_tree() {
        assert_eq!(storage_read(0).tree(), Some(TreeKind::PublicData));
        assert_eq!(
            TraceEntry::PublicLog {
                address: U256::zero(),
                fields: vec![],
            }
            .tree(),
            None
        );
    }
}
