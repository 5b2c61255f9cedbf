//! Sibling paths: the hashes needed to recompute a Merkle root from a leaf.

use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::hashing::hash_pair;

/// A Merkle sibling path, ordered bottom-up: the first element is the sibling
/// of the leaf itself, the last the sibling of the root's child.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SiblingPath(Vec<H256>);

impl SiblingPath {
    /// Wraps a bottom-up list of sibling hashes.
    pub fn new(hashes: Vec<H256>) -> Self {
        Self(hashes)
    }

    /// The number of levels in the path (equal to the tree depth).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path is empty (a zero-depth tree).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The sibling hashes, bottom-up.
    pub fn hashes(&self) -> &[H256] {
        &self.0
    }

    /// Recomputes the root implied by placing `leaf_hash` at `leaf_index`.
    pub fn root_from(&self, leaf_hash: H256, leaf_index: u64) -> H256 {
        let mut node = leaf_hash;
        let mut index = leaf_index;
        for sibling in &self.0 {
            node = if index & 1 == 0 {
                hash_pair(node, *sibling)
            } else {
                hash_pair(*sibling, node)
            };
            index >>= 1;
        }
        node
    }
}

impl From<Vec<H256>> for SiblingPath {
    fn from(hashes: Vec<H256>) -> Self {
        Self(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::ZeroHashes;

    #[test]
    fn empty_tree_root_from_zero_path() {
        let depth = 4;
        let zh = ZeroHashes::new(depth);
        let path = SiblingPath::new((0..depth).map(|h| zh.get(h)).collect());
        assert_eq!(path.root_from(H256::zero(), 0), zh.get(depth));
    }

    #[test]
    fn root_depends_on_leaf_index() {
        let path = SiblingPath::new(vec![H256::repeat_byte(1), H256::repeat_byte(2)]);
        let leaf = H256::repeat_byte(3);
        assert_ne!(path.root_from(leaf, 0), path.root_from(leaf, 1));
    }
}
