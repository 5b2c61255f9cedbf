//! Hashing primitives shared by the tree and its consumers.
//!
//! All node and leaf hashing is keccak256. An empty leaf hashes to
//! [`H256::zero`], and the hash of an all-empty subtree of height `h` is the
//! `h`-th element of the zero-hash chain, so unpopulated regions of a tree
//! never need to be materialized.

use ethereum_types::{H256, U256};
use keccak_hash::keccak;

/// The largest tree depth supported by the zero-hash chain.
pub const MAX_TREE_DEPTH: usize = 64;

/// Modulus of the native field (the BN254 scalar field). Field-typed values
/// and hash-to-field outputs are reduced modulo this.
pub fn field_modulus() -> U256 {
    U256::from_big_endian(&[
        0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58,
        0x5d, 0x28, 0x33, 0xe8, 0x48, 0x79, 0xb9, 0x70, 0x91, 0x43, 0xe1, 0xf5, 0x93, 0xf0, 0x00,
        0x00, 0x01,
    ])
}

/// Hashes two sibling nodes into their parent.
pub fn hash_pair(left: H256, right: H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    keccak(buf)
}

/// Hashes a sequence of field elements (big-endian, 32 bytes each).
pub fn hash_fields(fields: &[U256]) -> H256 {
    let mut buf = vec![0u8; fields.len() * 32];
    for (i, f) in fields.iter().enumerate() {
        f.to_big_endian(&mut buf[i * 32..(i + 1) * 32]);
    }
    keccak(buf)
}

/// Hashes a sequence of field elements and reduces the digest into the native
/// field. Used for siloing keys and deriving nonces.
pub fn hash_to_field(fields: &[U256]) -> U256 {
    U256::from_big_endian(hash_fields(fields).as_bytes()) % field_modulus()
}

/// The per-height hashes of all-empty subtrees.
///
/// `get(0)` is the empty leaf hash, `get(h)` the hash of an empty subtree
/// with `2^h` leaves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZeroHashes(Vec<H256>);

impl ZeroHashes {
    /// Computes the chain up to (and including) height `depth`.
    pub fn new(depth: usize) -> Self {
        let mut hashes = Vec::with_capacity(depth + 1);
        hashes.push(H256::zero());
        for h in 0..depth {
            let prev = hashes[h];
            hashes.push(hash_pair(prev, prev));
        }
        Self(hashes)
    }

    /// The hash of an empty subtree of the given height above the leaves.
    pub fn get(&self, height: usize) -> H256 {
        self.0[height]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_chain_is_consistent() {
        let zh = ZeroHashes::new(8);
        assert_eq!(zh.get(0), H256::zero());
        for h in 1..=8 {
            assert_eq!(zh.get(h), hash_pair(zh.get(h - 1), zh.get(h - 1)));
        }
    }

    #[test]
    fn hash_to_field_is_in_field() {
        let f = hash_to_field(&[U256::from(1), U256::from(2)]);
        assert!(f < field_modulus());
    }

    #[test]
    fn hash_pair_is_order_sensitive() {
        let a = H256::repeat_byte(1);
        let b = H256::repeat_byte(2);
        assert_ne!(hash_pair(a, b), hash_pair(b, a));
    }
}
