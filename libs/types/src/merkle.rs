//! Keccak-256 Merkle tree
//!
//! Layout matches the registry's on-chain verifier:
//! - leaf hash = keccak256(keccak256(data))
//! - node hash = keccak256(min(a, b) || max(a, b))
//! - an unpaired node at the end of a level is promoted unchanged
//!
//! Sorted pairs mean a proof is just the list of sibling digests, bottom-up.

use sha3::{Digest as _, Keccak256};

pub type Digest = [u8; 32];

pub fn keccak256(data: &[u8]) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double-hashed leaf, immune to second-preimage via inner nodes.
pub fn leaf_hash(data: &[u8]) -> Digest {
    keccak256(&keccak256(data))
}

pub fn hash_pair(a: &Digest, b: &Digest) -> Digest {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo);
    buf[32..].copy_from_slice(hi);
    keccak256(&buf)
}

/// Fold a proof into a root and compare.
pub fn verify(root: &Digest, leaf: &Digest, proof: &[Digest]) -> bool {
    let computed = proof.iter().fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
    &computed == root
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// levels[0] are leaf hashes, last level holds the root
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build from raw leaf data, hashing each leaf.
    pub fn from_leaves<T: AsRef<[u8]>>(leaves: &[T]) -> Self {
        Self::from_hashes(leaves.iter().map(|l| leaf_hash(l.as_ref())).collect())
    }

    pub fn from_hashes(hashes: Vec<Digest>) -> Self {
        let mut levels = vec![hashes];
        while levels.last().map_or(false, |level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| match pair.get(1) {
                    Some(right) => hash_pair(&pair[0], right),
                    None => pair[0],
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// `None` for an empty tree.
    pub fn root(&self) -> Option<Digest> {
        self.levels.last().and_then(|level| level.first().copied())
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |level| level.len())
    }

    pub fn leaf(&self, index: usize) -> Option<Digest> {
        self.levels.first().and_then(|level| level.get(index).copied())
    }

    /// Sibling path for the leaf at `index`, bottom-up.
    pub fn proof(&self, index: usize) -> Option<Vec<Digest>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut proof = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < level.len() {
                proof.push(level[sibling]);
            }
            idx /= 2;
        }
        Some(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") from the Ethereum yellow paper
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_empty_tree_has_no_root() {
        let tree = MerkleTree::from_leaves::<Vec<u8>>(&[]);
        assert_eq!(tree.root(), None);
        assert_eq!(tree.proof(0), None);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let tree = MerkleTree::from_leaves(&[b"only".to_vec()]);
        assert_eq!(tree.root(), Some(leaf_hash(b"only")));
        assert_eq!(tree.proof(0), Some(vec![]));
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::from_leaves(&[b"a".to_vec(), b"b".to_vec()]);
        let expected = hash_pair(&leaf_hash(b"a"), &leaf_hash(b"b"));
        assert_eq!(tree.root(), Some(expected));
    }

    #[test]
    fn test_odd_leaf_promoted() {
        let data = leaves(3);
        let tree = MerkleTree::from_leaves(&data);
        let ab = hash_pair(&leaf_hash(&data[0]), &leaf_hash(&data[1]));
        let expected = hash_pair(&ab, &leaf_hash(&data[2]));
        assert_eq!(tree.root(), Some(expected));
        assert_eq!(tree.proof(2), Some(vec![ab]));
    }

    #[test]
    fn test_every_proof_verifies_for_500_leaves() {
        let data = leaves(500);
        let tree = MerkleTree::from_leaves(&data);
        let root = tree.root().unwrap();
        for (i, leaf) in data.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert!(verify(&root, &leaf_hash(leaf), &proof), "leaf {i}");
        }
    }

    #[test]
    fn test_tampered_leaf_fails() {
        let data = leaves(17);
        let tree = MerkleTree::from_leaves(&data);
        let root = tree.root().unwrap();
        let proof = tree.proof(5).unwrap();
        let mut tampered = data[5].clone();
        tampered[0] ^= 0x01;
        assert!(!verify(&root, &leaf_hash(&tampered), &proof));
    }

    #[test]
    fn test_order_matters_for_root() {
        let data = leaves(4);
        let mut rotated = data.clone();
        rotated.rotate_left(1);
        assert_ne!(
            MerkleTree::from_leaves(&data).root(),
            MerkleTree::from_leaves(&rotated).root()
        );
    }

    proptest! {
        #[test]
        fn prop_proofs_verify(n in 1usize..64, pick in any::<usize>()) {
            let data = leaves(n);
            let tree = MerkleTree::from_leaves(&data);
            let index = pick % n;
            let proof = tree.proof(index).unwrap();
            prop_assert!(verify(&tree.root().unwrap(), &leaf_hash(&data[index]), &proof));
        }
    }
}
