//! Justification trie
//!
//! Commits to every intermediate state of one cycle's replay. Leaf `i` is the
//! reputation root after applying log entries `0..=i`:
//!
//! ```text
//! key   = uint256(i)                       (32 bytes)
//! value = root_hash (32) | uint256(n_nodes) (32)
//! ```
//!
//! The leaves live in a Patricia trie of the same scheme as the reputation
//! trie, so the ledger verifies them with the same code.

use crate::codec::{u256_word, word_to_u128, Hash};
use crate::error::{MinerError, Result};
use crate::replay::IntermediateRoot;
use crate::trie::{InclusionProof, PatriciaTrie};
use serde::{Deserialize, Serialize};

/// Encode the key of leaf `index`
pub fn leaf_key(index: u64) -> Hash {
    u256_word(index as u128)
}

/// Encode a leaf value
pub fn leaf_value(root_hash: &Hash, n_nodes: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(root_hash);
    out.extend_from_slice(&u256_word(n_nodes as u128));
    out
}

/// A justification leaf
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JustificationLeaf {
    pub index: u64,
    #[serde(with = "crate::codec::hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
}

impl JustificationLeaf {
    /// Whether two leaves describe the same state
    pub fn same_state(&self, other: &JustificationLeaf) -> bool {
        self.root_hash == other.root_hash && self.n_nodes == other.n_nodes
    }
}

impl From<IntermediateRoot> for JustificationLeaf {
    fn from(root: IntermediateRoot) -> Self {
        Self {
            index: root.log_index,
            root_hash: root.root_hash,
            n_nodes: root.n_nodes,
        }
    }
}

/// A leaf together with its inclusion proof
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JustificationProof {
    pub leaf: JustificationLeaf,
    pub proof: InclusionProof,
}

impl JustificationProof {
    /// Check that the proof encodes `leaf` and verifies against `root`
    pub fn verify(&self, root: &Hash) -> Result<()> {
        if self.proof.key != leaf_key(self.leaf.index) {
            return Err(MinerError::InvalidProof(format!(
                "proof key does not encode leaf {}",
                self.leaf.index
            )));
        }
        if self.proof.value != leaf_value(&self.leaf.root_hash, self.leaf.n_nodes) {
            return Err(MinerError::InvalidProof(format!(
                "proof value does not encode leaf {}",
                self.leaf.index
            )));
        }
        if !self.proof.verify(root) {
            return Err(MinerError::InvalidProof(format!(
                "leaf {} does not verify against the justification root",
                self.leaf.index
            )));
        }
        Ok(())
    }

    /// Decode a leaf from raw proof bytes
    pub fn from_proof(proof: InclusionProof) -> Result<Self> {
        if proof.key.len() != 32 || proof.value.len() != 64 {
            return Err(MinerError::InvalidProof(
                "justification leaf has the wrong width".to_string(),
            ));
        }
        let index = u64::try_from(word_to_u128(&proof.key)?)
            .map_err(|_| MinerError::InvalidProof("leaf index out of range".to_string()))?;
        let mut root_hash = [0u8; 32];
        root_hash.copy_from_slice(&proof.value[..32]);
        let n_nodes = u64::try_from(word_to_u128(&proof.value[32..])?)
            .map_err(|_| MinerError::InvalidProof("leaf node count out of range".to_string()))?;
        Ok(Self {
            leaf: JustificationLeaf {
                index,
                root_hash,
                n_nodes,
            },
            proof,
        })
    }
}

/// Merkle commitment over one replay's intermediate roots
#[derive(Clone, Debug, Default)]
pub struct JustificationTrie {
    trie: PatriciaTrie,
    leaves: Vec<JustificationLeaf>,
}

impl JustificationTrie {
    /// Build from the intermediate roots of a full replay, in log order
    pub fn build(roots: &[IntermediateRoot]) -> Result<Self> {
        let mut trie = PatriciaTrie::new();
        let mut leaves = Vec::with_capacity(roots.len());
        for (expected, root) in (0u64..).zip(roots) {
            if root.log_index != expected {
                return Err(MinerError::Validation(format!(
                    "intermediate root {} found at position {}",
                    root.log_index, expected
                )));
            }
            trie.insert(
                &leaf_key(root.log_index),
                &leaf_value(&root.root_hash, root.n_nodes),
            );
            leaves.push(JustificationLeaf::from(*root));
        }
        Ok(Self { trie, leaves })
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.root_hash()
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaf(&self, index: u64) -> Option<&JustificationLeaf> {
        self.leaves.get(index as usize)
    }

    pub fn last(&self) -> Option<&JustificationLeaf> {
        self.leaves.last()
    }

    /// Proof for leaf `index`
    pub fn prove(&self, index: u64) -> Result<JustificationProof> {
        let leaf = *self
            .leaf(index)
            .ok_or_else(|| MinerError::NotFound(format!("justification leaf {}", index)))?;
        let proof = self
            .trie
            .get_proof(&leaf_key(index))
            .ok_or_else(|| MinerError::NotFound(format!("justification leaf {}", index)))?;
        Ok(JustificationProof { leaf, proof })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(n: u64) -> Vec<IntermediateRoot> {
        (0..n)
            .map(|i| IntermediateRoot {
                log_index: i,
                root_hash: [i as u8 + 1; 32],
                n_nodes: 2 * (i + 1),
            })
            .collect()
    }

    #[test]
    fn test_every_leaf_proves() {
        let trie = JustificationTrie::build(&roots(30)).unwrap();
        let jrh = trie.root_hash();
        for i in 0..30 {
            let proof = trie.prove(i).unwrap();
            assert_eq!(proof.leaf.n_nodes, 2 * (i + 1));
            proof.verify(&jrh).unwrap();
        }
        assert!(trie.prove(30).is_err());
    }

    #[test]
    fn test_proof_bound_to_claimed_leaf() {
        let trie = JustificationTrie::build(&roots(8)).unwrap();
        let jrh = trie.root_hash();
        let mut proof = trie.prove(3).unwrap();
        proof.leaf.n_nodes += 1;
        assert!(proof.verify(&jrh).is_err());

        let mut proof = trie.prove(3).unwrap();
        proof.leaf.index = 4;
        assert!(proof.verify(&jrh).is_err());
    }

    #[test]
    fn test_one_differing_leaf_changes_root() {
        let honest = JustificationTrie::build(&roots(10)).unwrap();
        let mut tampered = roots(10);
        tampered[7].root_hash = [0xee; 32];
        let tampered = JustificationTrie::build(&tampered).unwrap();

        assert_ne!(honest.root_hash(), tampered.root_hash());
        assert_eq!(honest.leaf(6), tampered.leaf(6));
        assert_ne!(honest.leaf(7), tampered.leaf(7));
    }

    #[test]
    fn test_from_proof_decodes_leaf() {
        let trie = JustificationTrie::build(&roots(5)).unwrap();
        let proof = trie.prove(2).unwrap();
        let decoded = JustificationProof::from_proof(proof.proof.clone()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_out_of_order_roots_rejected() {
        let mut r = roots(3);
        r.swap(0, 1);
        assert!(JustificationTrie::build(&r).is_err());
    }
}
