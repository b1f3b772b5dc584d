//! Patricia proofs and the ledger's implied-root computation.
//!
//! A proof is `(branch_mask, siblings)`. Bit `255 - d` of the 256-bit mask is
//! set for each branch at depth `d` on the key's path; `siblings` hold the edge
//! hashes of the untaken children, root first. The verifier rebuilds the root
//! starting from the deepest branch.

use super::label::{bit_at, edge_hash, set_bit, Label, KEY_BITS};
use crate::codec::{hex_serde, keccak256, keccak256_concat, Hash, EMPTY_ROOT};
use crate::error::{MinerError, Result};
use serde::{Deserialize, Serialize};

/// Depths encoded in a branch mask, shallowest first
pub fn branch_depths(mask: &Hash) -> Vec<u16> {
    (0..KEY_BITS).filter(|d| bit_at(mask, *d) == 1).collect()
}

/// Build a branch mask from depths
pub fn mask_from_depths(depths: &[u16]) -> Hash {
    let mut mask = [0u8; 32];
    for depth in depths {
        set_bit(&mut mask, *depth);
    }
    mask
}

/// Root implied by a leaf at `key_hash` holding `value_hash`.
pub fn implied_root(
    key_hash: &Hash,
    value_hash: &Hash,
    branch_mask: &Hash,
    siblings: &[Hash],
) -> Result<Hash> {
    let depths = branch_depths(branch_mask);
    if depths.len() != siblings.len() {
        return Err(MinerError::InvalidProof(format!(
            "branch mask has {} branches but {} siblings were supplied",
            depths.len(),
            siblings.len()
        )));
    }

    let mut remaining = Label::full(*key_hash);
    let mut node = *value_hash;
    for (i, depth) in depths.iter().rev().enumerate() {
        let (prefix, suffix) = remaining.split_at(*depth);
        remaining = prefix;
        let (bit, label) = suffix.chop_first_bit();
        let own = edge_hash(&node, &label);
        let sibling = &siblings[siblings.len() - 1 - i];
        node = if bit == 0 {
            keccak256_concat(&[&own, sibling])
        } else {
            keccak256_concat(&[sibling, &own])
        };
    }
    Ok(edge_hash(&node, &remaining))
}

/// Proof that `key` maps to `value` under some root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    #[serde(with = "hex_serde::bytes")]
    pub key: Vec<u8>,
    #[serde(with = "hex_serde::bytes")]
    pub value: Vec<u8>,
    #[serde(with = "hex_serde")]
    pub branch_mask: Hash,
    #[serde(with = "hex_serde::hashes")]
    pub siblings: Vec<Hash>,
}

impl InclusionProof {
    pub fn key_hash(&self) -> Hash {
        keccak256(&self.key)
    }

    pub fn implied_root(&self) -> Result<Hash> {
        implied_root(
            &self.key_hash(),
            &keccak256(&self.value),
            &self.branch_mask,
            &self.siblings,
        )
    }

    /// Root after replacing this leaf's value in place
    pub fn implied_root_with_value(&self, value: &[u8]) -> Result<Hash> {
        implied_root(
            &self.key_hash(),
            &keccak256(value),
            &self.branch_mask,
            &self.siblings,
        )
    }

    pub fn verify(&self, root: &Hash) -> bool {
        matches!(self.implied_root(), Ok(implied) if &implied == root)
    }
}

/// Proof that `key` is absent, anchored at the adjacent leaf reached by
/// following the key's path. `adjacent` is `None` only for the empty trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenceProof {
    #[serde(with = "hex_serde::bytes")]
    pub key: Vec<u8>,
    pub adjacent: Option<InclusionProof>,
}

impl AbsenceProof {
    /// Depth at which the absent key leaves the adjacent leaf's path
    fn divergence_depth(&self, adjacent: &InclusionProof) -> Result<u16> {
        let key_label = Label::full(keccak256(&self.key));
        let adjacent_label = Label::full(adjacent.key_hash());
        let depth = key_label.common_prefix_len(&adjacent_label);
        if depth == KEY_BITS {
            return Err(MinerError::InvalidProof(
                "absent key collides with adjacent key".to_string(),
            ));
        }
        if bit_at(&adjacent.branch_mask, depth) == 1 {
            return Err(MinerError::InvalidProof(format!(
                "adjacent path branches at divergence depth {}",
                depth
            )));
        }
        Ok(depth)
    }

    pub fn verify(&self, root: &Hash) -> bool {
        match &self.adjacent {
            None => root == &EMPTY_ROOT,
            Some(adjacent) => adjacent.verify(root) && self.divergence_depth(adjacent).is_ok(),
        }
    }

    /// Root after inserting `key -> value` into the proven trie
    pub fn implied_root_after_insert(&self, value: &[u8]) -> Result<Hash> {
        let key_hash = keccak256(&self.key);
        let value_hash = keccak256(value);
        let Some(adjacent) = &self.adjacent else {
            return Ok(edge_hash(&value_hash, &Label::full(key_hash)));
        };

        let depth = self.divergence_depth(adjacent)?;
        let (_, below) = Label::full(key_hash).split_at(depth);
        let (_, new_leaf_label) = below.chop_first_bit();
        let new_sibling = edge_hash(&value_hash, &new_leaf_label);

        let mut depths = branch_depths(&adjacent.branch_mask);
        let position = depths.iter().take_while(|d| **d < depth).count();
        depths.insert(position, depth);
        let mut siblings = adjacent.siblings.clone();
        if position > siblings.len() {
            return Err(MinerError::InvalidProof(
                "adjacent proof is shorter than its branch mask".to_string(),
            ));
        }
        siblings.insert(position, new_sibling);

        implied_root(
            &adjacent.key_hash(),
            &keccak256(&adjacent.value),
            &mask_from_depths(&depths),
            &siblings,
        )
    }
}

/// Outcome of a lookup: a membership or non-membership proof
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrieProof {
    Present(InclusionProof),
    Absent(AbsenceProof),
}

impl TrieProof {
    pub fn verify(&self, root: &Hash) -> bool {
        match self {
            TrieProof::Present(p) => p.verify(root),
            TrieProof::Absent(p) => p.verify(root),
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            TrieProof::Present(p) => &p.key,
            TrieProof::Absent(p) => &p.key,
        }
    }

    /// Root after writing `value` under the proven key
    pub fn implied_root_after_write(&self, value: &[u8]) -> Result<Hash> {
        match self {
            TrieProof::Present(p) => p.implied_root_with_value(value),
            TrieProof::Absent(p) => p.implied_root_after_insert(value),
        }
    }
}
