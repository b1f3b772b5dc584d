//! Merkle-Patricia trie matching the ledger's proof scheme.
//!
//! Paths are `keccak256(key)`; every key occupies the full 256-bit path, so
//! leaves only ever sit at the end of a full-length path and every branch has
//! exactly two children. Branch hashes are cached and recomputed along the
//! insertion path only.
//!
//! ```text
//! leaf node hash   = keccak256(value)
//! edge hash        = keccak256(node | uint256(label.length) | label.data)
//! branch node hash = keccak256(edge_hash(child0) | edge_hash(child1))
//! root hash        = edge_hash(root edge)            (zero for empty trie)
//! ```

pub mod label;
pub mod proof;

pub use label::{edge_hash, Label};
pub use proof::{implied_root, AbsenceProof, InclusionProof, TrieProof};

use crate::codec::{keccak256, keccak256_concat, Hash, EMPTY_ROOT};
use label::set_bit;

#[derive(Clone, Debug)]
enum Node {
    Leaf {
        key: Vec<u8>,
        value: Vec<u8>,
        value_hash: Hash,
    },
    Branch {
        children: Box<[Edge; 2]>,
        hash: Hash,
    },
}

impl Node {
    fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        let value_hash = keccak256(&value);
        Node::Leaf {
            key,
            value,
            value_hash,
        }
    }

    fn branch(left: Edge, right: Edge) -> Self {
        let hash = keccak256_concat(&[&left.hash(), &right.hash()]);
        Node::Branch {
            children: Box::new([left, right]),
            hash,
        }
    }

    fn hash(&self) -> Hash {
        match self {
            Node::Leaf { value_hash, .. } => *value_hash,
            Node::Branch { hash, .. } => *hash,
        }
    }
}

#[derive(Clone, Debug)]
struct Edge {
    label: Label,
    node: Node,
}

impl Edge {
    fn hash(&self) -> Hash {
        edge_hash(&self.node.hash(), &self.label)
    }
}

/// Sparse Merkle-Patricia trie over arbitrary byte keys
#[derive(Clone, Debug, Default)]
pub struct PatriciaTrie {
    root: Option<Edge>,
    len: usize,
}

impl PatriciaTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root_hash(&self) -> Hash {
        self.root.as_ref().map(Edge::hash).unwrap_or(EMPTY_ROOT)
    }

    /// Insert or update `key -> value`. Returns true if the key was new.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let path = Label::full(keccak256(key));
        let leaf = Node::leaf(key.to_vec(), value.to_vec());
        let (root, inserted) = match self.root.take() {
            None => (
                Edge {
                    label: path,
                    node: leaf,
                },
                true,
            ),
            Some(edge) => insert_at_edge(edge, path, leaf),
        };
        self.root = Some(root);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// Stored value for `key`
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.walk(key)? {
            Walk::Found { value, .. } => Some(value),
            Walk::Diverged { .. } => None,
        }
    }

    /// Membership proof for a present key, non-membership proof otherwise.
    ///
    /// For an absent key the proof anchors at the adjacent leaf reached by
    /// continuing along the key's own bits below the point of divergence.
    pub fn prove(&self, key: &[u8]) -> TrieProof {
        let Some(walk) = self.walk(key) else {
            return TrieProof::Absent(AbsenceProof {
                key: key.to_vec(),
                adjacent: None,
            });
        };
        match walk {
            Walk::Found {
                value,
                branch_mask,
                siblings,
            } => TrieProof::Present(InclusionProof {
                key: key.to_vec(),
                value: value.to_vec(),
                branch_mask,
                siblings,
            }),
            Walk::Diverged {
                edge,
                remaining,
                depth,
                mut branch_mask,
                mut siblings,
            } => {
                let (adjacent_key, adjacent_value) =
                    descend_to_leaf(edge, remaining, depth, &mut branch_mask, &mut siblings);
                TrieProof::Absent(AbsenceProof {
                    key: key.to_vec(),
                    adjacent: Some(InclusionProof {
                        key: adjacent_key.to_vec(),
                        value: adjacent_value.to_vec(),
                        branch_mask,
                        siblings,
                    }),
                })
            }
        }
    }

    /// Inclusion proof, `None` if the key is absent
    pub fn get_proof(&self, key: &[u8]) -> Option<InclusionProof> {
        match self.prove(key) {
            TrieProof::Present(proof) => Some(proof),
            TrieProof::Absent(_) => None,
        }
    }

    /// All leaves as `(key, value)` pairs, in path order
    pub fn leaves(&self) -> Vec<(&[u8], &[u8])> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = &self.root {
            collect_leaves(&root.node, &mut out);
        }
        out
    }

    fn walk(&self, key: &[u8]) -> Option<Walk<'_>> {
        let mut edge = self.root.as_ref()?;
        let mut remaining = Label::full(keccak256(key));
        let mut depth = 0u16;
        let mut branch_mask = [0u8; 32];
        let mut siblings = Vec::new();

        loop {
            let (prefix, suffix) = remaining.split_common_prefix(&edge.label);
            if prefix.length < edge.label.length {
                return Some(Walk::Diverged {
                    edge,
                    remaining,
                    depth,
                    branch_mask,
                    siblings,
                });
            }
            match &edge.node {
                Node::Leaf { value, .. } => {
                    return Some(Walk::Found {
                        value,
                        branch_mask,
                        siblings,
                    });
                }
                Node::Branch { children, .. } => {
                    depth += prefix.length;
                    set_bit(&mut branch_mask, depth);
                    depth += 1;
                    let (head, tail) = suffix.chop_first_bit();
                    siblings.push(children[1 - head as usize].hash());
                    edge = &children[head as usize];
                    remaining = tail;
                }
            }
        }
    }
}

enum Walk<'a> {
    Found {
        value: &'a [u8],
        branch_mask: Hash,
        siblings: Vec<Hash>,
    },
    Diverged {
        edge: &'a Edge,
        remaining: Label,
        depth: u16,
        branch_mask: Hash,
        siblings: Vec<Hash>,
    },
}

/// Follow `remaining`'s bits (falling back to child 0 once they are used up)
/// from `edge` down to a leaf, extending the proof path.
fn descend_to_leaf<'a>(
    mut edge: &'a Edge,
    mut remaining: Label,
    mut depth: u16,
    branch_mask: &mut Hash,
    siblings: &mut Vec<Hash>,
) -> (&'a [u8], &'a [u8]) {
    loop {
        match &edge.node {
            Node::Leaf { key, value, .. } => return (key, value),
            Node::Branch { children, .. } => {
                depth += edge.label.length;
                set_bit(branch_mask, depth);
                depth += 1;
                let consumed = edge.label.length.min(remaining.length);
                let (_, rest) = remaining.split_at(consumed);
                let (head, tail) = if rest.is_empty() {
                    (0, rest)
                } else {
                    rest.chop_first_bit()
                };
                siblings.push(children[1 - head as usize].hash());
                edge = &children[head as usize];
                remaining = tail;
            }
        }
    }
}

fn insert_at_edge(edge: Edge, key: Label, leaf: Node) -> (Edge, bool) {
    let (prefix, suffix) = key.split_common_prefix(&edge.label);

    if suffix.is_empty() {
        // Full match, update in place
        return (Edge { label: prefix, node: leaf }, false);
    }

    if prefix.length >= edge.label.length {
        // Label fully matched, continue below
        let Node::Branch { children, .. } = edge.node else {
            unreachable!("leaf edges end at the full key length");
        };
        let [left, right] = *children;
        let (head, tail) = suffix.chop_first_bit();
        let (left, right, inserted) = if head == 0 {
            let (left, inserted) = insert_at_edge(left, tail, leaf);
            (left, right, inserted)
        } else {
            let (right, inserted) = insert_at_edge(right, tail, leaf);
            (left, right, inserted)
        };
        return (
            Edge {
                label: edge.label,
                node: Node::branch(left, right),
            },
            inserted,
        );
    }

    // Mismatch inside the label, split it with a new branch
    let (_, existing_rest) = edge.label.split_at(prefix.length);
    let (existing_head, existing_tail) = existing_rest.chop_first_bit();
    let existing = Edge {
        label: existing_tail,
        node: edge.node,
    };
    let (_, new_tail) = suffix.chop_first_bit();
    let new_leaf = Edge {
        label: new_tail,
        node: leaf,
    };
    let node = if existing_head == 0 {
        Node::branch(existing, new_leaf)
    } else {
        Node::branch(new_leaf, existing)
    };
    (Edge { label: prefix, node }, true)
}

fn collect_leaves<'a>(node: &'a Node, out: &mut Vec<(&'a [u8], &'a [u8])>) {
    match node {
        Node::Leaf { key, value, .. } => out.push((key, value)),
        Node::Branch { children, .. } => {
            collect_leaves(&children[0].node, out);
            collect_leaves(&children[1].node, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key-{}", i).into_bytes()).collect()
    }

    #[test]
    fn test_empty_root_is_zero() {
        let trie = PatriciaTrie::new();
        assert_eq!(trie.root_hash(), EMPTY_ROOT);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_insert_then_prove_every_key() {
        let mut trie = PatriciaTrie::new();
        for (i, key) in keys(64).iter().enumerate() {
            assert!(trie.insert(key, &[i as u8; 8]));
        }
        assert_eq!(trie.len(), 64);

        let root = trie.root_hash();
        for (i, key) in keys(64).iter().enumerate() {
            let proof = trie.get_proof(key).expect("key present");
            assert_eq!(proof.value, vec![i as u8; 8]);
            assert!(proof.verify(&root), "proof for key {} failed", i);
        }
    }

    #[test]
    fn test_update_keeps_len_and_changes_root() {
        let mut trie = PatriciaTrie::new();
        trie.insert(b"a", b"1");
        trie.insert(b"b", b"2");
        let before = trie.root_hash();

        assert!(!trie.insert(b"a", b"3"));
        assert_eq!(trie.len(), 2);
        assert_ne!(trie.root_hash(), before);
        assert_eq!(trie.get(b"a"), Some(&b"3"[..]));
    }

    #[test]
    fn test_update_implied_root_matches_trie() {
        let mut trie = PatriciaTrie::new();
        for key in keys(20) {
            trie.insert(&key, b"old");
        }
        let proof = trie.get_proof(b"key-7").unwrap();
        let predicted = proof.implied_root_with_value(b"new").unwrap();

        trie.insert(b"key-7", b"new");
        assert_eq!(trie.root_hash(), predicted);
    }

    #[test]
    fn test_root_independent_of_insertion_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                let value: [u8; 16] = rng.gen();
                (format!("k{}", i).into_bytes(), value.to_vec())
            })
            .collect();

        let mut first = PatriciaTrie::new();
        for (k, v) in &entries {
            first.insert(k, v);
        }
        entries.shuffle(&mut rng);
        let mut second = PatriciaTrie::new();
        for (k, v) in &entries {
            second.insert(k, v);
        }

        assert_eq!(first.root_hash(), second.root_hash());
        let key = b"k42".to_vec();
        assert_eq!(first.prove(&key), second.prove(&key));
    }

    #[test]
    fn test_absence_proof_verifies_and_predicts_insert() {
        let mut trie = PatriciaTrie::new();
        for key in keys(30) {
            trie.insert(&key, b"v");
        }
        let root = trie.root_hash();

        for i in 100..140 {
            let missing = format!("missing-{}", i).into_bytes();
            let TrieProof::Absent(proof) = trie.prove(&missing) else {
                panic!("key should be absent");
            };
            assert!(proof.verify(&root));

            let predicted = proof.implied_root_after_insert(b"fresh").unwrap();
            let mut copy = trie.clone();
            copy.insert(&missing, b"fresh");
            assert_eq!(copy.root_hash(), predicted);
        }
    }

    #[test]
    fn test_absence_proof_rejected_for_present_key() {
        let mut trie = PatriciaTrie::new();
        for key in keys(10) {
            trie.insert(&key, b"v");
        }
        let root = trie.root_hash();
        let adjacent = trie.get_proof(b"key-1").unwrap();
        let forged = AbsenceProof {
            key: b"key-2".to_vec(),
            adjacent: Some(adjacent),
        };
        // key-2 is present; its path must branch away from key-1's
        assert!(!forged.verify(&root));
    }

    #[test]
    fn test_single_leaf_absence() {
        let mut trie = PatriciaTrie::new();
        trie.insert(b"only", b"v");
        let proof = trie.prove(b"other");
        assert!(matches!(proof, TrieProof::Absent(_)));
        assert!(proof.verify(&trie.root_hash()));
    }

    #[test]
    fn test_tampered_proof_fails() {
        let mut trie = PatriciaTrie::new();
        for key in keys(16) {
            trie.insert(&key, b"v");
        }
        let root = trie.root_hash();
        let mut proof = trie.get_proof(b"key-3").unwrap();
        proof.value = b"w".to_vec();
        assert!(!proof.verify(&root));

        let mut proof = trie.get_proof(b"key-3").unwrap();
        if let Some(first) = proof.siblings.first_mut() {
            first[0] ^= 1;
        }
        assert!(!proof.verify(&root));
    }

    #[test]
    fn test_leaves_enumerates_everything() {
        let mut trie = PatriciaTrie::new();
        for key in keys(12) {
            trie.insert(&key, b"v");
        }
        let leaves = trie.leaves();
        assert_eq!(leaves.len(), 12);
        assert!(leaves.iter().any(|(k, _)| *k == b"key-11"));
    }
}
