//! Reputation store
//!
//! Owns the reputation trie together with the decoded entries and enforces
//! the store invariants in one place:
//! - a key's uid is assigned once, as `n_nodes + 1`, and never changes
//! - amounts are never negative and never exceed the ledger maximum
//!
//! Checkpoints are whole-state snapshots addressed by root hash, kept in a
//! bounded FIFO so a client can resume from the last confirmed state.

use crate::codec::{
    encode_key, to_hex, Hash, LedgerEncoding, ReputationEntry, ReputationKey, ValueEncoder,
    MAX_REPUTATION,
};
use crate::error::{MinerError, Result};
use crate::storage::{self, StoreSnapshot};
use crate::trie::{PatriciaTrie, TrieProof};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of retained checkpoints
pub const DEFAULT_MAX_CHECKPOINTS: usize = 8;

#[derive(Clone, Debug)]
struct Checkpoint {
    root_hash: Hash,
    trie: PatriciaTrie,
    entries: BTreeMap<ReputationKey, ReputationEntry>,
    n_nodes: u64,
}

#[derive(Clone)]
pub struct ReputationStore {
    trie: PatriciaTrie,
    entries: BTreeMap<ReputationKey, ReputationEntry>,
    n_nodes: u64,
    encoder: Arc<dyn ValueEncoder>,
    checkpoints: VecDeque<Checkpoint>,
    max_checkpoints: usize,
}

impl std::fmt::Debug for ReputationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationStore")
            .field("root_hash", &to_hex(&self.root_hash()))
            .field("n_nodes", &self.n_nodes)
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}

impl Default for ReputationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationStore {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(LedgerEncoding))
    }

    pub fn with_encoder(encoder: Arc<dyn ValueEncoder>) -> Self {
        Self {
            trie: PatriciaTrie::new(),
            entries: BTreeMap::new(),
            n_nodes: 0,
            encoder,
            checkpoints: VecDeque::new(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }

    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints.max(1);
        self
    }

    /// Copy of the current state without checkpoints, for speculative replay
    pub fn fork(&self) -> Self {
        Self {
            trie: self.trie.clone(),
            entries: self.entries.clone(),
            n_nodes: self.n_nodes,
            encoder: Arc::clone(&self.encoder),
            checkpoints: VecDeque::new(),
            max_checkpoints: self.max_checkpoints,
        }
    }

    /// Adopt the live state of `other`, keeping this store's checkpoints
    pub fn commit(&mut self, other: &ReputationStore) {
        self.trie = other.trie.clone();
        self.entries = other.entries.clone();
        self.n_nodes = other.n_nodes;
    }

    /// Drop all entries (genesis), keeping checkpoints
    pub fn reset(&mut self) {
        self.trie = PatriciaTrie::new();
        self.entries.clear();
        self.n_nodes = 0;
    }

    /// Set the amount stored under `key`.
    ///
    /// The existing uid is kept; a new key gets `n_nodes + 1`.
    pub fn insert(&mut self, key: ReputationKey, amount: i128) -> Result<ReputationEntry> {
        if amount < 0 {
            return Err(MinerError::NegativeReputation {
                key: key.to_string(),
                amount,
            });
        }
        let amount = amount as u128;
        if amount > MAX_REPUTATION {
            return Err(MinerError::InvalidValue(format!(
                "amount {} exceeds maximum reputation",
                amount
            )));
        }

        let uid = match self.entries.get(&key) {
            Some(existing) => existing.uid,
            None => self.n_nodes + 1,
        };
        let entry = ReputationEntry::new(amount, uid);
        let value = self.encoder.encode(&entry);
        self.trie.insert(&encode_key(&key), &value);
        if self.entries.insert(key, entry).is_none() {
            self.n_nodes = uid;
        }
        Ok(entry)
    }

    pub fn get(&self, key: &ReputationKey) -> Option<ReputationEntry> {
        self.entries.get(key).copied()
    }

    /// Amount under `key`, zero if absent
    pub fn amount(&self, key: &ReputationKey) -> u128 {
        self.entries.get(key).map(|e| e.amount).unwrap_or(0)
    }

    /// Inclusion proof for a present key, non-inclusion proof otherwise
    pub fn prove(&self, key: &ReputationKey) -> TrieProof {
        self.trie.prove(&encode_key(key))
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.root_hash()
    }

    pub fn n_nodes(&self) -> u64 {
        self.n_nodes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ReputationKey, &ReputationEntry)> {
        self.entries.iter()
    }

    /// Value bytes the store writes for `entry`
    pub fn encode_value(&self, entry: &ReputationEntry) -> Vec<u8> {
        self.encoder.encode(entry)
    }

    /// Snapshot the current state; returns its root hash
    pub fn checkpoint(&mut self) -> Hash {
        let root_hash = self.root_hash();
        self.checkpoints.retain(|c| c.root_hash != root_hash);
        self.checkpoints.push_back(Checkpoint {
            root_hash,
            trie: self.trie.clone(),
            entries: self.entries.clone(),
            n_nodes: self.n_nodes,
        });
        while self.checkpoints.len() > self.max_checkpoints {
            if let Some(evicted) = self.checkpoints.pop_front() {
                debug!(root = %to_hex(&evicted.root_hash), "Evicted oldest checkpoint");
            }
        }
        debug!(root = %to_hex(&root_hash), n_nodes = self.n_nodes, "Checkpoint taken");
        root_hash
    }

    /// Restore the checkpoint with the given root hash
    pub fn restore(&mut self, root_hash: &Hash) -> Result<()> {
        let checkpoint = self
            .checkpoints
            .iter()
            .find(|c| &c.root_hash == root_hash)
            .ok_or_else(|| MinerError::NotFound(format!("checkpoint {}", to_hex(root_hash))))?;
        self.trie = checkpoint.trie.clone();
        self.entries = checkpoint.entries.clone();
        self.n_nodes = checkpoint.n_nodes;
        info!(root = %to_hex(root_hash), n_nodes = self.n_nodes, "Restored checkpoint");
        Ok(())
    }

    pub fn has_checkpoint(&self, root_hash: &Hash) -> bool {
        self.checkpoints.iter().any(|c| &c.root_hash == root_hash)
    }

    /// Root hashes of retained checkpoints, oldest first
    pub fn checkpoint_roots(&self) -> Vec<Hash> {
        self.checkpoints.iter().map(|c| c.root_hash).collect()
    }

    /// Write the current state to `path`, tagged with `cycle`
    pub fn flush(&self, path: &Path, cycle: u64) -> Result<()> {
        storage::write_store(
            path,
            &StoreSnapshot {
                cycle,
                root_hash: self.root_hash(),
                n_nodes: self.n_nodes,
                entries: self.entries.clone(),
            },
        )
    }

    /// Load a store from `path`, rebuilding the trie with `encoder`.
    ///
    /// Returns the store (checkpointed at its loaded root) and the stored
    /// cycle, or `None` if there is no file.
    pub fn load(
        path: &Path,
        encoder: Arc<dyn ValueEncoder>,
        max_checkpoints: usize,
    ) -> Result<Option<(Self, u64)>> {
        let Some(snapshot) = storage::read_store(path)? else {
            return Ok(None);
        };

        let mut store = Self::with_encoder(encoder).with_max_checkpoints(max_checkpoints);
        // Insert in uid order so that uids are reassigned exactly as stored.
        let mut by_uid: Vec<_> = snapshot.entries.iter().collect();
        by_uid.sort_by_key(|(_, entry)| entry.uid);
        for (expected_uid, (key, entry)) in (1u64..).zip(by_uid) {
            if entry.uid != expected_uid {
                return Err(MinerError::Storage(format!(
                    "uid {} of {} breaks the uid sequence",
                    entry.uid, key
                )));
            }
            store.insert(*key, entry.amount as i128)?;
        }

        if store.n_nodes != snapshot.n_nodes {
            return Err(MinerError::Storage(format!(
                "store header claims {} nodes but file holds {}",
                snapshot.n_nodes, store.n_nodes
            )));
        }
        if store.root_hash() != snapshot.root_hash {
            warn!(
                expected = %to_hex(&snapshot.root_hash),
                actual = %to_hex(&store.root_hash()),
                "Store file root mismatch"
            );
            return Err(MinerError::Storage("Store file root hash mismatch".into()));
        }

        store.checkpoint();
        info!(
            path = %path.display(),
            cycle = snapshot.cycle,
            n_nodes = store.n_nodes,
            "Reputation store loaded"
        );
        Ok(Some((store, snapshot.cycle)))
    }
}
