//! Challenge bundles
//!
//! Once binary search isolates the first disputed log index `d`, each side
//! proves its transition from the state before `d` to its claimed state after
//! `d`. A bundle carries:
//! - the justification leaf for `d - 1` (absent for `d = 0`, where the prior
//!   state is the state the cycle started from)
//! - the justification leaf for `d`
//! - the log entry itself
//! - one witness per key the entry touches, in update order, each proven
//!   against the root reached after the previous witness was written
//!
//! [`verify_transition`] recomputes every update with the ledger's rules and
//! must land exactly on the claimed leaf `d`. The same function arbitrates on
//! the simulated ledger and lets a client check its own bundle before sending.

use crate::codec::{
    decode_key, decode_value, encode_value, to_hex, Hash, ReputationEntry,
    ReputationKey,
};
use crate::error::{MinerError, Result};
use crate::justification::JustificationProof;
use crate::replay::{
    apply_delta, apply_update, logged_descendants, resolve_updates_with, ReplayEngine,
    UpdateLogEntry,
};
use crate::reputation::ReputationStore;
use crate::skills::SkillTree;
use crate::trie::TrieProof;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// State a cycle starts from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorState {
    #[serde(with = "crate::codec::hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
}

/// Proof of one key's value before it is written
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWitness {
    pub key: ReputationKey,
    pub proof: TrieProof,
}

/// Everything needed to check one disputed transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub log_index: u64,
    pub entry: UpdateLogEntry,
    pub prior: Option<JustificationProof>,
    pub post: JustificationProof,
    pub witnesses: Vec<KeyWitness>,
}

/// Build the bundle for `log_index` by re-applying `entry` on top of
/// `prior_state` with `engine`'s strategy.
pub fn build_bundle(
    prior_state: &ReputationStore,
    engine: &ReplayEngine,
    entry: &UpdateLogEntry,
    prior: Option<JustificationProof>,
    post: JustificationProof,
) -> Result<ProofBundle> {
    let log_index = post.leaf.index;
    let mut working = prior_state.fork();
    let updates = engine.updates(&working, log_index, entry)?;
    let mut witnesses = Vec::with_capacity(updates.len());
    for update in &updates {
        witnesses.push(KeyWitness {
            key: update.key,
            proof: working.prove(&update.key),
        });
        apply_update(&mut working, update)?;
    }
    Ok(ProofBundle {
        log_index,
        entry: *entry,
        prior,
        post,
        witnesses,
    })
}

/// Amount and uid a witness proves, `None` for an absent key
fn witnessed_entry(witness: &KeyWitness) -> Result<Option<ReputationEntry>> {
    match &witness.proof {
        TrieProof::Present(proof) => Ok(Some(decode_value(&proof.value)?)),
        TrieProof::Absent(_) => Ok(None),
    }
}

/// Check that `bundle` proves a valid transition at its disputed index.
///
/// `jrh` is the justification root the bundle's leaves must verify against,
/// `confirmed` the state the cycle started from and `log_entry` the entry the
/// ledger holds at the disputed index.
pub fn verify_transition(
    bundle: &ProofBundle,
    jrh: &Hash,
    confirmed: &PriorState,
    skills: &SkillTree,
    log_entry: &UpdateLogEntry,
) -> Result<()> {
    let d = bundle.log_index;
    if &bundle.entry != log_entry {
        return Err(MinerError::InvalidProof(format!(
            "bundle entry differs from log entry {}",
            d
        )));
    }
    if let Err(e) = logged_descendants(skills, &bundle.entry) {
        return Err(MinerError::InvalidProof(format!(
            "log entry {} has an inconsistent update count: {}",
            d, e
        )));
    }

    if bundle.post.leaf.index != d {
        return Err(MinerError::InvalidProof(format!(
            "post leaf {} is not the disputed index {}",
            bundle.post.leaf.index, d
        )));
    }
    bundle.post.verify(jrh)?;

    let prior = match (&bundle.prior, d) {
        (None, 0) => *confirmed,
        (Some(prior), d) if d > 0 && prior.leaf.index == d - 1 => {
            prior.verify(jrh)?;
            PriorState {
                root_hash: prior.leaf.root_hash,
                n_nodes: prior.leaf.n_nodes,
            }
        }
        _ => {
            return Err(MinerError::InvalidProof(format!(
                "bundle for index {} carries the wrong prior leaf",
                d
            )))
        }
    };

    // Pre-entry amounts as claimed by the witnesses; each claim is checked
    // against the running root below before it is relied on.
    let mut claimed: HashMap<ReputationKey, ReputationEntry> = HashMap::new();
    for witness in &bundle.witnesses {
        if decode_key(witness.proof.key())? != witness.key {
            return Err(MinerError::InvalidProof(format!(
                "witness for {} proves a different key",
                witness.key
            )));
        }
        if let Some(entry) = witnessed_entry(witness)? {
            claimed.insert(witness.key, entry);
        }
    }

    let updates = resolve_updates_with(skills, &bundle.entry, |key| {
        claimed.get(key).map(|e| e.amount).unwrap_or(0)
    })?;
    if updates.len() != bundle.witnesses.len() {
        return Err(MinerError::InvalidProof(format!(
            "entry touches {} keys but {} witnesses were supplied",
            updates.len(),
            bundle.witnesses.len()
        )));
    }

    let mut root = prior.root_hash;
    let mut n_nodes = prior.n_nodes;
    for (update, witness) in updates.iter().zip(&bundle.witnesses) {
        if update.key != witness.key {
            return Err(MinerError::InvalidProof(format!(
                "expected witness for {}, found {}",
                update.key, witness.key
            )));
        }
        if !witness.proof.verify(&root) {
            return Err(MinerError::InvalidProof(format!(
                "witness for {} does not verify against {}",
                witness.key,
                to_hex(&root)
            )));
        }
        let next = match witnessed_entry(witness)? {
            Some(existing) => {
                if existing.uid == 0 || existing.uid > n_nodes {
                    return Err(MinerError::InvalidProof(format!(
                        "witness for {} claims uid {} beyond {} nodes",
                        witness.key, existing.uid, n_nodes
                    )));
                }
                ReputationEntry::new(apply_delta(existing.amount, update.delta), existing.uid)
            }
            None => {
                n_nodes += 1;
                ReputationEntry::new(apply_delta(0, update.delta), n_nodes)
            }
        };
        root = witness.proof.implied_root_after_write(&encode_value(&next))?;
    }

    if root != bundle.post.leaf.root_hash || n_nodes != bundle.post.leaf.n_nodes {
        return Err(MinerError::InvalidProof(format!(
            "transition at {} reaches {} with {} nodes, leaf claims {} with {}",
            d,
            to_hex(&root),
            n_nodes,
            to_hex(&bundle.post.leaf.root_hash),
            bundle.post.leaf.n_nodes
        )));
    }

    debug!(log_index = d, witnesses = bundle.witnesses.len(), "Transition verified");
    Ok(())
}
