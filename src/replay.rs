//! Log replay
//!
//! Applies an ordered reputation update log to a [`ReputationStore`]. Each
//! log entry expands into a fixed list of key updates:
//!
//! ```text
//! user half:       [descendants..] own skill, ancestors (nearest first)
//! colony-wide half: same skills, aggregate keys (user = 0x0)
//! ```
//!
//! Descendants are only touched by negative entries, and only those that
//! existed when the entry was logged. Every update is computed
//! from the state before the entry, so applying them in order is equivalent
//! to applying them at once.

use crate::codec::{hex_serde, to_hex, Address, Hash, ReputationKey, MAX_REPUTATION, ZERO_ADDRESS};
use crate::error::{MinerError, Result};
use crate::reputation::ReputationStore;
use crate::skills::SkillTree;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// One entry of the append-only reputation update log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    #[serde(with = "hex_serde")]
    pub user: Address,
    /// Signed reputation delta
    #[serde(with = "crate::codec::decimal")]
    pub amount: i128,
    pub skill_id: u64,
    #[serde(with = "hex_serde")]
    pub domain: Address,
    /// Number of key updates this entry expands to
    pub n_updates: u64,
    /// Sum of `n_updates` over all earlier entries of the same log
    pub n_previous_updates: u64,
}

impl UpdateLogEntry {
    /// Entry with zeroed update counters
    pub fn new(user: Address, amount: i128, skill_id: u64, domain: Address) -> Self {
        Self {
            user,
            amount,
            skill_id,
            domain,
            n_updates: 0,
            n_previous_updates: 0,
        }
    }

    pub fn user_key(&self) -> ReputationKey {
        ReputationKey::new(self.domain, self.skill_id, self.user)
    }
}

/// A signed change to the amount under one key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdate {
    pub key: ReputationKey,
    pub delta: i128,
}

/// Trie state right after a log entry was applied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateRoot {
    pub log_index: u64,
    #[serde(with = "hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
}

/// Number of key updates `entry` expands to under `skills`, as recorded
/// when the entry is logged
pub fn expected_update_count(skills: &SkillTree, entry: &UpdateLogEntry) -> u64 {
    let mut per_half = 1 + skills.ancestors(entry.skill_id).len() as u64;
    if entry.amount < 0 {
        per_half += skills.descendants(entry.skill_id).len() as u64;
    }
    2 * per_half
}

/// Descendants a loss touches: the ones that existed when the entry was
/// logged.
///
/// Skills are only ever appended and a skill's parent never changes, so its
/// ancestors are fixed and any descendant added later has a larger id than
/// every earlier one. The logged `n_updates` therefore pins the touched
/// descendants to the first `n_updates / 2 - 1 - ancestors` in id order.
pub fn logged_descendants(skills: &SkillTree, entry: &UpdateLogEntry) -> Result<Vec<u64>> {
    let fixed = 1 + skills.ancestors(entry.skill_id).len() as u64;
    let per_half = entry.n_updates / 2;
    if entry.n_updates % 2 != 0 || per_half < fixed {
        return Err(MinerError::Consistency(format!(
            "log entry on skill {} records {} updates, at least {} expected",
            entry.skill_id,
            entry.n_updates,
            2 * fixed
        )));
    }
    let count = (per_half - fixed) as usize;
    if entry.amount >= 0 {
        if count != 0 {
            return Err(MinerError::Consistency(format!(
                "grant on skill {} records {} updates, expected {}",
                entry.skill_id,
                entry.n_updates,
                2 * fixed
            )));
        }
        return Ok(Vec::new());
    }

    let mut descendants = skills.descendants(entry.skill_id);
    if count > descendants.len() {
        return Err(MinerError::Consistency(format!(
            "loss on skill {} records {} descendants but the skill has {}",
            entry.skill_id,
            count,
            descendants.len()
        )));
    }
    descendants.truncate(count);
    Ok(descendants)
}

/// `old + delta`, floored at zero and capped at the maximum reputation
pub fn apply_delta(old: u128, delta: i128) -> u128 {
    if delta >= 0 {
        old.saturating_add(delta as u128).min(MAX_REPUTATION)
    } else {
        old.saturating_sub(delta.unsigned_abs())
    }
}

/// `floor(a * b / c)` without overflow, saturating at the maximum reputation
fn mul_div(a: u128, b: u128, c: u128) -> u128 {
    if c == 0 {
        return 0;
    }
    let product = U256::from(a) * U256::from(b);
    let quotient = product / U256::from(c);
    if quotient > U256::from(MAX_REPUTATION) {
        MAX_REPUTATION
    } else {
        quotient.low_u128()
    }
}

/// The ledger's update rules for one entry, computed against `store` as it
/// stands before the entry.
pub fn resolve_updates(
    store: &ReputationStore,
    skills: &SkillTree,
    entry: &UpdateLogEntry,
) -> Result<Vec<KeyUpdate>> {
    resolve_updates_with(skills, entry, |key| store.amount(key))
}

/// [`resolve_updates`] over any source of pre-entry amounts
pub fn resolve_updates_with<F>(
    skills: &SkillTree,
    entry: &UpdateLogEntry,
    amount_of: F,
) -> Result<Vec<KeyUpdate>>
where
    F: Fn(&ReputationKey) -> u128,
{
    if entry.user == ZERO_ADDRESS {
        return Err(MinerError::InvalidKey(
            "log entry has the aggregate sentinel as its user".to_string(),
        ));
    }
    if !skills.contains(entry.skill_id) {
        return Err(MinerError::Validation(format!(
            "log entry references unknown skill {}",
            entry.skill_id
        )));
    }

    let ancestors = skills.ancestors(entry.skill_id);
    let user_key = entry.user_key();

    // (skill, delta) pairs for the user half
    let mut half: Vec<(u64, i128)> = Vec::new();
    if entry.amount >= 0 {
        half.push((entry.skill_id, entry.amount));
        half.extend(ancestors.iter().map(|s| (*s, entry.amount)));
    } else {
        let origin = amount_of(&user_key);
        let loss = entry.amount.unsigned_abs().min(origin);
        for child in logged_descendants(skills, entry)? {
            let held = amount_of(&user_key.with_skill(child));
            let child_loss = mul_div(loss, held, origin);
            half.push((child, -(child_loss as i128)));
        }
        half.push((entry.skill_id, -(loss as i128)));
        half.extend(ancestors.iter().map(|s| (*s, -(loss as i128))));
    }

    let mut updates = Vec::with_capacity(half.len() * 2);
    updates.extend(half.iter().map(|(skill, delta)| KeyUpdate {
        key: user_key.with_skill(*skill),
        delta: *delta,
    }));
    updates.extend(half.iter().map(|(skill, delta)| KeyUpdate {
        key: ReputationKey::aggregate(entry.domain, *skill),
        delta: *delta,
    }));
    Ok(updates)
}

/// Apply one key update to `store`
pub fn apply_update(store: &mut ReputationStore, update: &KeyUpdate) -> Result<()> {
    let amount = apply_delta(store.amount(&update.key), update.delta);
    store.insert(update.key, amount as i128)?;
    trace!(key = %update.key, delta = update.delta, amount, "Applied update");
    Ok(())
}

/// Computes the key updates for a log entry.
///
/// The ledger only accepts [`CorrectReplay`]; other strategies model
/// participants that replay incorrectly.
pub trait ReplayStrategy: Send + Sync {
    fn updates(
        &self,
        log_index: u64,
        store: &ReputationStore,
        skills: &SkillTree,
        entry: &UpdateLogEntry,
    ) -> Result<Vec<KeyUpdate>>;
}

/// The ledger's update rules
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrectReplay;

impl ReplayStrategy for CorrectReplay {
    fn updates(
        &self,
        _log_index: u64,
        store: &ReputationStore,
        skills: &SkillTree,
        entry: &UpdateLogEntry,
    ) -> Result<Vec<KeyUpdate>> {
        resolve_updates(store, skills, entry)
    }
}

/// Check an entry's update counters against the skill tree and the entry
/// before it. The tree may have grown since the entry was logged.
pub fn validate_counters(
    skills: &SkillTree,
    entry: &UpdateLogEntry,
    previous: Option<&UpdateLogEntry>,
) -> Result<()> {
    logged_descendants(skills, entry)?;
    let expected_previous = previous
        .map(|p| p.n_previous_updates + p.n_updates)
        .unwrap_or(0);
    if entry.n_previous_updates != expected_previous {
        return Err(MinerError::Consistency(format!(
            "log entry records {} previous updates, expected {}",
            entry.n_previous_updates, expected_previous
        )));
    }
    Ok(())
}

/// Sequential log replayer
#[derive(Clone)]
pub struct ReplayEngine {
    skills: SkillTree,
    strategy: Arc<dyn ReplayStrategy>,
}

impl ReplayEngine {
    pub fn new(skills: SkillTree) -> Self {
        Self::with_strategy(skills, Arc::new(CorrectReplay))
    }

    pub fn with_strategy(skills: SkillTree, strategy: Arc<dyn ReplayStrategy>) -> Self {
        Self { skills, strategy }
    }

    pub fn skills(&self) -> &SkillTree {
        &self.skills
    }

    pub fn set_skills(&mut self, skills: SkillTree) {
        self.skills = skills;
    }

    /// Key updates for the entry at `log_index` under this engine's strategy
    pub fn updates(
        &self,
        store: &ReputationStore,
        log_index: u64,
        entry: &UpdateLogEntry,
    ) -> Result<Vec<KeyUpdate>> {
        self.strategy.updates(log_index, store, &self.skills, entry)
    }

    /// Apply the entry at `log_index` to `store`
    pub fn apply_entry(
        &self,
        store: &mut ReputationStore,
        log_index: u64,
        entry: &UpdateLogEntry,
    ) -> Result<IntermediateRoot> {
        for update in self.updates(store, log_index, entry)? {
            apply_update(store, &update)?;
        }
        Ok(IntermediateRoot {
            log_index,
            root_hash: store.root_hash(),
            n_nodes: store.n_nodes(),
        })
    }

    /// Apply `log[from..to]` in order, returning the state after each entry
    pub fn replay(
        &self,
        store: &mut ReputationStore,
        log: &[UpdateLogEntry],
        from: u64,
        to: u64,
    ) -> Result<Vec<IntermediateRoot>> {
        let to = to.min(log.len() as u64);
        if from > to {
            return Err(MinerError::Validation(format!(
                "replay range {}..{} is inverted",
                from, to
            )));
        }

        let mut roots = Vec::with_capacity((to - from) as usize);
        for index in from..to {
            let i = index as usize;
            let previous = i.checked_sub(1).map(|p| &log[p]);
            validate_counters(&self.skills, &log[i], previous)?;
            roots.push(self.apply_entry(store, index, &log[i])?);
        }

        if let Some(last) = roots.last() {
            debug!(
                from,
                to,
                root = %to_hex(&last.root_hash),
                n_nodes = last.n_nodes,
                "Replayed log"
            );
        }
        Ok(roots)
    }
}

/// Fill in `n_updates` / `n_previous_updates` for a freshly built log
pub fn assign_counters(skills: &SkillTree, log: &mut [UpdateLogEntry]) {
    let mut previous = 0;
    for entry in log.iter_mut() {
        entry.n_updates = expected_update_count(skills, entry);
        entry.n_previous_updates = previous;
        previous += entry.n_updates;
    }
}
