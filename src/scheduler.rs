//! Submission scheduling
//!
//! A staker may submit a root hash with any of its usable entries. Entry `i`
//! becomes eligible once the window's acceptance threshold exceeds its score:
//!
//! ```text
//! score(i)     = keccak256(staker | uint256(i) | root_hash)      as uint256
//! threshold(t) = floor((2^256 - 1) * elapsed(t) / window_length)
//! usable       = min(MAX_ENTRIES, stake / min_stake)
//! ```
//!
//! The threshold starts at zero when the window opens, so nothing is eligible
//! then, and reaches the maximum when it closes.

use crate::codec::{keccak256_concat, to_hex, u256_word, Address, Hash};
use crate::error::{MinerError, Result};
use primitive_types::{U256, U512};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Maximum number of entries per staker and cycle
pub const MAX_ENTRIES: u64 = 12;

/// The period in which submissions for a cycle are accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningWindow {
    /// Chain time the window opened
    pub opened_at: u64,
    /// Window length in seconds
    pub length: u64,
}

impl MiningWindow {
    pub fn new(opened_at: u64, length: u64) -> Self {
        Self { opened_at, length }
    }

    pub fn closes_at(&self) -> u64 {
        self.opened_at.saturating_add(self.length)
    }

    pub fn is_open(&self, now: u64) -> bool {
        now >= self.opened_at && now < self.closes_at()
    }

    /// Seconds since opening, clamped to the window
    pub fn elapsed(&self, now: u64) -> u64 {
        now.saturating_sub(self.opened_at).min(self.length)
    }

    /// Acceptance threshold at chain time `now`
    pub fn threshold(&self, now: u64) -> U256 {
        threshold_at(self.elapsed(now), self.length)
    }
}

fn threshold_at(elapsed: u64, length: u64) -> U256 {
    if length == 0 || elapsed >= length {
        return U256::MAX;
    }
    let scaled = U256::MAX.full_mul(U256::from(elapsed)) / U512::from(length);
    U256::try_from(scaled).unwrap_or(U256::MAX)
}

/// Score of `entry_index` for `staker` submitting `root_hash`
pub fn entry_score(staker: &Address, entry_index: u64, root_hash: &Hash) -> U256 {
    let digest = keccak256_concat(&[staker, &u256_word(entry_index as u128), root_hash]);
    U256::from_big_endian(&digest)
}

/// Number of entries a stake entitles its holder to
pub fn allowed_entries(stake: u128, min_stake: u128) -> u64 {
    if min_stake == 0 {
        return MAX_ENTRIES;
    }
    let entries = stake / min_stake;
    entries.min(MAX_ENTRIES as u128) as u64
}

/// Whether `entry_index` may submit at `now`
pub fn is_eligible(
    window: &MiningWindow,
    now: u64,
    staker: &Address,
    entry_index: u64,
    root_hash: &Hash,
) -> bool {
    entry_score(staker, entry_index, root_hash) < window.threshold(now)
}

/// Earliest chain time at which `entry_index` becomes eligible
pub fn entry_eligible_at(
    window: &MiningWindow,
    staker: &Address,
    entry_index: u64,
    root_hash: &Hash,
) -> Option<u64> {
    let score = entry_score(staker, entry_index, root_hash);
    if score >= U256::MAX {
        return None;
    }
    // Smallest elapsed with score < threshold; the threshold is monotonic.
    let (mut lo, mut hi) = (0u64, window.length);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if score < threshold_at(mid, window.length) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Some(window.opened_at + lo)
}

/// One usable entry as seen at a given time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCandidate {
    pub index: u64,
    pub eligible: bool,
}

/// Picks which entry to submit with
pub trait EntrySelection: Send + Sync {
    fn select(&self, candidates: &[EntryCandidate]) -> Option<u64>;
}

/// Scan entries in order and take the first eligible one
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstEligible;

impl EntrySelection for FirstEligible {
    fn select(&self, candidates: &[EntryCandidate]) -> Option<u64> {
        candidates.iter().find(|c| c.eligible).map(|c| c.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Submitted {
    root_hash: Hash,
    n_nodes: u64,
}

/// Per-cycle submission bookkeeping for one staker
pub struct SubmissionScheduler {
    staker: Address,
    selection: Arc<dyn EntrySelection>,
    cycle: u64,
    submitted: Option<Submitted>,
    used_entries: BTreeSet<u64>,
}

impl SubmissionScheduler {
    pub fn new(staker: Address) -> Self {
        Self::with_selection(staker, Arc::new(FirstEligible))
    }

    pub fn with_selection(staker: Address, selection: Arc<dyn EntrySelection>) -> Self {
        Self {
            staker,
            selection,
            cycle: 0,
            submitted: None,
            used_entries: BTreeSet::new(),
        }
    }

    pub fn staker(&self) -> &Address {
        &self.staker
    }

    /// Forget everything recorded for the previous cycle
    pub fn begin_cycle(&mut self, cycle: u64) {
        if cycle != self.cycle {
            debug!(cycle, "Scheduler reset for new cycle");
        }
        self.cycle = cycle;
        self.submitted = None;
        self.used_entries.clear();
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn has_submitted(&self) -> bool {
        self.submitted.is_some()
    }

    /// Entries already spent this cycle
    pub fn used_entries(&self) -> impl Iterator<Item = &u64> {
        self.used_entries.iter()
    }

    /// Local checks run before any submission transaction
    pub fn check(&self, root_hash: &Hash, n_nodes: u64, entry_index: u64) -> Result<()> {
        if let Some(previous) = &self.submitted {
            if previous.root_hash != *root_hash || previous.n_nodes != n_nodes {
                return Err(MinerError::ConflictingSubmission {
                    submitted: format!("{}/{}", to_hex(&previous.root_hash), previous.n_nodes),
                });
            }
        }
        if self.used_entries.contains(&entry_index) {
            return Err(MinerError::EntryReused { entry_index });
        }
        Ok(())
    }

    /// Usable entries with their eligibility at `now`
    pub fn candidates(
        &self,
        window: &MiningWindow,
        now: u64,
        stake: u128,
        min_stake: u128,
        root_hash: &Hash,
    ) -> Vec<EntryCandidate> {
        (1..=allowed_entries(stake, min_stake))
            .filter(|i| !self.used_entries.contains(i))
            .map(|index| EntryCandidate {
                index,
                eligible: is_eligible(window, now, &self.staker, index, root_hash),
            })
            .collect()
    }

    /// Entry to submit `root_hash` with at `now`, `None` if nothing is
    /// eligible yet
    pub fn plan(
        &self,
        window: &MiningWindow,
        now: u64,
        stake: u128,
        min_stake: u128,
        root_hash: &Hash,
        n_nodes: u64,
    ) -> Result<Option<u64>> {
        if allowed_entries(stake, min_stake) == 0 {
            return Err(MinerError::NotEligible(format!(
                "stake {} is below the minimum {}",
                stake, min_stake
            )));
        }
        let candidates = self.candidates(window, now, stake, min_stake, root_hash);
        let Some(entry_index) = self.selection.select(&candidates) else {
            return Ok(None);
        };
        self.check(root_hash, n_nodes, entry_index)?;
        Ok(Some(entry_index))
    }

    /// Remember a successful submission
    pub fn record(&mut self, root_hash: Hash, n_nodes: u64, entry_index: u64) {
        self.submitted = Some(Submitted { root_hash, n_nodes });
        self.used_entries.insert(entry_index);
        info!(
            cycle = self.cycle,
            entry_index,
            root = %to_hex(&root_hash),
            n_nodes,
            "Recorded submission"
        );
    }

    /// Earliest chain time at which any usable entry becomes eligible
    pub fn earliest_eligible_time(
        &self,
        window: &MiningWindow,
        stake: u128,
        min_stake: u128,
        root_hash: &Hash,
    ) -> Option<u64> {
        (1..=allowed_entries(stake, min_stake))
            .filter(|i| !self.used_entries.contains(i))
            .filter_map(|i| entry_eligible_at(window, &self.staker, i, root_hash))
            .min()
    }
}
