//! In-process simulated ledger
//!
//! Holds the ledger contract's mining state behind a `parking_lot::Mutex` and
//! applies the same acceptance rules the contract does: submission
//! eligibility, dispute pairing, step accounting, binary-search narrowing,
//! challenge arbitration through [`verify_transition`], timeouts and
//! confirmation. Chain time only moves when the test advances it.
//!
//! Setup helpers (`add_skill`, `set_stake`, `push_log_entry`,
//! `open_next_cycle`) stand in for the parts of the contract that are out of
//! scope here. Transport failures can be injected to exercise retries.
//!
//! A tie invalidates both sides. If that leaves no claim standing, nothing is
//! ever confirmed for the cycle and submissions are not reopened, so the
//! ledger stays on that cycle for good.

use super::{
    ConfirmedState, CycleInfo, DisputeSlot, LedgerClient, RoundStatus, SubmissionReceipt,
};
use crate::challenge::{verify_transition, ProofBundle};
use crate::codec::{to_hex, Address, Hash};
use crate::error::{MinerError, Result};
use crate::justification::JustificationProof;
use crate::replay::{expected_update_count, UpdateLogEntry};
use crate::scheduler::{allowed_entries, is_eligible, MiningWindow};
use crate::skills::{Skill, SkillTree};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Simulated ledger parameters
#[derive(Debug, Clone)]
pub struct SimulatedLedgerConfig {
    /// Chain time at construction
    pub start_time: u64,
    /// Mining window length in seconds
    pub window_length: u64,
    /// Response timeout in seconds
    pub challenge_timeout: u64,
    /// Stake per submission entry
    pub min_stake: u128,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            start_time: 1_000,
            window_length: 3_600,
            challenge_timeout: 600,
            min_stake: 1_000,
        }
    }
}

#[derive(Debug, Default)]
struct Round {
    slots: Vec<DisputeSlot>,
    closed_at: Option<u64>,
}

#[derive(Debug)]
struct SubmitterRecord {
    root_hash: Hash,
    n_nodes: u64,
    entries: BTreeSet<u64>,
}

#[derive(Debug)]
struct State {
    config: SimulatedLedgerConfig,
    now: u64,
    cycle: u64,
    window: MiningWindow,
    /// `starts[c]` is the state cycle `c` started from
    starts: Vec<ConfirmedState>,
    /// `logs[c]` is cycle `c`'s log; the last one collects the next cycle
    logs: Vec<Vec<UpdateLogEntry>>,
    rounds: Vec<Round>,
    submitters: HashMap<Address, SubmitterRecord>,
    skills: SkillTree,
    stakes: HashMap<Address, u128>,
    failures_to_inject: u32,
    calls: HashMap<&'static str, u64>,
}

fn revert(reason: impl Into<String>) -> MinerError {
    MinerError::Revert(reason.into())
}

impl State {
    fn active_log(&self) -> &[UpdateLogEntry] {
        &self.logs[self.cycle as usize]
    }

    fn pending_log(&self) -> &[UpdateLogEntry] {
        &self.logs[self.cycle as usize + 1]
    }

    fn upper_bound(&self) -> u64 {
        (self.active_log().len() as u64).saturating_sub(1)
    }

    fn round_closed_at(&self, round: u64) -> Option<u64> {
        if round == 0 {
            let closes_at = self.window.closes_at();
            (self.now >= closes_at).then_some(closes_at)
        } else {
            self.rounds.get(round as usize).and_then(|r| r.closed_at)
        }
    }

    fn round(&self, round: u64) -> Result<&Round> {
        self.rounds
            .get(round as usize)
            .ok_or_else(|| revert(format!("no-such-round {}", round)))
    }

    fn slot(&self, round: u64, index: u64) -> Result<&DisputeSlot> {
        self.round(round)?
            .slots
            .get(index as usize)
            .ok_or_else(|| revert(format!("no-such-slot {}/{}", round, index)))
    }

    fn slot_mut(&mut self, round: u64, index: u64) -> &mut DisputeSlot {
        &mut self.rounds[round as usize].slots[index as usize]
    }

    /// Common checks for a response from `from` on `(round, index)`; returns
    /// the opponent's index.
    fn check_responder(&self, from: &Address, round: u64, index: u64) -> Result<u64> {
        if self.round_closed_at(round).is_none() {
            return Err(revert("round-not-closed"));
        }
        let slot = self.slot(round, index)?;
        if slot.is_resolved() {
            return Err(revert("hash-already-resolved"));
        }
        if !slot.stakers.contains(from) {
            return Err(revert("not-a-staker-of-hash"));
        }
        let opponent = slot.opponent_index();
        let opp = self
            .slot(round, opponent)
            .map_err(|_| revert("no-opponent"))?;
        if opp.is_resolved() {
            return Err(revert("opponent-already-resolved"));
        }
        Ok(opponent)
    }

    /// Move the winner at `(round, index)` into the next round
    fn advance(&mut self, round: u64, index: u64) {
        let upper = self.upper_bound();
        let next_round = round as usize + 1;
        if self.rounds.len() <= next_round {
            self.rounds.push(Round::default());
        }
        let next_index = self.rounds[next_round].slots.len() as u64;
        let winner = self.slot(round, index).cloned();
        if let Ok(mut slot) = winner {
            slot.round = round + 1;
            slot.index = next_index;
            slot.challenge_steps_completed = u64::from(slot.justification_root.is_some());
            slot.lower_bound = 0;
            slot.upper_bound = upper;
            slot.last_response_at = 0;
            slot.pending_leaf = None;
            slot.challenge_proven = false;
            self.rounds[next_round].slots.push(slot);
            self.slot_mut(round, index).advanced_to = Some(next_index);
            info!(round, index, next_index, "Hash advanced to next round");
        }
    }

    /// Close the next round once every slot of `round` resolved
    fn maybe_close_next(&mut self, round: u64) {
        let all_resolved = self
            .rounds
            .get(round as usize)
            .is_some_and(|r| r.slots.iter().all(DisputeSlot::is_resolved));
        if !all_resolved {
            return;
        }
        let next_round = round as usize + 1;
        if self.rounds.len() <= next_round {
            self.rounds.push(Round::default());
        }
        if self.rounds[next_round].closed_at.is_none() {
            self.rounds[next_round].closed_at = Some(self.now);
            debug!(round = round + 1, at = self.now, "Round closed");
        }
    }
}

/// Simulated ledger contract with a manual clock
pub struct SimulatedLedger {
    state: Mutex<State>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(SimulatedLedgerConfig::default())
    }
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let now = config.start_time;
        let window = MiningWindow::new(now, config.window_length);
        Self {
            state: Mutex::new(State {
                config,
                now,
                cycle: 0,
                window,
                starts: vec![ConfirmedState::genesis()],
                logs: vec![Vec::new(), Vec::new()],
                rounds: vec![Round::default()],
                submitters: HashMap::new(),
                skills: SkillTree::new(),
                stakes: HashMap::new(),
                failures_to_inject: 0,
                calls: HashMap::new(),
            }),
        }
    }

    // ==================== Setup ====================

    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    pub fn advance(&self, seconds: u64) {
        self.state.lock().now += seconds;
    }

    pub fn set_time(&self, now: u64) {
        let mut state = self.state.lock();
        state.now = state.now.max(now);
    }

    pub fn add_skill(&self, parent: Option<u64>) -> Result<u64> {
        self.state.lock().skills.add_skill(parent)
    }

    pub fn set_stake(&self, staker: Address, amount: u128) {
        self.state.lock().stakes.insert(staker, amount);
    }

    /// Append an entry to the log the next cycle will mine
    pub fn push_log_entry(
        &self,
        user: Address,
        amount: i128,
        skill_id: u64,
        domain: Address,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.skills.contains(skill_id) {
            return Err(revert(format!("unknown-skill {}", skill_id)));
        }
        let mut entry = UpdateLogEntry::new(user, amount, skill_id, domain);
        entry.n_updates = expected_update_count(&state.skills, &entry);
        entry.n_previous_updates = state
            .pending_log()
            .last()
            .map(|p| p.n_previous_updates + p.n_updates)
            .unwrap_or(0);
        let index = state.pending_log().len() as u64;
        let pending = state.cycle as usize + 1;
        state.logs[pending].push(entry);
        Ok(index)
    }

    /// Start the next cycle from the current start state. Only allowed while
    /// the active cycle has an empty log and no submissions, which is the one
    /// case where its outcome is already determined.
    pub fn open_next_cycle(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.active_log().is_empty() || !state.submitters.is_empty() {
            return Err(revert("active-cycle-in-progress"));
        }
        let start = state.starts[state.cycle as usize];
        Self::start_cycle(&mut state, start.root_hash, start.n_nodes);
        Ok(())
    }

    /// Make the next `n` calls fail with a transport error
    pub fn inject_transport_failures(&self, n: u32) {
        self.state.lock().failures_to_inject = n;
    }

    /// Number of calls made to `method`, failed ones included
    pub fn calls(&self, method: &str) -> u64 {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn skills(&self) -> SkillTree {
        self.state.lock().skills.clone()
    }

    fn start_cycle(state: &mut State, root_hash: Hash, n_nodes: u64) {
        state.cycle += 1;
        state.starts.push(ConfirmedState {
            cycle: state.cycle,
            root_hash,
            n_nodes,
        });
        state.logs.push(Vec::new());
        state.window = MiningWindow::new(state.now, state.config.window_length);
        state.rounds = vec![Round::default()];
        state.submitters.clear();
        info!(
            cycle = state.cycle,
            root = %to_hex(&root_hash),
            n_nodes,
            log_length = state.active_log().len(),
            "Mining cycle opened"
        );
    }

    /// Lock the state for one call, counting it and applying injected
    /// transport failures.
    fn enter(&self, method: &'static str) -> Result<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_insert(0) += 1;
        if state.failures_to_inject > 0 {
            state.failures_to_inject -= 1;
            return Err(MinerError::Transport(format!(
                "injected failure calling {}",
                method
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn chain_time(&self) -> Result<u64> {
        Ok(self.enter("chainTime")?.now)
    }

    async fn active_cycle(&self) -> Result<CycleInfo> {
        let state = self.enter("activeCycle")?;
        Ok(CycleInfo {
            cycle: state.cycle,
            window: state.window,
            challenge_timeout: state.config.challenge_timeout,
        })
    }

    async fn confirmed_state(&self, cycle: u64) -> Result<ConfirmedState> {
        let state = self.enter("confirmedState")?;
        state
            .starts
            .get(cycle as usize)
            .copied()
            .ok_or_else(|| revert(format!("no-such-cycle {}", cycle)))
    }

    async fn skill_count(&self) -> Result<u64> {
        Ok(self.enter("getSkillCount")?.skills.len())
    }

    async fn skill(&self, skill_id: u64) -> Result<Skill> {
        self.enter("getSkill")?
            .skills
            .get(skill_id)
            .ok_or_else(|| revert(format!("no-such-skill {}", skill_id)))
    }

    async fn stake_of(&self, staker: &Address) -> Result<u128> {
        Ok(self
            .enter("stakeOf")?
            .stakes
            .get(staker)
            .copied()
            .unwrap_or(0))
    }

    async fn min_stake(&self) -> Result<u128> {
        Ok(self.enter("minStake")?.config.min_stake)
    }

    async fn log_length(&self, cycle: u64) -> Result<u64> {
        let state = self.enter("getReputationUpdateLogLength")?;
        state
            .logs
            .get(cycle as usize)
            .map(|log| log.len() as u64)
            .ok_or_else(|| revert(format!("no-such-cycle {}", cycle)))
    }

    async fn log_entry(&self, cycle: u64, index: u64) -> Result<UpdateLogEntry> {
        let state = self.enter("getReputationUpdateLogEntry")?;
        state
            .logs
            .get(cycle as usize)
            .and_then(|log| log.get(index as usize))
            .copied()
            .ok_or_else(|| revert(format!("no-such-log-entry {}/{}", cycle, index)))
    }

    async fn dispute_round_length(&self, round: u64) -> Result<u64> {
        let state = self.enter("getDisputeRoundLength")?;
        Ok(state
            .rounds
            .get(round as usize)
            .map(|r| r.slots.len() as u64)
            .unwrap_or(0))
    }

    async fn dispute_slot(&self, round: u64, index: u64) -> Result<DisputeSlot> {
        let state = self.enter("disputeRounds")?;
        state.slot(round, index).cloned()
    }

    async fn round_status(&self, round: u64) -> Result<RoundStatus> {
        let state = self.enter("roundStatus")?;
        let slots = state
            .rounds
            .get(round as usize)
            .map(|r| r.slots.as_slice())
            .unwrap_or(&[]);
        Ok(RoundStatus {
            round,
            closed_at: state.round_closed_at(round),
            slots: slots.len() as u64,
            unresolved: slots.iter().filter(|s| !s.is_resolved()).count() as u64,
        })
    }

    async fn submit_root_hash(
        &self,
        from: &Address,
        root_hash: &Hash,
        n_nodes: u64,
        entry_index: u64,
    ) -> Result<SubmissionReceipt> {
        let mut state = self.enter("submitRootHash")?;
        let now = state.now;
        if !state.window.is_open(now) {
            return Err(revert("mining-window-closed"));
        }
        let stake = state.stakes.get(from).copied().unwrap_or(0);
        let allowed = allowed_entries(stake, state.config.min_stake);
        if entry_index == 0 || entry_index > allowed {
            return Err(revert(format!(
                "entry-not-allowed {} of {}",
                entry_index, allowed
            )));
        }
        if !is_eligible(&state.window, now, from, entry_index, root_hash) {
            return Err(revert("entry-not-eligible"));
        }
        if state.active_log().is_empty() {
            let start = state.starts[state.cycle as usize];
            if !start.matches(root_hash, n_nodes) {
                return Err(revert("empty-log-requires-confirmed-root"));
            }
        }
        if let Some(record) = state.submitters.get(from) {
            if record.root_hash != *root_hash || record.n_nodes != n_nodes {
                return Err(revert("conflicting-submission"));
            }
            if record.entries.contains(&entry_index) {
                return Err(revert("entry-already-used"));
            }
        }

        let upper = state.upper_bound();
        let round = &mut state.rounds[0];
        let index = match round
            .slots
            .iter()
            .position(|s| &s.root_hash == root_hash && s.n_nodes == n_nodes)
        {
            Some(i) => {
                let slot = &mut round.slots[i];
                if !slot.stakers.contains(from) {
                    slot.stakers.push(*from);
                }
                i as u64
            }
            None => {
                let index = round.slots.len() as u64;
                round.slots.push(DisputeSlot {
                    round: 0,
                    index,
                    root_hash: *root_hash,
                    n_nodes,
                    justification_root: None,
                    lower_bound: 0,
                    upper_bound: upper,
                    challenge_steps_completed: 0,
                    last_response_at: 0,
                    pending_leaf: None,
                    challenge_proven: false,
                    invalidated: false,
                    advanced_to: None,
                    stakers: vec![*from],
                });
                index
            }
        };
        state
            .submitters
            .entry(*from)
            .or_insert_with(|| SubmitterRecord {
                root_hash: *root_hash,
                n_nodes,
                entries: BTreeSet::new(),
            })
            .entries
            .insert(entry_index);

        info!(
            staker = %to_hex(from),
            root = %to_hex(root_hash),
            n_nodes,
            entry_index,
            index,
            "Root hash submitted"
        );
        Ok(SubmissionReceipt { round: 0, index })
    }

    async fn confirm_new_hash(&self, _from: &Address, round: u64) -> Result<()> {
        let mut state = self.enter("confirmNewHash")?;
        if state.round_closed_at(round).is_none() {
            return Err(revert("round-not-closed"));
        }
        let slots = &state.round(round)?.slots;
        if slots.len() != 1 {
            return Err(revert(format!(
                "round {} has {} hashes, expected one",
                round,
                slots.len()
            )));
        }
        let winner = slots[0].clone();
        if winner.is_resolved() {
            return Err(revert("hash-already-resolved"));
        }
        info!(
            cycle = state.cycle,
            round,
            root = %to_hex(&winner.root_hash),
            n_nodes = winner.n_nodes,
            "New reputation hash confirmed"
        );
        Self::start_cycle(&mut state, winner.root_hash, winner.n_nodes);
        Ok(())
    }

    async fn invalidate_hash(&self, _from: &Address, round: u64, index: u64) -> Result<()> {
        let mut state = self.enter("invalidateHash")?;
        let closed_at = state
            .round_closed_at(round)
            .ok_or_else(|| revert("round-not-closed"))?;
        let len = state.round(round)?.slots.len() as u64;
        let timeout = state.config.challenge_timeout;
        let now = state.now;

        if index >= len {
            // Bye: the empty index next to an unpaired hash
            let lone = index ^ 1;
            if index != len || len % 2 == 0 || len == 1 {
                return Err(revert("no-unpaired-hash"));
            }
            let others_resolved = state.rounds[round as usize]
                .slots
                .iter()
                .filter(|s| s.index != lone)
                .all(DisputeSlot::is_resolved);
            if !others_resolved {
                return Err(revert("round-has-unresolved-hashes"));
            }
            if state.slot(round, lone)?.is_resolved() {
                return Err(revert("hash-already-resolved"));
            }
            state.advance(round, lone);
            state.maybe_close_next(round);
            return Ok(());
        }

        let target = state.slot(round, index)?.clone();
        let opponent = state
            .slot(round, target.opponent_index())
            .map_err(|_| revert("no-opponent"))?
            .clone();
        if target.is_resolved() || opponent.is_resolved() {
            return Err(revert("hash-already-resolved"));
        }

        let target_steps = target.challenge_steps_completed;
        let opponent_steps = opponent.challenge_steps_completed;
        if target_steps < opponent_steps {
            let deadline = opponent.last_response_at.max(closed_at) + timeout;
            if now < deadline {
                return Err(revert("response-timeout-not-elapsed"));
            }
            state.slot_mut(round, index).invalidated = true;
            info!(round, index, "Hash invalidated");
            state.advance(round, opponent.index);
        } else if target_steps == opponent_steps {
            let deadline = target
                .last_response_at
                .max(opponent.last_response_at)
                .max(closed_at)
                + timeout;
            if now < deadline {
                return Err(revert("response-timeout-not-elapsed"));
            }
            // If no other slot is left standing the cycle is never confirmed
            state.slot_mut(round, index).invalidated = true;
            state.slot_mut(round, opponent.index).invalidated = true;
            info!(round, index, opponent = opponent.index, "Tied hashes invalidated");
        } else {
            return Err(revert("hash-is-ahead"));
        }
        state.maybe_close_next(round);
        Ok(())
    }

    async fn submit_justification_root_hash(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        justification_root: &Hash,
        last_leaf: Option<&JustificationProof>,
    ) -> Result<()> {
        let mut state = self.enter("submitJustificationRootHash")?;
        state.check_responder(from, round, index)?;
        let slot = state.slot(round, index)?.clone();
        if slot.justification_root.is_some() {
            return Err(revert("justification-already-submitted"));
        }

        let n_leaves = state.active_log().len() as u64;
        match (n_leaves, last_leaf) {
            (0, None) => {}
            (0, Some(_)) => return Err(revert("empty-log-takes-no-leaf")),
            (_, None) => return Err(revert("missing-last-leaf")),
            (n, Some(proof)) => {
                if proof.leaf.index != n - 1 {
                    return Err(revert("leaf-is-not-last"));
                }
                proof
                    .verify(justification_root)
                    .map_err(|e| revert(format!("invalid-last-leaf: {}", e)))?;
                if proof.leaf.root_hash != slot.root_hash || proof.leaf.n_nodes != slot.n_nodes {
                    return Err(revert("last-leaf-differs-from-submission"));
                }
            }
        }

        let now = state.now;
        let upper = state.upper_bound();
        let slot = state.slot_mut(round, index);
        slot.justification_root = Some(*justification_root);
        slot.challenge_steps_completed += 1;
        slot.last_response_at = now;
        slot.lower_bound = 0;
        slot.upper_bound = upper;
        debug!(round, index, jrh = %to_hex(justification_root), "Justification root accepted");
        Ok(())
    }

    async fn respond_to_binary_search(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        proof: &JustificationProof,
    ) -> Result<()> {
        let mut state = self.enter("respondToBinarySearchForChallenge")?;
        let opponent_index = state.check_responder(from, round, index)?;
        let me = state.slot(round, index)?.clone();
        let opponent = state.slot(round, opponent_index)?.clone();

        let (Some(jrh), Some(_)) = (me.justification_root, opponent.justification_root) else {
            return Err(revert("justification-root-missing"));
        };
        if me.challenge_steps_completed > opponent.challenge_steps_completed {
            return Err(revert("hash-is-ahead"));
        }
        if me.search_finished() {
            return Err(revert("binary-search-finished"));
        }
        let mid = me.midpoint();
        if proof.leaf.index != mid {
            return Err(revert(format!(
                "expected leaf {} got {}",
                mid, proof.leaf.index
            )));
        }
        proof
            .verify(&jrh)
            .map_err(|e| revert(format!("invalid-intermediate-root: {}", e)))?;

        let now = state.now;
        {
            let slot = state.slot_mut(round, index);
            slot.pending_leaf = Some(proof.leaf);
            slot.challenge_steps_completed += 1;
            slot.last_response_at = now;
        }

        // Narrow once both sides answered the same step
        if me.challenge_steps_completed + 1 == opponent.challenge_steps_completed {
            let agree = opponent
                .pending_leaf
                .is_some_and(|theirs| theirs.same_state(&proof.leaf));
            let (lower, upper) = if agree {
                (mid + 1, me.upper_bound)
            } else {
                (me.lower_bound, mid)
            };
            for i in [index, opponent_index] {
                let slot = state.slot_mut(round, i);
                slot.lower_bound = lower;
                slot.upper_bound = upper;
                slot.pending_leaf = None;
            }
            debug!(round, index, mid, agree, lower, upper, "Binary search narrowed");
        }
        Ok(())
    }

    async fn respond_to_challenge(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        bundle: &ProofBundle,
    ) -> Result<()> {
        let mut state = self.enter("respondToChallenge")?;
        let opponent_index = state.check_responder(from, round, index)?;
        let me = state.slot(round, index)?.clone();
        let opponent = state.slot(round, opponent_index)?.clone();

        let (Some(jrh), Some(_)) = (me.justification_root, opponent.justification_root) else {
            return Err(revert("justification-root-missing"));
        };
        if !me.search_finished() {
            return Err(revert("binary-search-unfinished"));
        }
        if me.challenge_proven {
            return Err(revert("challenge-already-proven"));
        }
        if me.challenge_steps_completed > opponent.challenge_steps_completed {
            return Err(revert("hash-is-ahead"));
        }
        let disputed = me.lower_bound;
        if bundle.log_index != disputed {
            return Err(revert(format!(
                "expected proof for log entry {} got {}",
                disputed, bundle.log_index
            )));
        }
        let log_entry = state
            .active_log()
            .get(disputed as usize)
            .copied()
            .ok_or_else(|| revert("no-such-log-entry"))?;
        let start = state.starts[state.cycle as usize].prior();
        verify_transition(bundle, &jrh, &start, &state.skills, &log_entry)
            .map_err(|e| revert(format!("invalid-challenge-response: {}", e)))?;

        let now = state.now;
        let slot = state.slot_mut(round, index);
        slot.challenge_proven = true;
        slot.challenge_steps_completed += 1;
        slot.last_response_at = now;
        info!(round, index, disputed, "Challenge response accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EMPTY_ROOT;

    const STAKER: Address = [0x11; 20];

    fn ledger() -> SimulatedLedger {
        let ledger = SimulatedLedger::default();
        ledger.set_stake(STAKER, 12_000);
        ledger
    }

    #[tokio::test]
    async fn test_closed_window_rejects_submission() {
        let ledger = ledger();
        ledger.advance(3_600);
        let err = ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MinerError::Revert(ref r) if r == "mining-window-closed"));
    }

    #[tokio::test]
    async fn test_empty_log_accepts_only_confirmed_root() {
        let ledger = ledger();
        ledger.advance(3_599);
        let err = ledger
            .submit_root_hash(&STAKER, &[1u8; 32], 0, 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty-log-requires-confirmed-root"));

        let receipt = ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 1)
            .await
            .unwrap();
        assert_eq!(receipt, SubmissionReceipt { round: 0, index: 0 });

        ledger.advance(1);
        ledger.confirm_new_hash(&STAKER, 0).await.unwrap();
        let cycle = ledger.active_cycle().await.unwrap();
        assert_eq!(cycle.cycle, 1);
        assert_eq!(ledger.confirmed_state(1).await.unwrap().root_hash, EMPTY_ROOT);
    }

    #[tokio::test]
    async fn test_entry_rules() {
        let ledger = ledger();
        ledger.advance(3_599);
        ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 3)
            .await
            .unwrap();

        let reused = ledger.submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 3).await;
        assert!(matches!(reused, Err(MinerError::Revert(ref r)) if r == "entry-already-used"));
        let too_many = ledger.submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 13).await;
        assert!(too_many.is_err());
        // second entry joins the same slot
        let receipt = ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 4)
            .await
            .unwrap();
        assert_eq!(receipt.index, 0);
        assert_eq!(ledger.dispute_round_length(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entry_not_yet_eligible() {
        let ledger = ledger();
        let err = ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MinerError::Revert(ref r) if r == "entry-not-eligible"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transport_errors() {
        let ledger = ledger();
        ledger.inject_transport_failures(2);
        assert!(ledger.chain_time().await.unwrap_err().is_retryable());
        assert!(ledger.chain_time().await.unwrap_err().is_retryable());
        assert_eq!(ledger.chain_time().await.unwrap(), 1_000);
        assert_eq!(ledger.calls("chainTime"), 3);
    }

    #[tokio::test]
    async fn test_log_counters_assigned_on_push() {
        let ledger = ledger();
        let parent = ledger.add_skill(None).unwrap();
        let child = ledger.add_skill(Some(parent)).unwrap();
        ledger.push_log_entry([1u8; 20], 10, child, [9u8; 20]).unwrap();
        ledger.push_log_entry([1u8; 20], -5, parent, [9u8; 20]).unwrap();
        ledger.open_next_cycle().unwrap();

        let first = ledger.log_entry(1, 0).await.unwrap();
        let second = ledger.log_entry(1, 1).await.unwrap();
        assert_eq!(first.n_updates, 4);
        assert_eq!(second.n_updates, 4);
        assert_eq!(second.n_previous_updates, 4);
        assert_eq!(ledger.log_length(1).await.unwrap(), 2);
        assert_eq!(ledger.log_length(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_next_cycle_refused_with_work_pending() {
        let ledger = ledger();
        ledger.add_skill(None).unwrap();
        ledger.push_log_entry([1u8; 20], 10, 1, [9u8; 20]).unwrap();
        ledger.open_next_cycle().unwrap();
        assert!(ledger.open_next_cycle().is_err());
    }

    #[tokio::test]
    async fn test_bye_requires_other_slots_resolved() {
        let ledger = ledger();
        ledger.advance(3_599);
        ledger
            .submit_root_hash(&STAKER, &EMPTY_ROOT, 0, 1)
            .await
            .unwrap();
        ledger.advance(1);
        // single slot: confirm, not bye
        assert!(ledger.invalidate_hash(&STAKER, 0, 1).await.is_err());
        let status = ledger.round_status(0).await.unwrap();
        assert_eq!(status.closed_at, Some(4_600));
        assert_eq!(status.unresolved, 1);
    }
}
