//! Shared fixtures for integration tests
//!
//! Builds a simulated ledger with a small skill forest and a seeded random
//! log, plus faulty strategies for dishonest miners.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reputation_miner::codec::encode_value;
use reputation_miner::{
    Address, ClientOptions, EntryCandidate, EntrySelection, KeyUpdate, MinerStrategies,
    MiningClient, ReplayStrategy, ReputationEntry, ReputationStore, Result, RetryPolicy,
    SimulatedLedger, SimulatedLedgerConfig, SkillTree, StepOutcome, UpdateLogEntry,
    ValueEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub const HONEST: Address = [0xa1; 20];
pub const HONEST_TWO: Address = [0xa2; 20];
pub const CHEAT: Address = [0xb1; 20];
pub const CHEAT_TWO: Address = [0xb2; 20];
pub const DOMAIN: Address = [0xd0; 20];
pub const MIN_STAKE: u128 = 1_000;

/// Seconds the clock moves between rounds of client steps
pub const TICK: u64 = 60;

// ============================================================================
// LEDGER SETUP
// ============================================================================

pub fn ledger() -> Arc<SimulatedLedger> {
    Arc::new(SimulatedLedger::new(SimulatedLedgerConfig {
        start_time: 1_000,
        window_length: 3_600,
        challenge_timeout: 600,
        min_stake: MIN_STAKE,
    }))
}

/// Skill forest used by every scenario:
///
/// ```text
/// 1 ── 2 ── 3
///  └── 4
/// 5 ── 6
/// ```
pub fn seed_skills(ledger: &SimulatedLedger) {
    let s1 = ledger.add_skill(None).unwrap();
    let s2 = ledger.add_skill(Some(s1)).unwrap();
    ledger.add_skill(Some(s2)).unwrap();
    ledger.add_skill(Some(s1)).unwrap();
    let s5 = ledger.add_skill(None).unwrap();
    ledger.add_skill(Some(s5)).unwrap();
}

/// Append `n` random entries to the next cycle's log
pub fn seed_log(ledger: &SimulatedLedger, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let skills = ledger.skills().len();
    for _ in 0..n {
        let user = [0x10 + rng.gen_range(0..5u8); 20];
        let amount = rng.gen_range(-120i128..=250);
        let skill = rng.gen_range(1..=skills);
        ledger.push_log_entry(user, amount, skill, DOMAIN).unwrap();
    }
}

/// Skills, a 30-entry log, and cycle 1 open for mining it
pub fn thirty_entry_cycle() -> Arc<SimulatedLedger> {
    let ledger = ledger();
    seed_skills(&ledger);
    seed_log(&ledger, 30, 42);
    ledger.open_next_cycle().unwrap();
    ledger
}

// ============================================================================
// CLIENTS
// ============================================================================

pub fn options() -> ClientOptions {
    ClientOptions {
        store_path: None,
        max_checkpoints: 8,
        retry: RetryPolicy::immediate(3),
        poll_interval: Duration::ZERO,
    }
}

pub fn client(
    ledger: &Arc<SimulatedLedger>,
    staker: Address,
    strategies: MinerStrategies,
) -> MiningClient<SimulatedLedger> {
    ledger.set_stake(staker, 12 * MIN_STAKE);
    MiningClient::new(Arc::clone(ledger), staker, strategies, options())
}

pub fn honest(ledger: &Arc<SimulatedLedger>, staker: Address) -> MiningClient<SimulatedLedger> {
    client(ledger, staker, MinerStrategies::default())
}

pub fn cheat(
    ledger: &Arc<SimulatedLedger>,
    staker: Address,
    at: u64,
    by: i128,
) -> MiningClient<SimulatedLedger> {
    client(
        ledger,
        staker,
        MinerStrategies {
            replay: Arc::new(Inflate { at, by }),
            ..MinerStrategies::default()
        },
    )
}

/// Step every undecided client once per tick, advancing the clock between
/// ticks, until all are decided or `max_ticks` pass.
pub async fn drive(
    ledger: &SimulatedLedger,
    clients: &mut [MiningClient<SimulatedLedger>],
    max_ticks: usize,
) -> Vec<StepOutcome> {
    let mut outcomes = vec![StepOutcome::Pending; clients.len()];
    for _ in 0..max_ticks {
        for (client, outcome) in clients.iter_mut().zip(outcomes.iter_mut()) {
            if *outcome == StepOutcome::Pending {
                *outcome = client.step().await.unwrap();
            }
        }
        if outcomes.iter().all(|o| *o != StepOutcome::Pending) {
            break;
        }
        ledger.advance(TICK);
    }
    outcomes
}

/// Step the clients until each has submitted its root hash
pub async fn submit_all(ledger: &SimulatedLedger, clients: &mut [MiningClient<SimulatedLedger>]) {
    for _ in 0..100 {
        let mut all = true;
        for client in clients.iter_mut() {
            if client.controller().and_then(|c| c.position()).is_none() {
                client.step().await.unwrap();
            }
            all &= client.controller().and_then(|c| c.position()).is_some();
        }
        if all {
            return;
        }
        ledger.advance(TICK);
    }
    panic!("clients did not all submit within the window");
}

// ============================================================================
// FAULTY STRATEGIES
// ============================================================================

/// Replays correctly except at entry `at`, whose first update becomes a gain
/// of `|delta| + by`. The result always differs from the correct one, even
/// where a loss would have been floored at zero.
pub struct Inflate {
    pub at: u64,
    pub by: i128,
}

impl ReplayStrategy for Inflate {
    fn updates(
        &self,
        log_index: u64,
        store: &ReputationStore,
        skills: &SkillTree,
        entry: &UpdateLogEntry,
    ) -> Result<Vec<KeyUpdate>> {
        let mut updates = reputation_miner::replay::resolve_updates(store, skills, entry)?;
        if log_index == self.at {
            updates[0].delta = updates[0].delta.abs() + self.by;
        }
        Ok(updates)
    }
}

/// Writes the uid word before the amount word
pub struct SwappedFields;

impl ValueEncoder for SwappedFields {
    fn encode(&self, entry: &ReputationEntry) -> Vec<u8> {
        let mut bytes = encode_value(entry).to_vec();
        bytes.rotate_left(32);
        bytes
    }
}

/// Submits with the first usable entry whether or not it is eligible yet
pub struct Eager;

impl EntrySelection for Eager {
    fn select(&self, candidates: &[EntryCandidate]) -> Option<u64> {
        candidates.first().map(|c| c.index)
    }
}
