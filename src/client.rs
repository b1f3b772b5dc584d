//! Mining client
//!
//! Drives one staker through the mining protocol against a [`LedgerClient`]:
//!
//! 1. `sync` brings the local store to the state the active cycle started
//!    from, restoring a checkpoint or replaying confirmed cycles
//! 2. `prepare_cycle` replays the active cycle's log on a fork and builds the
//!    justification trie
//! 3. `step` submits once an entry is eligible, then feeds ledger
//!    observations to the [`DisputeController`] and executes its actions
//! 4. a win commits the replayed state, checkpoints it and flushes it to disk
//!
//! Every ledger call goes through the [`RetryPolicy`]; reverts are never
//! retried.

use crate::challenge::{build_bundle, verify_transition, PriorState, ProofBundle};
use crate::codec::{to_hex, Address, Hash, LedgerEncoding, ValueEncoder};
use crate::config::MinerConfig;
use crate::dispute::{
    DisputeAction, DisputeController, DisputeEvent, DisputeEvidence, Outcome, RoundObservation,
};
use crate::error::{MinerError, Result};
use crate::justification::{JustificationProof, JustificationTrie};
use crate::ledger::{ConfirmedState, CycleInfo, LedgerClient};
use crate::replay::{CorrectReplay, IntermediateRoot, ReplayEngine, ReplayStrategy, UpdateLogEntry};
use crate::reputation::{ReputationStore, DEFAULT_MAX_CHECKPOINTS};
use crate::retry::RetryPolicy;
use crate::scheduler::{EntrySelection, FirstEligible, SubmissionScheduler};
use crate::skills::SkillTree;
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ==================== Strategies ====================

/// Pluggable behavior of a miner. The defaults follow the ledger's rules;
/// simulations swap in faulty ones to play dishonest participants.
#[derive(Clone)]
pub struct MinerStrategies {
    pub replay: Arc<dyn ReplayStrategy>,
    pub encoder: Arc<dyn ValueEncoder>,
    pub selection: Arc<dyn EntrySelection>,
}

impl Default for MinerStrategies {
    fn default() -> Self {
        Self {
            replay: Arc::new(CorrectReplay),
            encoder: Arc::new(LedgerEncoding),
            selection: Arc::new(FirstEligible),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Where the confirmed state is persisted; `None` keeps it in memory
    pub store_path: Option<PathBuf>,
    pub max_checkpoints: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            store_path: None,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl From<&MinerConfig> for ClientOptions {
    fn from(config: &MinerConfig) -> Self {
        Self {
            store_path: Some(config.store_path.clone()),
            max_checkpoints: config.max_checkpoints,
            retry: config.retry,
            poll_interval: config.poll_interval(),
        }
    }
}

// ==================== Evidence ====================

/// Proof source for one cycle: the start state, the log and the replay that
/// produced our claim.
pub struct CycleEvidence {
    start: ReputationStore,
    engine: ReplayEngine,
    log: Vec<UpdateLogEntry>,
    roots: Vec<IntermediateRoot>,
    prior: PriorState,
    justification: JustificationTrie,
}

impl CycleEvidence {
    pub fn new(
        start: ReputationStore,
        engine: ReplayEngine,
        log: Vec<UpdateLogEntry>,
        roots: Vec<IntermediateRoot>,
        prior: PriorState,
    ) -> Result<Self> {
        let justification = JustificationTrie::build(&roots)?;
        Ok(Self {
            start,
            engine,
            log,
            roots,
            prior,
            justification,
        })
    }

    /// Final (root, n_nodes) of the replay; the start state for an empty log
    pub fn claim(&self) -> (Hash, u64) {
        self.roots
            .last()
            .map(|r| (r.root_hash, r.n_nodes))
            .unwrap_or((self.prior.root_hash, self.prior.n_nodes))
    }

    pub fn intermediate_roots(&self) -> &[IntermediateRoot] {
        &self.roots
    }
}

impl DisputeEvidence for CycleEvidence {
    fn n_leaves(&self) -> u64 {
        self.log.len() as u64
    }

    fn justification_root(&self) -> Result<Hash> {
        Ok(self.justification.root_hash())
    }

    fn intermediate_proof(&self, index: u64) -> Result<JustificationProof> {
        self.justification.prove(index)
    }

    fn challenge_bundle(&self, index: u64) -> Result<ProofBundle> {
        let entry = self
            .log
            .get(index as usize)
            .ok_or_else(|| MinerError::NotFound(format!("log entry {}", index)))?;

        let mut state = self.start.fork();
        self.engine.replay(&mut state, &self.log, 0, index)?;
        let prior = match index {
            0 => None,
            d => Some(self.justification.prove(d - 1)?),
        };
        let post = self.justification.prove(index)?;
        let bundle = build_bundle(&state, &self.engine, entry, prior, post)?;

        verify_transition(
            &bundle,
            &self.justification.root_hash(),
            &self.prior,
            self.engine.skills(),
            entry,
        )?;
        Ok(bundle)
    }
}

// ==================== Client ====================

/// Result of one [`MiningClient::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing decided yet; call `step` again later
    Pending,
    /// The window closed (or the cycle moved on) before we submitted
    Missed,
    Resolved(Outcome),
}

struct ActiveCycle {
    info: CycleInfo,
    working: ReputationStore,
    controller: DisputeController<CycleEvidence>,
    submitted: bool,
    finalized: bool,
}

pub struct MiningClient<L> {
    ledger: Arc<L>,
    staker: Address,
    strategies: MinerStrategies,
    options: ClientOptions,
    store: ReputationStore,
    scheduler: SubmissionScheduler,
    cycle: Option<ActiveCycle>,
}

impl<L: LedgerClient> MiningClient<L> {
    pub fn new(
        ledger: Arc<L>,
        staker: Address,
        strategies: MinerStrategies,
        options: ClientOptions,
    ) -> Self {
        let store = ReputationStore::with_encoder(Arc::clone(&strategies.encoder))
            .with_max_checkpoints(options.max_checkpoints);
        let scheduler = SubmissionScheduler::with_selection(staker, Arc::clone(&strategies.selection));
        Self {
            ledger,
            staker,
            strategies,
            options,
            store,
            scheduler,
            cycle: None,
        }
    }

    /// Like [`new`](Self::new), starting from the persisted store if one
    /// exists at `options.store_path`.
    pub fn open(
        ledger: Arc<L>,
        staker: Address,
        strategies: MinerStrategies,
        options: ClientOptions,
    ) -> Result<Self> {
        let mut client = Self::new(ledger, staker, strategies, options);
        if let Some(path) = client.options.store_path.clone() {
            if let Some((store, cycle)) = ReputationStore::load(
                &path,
                Arc::clone(&client.strategies.encoder),
                client.options.max_checkpoints,
            )? {
                info!(cycle, root = %to_hex(&store.root_hash()), "Resuming from persisted store");
                client.store = store;
            }
        }
        Ok(client)
    }

    pub fn staker(&self) -> &Address {
        &self.staker
    }

    /// Confirmed local state
    pub fn store(&self) -> &ReputationStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn controller(&self) -> Option<&DisputeController<CycleEvidence>> {
        self.cycle.as_ref().map(|c| &c.controller)
    }

    /// Cycle currently being mined
    pub fn current_cycle(&self) -> Option<u64> {
        self.cycle.as_ref().map(|c| c.info.cycle)
    }

    /// Claimed (root, n_nodes) for the current cycle
    pub fn claim(&self) -> Option<(Hash, u64)> {
        self.cycle.as_ref().map(|c| c.controller.evidence().claim())
    }

    // ---------- ledger reads ----------

    async fn fetch_active_cycle(&self) -> Result<CycleInfo> {
        let ledger = &self.ledger;
        self.options
            .retry
            .run("activeCycle", move || ledger.active_cycle())
            .await
    }

    async fn fetch_confirmed(&self, cycle: u64) -> Result<ConfirmedState> {
        let ledger = &self.ledger;
        self.options
            .retry
            .run("confirmedState", move || ledger.confirmed_state(cycle))
            .await
    }

    async fn fetch_skills(&self) -> Result<SkillTree> {
        let ledger = &self.ledger;
        let retry = &self.options.retry;
        let count = retry.run("getSkillCount", move || ledger.skill_count()).await?;
        let skills = try_join_all(
            (1..=count).map(move |id| retry.run("getSkill", move || ledger.skill(id))),
        )
        .await?;
        SkillTree::from_skills(&skills)
    }

    async fn fetch_log(&self, cycle: u64) -> Result<Vec<UpdateLogEntry>> {
        let ledger = &self.ledger;
        let retry = &self.options.retry;
        let len = retry
            .run("getReputationUpdateLogLength", move || ledger.log_length(cycle))
            .await?;
        try_join_all((0..len).map(move |i| {
            retry.run("getReputationUpdateLogEntry", move || {
                ledger.log_entry(cycle, i)
            })
        }))
        .await
    }

    async fn chain_time(&self) -> Result<u64> {
        let ledger = &self.ledger;
        self.options
            .retry
            .run("chainTime", move || ledger.chain_time())
            .await
    }

    fn engine(&self, skills: SkillTree) -> ReplayEngine {
        ReplayEngine::with_strategy(skills, Arc::clone(&self.strategies.replay))
    }

    // ---------- sync ----------

    /// Bring the local store to the state the active cycle started from.
    ///
    /// Walks back from the active cycle to the newest confirmed state the
    /// store already holds (live or checkpointed), then replays forward,
    /// checking every replayed cycle against its confirmation. A mismatch is
    /// a consistency fault.
    pub async fn sync(&mut self) -> Result<ConfirmedState> {
        let active = self.fetch_active_cycle().await?.cycle;
        let target = self.fetch_confirmed(active).await?;
        if target.matches(&self.store.root_hash(), self.store.n_nodes()) {
            debug!(cycle = active, "Store already in sync");
            return Ok(target);
        }

        let mut from = None;
        for cycle in (0..=active).rev() {
            let confirmed = self.fetch_confirmed(cycle).await?;
            if confirmed.matches(&self.store.root_hash(), self.store.n_nodes()) {
                from = Some(cycle);
                break;
            }
            if self.store.has_checkpoint(&confirmed.root_hash) {
                self.store.restore(&confirmed.root_hash)?;
                if self.store.n_nodes() == confirmed.n_nodes {
                    from = Some(cycle);
                    break;
                }
            }
        }
        let from = match from {
            Some(cycle) => cycle,
            None => {
                warn!("No known confirmed state held locally, replaying from genesis");
                self.store.reset();
                0
            }
        };

        if from < active {
            let engine = self.engine(self.fetch_skills().await?);
            for cycle in from..active {
                let log = self.fetch_log(cycle).await?;
                let mut next = self.store.fork();
                engine.replay(&mut next, &log, 0, log.len() as u64)?;
                let confirmed = self.fetch_confirmed(cycle + 1).await?;
                if !confirmed.matches(&next.root_hash(), next.n_nodes()) {
                    error!(
                        cycle,
                        expected = %to_hex(&confirmed.root_hash),
                        actual = %to_hex(&next.root_hash()),
                        "Replay diverged from confirmed state"
                    );
                    return Err(MinerError::Consistency(format!(
                        "replay of cycle {} gives {}/{} but the ledger confirmed {}/{}",
                        cycle,
                        to_hex(&next.root_hash()),
                        next.n_nodes(),
                        to_hex(&confirmed.root_hash),
                        confirmed.n_nodes
                    )));
                }
                self.store.commit(&next);
                self.store.checkpoint();
            }
            self.persist(active)?;
        }

        info!(
            cycle = active,
            from,
            root = %to_hex(&self.store.root_hash()),
            n_nodes = self.store.n_nodes(),
            "Store synced"
        );
        Ok(target)
    }

    fn persist(&self, cycle: u64) -> Result<()> {
        match &self.options.store_path {
            Some(path) => self.store.flush(path, cycle),
            None => Ok(()),
        }
    }

    // ---------- cycle ----------

    /// Sync, then replay the active cycle's log and get ready to submit
    pub async fn prepare_cycle(&mut self) -> Result<CycleInfo> {
        let confirmed = self.sync().await?;
        let info = self.fetch_active_cycle().await?;
        let skills = self.fetch_skills().await?;
        let log = self.fetch_log(info.cycle).await?;
        let engine = self.engine(skills);

        let mut working = self.store.fork();
        let roots = engine.replay(&mut working, &log, 0, log.len() as u64)?;
        let evidence = CycleEvidence::new(self.store.fork(), engine, log, roots, confirmed.prior())?;
        let (root_hash, n_nodes) = evidence.claim();

        self.scheduler.begin_cycle(info.cycle);
        self.cycle = Some(ActiveCycle {
            info,
            working,
            controller: DisputeController::new(evidence),
            submitted: false,
            finalized: false,
        });
        info!(
            cycle = info.cycle,
            root = %to_hex(&root_hash),
            n_nodes,
            closes_at = info.window.closes_at(),
            "Cycle prepared"
        );
        Ok(info)
    }

    /// Advance the protocol by at most one transaction
    ///
    /// An `Eliminated` outcome, or `Lost` through invalidation, returns
    /// without adopting the confirmed state. The store only catches up on the
    /// next [`sync`](Self::sync), so call
    /// [`wait_for_next_cycle`](Self::wait_for_next_cycle) and then sync or
    /// prepare the next cycle.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        if self.cycle.is_none() {
            self.prepare_cycle().await?;
        }
        let Some(mut active) = self.cycle.take() else {
            return Err(MinerError::InvalidState("no cycle prepared".to_string()));
        };
        let result = self.step_cycle(&mut active).await;
        self.cycle = Some(active);
        result
    }

    async fn step_cycle(&mut self, active: &mut ActiveCycle) -> Result<StepOutcome> {
        if let Some(outcome) = active.controller.outcome() {
            return Ok(StepOutcome::Resolved(outcome));
        }
        if !active.submitted {
            return self.try_submit(active).await;
        }

        let current = self.fetch_active_cycle().await?;
        if current.cycle > active.info.cycle {
            let confirmed = self.fetch_confirmed(active.info.cycle + 1).await?;
            active.controller.on_event(DisputeEvent::Confirmed(confirmed));
            return self.finalize(active, &confirmed).await;
        }

        let observation = self.observe(active).await?;
        let actions = active
            .controller
            .on_event(DisputeEvent::Observed(Box::new(observation)));
        for action in &actions {
            self.execute(action).await?;
        }
        Ok(match active.controller.outcome() {
            Some(outcome) => StepOutcome::Resolved(outcome),
            None => StepOutcome::Pending,
        })
    }

    async fn try_submit(&mut self, active: &mut ActiveCycle) -> Result<StepOutcome> {
        let ledger = &self.ledger;
        let retry = &self.options.retry;
        let staker = &self.staker;
        let (now, current, stake, min_stake) = futures::try_join!(
            retry.run("chainTime", move || ledger.chain_time()),
            retry.run("activeCycle", move || ledger.active_cycle()),
            retry.run("stakeOf", move || ledger.stake_of(staker)),
            retry.run("minStake", move || ledger.min_stake()),
        )?;

        let window = active.info.window;
        if current.cycle != active.info.cycle || !window.is_open(now) {
            info!(cycle = active.info.cycle, now, "Mining window passed without a submission");
            return Ok(StepOutcome::Missed);
        }

        let (root_hash, n_nodes) = active.controller.evidence().claim();
        let Some(entry_index) =
            self.scheduler
                .plan(&window, now, stake, min_stake, &root_hash, n_nodes)?
        else {
            if let Some(at) =
                self.scheduler
                    .earliest_eligible_time(&window, stake, min_stake, &root_hash)
            {
                debug!(now, eligible_at = at, "No entry eligible yet");
            }
            return Ok(StepOutcome::Pending);
        };

        let root = &root_hash;
        let receipt = retry
            .run("submitRootHash", move || {
                ledger.submit_root_hash(staker, root, n_nodes, entry_index)
            })
            .await?;
        self.scheduler.record(root_hash, n_nodes, entry_index);
        active.submitted = true;
        active.controller.on_event(DisputeEvent::Submitted {
            round: receipt.round,
            index: receipt.index,
            root_hash,
            n_nodes,
        });
        Ok(StepOutcome::Pending)
    }

    async fn observe(&self, active: &ActiveCycle) -> Result<RoundObservation> {
        let Some((round, index)) = active.controller.position() else {
            return Err(MinerError::InvalidState(
                "submitted without a dispute position".to_string(),
            ));
        };
        let ledger = &self.ledger;
        let retry = &self.options.retry;

        let (now, me, round_len, status) = futures::try_join!(
            retry.run("chainTime", move || ledger.chain_time()),
            retry.run("disputeRounds", move || ledger.dispute_slot(round, index)),
            retry.run("getDisputeRoundLength", move || {
                ledger.dispute_round_length(round)
            }),
            retry.run("roundStatus", move || ledger.round_status(round)),
        )?;

        let opponent_index = me.opponent_index();
        let opponent = if opponent_index < round_len {
            Some(
                retry
                    .run("disputeRounds", move || {
                        ledger.dispute_slot(round, opponent_index)
                    })
                    .await?,
            )
        } else {
            None
        };

        let pair_unresolved = u64::from(!me.is_resolved())
            + u64::from(opponent.as_ref().is_some_and(|o| !o.is_resolved()));
        Ok(RoundObservation {
            now,
            round,
            index,
            me,
            opponent,
            round_len,
            round_closed_at: status.closed_at,
            others_resolved: status.unresolved.saturating_sub(pair_unresolved) == 0,
            challenge_timeout: active.info.challenge_timeout,
        })
    }

    /// Send one dispute transaction. A revert means the ledger state moved
    /// under us; the next observation decides again.
    async fn execute(&self, action: &DisputeAction) -> Result<()> {
        let ledger = &self.ledger;
        let from = &self.staker;
        let retry = &self.options.retry;
        let name = action.name();
        let result = match action {
            DisputeAction::SubmitJustificationRoot {
                round,
                index,
                justification_root,
                last_leaf,
            } => {
                retry
                    .run(name, move || {
                        ledger.submit_justification_root_hash(
                            from,
                            *round,
                            *index,
                            justification_root,
                            last_leaf.as_ref(),
                        )
                    })
                    .await
            }
            DisputeAction::RespondToBinarySearch {
                round,
                index,
                proof,
            } => {
                retry
                    .run(name, move || {
                        ledger.respond_to_binary_search(from, *round, *index, proof)
                    })
                    .await
            }
            DisputeAction::RespondToChallenge {
                round,
                index,
                bundle,
            } => {
                retry
                    .run(name, move || {
                        ledger.respond_to_challenge(from, *round, *index, bundle)
                    })
                    .await
            }
            DisputeAction::InvalidateHash { round, index } => {
                retry
                    .run(name, move || ledger.invalidate_hash(from, *round, *index))
                    .await
            }
            DisputeAction::ConfirmNewHash { round } => {
                retry
                    .run(name, move || ledger.confirm_new_hash(from, *round))
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(action = name, "Dispute transaction accepted");
                Ok(())
            }
            Err(MinerError::Revert(reason)) => {
                warn!(action = name, reason = %reason, "Dispute transaction reverted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt the confirmed state of the finished cycle
    async fn finalize(
        &mut self,
        active: &mut ActiveCycle,
        confirmed: &ConfirmedState,
    ) -> Result<StepOutcome> {
        let Some(outcome) = active.controller.outcome() else {
            return Ok(StepOutcome::Pending);
        };
        if active.finalized {
            return Ok(StepOutcome::Resolved(outcome));
        }

        if outcome == Outcome::Lost {
            // Replay once more from freshly fetched data before giving up on
            // the local state.
            warn!(
                cycle = active.info.cycle,
                confirmed = %to_hex(&confirmed.root_hash),
                "Another root hash was confirmed, re-replaying"
            );
            let skills = self.fetch_skills().await?;
            let log = self.fetch_log(active.info.cycle).await?;
            let mut fresh = self.store.fork();
            self.engine(skills)
                .replay(&mut fresh, &log, 0, log.len() as u64)?;
            if !confirmed.matches(&fresh.root_hash(), fresh.n_nodes()) {
                return Err(MinerError::Consistency(format!(
                    "cycle {} confirmed {}/{} which local replay cannot reproduce",
                    active.info.cycle,
                    to_hex(&confirmed.root_hash),
                    confirmed.n_nodes
                )));
            }
            active.working = fresh;
        }

        self.store.commit(&active.working);
        self.store.checkpoint();
        self.persist(confirmed.cycle)?;
        active.finalized = true;
        info!(
            cycle = active.info.cycle,
            outcome = %outcome,
            root = %to_hex(&confirmed.root_hash),
            n_nodes = confirmed.n_nodes,
            "Cycle finalized"
        );
        Ok(StepOutcome::Resolved(outcome))
    }

    /// Wait until the ledger moves past the cycle we mined
    pub async fn wait_for_next_cycle(&mut self) -> Result<u64> {
        let mined = self.current_cycle();
        loop {
            let info = self.fetch_active_cycle().await?;
            if mined.map_or(true, |c| info.cycle > c) {
                self.cycle = None;
                return Ok(info.cycle);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Mine the active cycle until our part in it is decided. Resumes the
    /// cycle already in progress, if any.
    pub async fn run_cycle(&mut self) -> Result<StepOutcome> {
        if self.cycle.is_none() {
            self.prepare_cycle().await?;
        }
        loop {
            match self.step().await? {
                StepOutcome::Pending => {}
                decided => return Ok(decided),
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Current chain time as seen through the retry policy
    pub async fn now(&self) -> Result<u64> {
        self.chain_time().await
    }
}
