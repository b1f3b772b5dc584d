//! Dispute controller
//!
//! Drives one submission through the dispute rounds of a cycle. The
//! controller is a pure transition function over polled ledger observations:
//! every [`RoundObservation`] is enough to derive the next action from
//! scratch, so a response lost in transit is re-issued unchanged on the next
//! poll.
//!
//! ```text
//! Idle -> Submitted -> AwaitingOpponent -> JustificationExchanged
//!      -> BinarySearching -> ChallengeResponse -> Resolved(Won | Lost | Eliminated)
//! ```
//!
//! Proofs come from an injected [`DisputeEvidence`] source.

use crate::challenge::ProofBundle;
use crate::codec::{to_hex, Hash};
use crate::error::Result;
use crate::justification::JustificationProof;
use crate::ledger::{ConfirmedState, DisputeSlot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Terminal result of a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Our root hash was confirmed
    Won,
    /// Invalidated after the opponent proved the disputed transition, or a
    /// different root hash was confirmed
    Lost,
    /// Invalidated by timeout or by a tie
    Eliminated,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Won => write!(f, "won"),
            Outcome::Lost => write!(f, "lost"),
            Outcome::Eliminated => write!(f, "eliminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeState {
    Idle,
    Submitted,
    AwaitingOpponent,
    JustificationExchanged,
    BinarySearching,
    ChallengeResponse,
    Resolved(Outcome),
}

/// Everything the controller needs to know about its round at one instant
#[derive(Debug, Clone)]
pub struct RoundObservation {
    /// Chain time
    pub now: u64,
    pub round: u64,
    pub index: u64,
    pub me: DisputeSlot,
    pub opponent: Option<DisputeSlot>,
    /// Slots in the round
    pub round_len: u64,
    pub round_closed_at: Option<u64>,
    /// Every slot of the round other than ours and our opponent's resolved
    pub others_resolved: bool,
    pub challenge_timeout: u64,
}

#[derive(Debug, Clone)]
pub enum DisputeEvent {
    /// Our claim landed in `round` at `index`
    Submitted {
        round: u64,
        index: u64,
        root_hash: Hash,
        n_nodes: u64,
    },
    Observed(Box<RoundObservation>),
    /// The cycle was confirmed
    Confirmed(ConfirmedState),
}

/// Ledger transaction requested by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeAction {
    SubmitJustificationRoot {
        round: u64,
        index: u64,
        justification_root: Hash,
        last_leaf: Option<JustificationProof>,
    },
    RespondToBinarySearch {
        round: u64,
        index: u64,
        proof: JustificationProof,
    },
    RespondToChallenge {
        round: u64,
        index: u64,
        bundle: Box<ProofBundle>,
    },
    InvalidateHash {
        round: u64,
        index: u64,
    },
    ConfirmNewHash {
        round: u64,
    },
}

impl DisputeAction {
    pub fn name(&self) -> &'static str {
        match self {
            DisputeAction::SubmitJustificationRoot { .. } => "submitJustificationRootHash",
            DisputeAction::RespondToBinarySearch { .. } => "respondToBinarySearchForChallenge",
            DisputeAction::RespondToChallenge { .. } => "respondToChallenge",
            DisputeAction::InvalidateHash { .. } => "invalidateHash",
            DisputeAction::ConfirmNewHash { .. } => "confirmNewHash",
        }
    }
}

/// Source of the proofs a dispute needs
pub trait DisputeEvidence {
    /// Number of justification leaves (the log length)
    fn n_leaves(&self) -> u64;

    fn justification_root(&self) -> Result<Hash>;

    fn intermediate_proof(&self, index: u64) -> Result<JustificationProof>;

    /// A bundle that has already been checked to prove the transition
    fn challenge_bundle(&self, index: u64) -> Result<ProofBundle>;
}

pub struct DisputeController<E> {
    evidence: E,
    state: DisputeState,
    position: Option<(u64, u64)>,
    claim: Option<(Hash, u64)>,
}

impl<E: DisputeEvidence> DisputeController<E> {
    pub fn new(evidence: E) -> Self {
        Self {
            evidence,
            state: DisputeState::Idle,
            position: None,
            claim: None,
        }
    }

    pub fn state(&self) -> DisputeState {
        self.state
    }

    /// Current (round, index) of our slot
    pub fn position(&self) -> Option<(u64, u64)> {
        self.position
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            DisputeState::Resolved(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn evidence(&self) -> &E {
        &self.evidence
    }

    pub fn on_event(&mut self, event: DisputeEvent) -> Vec<DisputeAction> {
        if self.outcome().is_some() {
            return Vec::new();
        }
        match event {
            DisputeEvent::Submitted {
                round,
                index,
                root_hash,
                n_nodes,
            } => {
                self.position = Some((round, index));
                self.claim = Some((root_hash, n_nodes));
                self.state = DisputeState::Submitted;
                debug!(round, index, "Submission registered");
                Vec::new()
            }
            DisputeEvent::Observed(observation) => self.on_observation(&observation),
            DisputeEvent::Confirmed(confirmed) => {
                let ours = self
                    .claim
                    .is_some_and(|(root, n)| confirmed.matches(&root, n));
                self.resolve(if ours { Outcome::Won } else { Outcome::Lost })
            }
        }
    }

    fn resolve(&mut self, outcome: Outcome) -> Vec<DisputeAction> {
        info!(outcome = %outcome, position = ?self.position, "Dispute resolved");
        self.state = DisputeState::Resolved(outcome);
        Vec::new()
    }

    fn on_observation(&mut self, obs: &RoundObservation) -> Vec<DisputeAction> {
        let me = &obs.me;

        if self.position != Some((obs.round, obs.index)) {
            // Stale observation of a slot we already left
            return Vec::new();
        }

        if let Some(next) = me.advanced_to {
            info!(from_round = obs.round, next_index = next, "Advanced to next round");
            self.position = Some((obs.round + 1, next));
            self.state = DisputeState::AwaitingOpponent;
            return Vec::new();
        }

        if me.invalidated {
            let outmatched = obs.opponent.as_ref().is_some_and(|opp| {
                me.search_finished()
                    && opp.challenge_proven
                    && opp.challenge_steps_completed > me.challenge_steps_completed
            });
            return self.resolve(if outmatched {
                Outcome::Lost
            } else {
                Outcome::Eliminated
            });
        }

        let Some(closed_at) = obs.round_closed_at else {
            self.state = DisputeState::AwaitingOpponent;
            return Vec::new();
        };

        match &obs.opponent {
            None => self.unpaired(obs),
            Some(opponent) => self.paired(obs, opponent, closed_at),
        }
    }

    /// Our slot has no opponent in this round
    fn unpaired(&mut self, obs: &RoundObservation) -> Vec<DisputeAction> {
        self.state = DisputeState::AwaitingOpponent;
        if obs.round_len == 1 {
            return vec![DisputeAction::ConfirmNewHash { round: obs.round }];
        }
        if obs.others_resolved {
            // The empty index next to us stands in for the missing opponent
            return vec![DisputeAction::InvalidateHash {
                round: obs.round,
                index: obs.me.opponent_index(),
            }];
        }
        Vec::new()
    }

    fn paired(
        &mut self,
        obs: &RoundObservation,
        opponent: &DisputeSlot,
        closed_at: u64,
    ) -> Vec<DisputeAction> {
        let me = &obs.me;
        let (round, index) = (obs.round, obs.index);
        let my_steps = me.challenge_steps_completed;
        let their_steps = opponent.challenge_steps_completed;

        if opponent.is_resolved() {
            // Our advancement lands in the same transaction; wait for it.
            return Vec::new();
        }

        if my_steps <= their_steps {
            if let Some(action) = self.next_response(obs, opponent) {
                return vec![action];
            }
        }

        // The side behind has `challenge_timeout` from our last response
        let opponent_deadline = me.last_response_at.max(closed_at) + obs.challenge_timeout;
        if my_steps > their_steps && obs.now >= opponent_deadline {
            info!(
                round,
                opponent = opponent.index,
                my_steps,
                their_steps,
                "Opponent timed out, invalidating"
            );
            return vec![DisputeAction::InvalidateHash {
                round,
                index: opponent.index,
            }];
        }

        let tie_deadline = me
            .last_response_at
            .max(opponent.last_response_at)
            .max(closed_at)
            + obs.challenge_timeout;
        if my_steps == their_steps && obs.now >= tie_deadline {
            warn!(round, index, steps = my_steps, "Tied and stuck, invalidating both");
            return vec![DisputeAction::InvalidateHash {
                round,
                index: opponent.index,
            }];
        }

        Vec::new()
    }

    /// The response we owe at this point of the protocol, if we can make one
    fn next_response(
        &mut self,
        obs: &RoundObservation,
        opponent: &DisputeSlot,
    ) -> Option<DisputeAction> {
        let me = &obs.me;
        let (round, index) = (obs.round, obs.index);

        if me.justification_root.is_none() {
            self.state = DisputeState::JustificationExchanged;
            let justification_root = self
                .evidence
                .justification_root()
                .map_err(|e| warn!(error = %e, "Cannot build justification root"))
                .ok()?;
            let last_leaf = match self.evidence.n_leaves() {
                0 => None,
                n => Some(
                    self.evidence
                        .intermediate_proof(n - 1)
                        .map_err(|e| warn!(error = %e, "Cannot prove last leaf"))
                        .ok()?,
                ),
            };
            debug!(round, index, jrh = %to_hex(&justification_root), "Submitting justification root");
            return Some(DisputeAction::SubmitJustificationRoot {
                round,
                index,
                justification_root,
                last_leaf,
            });
        }

        if opponent.justification_root.is_none() {
            self.state = DisputeState::JustificationExchanged;
            return None;
        }

        if !me.search_finished() {
            self.state = DisputeState::BinarySearching;
            let mid = me.midpoint();
            let proof = self
                .evidence
                .intermediate_proof(mid)
                .map_err(|e| warn!(error = %e, mid, "Cannot prove intermediate root"))
                .ok()?;
            debug!(
                round,
                index,
                lower = me.lower_bound,
                upper = me.upper_bound,
                mid,
                "Responding to binary search"
            );
            return Some(DisputeAction::RespondToBinarySearch {
                round,
                index,
                proof,
            });
        }

        self.state = DisputeState::ChallengeResponse;
        if me.challenge_proven {
            return None;
        }
        let disputed = me.lower_bound;
        match self.evidence.challenge_bundle(disputed) {
            Ok(bundle) => {
                info!(round, index, disputed, "Responding to challenge");
                Some(DisputeAction::RespondToChallenge {
                    round,
                    index,
                    bundle: Box::new(bundle),
                })
            }
            Err(e) => {
                warn!(
                    round,
                    index,
                    disputed,
                    error = %e,
                    "Cannot prove disputed transition"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MinerError;
    use crate::justification::JustificationTrie;
    use crate::replay::IntermediateRoot;
    use std::cell::Cell;

    struct FakeEvidence {
        trie: JustificationTrie,
        can_prove: bool,
        bundles_built: Cell<u32>,
    }

    impl FakeEvidence {
        fn new(n: u64, can_prove: bool) -> Self {
            let roots: Vec<_> = (0..n)
                .map(|i| IntermediateRoot {
                    log_index: i,
                    root_hash: [i as u8; 32],
                    n_nodes: i + 1,
                })
                .collect();
            Self {
                trie: JustificationTrie::build(&roots).unwrap(),
                can_prove,
                bundles_built: Cell::new(0),
            }
        }
    }

    impl DisputeEvidence for FakeEvidence {
        fn n_leaves(&self) -> u64 {
            self.trie.len()
        }

        fn justification_root(&self) -> Result<Hash> {
            Ok(self.trie.root_hash())
        }

        fn intermediate_proof(&self, index: u64) -> Result<JustificationProof> {
            self.trie.prove(index)
        }

        fn challenge_bundle(&self, index: u64) -> Result<ProofBundle> {
            if !self.can_prove {
                return Err(MinerError::InvalidProof("cannot prove".into()));
            }
            self.bundles_built.set(self.bundles_built.get() + 1);
            Ok(ProofBundle {
                log_index: index,
                entry: crate::replay::UpdateLogEntry::new([1u8; 20], 1, 1, [2u8; 20]),
                prior: None,
                post: self.trie.prove(index)?,
                witnesses: Vec::new(),
            })
        }
    }

    fn slot(index: u64, root: u8) -> DisputeSlot {
        DisputeSlot {
            round: 0,
            index,
            root_hash: [root; 32],
            n_nodes: 30,
            justification_root: None,
            lower_bound: 0,
            upper_bound: 29,
            challenge_steps_completed: 0,
            last_response_at: 0,
            pending_leaf: None,
            challenge_proven: false,
            invalidated: false,
            advanced_to: None,
            stakers: vec![[index as u8; 20]],
        }
    }

    fn observe(me: DisputeSlot, opponent: Option<DisputeSlot>, now: u64) -> DisputeEvent {
        DisputeEvent::Observed(Box::new(RoundObservation {
            now,
            round: 0,
            index: me.index,
            round_len: if opponent.is_some() { 2 } else { 1 },
            me,
            opponent,
            round_closed_at: Some(100),
            others_resolved: true,
            challenge_timeout: 50,
        }))
    }

    fn controller(can_prove: bool) -> DisputeController<FakeEvidence> {
        let mut c = DisputeController::new(FakeEvidence::new(30, can_prove));
        c.on_event(DisputeEvent::Submitted {
            round: 0,
            index: 0,
            root_hash: [1u8; 32],
            n_nodes: 30,
        });
        c
    }

    #[test]
    fn test_waits_while_round_open() {
        let mut c = controller(true);
        let mut event = observe(slot(0, 1), Some(slot(1, 2)), 10);
        if let DisputeEvent::Observed(obs) = &mut event {
            obs.round_closed_at = None;
        }
        assert!(c.on_event(event).is_empty());
        assert_eq!(c.state(), DisputeState::AwaitingOpponent);
    }

    #[test]
    fn test_sole_slot_confirms() {
        let mut c = controller(true);
        let actions = c.on_event(observe(slot(0, 1), None, 200));
        assert_eq!(actions, vec![DisputeAction::ConfirmNewHash { round: 0 }]);
    }

    #[test]
    fn test_submits_justification_with_last_leaf() {
        let mut c = controller(true);
        let actions = c.on_event(observe(slot(0, 1), Some(slot(1, 2)), 110));
        match &actions[..] {
            [DisputeAction::SubmitJustificationRoot { last_leaf: Some(leaf), .. }] => {
                assert_eq!(leaf.leaf.index, 29);
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(c.state(), DisputeState::JustificationExchanged);
    }

    #[test]
    fn test_responds_at_midpoint_and_is_idempotent() {
        let mut c = controller(true);
        let mut me = slot(0, 1);
        let mut opp = slot(1, 2);
        me.justification_root = Some(c.evidence().justification_root().unwrap());
        opp.justification_root = Some([9u8; 32]);
        me.challenge_steps_completed = 1;
        opp.challenge_steps_completed = 1;

        let first = c.on_event(observe(me.clone(), Some(opp.clone()), 120));
        let second = c.on_event(observe(me, Some(opp), 121));
        assert_eq!(first, second);
        match &first[..] {
            [DisputeAction::RespondToBinarySearch { proof, .. }] => assert_eq!(proof.leaf.index, 14),
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(c.state(), DisputeState::BinarySearching);
    }

    #[test]
    fn test_does_not_respond_while_ahead() {
        let mut c = controller(true);
        let mut me = slot(0, 1);
        let mut opp = slot(1, 2);
        me.justification_root = Some([8u8; 32]);
        opp.justification_root = Some([9u8; 32]);
        me.challenge_steps_completed = 3;
        opp.challenge_steps_completed = 2;
        me.last_response_at = 130;
        opp.last_response_at = 110;

        assert!(c.on_event(observe(me.clone(), Some(opp.clone()), 150)).is_empty());
        let actions = c.on_event(observe(me, Some(opp), 180));
        assert_eq!(actions, vec![DisputeAction::InvalidateHash { round: 0, index: 1 }]);
    }

    #[test]
    fn test_challenge_response_when_provable() {
        let mut c = controller(true);
        let mut me = slot(0, 1);
        let mut opp = slot(1, 2);
        for s in [&mut me, &mut opp] {
            s.justification_root = Some([8u8; 32]);
            s.lower_bound = 7;
            s.upper_bound = 7;
            s.challenge_steps_completed = 6;
        }
        let actions = c.on_event(observe(me, Some(opp), 200));
        assert!(matches!(
            &actions[..],
            [DisputeAction::RespondToChallenge { bundle, .. }] if bundle.log_index == 7
        ));
        assert_eq!(c.state(), DisputeState::ChallengeResponse);
    }

    #[test]
    fn test_unprovable_challenge_waits_then_ties() {
        let mut c = controller(false);
        let mut me = slot(0, 1);
        let mut opp = slot(1, 2);
        for s in [&mut me, &mut opp] {
            s.justification_root = Some([8u8; 32]);
            s.lower_bound = 7;
            s.upper_bound = 7;
            s.challenge_steps_completed = 6;
            s.last_response_at = 300;
        }
        assert!(c.on_event(observe(me.clone(), Some(opp.clone()), 320)).is_empty());
        let actions = c.on_event(observe(me, Some(opp), 350));
        assert_eq!(actions, vec![DisputeAction::InvalidateHash { round: 0, index: 1 }]);
    }

    #[test]
    fn test_invalidated_after_losing_challenge_is_lost() {
        let mut c = controller(false);
        let mut me = slot(0, 1);
        let mut opp = slot(1, 2);
        for s in [&mut me, &mut opp] {
            s.justification_root = Some([8u8; 32]);
            s.lower_bound = 7;
            s.upper_bound = 7;
            s.challenge_steps_completed = 6;
        }
        opp.challenge_steps_completed = 7;
        opp.challenge_proven = true;
        me.invalidated = true;
        c.on_event(observe(me, Some(opp), 400));
        assert_eq!(c.outcome(), Some(Outcome::Lost));
    }

    #[test]
    fn test_invalidated_by_timeout_is_eliminated() {
        let mut c = controller(true);
        let mut me = slot(0, 1);
        me.invalidated = true;
        c.on_event(observe(me, Some(slot(1, 2)), 400));
        assert_eq!(c.outcome(), Some(Outcome::Eliminated));
    }

    #[test]
    fn test_advancement_moves_position() {
        let mut c = controller(true);
        let mut me = slot(0, 1);
        me.advanced_to = Some(3);
        assert!(c.on_event(observe(me, None, 400)).is_empty());
        assert_eq!(c.position(), Some((1, 3)));
    }

    #[test]
    fn test_confirmation_decides_outcome() {
        let mut c = controller(true);
        c.on_event(DisputeEvent::Confirmed(ConfirmedState {
            cycle: 1,
            root_hash: [1u8; 32],
            n_nodes: 30,
        }));
        assert_eq!(c.outcome(), Some(Outcome::Won));
        // terminal states ignore further events
        assert!(c.on_event(observe(slot(0, 1), None, 600)).is_empty());

        let mut other = controller(true);
        other.on_event(DisputeEvent::Confirmed(ConfirmedState {
            cycle: 1,
            root_hash: [1u8; 32],
            n_nodes: 31,
        }));
        assert_eq!(other.outcome(), Some(Outcome::Lost));
    }

    #[test]
    fn test_bye_waits_for_other_pairings() {
        let mut c = DisputeController::new(FakeEvidence::new(30, true));
        c.on_event(DisputeEvent::Submitted {
            round: 0,
            index: 2,
            root_hash: [1u8; 32],
            n_nodes: 30,
        });
        let mut event = observe(slot(2, 1), None, 200);
        if let DisputeEvent::Observed(obs) = &mut event {
            obs.round_len = 3;
            obs.others_resolved = false;
        }
        assert!(c.on_event(event).is_empty());

        let mut event = observe(slot(2, 1), None, 300);
        if let DisputeEvent::Observed(obs) = &mut event {
            obs.round_len = 3;
        }
        assert_eq!(
            c.on_event(event),
            vec![DisputeAction::InvalidateHash { round: 0, index: 3 }]
        );
    }
}
