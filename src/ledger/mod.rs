//! Ledger contract boundary
//!
//! [`LedgerClient`] is the call contract of the external reputation-mining
//! ledger. Views read the active cycle's state; transactions carry the
//! sender address and either apply completely or fail with
//! [`MinerError::Revert`](crate::error::MinerError::Revert).
//!
//! Two implementations ship with the crate:
//! - [`JsonRpcLedgerClient`], JSON-RPC 2.0 over HTTP to a ledger gateway
//! - [`SimulatedLedger`], an in-process chain with a manual clock that
//!   enforces the same acceptance rules, for tests and local simulations

pub mod rpc;
pub mod simulated;

pub use rpc::JsonRpcLedgerClient;
pub use simulated::{SimulatedLedger, SimulatedLedgerConfig};

use crate::challenge::{PriorState, ProofBundle};
use crate::codec::{hex_serde, Address, Hash};
use crate::error::Result;
use crate::justification::{JustificationLeaf, JustificationProof};
use crate::replay::UpdateLogEntry;
use crate::scheduler::MiningWindow;
use crate::skills::Skill;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ==================== Ledger Types ====================

/// The cycle currently being mined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub cycle: u64,
    pub window: MiningWindow,
    /// Seconds a side has to respond before it can be invalidated
    pub challenge_timeout: u64,
}

/// State a cycle started from (the previous cycle's confirmed result)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub cycle: u64,
    #[serde(with = "hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
}

impl ConfirmedState {
    pub fn genesis() -> Self {
        Self {
            cycle: 0,
            root_hash: crate::codec::EMPTY_ROOT,
            n_nodes: 0,
        }
    }

    pub fn prior(&self) -> PriorState {
        PriorState {
            root_hash: self.root_hash,
            n_nodes: self.n_nodes,
        }
    }

    pub fn matches(&self, root_hash: &Hash, n_nodes: u64) -> bool {
        &self.root_hash == root_hash && self.n_nodes == n_nodes
    }
}

/// One submission slot of a dispute round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeSlot {
    pub round: u64,
    pub index: u64,
    #[serde(with = "hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
    #[serde(with = "hex_serde::option")]
    pub justification_root: Option<Hash>,
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub challenge_steps_completed: u64,
    /// Chain time of this slot's last accepted response
    pub last_response_at: u64,
    /// Leaf submitted for the binary-search step not yet answered by the
    /// opponent
    pub pending_leaf: Option<JustificationLeaf>,
    pub challenge_proven: bool,
    pub invalidated: bool,
    /// Index in the next round once this slot won its pairing
    pub advanced_to: Option<u64>,
    #[serde(with = "hex_serde::addresses")]
    pub stakers: Vec<Address>,
}

impl DisputeSlot {
    pub fn opponent_index(&self) -> u64 {
        self.index ^ 1
    }

    pub fn is_resolved(&self) -> bool {
        self.invalidated || self.advanced_to.is_some()
    }

    /// Binary search has isolated a single log index
    pub fn search_finished(&self) -> bool {
        self.justification_root.is_some() && self.lower_bound >= self.upper_bound
    }

    /// Log index probed by the next binary-search response
    pub fn midpoint(&self) -> u64 {
        self.lower_bound + (self.upper_bound - self.lower_bound) / 2
    }
}

/// Summary of a dispute round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub round: u64,
    /// Chain time the round closed, `None` while it is still open
    pub closed_at: Option<u64>,
    pub slots: u64,
    pub unresolved: u64,
}

/// Where a root-hash submission landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub round: u64,
    pub index: u64,
}

// ==================== Call Contract ====================

#[async_trait]
pub trait LedgerClient: Send + Sync {
    // ----- views -----

    async fn chain_time(&self) -> Result<u64>;

    async fn active_cycle(&self) -> Result<CycleInfo>;

    /// State cycle `cycle` started from
    async fn confirmed_state(&self, cycle: u64) -> Result<ConfirmedState>;

    async fn skill_count(&self) -> Result<u64>;

    async fn skill(&self, skill_id: u64) -> Result<Skill>;

    async fn stake_of(&self, staker: &Address) -> Result<u128>;

    async fn min_stake(&self) -> Result<u128>;

    async fn log_length(&self, cycle: u64) -> Result<u64>;

    async fn log_entry(&self, cycle: u64, index: u64) -> Result<UpdateLogEntry>;

    async fn dispute_round_length(&self, round: u64) -> Result<u64>;

    async fn dispute_slot(&self, round: u64, index: u64) -> Result<DisputeSlot>;

    async fn round_status(&self, round: u64) -> Result<RoundStatus>;

    // ----- transactions -----

    async fn submit_root_hash(
        &self,
        from: &Address,
        root_hash: &Hash,
        n_nodes: u64,
        entry_index: u64,
    ) -> Result<SubmissionReceipt>;

    async fn confirm_new_hash(&self, from: &Address, round: u64) -> Result<()>;

    async fn invalidate_hash(&self, from: &Address, round: u64, index: u64) -> Result<()>;

    /// `last_leaf` proves the final intermediate root; `None` only for an
    /// empty log
    async fn submit_justification_root_hash(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        justification_root: &Hash,
        last_leaf: Option<&JustificationProof>,
    ) -> Result<()>;

    async fn respond_to_binary_search(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        proof: &JustificationProof,
    ) -> Result<()>;

    async fn respond_to_challenge(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        bundle: &ProofBundle,
    ) -> Result<()>;
}
