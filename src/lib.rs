//! Reputation Miner
//!
//! Off-chain mining client for a ledger that stores reputation as a Patricia
//! trie root. Each cycle the miner replays the ledger's append-only update
//! log, submits the resulting root hash, and defends it against conflicting
//! submissions through a binary-search dispute down to a single disputed log
//! entry, which is then proven key by key.
//!
//! ## Module Structure
//!
//! - `codec`: hashing, key/value encodings, hex helpers
//! - `trie`: Patricia trie with inclusion and absence proofs
//! - `skills`: skill hierarchy (ancestors, descendants)
//! - `reputation`: reputation store with checkpoints and persistence
//! - `storage`: on-disk store file format
//! - `replay`: deterministic log replay
//! - `justification`: justification trie over intermediate roots
//! - `challenge`: proof bundles for a disputed transition
//! - `scheduler`: submission eligibility and entry planning
//! - `dispute`: dispute state machine
//! - `ledger`: ledger call contract, JSON-RPC client, simulated ledger
//! - `client`: mining client tying it all together
//! - `retry`, `config`, `logging`: ambient plumbing

// ============================================================================
// CORE
// ============================================================================

pub mod codec;
pub mod error;
pub mod skills;
pub mod trie;

// ============================================================================
// STATE
// ============================================================================

pub mod reputation;
pub mod storage;

// ============================================================================
// PROTOCOL
// ============================================================================

pub mod challenge;
pub mod dispute;
pub mod justification;
pub mod replay;
pub mod scheduler;

// ============================================================================
// LEDGER & CLIENT
// ============================================================================

pub mod client;
pub mod ledger;

// ============================================================================
// PLUMBING
// ============================================================================

pub mod config;
pub mod logging;
pub mod retry;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use challenge::{build_bundle, verify_transition, KeyWitness, PriorState, ProofBundle};
pub use client::{ClientOptions, CycleEvidence, MinerStrategies, MiningClient, StepOutcome};
pub use codec::{
    Address, Hash, LedgerEncoding, ReputationEntry, ReputationKey, ValueEncoder, EMPTY_ROOT,
};
pub use config::MinerConfig;
pub use dispute::{
    DisputeAction, DisputeController, DisputeEvent, DisputeEvidence, DisputeState, Outcome,
    RoundObservation,
};
pub use error::{MinerError, Result};
pub use justification::{JustificationLeaf, JustificationProof, JustificationTrie};
pub use ledger::{
    ConfirmedState, CycleInfo, DisputeSlot, JsonRpcLedgerClient, LedgerClient, RoundStatus,
    SimulatedLedger, SimulatedLedgerConfig, SubmissionReceipt,
};
pub use replay::{
    CorrectReplay, IntermediateRoot, KeyUpdate, ReplayEngine, ReplayStrategy, UpdateLogEntry,
};
pub use reputation::ReputationStore;
pub use retry::RetryPolicy;
pub use scheduler::{
    EntryCandidate, EntrySelection, FirstEligible, MiningWindow, SubmissionScheduler,
};
pub use skills::{Skill, SkillTree};
pub use trie::{AbsenceProof, InclusionProof, PatriciaTrie, TrieProof};
