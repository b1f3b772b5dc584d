//! Error types for the reputation miner

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, MinerError>;

/// Reputation miner error types
///
/// Variants fall into four classes: local validation errors (rejected before
/// any transaction is issued), transport errors (retried with backoff),
/// deterministic ledger reverts (surfaced immediately) and consistency faults
/// (fatal, the local state has diverged from the ledger).
#[derive(Error, Debug)]
pub enum MinerError {
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    #[error("Invalid value format: {0}")]
    InvalidValue(String),

    #[error("Negative reputation rejected for {key}: {amount}")]
    NegativeReputation { key: String, amount: i128 },

    #[error("Entry {entry_index} already used for this submission")]
    EntryReused { entry_index: u64 },

    #[error("Conflicting submission: already submitted {submitted} this cycle")]
    ConflictingSubmission { submitted: String },

    #[error("No eligible entry: {0}")]
    NotEligible(String),

    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Ledger reverted: {0}")]
    Revert(String),

    #[error("Consistency fault: {0}")]
    Consistency(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl MinerError {
    /// Whether the failed operation may succeed if issued again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MinerError::Transport(_) | MinerError::Timeout(_))
    }

    /// Whether this error means local state can no longer be trusted.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, MinerError::Consistency(_))
    }
}

impl From<std::io::Error> for MinerError {
    fn from(err: std::io::Error) -> Self {
        MinerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MinerError {
    fn from(err: serde_json::Error) -> Self {
        MinerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MinerError {
    fn from(err: toml::de::Error) -> Self {
        MinerError::Config(err.to_string())
    }
}

impl From<hex::FromHexError> for MinerError {
    fn from(err: hex::FromHexError) -> Self {
        MinerError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MinerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MinerError::Timeout(err.to_string())
        } else {
            MinerError::Transport(err.to_string())
        }
    }
}
