//! Miner Configuration
//!
//! Loaded from an optional TOML file, then overridden by
//! `REPUTATION_MINER_*` environment variables:
//! - `REPUTATION_MINER_STAKER` - hex address the miner submits as
//! - `REPUTATION_MINER_LEDGER_URL` - JSON-RPC endpoint of the ledger gateway
//! - `REPUTATION_MINER_STORE_PATH` - where the confirmed state is persisted
//! - `REPUTATION_MINER_POLL_INTERVAL_MS`
//! - `REPUTATION_MINER_REQUEST_TIMEOUT_MS`
//! - `REPUTATION_MINER_MAX_CHECKPOINTS`
//! - `REPUTATION_MINER_RETRY_MAX_ATTEMPTS`

use crate::codec::{parse_address, Address};
use crate::error::{MinerError, Result};
use crate::reputation::DEFAULT_MAX_CHECKPOINTS;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "REPUTATION_MINER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Hex address of the staker this miner submits for
    pub staker: String,
    pub ledger_url: String,
    pub store_path: PathBuf,
    /// Delay between protocol steps
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Reputation states kept for restore
    pub max_checkpoints: usize,
    pub retry: RetryPolicy,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            staker: String::new(),
            ledger_url: "http://127.0.0.1:8545".to_string(),
            store_path: PathBuf::from("reputation-state.json"),
            poll_interval_ms: 2_000,
            request_timeout_ms: 10_000,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            retry: RetryPolicy::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            MinerError::Config(format!("{}{} is not valid: {}", ENV_PREFIX, name, raw))
        }),
        None => Ok(None),
    }
}

impl MinerConfig {
    /// Load from `path` (if given) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MinerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(staker) = env_var("STAKER") {
            self.staker = staker;
        }
        if let Some(url) = env_var("LEDGER_URL") {
            self.ledger_url = url;
        }
        if let Some(path) = env_var("STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(ms) = env_parse("POLL_INTERVAL_MS")? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = env_parse("REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = ms;
        }
        if let Some(n) = env_parse("MAX_CHECKPOINTS")? {
            self.max_checkpoints = n;
        }
        if let Some(n) = env_parse("RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.staker_address()?;
        if !(self.ledger_url.starts_with("http://") || self.ledger_url.starts_with("https://")) {
            return Err(MinerError::Config(format!(
                "ledger_url must be an http(s) URL: {}",
                self.ledger_url
            )));
        }
        if self.max_checkpoints == 0 {
            return Err(MinerError::Config(
                "max_checkpoints must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MinerError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(MinerError::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn staker_address(&self) -> Result<Address> {
        if self.staker.is_empty() {
            return Err(MinerError::Config("staker address is not set".to_string()));
        }
        parse_address(&self.staker).map_err(|e| MinerError::Config(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const STAKER: &str = "0x1111111111111111111111111111111111111111";

    fn clear_env() {
        for name in [
            "STAKER",
            "LEDGER_URL",
            "STORE_PATH",
            "POLL_INTERVAL_MS",
            "REQUEST_TIMEOUT_MS",
            "MAX_CHECKPOINTS",
            "RETRY_MAX_ATTEMPTS",
        ] {
            std::env::remove_var(format!("{}{}", ENV_PREFIX, name));
        }
    }

    #[test]
    #[serial]
    fn test_missing_staker_rejected() {
        clear_env();
        let err = MinerConfig::load(None).unwrap_err();
        assert!(matches!(err, MinerError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
staker = "{}"
ledger_url = "http://ledger:9000"
poll_interval_ms = 500

[retry]
max_attempts = 7
base_delay_ms = 10
max_delay_ms = 100
"#,
            STAKER
        )
        .unwrap();

        let config = MinerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.ledger_url, "http://ledger:9000");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.max_checkpoints, DEFAULT_MAX_CHECKPOINTS);
        assert_eq!(config.staker_address().unwrap(), [0x11; 20]);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "staker = \"{}\"\npoll_interval_ms = 500", STAKER).unwrap();
        std::env::set_var("REPUTATION_MINER_POLL_INTERVAL_MS", "250");
        std::env::set_var("REPUTATION_MINER_STORE_PATH", "/tmp/miner/state.json");

        let config = MinerConfig::load(Some(file.path())).unwrap();
        clear_env();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.store_path, PathBuf::from("/tmp/miner/state.json"));
    }

    #[test]
    #[serial]
    fn test_bad_env_number_rejected() {
        clear_env();
        std::env::set_var("REPUTATION_MINER_STAKER", STAKER);
        std::env::set_var("REPUTATION_MINER_MAX_CHECKPOINTS", "many");
        let err = MinerConfig::load(None).unwrap_err();
        clear_env();
        assert!(err.to_string().contains("MAX_CHECKPOINTS"));
    }

    #[test]
    #[serial]
    fn test_invalid_url_rejected() {
        clear_env();
        let config = MinerConfig {
            staker: STAKER.to_string(),
            ledger_url: "ledger:9000".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
