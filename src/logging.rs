//! Tracing setup for the miner binary

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "reputation_miner=debug,info";

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
