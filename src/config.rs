use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Prefixed address length in bytes: 3-byte prefix + 40 hex chars.
pub const ADDRESS_SIZE: usize = 43;
pub const COIN_PREFIX: &str = "gBx";
pub const CONTRACT_PREFIX: &str = "gBc";

/// Recipient sentinel marking a contract-creation transaction.
pub const CREATE_CONTRACT: &str = "";

pub const CHAIN_VERSION: u64 = 1;

/// Fee rates in base units.
pub const FEE_EXECUTE: u64 = 10;
pub const FEE_CREATE: u64 = 100;
pub const FEE_CALL: u64 = 50;

/// Maximum transactions drafted into one candidate block.
pub const TX_BATCH: usize = 60;

/// Transactions older than this are not admitted to the mempool.
pub const TX_FRESH_WINDOW_US: u64 = 600 * 1_000_000;

/// Half-width added above the candidate time-window datum, in microseconds.
pub const CANDIDATE_TIME_SLACK_US: u64 = 500_000;

pub const CANDIDATE_WAIT: Duration = Duration::from_secs(3);
pub const VOTE_WAIT: Duration = Duration::from_secs(2);
pub const CONFIRM_WAIT: Duration = Duration::from_secs(2);
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
pub const ROUND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Reserved state-db key holding the validator stake minimum.
pub const MINIMUM_KEY: &[u8] = b"minimum";
/// Reserved chain-db key holding the current top height.
pub const TOP_HEADER_KEY: &[u8] = b"top_header";
/// Raw key whose trie key holds the registered validator list.
pub const CONSTANT_REP: &[u8] = b"constant_rep";

/// Current wall clock in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
