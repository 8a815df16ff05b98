use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::crypto::{Address, Hash};
use crate::error::ChainError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    pub validator_id: String,
    pub signature: String,
}

/// Genesis constants. Boot recomputes the genesis block from these and
/// fails when the expected block hash or state root disagrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub version: u64,
    pub minimum: u64,
    pub creator: Address,
    pub published_balance: u64,
    pub validators: Vec<GenesisValidator>,
    pub block_hash: Hash,
    pub state_root: Hash,
}

impl GenesisConfig {
    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChainError::Serialize(format!("genesis read: {}", e)))?;
        serde_json::from_str(&raw).map_err(|e| ChainError::Serialize(e.to_string()))
    }
}
