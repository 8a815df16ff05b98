use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::trie::TrieError;

/// Error taxonomy the round loop dispatches on. Validation errors drop
/// the offending item and the round continues; round errors abort the
/// round; finalize errors put the node into sync mode.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("fee limit exceeded: {0}")]
    FeeLimited(String),
    #[error("round: {0}")]
    Round(String),
    #[error("finalize: {0}")]
    Finalize(String),
    #[error("state cache: {0}")]
    Cache(String),
    #[error("serialize: {0}")]
    Serialize(String),
    #[error("finalize queue backlog")]
    Backlog,
    #[error("missing chain entry: {0}")]
    Missing(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("trie: {0}")]
    Trie(#[from] TrieError),
}

impl From<CryptoError> for ChainError {
    fn from(err: CryptoError) -> Self {
        ChainError::Validation(err.to_string())
    }
}

impl From<bincode::Error> for ChainError {
    fn from(err: bincode::Error) -> Self {
        ChainError::Serialize(err.to_string())
    }
}
