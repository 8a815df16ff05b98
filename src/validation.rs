use crate::config::{ADDRESS_SIZE, COIN_PREFIX, CONTRACT_PREFIX};
use crate::crypto::{verify, Address};
use crate::error::ChainError;
use crate::trie::make_hash_root;
use crate::types::{Block, Transaction, ValidatorRecord, Vote};

pub fn validate_address(address: &Address) -> Result<(), ChainError> {
    let value = address.as_str();
    if !value.starts_with(COIN_PREFIX) && !value.starts_with(CONTRACT_PREFIX) {
        return Err(ChainError::Validation(format!(
            "address not allowed {}",
            value
        )));
    }
    if value.len() != ADDRESS_SIZE {
        return Err(ChainError::Validation(format!(
            "address length {}, expected {}: {}",
            value.len(),
            ADDRESS_SIZE,
            value
        )));
    }
    Ok(())
}

pub fn validate_contract(address: &Address) -> Result<(), ChainError> {
    if !address.as_str().starts_with(CONTRACT_PREFIX) {
        return Err(ChainError::Validation(format!(
            "not a contract address {}",
            address
        )));
    }
    if address.as_str().len() != ADDRESS_SIZE {
        return Err(ChainError::Validation(format!(
            "contract address length {}, expected {}",
            address.as_str().len(),
            ADDRESS_SIZE
        )));
    }
    Ok(())
}

pub fn validate_payable(transaction: &Transaction, balance: u64) -> Result<(), ChainError> {
    let total = transaction.value.saturating_add(transaction.fee);
    if balance < total {
        return Err(ChainError::Validation(format!(
            "payment refused, amount total paid: {}, account balance: {}",
            total, balance
        )));
    }
    Ok(())
}

pub fn validate_nonce(expected: u64, actual: u64) -> Result<(), ChainError> {
    if expected != actual {
        return Err(ChainError::Validation(format!(
            "account nonce: {}, execute context nonce: {}",
            actual, expected
        )));
    }
    Ok(())
}

/// Transaction hash and signature checks.
pub fn validate_transaction(transaction: &Transaction) -> Result<(), ChainError> {
    let digest = transaction.digest();
    if transaction.tx_hash != digest {
        return Err(ChainError::Validation(format!(
            "transaction hash: {}, digest: {}",
            transaction.tx_hash, digest
        )));
    }
    verify(&digest, &transaction.signature, &transaction.sender)?;
    Ok(())
}

/// Candidate block checks: pre-hash equality, creator signature and
/// transaction-root recomputation.
pub fn validate_candidate(block: &Block) -> Result<(), ChainError> {
    let pre_hash = block.pre_hash();
    if pre_hash != block.header.candidate_block_hash {
        return Err(ChainError::Validation(format!(
            "candidate hash: {}, header candidate hash: {}",
            pre_hash, block.header.candidate_block_hash
        )));
    }
    verify(&pre_hash, &block.header.signature, &block.header.creator)?;

    let trie = make_hash_root(&block.transaction_list)?;
    if trie.root() != &block.header.tx_root_hash {
        return Err(ChainError::Validation(format!(
            "block tx root: {}, digest tx root: {}",
            block.header.tx_root_hash,
            trie.root()
        )));
    }
    Ok(())
}

pub fn validate_vote(vote: &Vote) -> Result<(), ChainError> {
    let digest = vote.digest();
    if vote.vote_hash != digest {
        return Err(ChainError::Validation(format!(
            "vote hash: {}, digest: {}",
            vote.vote_hash, digest
        )));
    }
    verify(&digest, &vote.signature, &vote.creator)?;
    Ok(())
}

/// Finalize block checks: sealed block hash and creator signature.
pub fn validate_finalize(block: &Block) -> Result<(), ChainError> {
    let digest = block.hash();
    if digest != block.header.block_hash {
        return Err(ChainError::Validation(format!(
            "finalize hash: {}, digest: {}",
            block.header.block_hash, digest
        )));
    }
    verify(&digest, &block.header.signature, &block.header.creator)?;
    Ok(())
}

/// Every sender must be a registered validator account.
pub fn validate_validator_set(
    senders: &[Address],
    validators: &[ValidatorRecord],
) -> Result<(), ChainError> {
    for sender in senders {
        if !validators.iter().any(|rep| &rep.account == sender) {
            return Err(ChainError::Validation(format!(
                "{} not in validator set of {}",
                sender,
                validators.len()
            )));
        }
    }
    Ok(())
}
