use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::{sha3_hex, Address, Hash};
use crate::error::ChainError;

/// Hash of record fields: the comma-joined decimal/string rendering of
/// each field, in declaration order, digested with SHA3-256.
fn join_hash(fields: &[String]) -> Hash {
    sha3_hex(fields.join(",").as_bytes())
}

// -----------------------------------------------------------------------------
// Transaction
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    pub version: u64,
    #[serde(rename = "type")]
    pub tx_type: String,
    #[serde(rename = "from")]
    pub sender: Address,
    #[serde(rename = "to")]
    pub recipient: Address,
    pub value: u64,
    pub fee: u64,
    pub message: String,
    pub timestamp: u64,
    pub tx_hash: Hash,
    pub signature: String,
}

impl Transaction {
    /// Digest of all fields preceding `tx_hash`.
    pub fn digest(&self) -> Hash {
        join_hash(&[
            self.version.to_string(),
            self.tx_type.clone(),
            self.sender.to_string(),
            self.recipient.to_string(),
            self.value.to_string(),
            self.fee.to_string(),
            self.message.clone(),
            self.timestamp.to_string(),
        ])
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string(self).map_err(|e| ChainError::Serialize(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ChainError> {
        serde_json::from_str(raw).map_err(|e| ChainError::Serialize(e.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Vote
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Vote {
    pub version: u64,
    pub block_height: u64,
    pub candidate_block_hash: Hash,
    pub creator: Address,
    pub vote_hash: Hash,
    pub signature: String,
}

impl Vote {
    pub fn digest(&self) -> Hash {
        join_hash(&[
            self.version.to_string(),
            self.block_height.to_string(),
            self.candidate_block_hash.to_string(),
            self.creator.to_string(),
        ])
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string(self).map_err(|e| ChainError::Serialize(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ChainError> {
        serde_json::from_str(raw).map_err(|e| ChainError::Serialize(e.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Receipt
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Completed,
    Cancel,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiptStatus::Completed => f.write_str("completed"),
            ReceiptStatus::Cancel => f.write_str("cancel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub height: u64,
    pub fee_limit: u64,
    pub paid_fee: u64,
    pub created_address: Address,
    pub status: ReceiptStatus,
    pub message: String,
    pub error_message: String,
}

// -----------------------------------------------------------------------------
// Block header / block
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockHeader {
    pub prev_hash: Hash,
    pub height: u64,
    pub tx_root_hash: Hash,
    pub creator: Address,
    pub timestamp: u64,
    pub version: u64,
    pub chain_id: u64,
    pub candidate_block_hash: Hash,
    pub vote_root_hash: Hash,
    pub receipt_root: Hash,
    pub state_root: Hash,
    pub finalized_timestamp: u64,
    pub block_hash: Hash,
    pub signature: String,
}

impl BlockHeader {
    pub fn empty() -> Self {
        BlockHeader {
            prev_hash: Hash::none(),
            height: 0,
            tx_root_hash: Hash::none(),
            creator: Address::empty(),
            timestamp: 0,
            version: 0,
            chain_id: 0,
            candidate_block_hash: Hash::none(),
            vote_root_hash: Hash::none(),
            receipt_root: Hash::none(),
            state_root: Hash::none(),
            finalized_timestamp: 0,
            block_hash: Hash::none(),
            signature: String::new(),
        }
    }

    /// Candidate identity: digest of the first seven fields. Immutable
    /// from proposal onward.
    pub fn pre_digest(&self) -> Hash {
        join_hash(&[
            self.prev_hash.to_string(),
            self.height.to_string(),
            self.tx_root_hash.to_string(),
            self.creator.to_string(),
            self.timestamp.to_string(),
            self.version.to_string(),
            self.chain_id.to_string(),
        ])
    }

    /// Block identity: digest of every field up to `finalized_timestamp`,
    /// written after execution.
    pub fn digest(&self) -> Hash {
        join_hash(&[
            self.prev_hash.to_string(),
            self.height.to_string(),
            self.tx_root_hash.to_string(),
            self.creator.to_string(),
            self.timestamp.to_string(),
            self.version.to_string(),
            self.chain_id.to_string(),
            self.candidate_block_hash.to_string(),
            self.vote_root_hash.to_string(),
            self.receipt_root.to_string(),
            self.state_root.to_string(),
            self.finalized_timestamp.to_string(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Block {
    pub header: BlockHeader,
    pub transaction_list: Vec<Transaction>,
    pub vote_list: Vec<Vote>,
    pub extra: BTreeMap<String, String>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Block {
            header,
            transaction_list: Vec::new(),
            vote_list: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn creator(&self) -> &Address {
        &self.header.creator
    }

    pub fn previous(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn pre_hash(&self) -> Hash {
        self.header.pre_digest()
    }

    pub fn hash(&self) -> Hash {
        self.header.digest()
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string(self).map_err(|e| ChainError::Serialize(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ChainError> {
        serde_json::from_str(raw).map_err(|e| ChainError::Serialize(e.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Confirm message
// -----------------------------------------------------------------------------

/// Confirm tuple `(height, sender, block_hash)` with a signature over
/// the digest of the comma-joined rendering of those three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirm {
    pub height: u64,
    pub sender: Address,
    pub block_hash: Hash,
    pub signature: String,
}

impl Confirm {
    pub fn digest(height: u64, sender: &Address, block_hash: &Hash) -> Hash {
        join_hash(&[
            height.to_string(),
            sender.to_string(),
            block_hash.to_string(),
        ])
    }

    pub fn to_wire(&self) -> Result<String, ChainError> {
        let tuple = (
            self.height.to_string(),
            self.sender.to_string(),
            self.block_hash.to_string(),
            self.signature.clone(),
        );
        serde_json::to_string(&tuple).map_err(|e| ChainError::Serialize(e.to_string()))
    }

    pub fn from_wire(raw: &str) -> Result<Self, ChainError> {
        let (height, sender, block_hash, signature): (String, String, String, String) =
            serde_json::from_str(raw).map_err(|e| ChainError::Serialize(e.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|e| ChainError::Serialize(e.to_string()))?;
        Ok(Confirm {
            height,
            sender: Address::new(sender),
            block_hash: Hash::from_hex(block_hash),
            signature,
        })
    }
}

// -----------------------------------------------------------------------------
// Account / delegation / validator registry
// -----------------------------------------------------------------------------

pub const ACCOUNT_EOA: &str = "eoa";
pub const ACCOUNT_CONTRACT: &str = "contract";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub address: Address,
    #[serde(rename = "type")]
    pub account_type: String,
    pub nonce: u64,
    pub balance: u64,
    pub delegated: Vec<Hash>,
    pub delegated_balance: u64,
    pub node_id: String,
    pub node_signature: String,
    pub state: BTreeMap<String, String>,
    pub code: Hash,
}

impl Account {
    pub fn fresh(address: Address) -> Self {
        Account {
            address,
            account_type: ACCOUNT_EOA.to_string(),
            nonce: 0,
            balance: 0,
            delegated: Vec::new(),
            delegated_balance: 0,
            node_id: String::new(),
            node_signature: String::new(),
            state: BTreeMap::new(),
            code: Hash::none(),
        }
    }
}

/// Delegation record, keyed by `hash(from || to)`; mutable by
/// accumulation only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
}

/// Entry of the registered validator list stored under the reserved
/// `constant_rep` trie key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub node_id: String,
    pub account: Address,
    pub delegated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            tx_type: "transfer".into(),
            sender: Address::new("gBx0000000000000000000000000000000000000001"),
            recipient: Address::new("gBx0000000000000000000000000000000000000002"),
            value: 10,
            fee: 5,
            message: String::new(),
            timestamp: 1_700_000_000_000_000,
            tx_hash: Hash::none(),
            signature: String::new(),
        }
    }

    #[test]
    fn tx_digest_excludes_hash_and_signature() {
        let mut tx = sample_tx();
        let digest = tx.digest();
        tx.tx_hash = digest.clone();
        tx.signature = "ff".repeat(65);
        assert_eq!(tx.digest(), digest);
    }

    #[test]
    fn tx_json_roundtrip() {
        let mut tx = sample_tx();
        tx.tx_hash = tx.digest();
        let json = tx.to_json().unwrap();
        assert!(json.contains("\"from\""));
        assert!(json.contains("\"tx_hash\""));
        let back = Transaction::from_json(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn tx_json_rejects_unknown_field() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_tx().to_json().unwrap()).unwrap();
        value["bogus"] = serde_json::json!(1);
        assert!(Transaction::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn header_pre_digest_ignores_roots() {
        let mut header = BlockHeader::empty();
        header.height = 3;
        header.creator = Address::new("gBx0000000000000000000000000000000000000001");
        header.timestamp = 42;
        let pre = header.pre_digest();

        header.vote_root_hash = sha3_hex(b"votes");
        header.state_root = sha3_hex(b"state");
        header.finalized_timestamp = 77;
        assert_eq!(header.pre_digest(), pre);
        assert_ne!(header.digest(), pre);
    }

    #[test]
    fn block_hash_tracks_header_digest() {
        let mut header = BlockHeader::empty();
        header.height = 1;
        let block = Block::new(header.clone());
        assert_eq!(block.hash(), header.digest());
        assert_eq!(block.pre_hash(), header.pre_digest());
    }

    #[test]
    fn confirm_wire_roundtrip() {
        let confirm = Confirm {
            height: 9,
            sender: Address::new("gBx0000000000000000000000000000000000000001"),
            block_hash: sha3_hex(b"candidate"),
            signature: "ab".repeat(65),
        };
        let wire = confirm.to_wire().unwrap();
        let back = Confirm::from_wire(&wire).unwrap();
        assert_eq!(back, confirm);
    }

    #[test]
    fn block_codec_roundtrip() {
        let mut header = BlockHeader::empty();
        header.height = 5;
        let mut block = Block::new(header);
        let mut tx = sample_tx();
        tx.tx_hash = tx.digest();
        block.transaction_list.push(tx);

        let raw = bincode::serialize(&block).unwrap();
        let back: Block = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, block);

        let json = block.to_json().unwrap();
        assert_eq!(Block::from_json(&json).unwrap(), block);
    }
}
