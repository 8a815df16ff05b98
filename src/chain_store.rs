use std::sync::Arc;

use crate::config::TOP_HEADER_KEY;
use crate::crypto::Hash;
use crate::error::ChainError;
use crate::storage::Database;
use crate::trie::{index_key, int_to_bytes32, Trie, TrieError};
use crate::types::{Block, BlockHeader, Receipt, Transaction, Vote};

fn tx_lookup_key(tx_hash: &Hash) -> Vec<u8> {
    let mut key = b"lookup::tx::".to_vec();
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

fn vote_lookup_key(vote_hash: &Hash) -> Vec<u8> {
    let mut key = b"lookup::vote::".to_vec();
    key.extend_from_slice(vote_hash.as_bytes());
    key
}

/// Block, header and receipt persistence. One atomic batch per
/// finalized block: top height, height index, block body and the
/// per-item lookup records used to reach transactions and votes through
/// their root tries.
#[derive(Clone)]
pub struct ChainStore {
    db: Arc<dyn Database>,
}

impl ChainStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        ChainStore { db }
    }

    pub fn db(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        let raw = self
            .db
            .get(TOP_HEADER_KEY)?
            .ok_or_else(|| ChainError::Missing("top_header".into()))?;
        let tail: [u8; 8] = raw[raw.len() - 8..]
            .try_into()
            .map_err(|_| ChainError::Serialize("top_header width".into()))?;
        Ok(u64::from_be_bytes(tail))
    }

    pub fn has_height(&self) -> Result<bool, ChainError> {
        Ok(self.db.exists(TOP_HEADER_KEY)?)
    }

    pub fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.get_header_from_height(0)?.chain_id)
    }

    pub fn has_block(&self, block_hash: &Hash) -> Result<bool, ChainError> {
        Ok(self.db.exists(block_hash.as_bytes())?)
    }

    pub fn get_header_from_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
        let raw = self
            .db
            .get(&int_to_bytes32(height))?
            .ok_or_else(|| ChainError::Missing(format!("header at height {}", height)))?;
        Ok(bincode::deserialize(&raw)?)
    }

    pub fn get_block_from_hash(&self, block_hash: &Hash) -> Result<Block, ChainError> {
        let raw = self
            .db
            .get(block_hash.as_bytes())?
            .ok_or_else(|| ChainError::Missing(format!("block {}", block_hash)))?;
        Ok(bincode::deserialize(&raw)?)
    }

    pub fn get_header_from_hash(&self, block_hash: &Hash) -> Result<BlockHeader, ChainError> {
        Ok(self.get_block_from_hash(block_hash)?.header)
    }

    pub fn get_block_from_height(&self, height: u64) -> Result<Block, ChainError> {
        let header = self.get_header_from_height(height)?;
        self.get_block_from_hash(&header.block_hash)
    }

    pub fn has_transaction(&self, tx_hash: &Hash) -> Result<bool, ChainError> {
        Ok(self.db.exists(&tx_lookup_key(tx_hash))?)
    }

    fn get_lookup(&self, key: &[u8]) -> Result<Option<(u64, u64)>, ChainError> {
        match self.db.get(key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    fn read_trie_item(&self, root: &Hash, index: u64) -> Result<Vec<u8>, ChainError> {
        let mut trie = Trie::new(root.clone(), Some(self.db.clone()));
        match trie.get(&index_key(index)) {
            Ok(raw) => Ok(raw),
            Err(TrieError::NotFound) => {
                Err(ChainError::Missing(format!("trie item {} of {}", index, root)))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_transaction(&self, tx_hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        let Some((height, index)) = self.get_lookup(&tx_lookup_key(tx_hash))? else {
            return Ok(None);
        };
        let header = self.get_header_from_height(height)?;
        let raw = self.read_trie_item(&header.tx_root_hash, index)?;
        Ok(Some(bincode::deserialize(&raw)?))
    }

    pub fn get_vote(&self, vote_hash: &Hash) -> Result<Option<Vote>, ChainError> {
        let Some((height, index)) = self.get_lookup(&vote_lookup_key(vote_hash))? else {
            return Ok(None);
        };
        let header = self.get_header_from_height(height)?;
        let raw = self.read_trie_item(&header.vote_root_hash, index)?;
        Ok(Some(bincode::deserialize(&raw)?))
    }

    /// Receipts share the transaction lookup record and are read
    /// through the receipt-root trie.
    pub fn get_receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>, ChainError> {
        let Some((height, index)) = self.get_lookup(&tx_lookup_key(tx_hash))? else {
            return Ok(None);
        };
        let header = self.get_header_from_height(height)?;
        let raw = self.read_trie_item(&header.receipt_root, index)?;
        Ok(Some(bincode::deserialize(&raw)?))
    }

    /// Flush a computed trie's node cache into the chain db so its root
    /// stays readable, then drop the cache.
    pub fn set_trie(&self, trie: &mut Trie) -> Result<(), ChainError> {
        let ops = trie
            .cache()
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect();
        self.db.write_batch(ops)?;
        trie.clear();
        Ok(())
    }

    pub fn commit(&self, block: &Block) -> Result<(), ChainError> {
        let mut ops: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        ops.push((
            TOP_HEADER_KEY.to_vec(),
            int_to_bytes32(block.header.height).to_vec(),
        ));
        ops.push((
            int_to_bytes32(block.header.height).to_vec(),
            bincode::serialize(&block.header)?,
        ));
        ops.push((
            block.header.block_hash.as_bytes().to_vec(),
            bincode::serialize(block)?,
        ));
        for (index, tx) in block.transaction_list.iter().enumerate() {
            ops.push((
                tx_lookup_key(&tx.tx_hash),
                bincode::serialize(&(block.header.height, index as u64))?,
            ));
        }
        for (index, vote) in block.vote_list.iter().enumerate() {
            ops.push((
                vote_lookup_key(&vote.vote_hash),
                bincode::serialize(&(block.header.height, index as u64))?,
            ));
        }
        self.db.write_batch(ops)?;
        Ok(())
    }
}
