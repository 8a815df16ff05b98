use std::sync::{Arc, Mutex};

use crate::chain_store::ChainStore;
use crate::config::{now_micros, CHAIN_VERSION, EXECUTE_TIMEOUT};
use crate::crypto::{verify, Address, Hash, Signer};
use crate::error::ChainError;
use crate::genesis::GenesisConfig;
use crate::state::StateStore;
use crate::trie::make_hash_root;
use crate::types::{Account, Block, BlockHeader, Delegation, Receipt, Transaction, Vote};
use crate::wagon::Wagon;

/// Chain facade: genesis boot, block validation, candidate
/// preparation, finalize-and-link. Owns the signer and shares the
/// state store with the wagons it spawns.
pub struct Chain {
    store: ChainStore,
    state: Arc<Mutex<StateStore>>,
    signer: Signer,
    nodebase: Address,
    version: u64,
}

impl Chain {
    pub fn new(store: ChainStore, state: Arc<Mutex<StateStore>>, signer: Signer) -> Self {
        let nodebase = signer.nodebase();
        Chain {
            store,
            state,
            signer,
            nodebase,
            version: CHAIN_VERSION,
        }
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodebase(&self) -> &Address {
        &self.nodebase
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        self.store.height()
    }

    pub fn chain_id(&self) -> Result<u64, ChainError> {
        self.store.chain_id()
    }

    pub fn is_validator(&self) -> Result<bool, ChainError> {
        let records = self.state.lock().unwrap().get_validator_records()?;
        Ok(records.iter().any(|rep| rep.account == self.nodebase))
    }

    pub fn get_validator_records(&self) -> Result<Vec<crate::types::ValidatorRecord>, ChainError> {
        self.state.lock().unwrap().get_validator_records()
    }

    pub fn get_validator_count(&self) -> Result<(usize, usize), ChainError> {
        self.state.lock().unwrap().get_validator_count()
    }

    pub fn get_balance(&self, address: &Address) -> Result<u64, ChainError> {
        self.state.lock().unwrap().get_balance(address)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        self.state.lock().unwrap().get_nonce(address)
    }

    pub fn get_account(&self, address: &Address) -> Result<Account, ChainError> {
        self.state.lock().unwrap().get_account(address)
    }

    pub fn get_delegated(&self, address: &Address) -> Result<Vec<Delegation>, ChainError> {
        self.state.lock().unwrap().get_delegated(address)
    }

    pub fn has_transaction(&self, tx_hash: &Hash) -> Result<bool, ChainError> {
        self.store.has_transaction(tx_hash)
    }

    pub fn get_transaction(&self, tx_hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        self.store.get_transaction(tx_hash)
    }

    pub fn get_receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>, ChainError> {
        self.store.get_receipt(tx_hash)
    }

    pub fn get_header_from_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
        self.store.get_header_from_height(height)
    }

    pub fn make_signature(&self, digest: &Hash) -> Result<String, ChainError> {
        Ok(self.signer.sign(digest)?)
    }

    pub fn prepare_wagon(&self, parent: Option<BlockHeader>) -> Wagon {
        Wagon::new(self.store.clone(), self.state.clone(), parent)
    }

    /// After a restart with an existing chain, point the state store at
    /// the tip's state root.
    pub fn align_state_root(&self) -> Result<(), ChainError> {
        if self.store.has_height()? {
            let tip = self.store.get_header_from_height(self.store.height()?)?;
            self.state.lock().unwrap().set_root(tip.state_root);
        }
        Ok(())
    }

    /// First boot: declare genesis from the constants and commit it.
    /// Returns false when the genesis block is already stored.
    pub fn block_from_genesis(&self, config: &GenesisConfig) -> Result<bool, ChainError> {
        if self.store.has_block(&config.block_hash)? {
            return Ok(false);
        }

        let mut header = BlockHeader::empty();
        header.height = 0;
        header.version = config.version;
        header.chain_id = config.chain_id;
        let genesis = Block::new(header);

        let mut wagon = self.prepare_wagon(None);
        let mut genesis = wagon.genesis_declare(&genesis, config)?;
        genesis.header.block_hash = genesis.hash();
        self.from_genesis(&genesis, config)?;
        Ok(true)
    }

    fn from_genesis(&self, block: &Block, config: &GenesisConfig) -> Result<(), ChainError> {
        if block.height() != 0 {
            return Err(ChainError::Validation(format!(
                "genesis block height 0, current block height {}",
                block.height()
            )));
        }
        if block.hash() != config.block_hash {
            return Err(ChainError::Validation(format!(
                "genesis hash {}, current hash {}",
                config.block_hash,
                block.hash()
            )));
        }
        if block.header.state_root != config.state_root {
            return Err(ChainError::Validation(format!(
                "genesis state root: {}, current state root: {}",
                config.state_root, block.header.state_root
            )));
        }
        self.store.commit(block)
    }

    pub fn validate_header(
        &self,
        permit_header: &BlockHeader,
        block: &Block,
    ) -> Result<(), ChainError> {
        let header = &block.header;
        if self.chain_id()? != header.chain_id {
            return Err(ChainError::Validation(format!(
                "main chain id: {}, current header chain id: {}",
                self.chain_id()?,
                header.chain_id
            )));
        }
        verify(&header.digest(), &header.signature, &header.creator)?;

        if permit_header.height + 1 != header.height {
            return Err(ChainError::Finalize(format!(
                "permit header height: {}, current header height: {}",
                permit_header.height, header.height
            )));
        }
        if &permit_header.digest() != block.previous() {
            return Err(ChainError::Finalize(format!(
                "previous hash: {}, current block previous hash: {}",
                permit_header.digest(),
                block.previous()
            )));
        }
        if permit_header.timestamp >= header.timestamp {
            return Err(ChainError::Validation(format!(
                "permit header time: {}, current header time: {}",
                permit_header.timestamp, header.timestamp
            )));
        }

        let tx_root = make_hash_root(&block.transaction_list)?;
        if tx_root.root() != &header.tx_root_hash {
            return Err(ChainError::Validation(format!(
                "current header tx root: {}, digest tx root: {}",
                header.tx_root_hash,
                tx_root.root()
            )));
        }
        let vote_root = make_hash_root(&block.vote_list)?;
        if vote_root.root() != &header.vote_root_hash {
            return Err(ChainError::Validation("vote root error".to_string()));
        }
        Ok(())
    }

    pub fn validate_vote_list(
        &self,
        header: &BlockHeader,
        votes: &[Vote],
    ) -> Result<(), ChainError> {
        for vote in votes {
            verify(&vote.vote_hash, &vote.signature, &vote.creator)?;
            if vote.vote_hash != vote.digest() {
                return Err(ChainError::Validation(format!(
                    "saved vote hash: {}, digest vote hash: {}",
                    vote.vote_hash,
                    vote.digest()
                )));
            }
            if header.height != vote.block_height {
                return Err(ChainError::Validation(format!(
                    "current header height: {}, vote height: {}",
                    header.height, vote.block_height
                )));
            }
        }
        Ok(())
    }

    pub fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        // an unknown parent is a broken chain link, not a bad block
        let permit_block = match self.store.get_block_from_hash(block.previous()) {
            Ok(parent) => parent,
            Err(ChainError::Missing(what)) => {
                return Err(ChainError::Finalize(format!("unknown parent: {}", what)));
            }
            Err(err) => return Err(err),
        };
        self.validate_header(&permit_block.header, block)?;
        self.validate_vote_list(&block.header, &block.vote_list)
    }

    /// Empty candidate scaffold on top of `header`.
    pub fn prepare_candidate_from_header(
        &self,
        header: &BlockHeader,
    ) -> Result<Block, ChainError> {
        let mut candidate = BlockHeader::empty();
        candidate.version = self.version;
        candidate.chain_id = self.chain_id()?;
        candidate.prev_hash = header.digest();
        candidate.height = header.height + 1;
        candidate.creator = self.nodebase.clone();
        Ok(Block::new(candidate))
    }

    /// Creator path: attach the round's votes, execute, stamp the
    /// finalize timestamp and seal the block hash.
    pub async fn make_finalize_from_confirm(
        &self,
        confirm_block: Block,
        votes: Vec<Vote>,
    ) -> Result<Block, ChainError> {
        let tx_trie = make_hash_root(&confirm_block.transaction_list)?;
        if &confirm_block.header.tx_root_hash != tx_trie.root() {
            return Err(ChainError::Validation("tx root not matched".to_string()));
        }
        let permit_header = self.store.get_header_from_hash(confirm_block.previous())?;
        let mut wagon = self.prepare_wagon(Some(permit_header));

        let vote_trie = make_hash_root(&votes)?;
        let mut working = confirm_block;
        working.vote_list = votes;
        working.header.vote_root_hash = vote_trie.root().clone();

        let executed = match wagon.execute_transactions(self.version, &working).await {
            Ok(block) => block,
            Err(err) => {
                wagon.clear();
                return Err(err);
            }
        };
        wagon.clear();

        let mut sealed = executed;
        sealed.header.finalized_timestamp = now_micros();
        sealed.header.block_hash = sealed.hash();
        sealed.header.signature = self.make_signature(&sealed.header.block_hash)?;
        Ok(sealed)
    }

    /// Validate, re-execute and atomically commit a finalized block.
    pub async fn finalize(&self, block: &Block) -> Result<(), ChainError> {
        self.validate_block(block)?;

        let parent = self.store.get_header_from_height(self.height()?)?;
        let mut wagon = self.prepare_wagon(Some(parent.clone()));
        let started = std::time::Instant::now();

        let executed = match tokio::time::timeout(
            EXECUTE_TIMEOUT,
            wagon.execute_transactions(self.version, block),
        )
        .await
        {
            Err(_) => {
                wagon.clear();
                return Err(ChainError::Finalize("execution timeout".to_string()));
            }
            Ok(Err(err)) => {
                wagon.clear();
                return Err(err);
            }
            Ok(Ok(executed)) => executed,
        };

        if executed.header.block_hash != executed.hash() {
            wagon.clear();
            return Err(ChainError::Validation(format!(
                "final-block hash error, block-hash: {}, current-hash: {}",
                executed.header.block_hash,
                executed.hash()
            )));
        }

        wagon.finalize(&executed)?;
        log::debug!(
            "new link {} -> {}: {}, execute: {}, elapsed: {:?}",
            parent.height,
            executed.height(),
            executed.header.block_hash,
            executed.transaction_list.len(),
            started.elapsed()
        );
        Ok(())
    }
}
