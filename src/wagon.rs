use std::sync::{Arc, Mutex};

use crate::chain_store::ChainStore;
use crate::crypto::{Address, Hash};
use crate::error::ChainError;
use crate::executor::{ExecuteContext, Executor};
use crate::genesis::GenesisConfig;
use crate::state::StateStore;
use crate::trie::{make_hash_root, Trie};
use crate::types::{Block, BlockHeader, Receipt, ReceiptStatus, Transaction};
use crate::validation::{validate_payable, validate_transaction};

/// Block engine: drives the executor across a block, accumulates
/// receipts and paid fees, distributes voter rewards and performs the
/// atomic finalize. Owns the state trie cache and the receipt list for
/// the duration of one block; `clear` runs on every exit path.
pub struct Wagon {
    chain: ChainStore,
    state: Arc<Mutex<StateStore>>,
    parent: Option<BlockHeader>,
    receipts: Vec<(u64, Receipt)>,
    receipt_trie: Option<Trie>,
    total_paid: u64,
}

impl Wagon {
    pub fn new(
        chain: ChainStore,
        state: Arc<Mutex<StateStore>>,
        parent: Option<BlockHeader>,
    ) -> Self {
        Wagon {
            chain,
            state,
            parent,
            receipts: Vec::new(),
            receipt_trie: None,
            total_paid: 0,
        }
    }

    /// Seed the world state from the genesis constants and stamp the
    /// resulting roots into the genesis header.
    pub fn genesis_declare(
        &mut self,
        block: &Block,
        config: &GenesisConfig,
    ) -> Result<Block, ChainError> {
        {
            let mut state = self.state.lock().unwrap();
            state.set_root(Hash::none());
            state.set_minimum(config.minimum)?;
            state.set_balance(&config.creator, config.published_balance)?;
            for validator in &config.validators {
                state.increase_nonce(&config.creator)?;
                state.increase_nonce(&validator.address)?;
                state.compute_balance(&config.creator, -(config.minimum as i128))?;
                state.compute_balance(&validator.address, config.minimum as i128)?;
                state.set_delegated(&validator.address, &validator.address, config.minimum)?;
                state.register_validator(
                    &validator.address,
                    &validator.validator_id,
                    &validator.signature,
                )?;
            }
            state.commit()?;
        }
        let state_root = self.state.lock().unwrap().state_root().clone();

        let mut out = block.clone();
        out.header.state_root = state_root;
        out.header.tx_root_hash = Hash::none();
        out.header.vote_root_hash = Hash::none();
        out.header.receipt_root = Hash::none();
        Ok(out)
    }

    /// Execute every transaction in order and return the block copy
    /// with the computed receipt root and the cached state root.
    pub async fn execute_transactions(
        &mut self,
        version: u64,
        block: &Block,
    ) -> Result<Block, ChainError> {
        let parent_height = self
            .parent
            .as_ref()
            .map(|h| h.height)
            .ok_or_else(|| ChainError::Validation("wagon has no parent header".into()))?;
        if block.height() != parent_height + 1 {
            return Err(ChainError::Validation(format!(
                "wagon executes on height={}, block height={}",
                parent_height + 1,
                block.height()
            )));
        }

        for (index, transaction) in block.transaction_list.iter().enumerate() {
            self.execute_transaction(version, index as u64, &block.header, transaction)?;
            tokio::task::yield_now().await;
        }

        self.receipts.sort_by_key(|(index, _)| *index);
        let receipts: Vec<Receipt> =
            self.receipts.iter().map(|(_, r)| r.clone()).collect();
        let trie = make_hash_root(&receipts)?;
        let receipt_root = trie.root().clone();
        self.receipt_trie = Some(trie);

        self.pre_finalize(block)?;

        let state_root = self.state.lock().unwrap().cache_trie_root();
        let mut out = block.clone();
        out.header.receipt_root = receipt_root;
        out.header.state_root = state_root;
        Ok(out)
    }

    fn execute_transaction(
        &mut self,
        version: u64,
        index: u64,
        header: &BlockHeader,
        transaction: &Transaction,
    ) -> Result<(), ChainError> {
        let executor = Executor;
        let mut state = self.state.lock().unwrap();
        let nonce = state.get_nonce(&transaction.sender)?;
        let mut context = ExecuteContext::new(index, transaction, nonce);

        let checked = (|| -> Result<(), ChainError> {
            if version != transaction.version {
                return Err(ChainError::Validation(format!(
                    "transaction version {}, chain version {}",
                    transaction.version, version
                )));
            }
            validate_transaction(transaction)?;
            validate_payable(transaction, state.get_balance(&transaction.sender)?)?;
            executor.validate(&mut state, &context, transaction)
        })();

        match checked {
            Err(err @ (ChainError::Validation(_) | ChainError::Serialize(_))) => {
                // failed before the fee debit: nothing to refund
                context.set_error(&err);
            }
            Err(other) => return Err(other),
            Ok(()) => match executor.apply(&mut state, &mut context, transaction) {
                Ok(()) => {}
                Err(err @ (ChainError::Validation(_) | ChainError::FeeLimited(_))) => {
                    context.set_error(&err);
                    let remainder = context.fee_remainder();
                    state.compute_balance(&context.txbase, remainder as i128)?;
                }
                Err(other) => return Err(other),
            },
        }
        drop(state);

        self.set_execute_result(context, header, transaction);
        Ok(())
    }

    fn set_execute_result(
        &mut self,
        context: ExecuteContext,
        header: &BlockHeader,
        transaction: &Transaction,
    ) {
        let status = if context.is_error() {
            ReceiptStatus::Cancel
        } else {
            ReceiptStatus::Completed
        };
        let receipt = Receipt {
            tx_hash: transaction.tx_hash.clone(),
            height: header.height,
            fee_limit: context.limited,
            paid_fee: context.paid(),
            created_address: context.create_address().clone(),
            status,
            message: context.message().to_string(),
            error_message: context.error().to_string(),
        };
        self.total_paid += context.paid();
        self.receipts.push((context.index, receipt));
    }

    fn pre_finalize(&mut self, block: &Block) -> Result<(), ChainError> {
        if block.height() > 0 {
            self.distribute_rewards(block)?;
        }
        Ok(())
    }

    /// Voters of the finalized candidate share the paid fees equally;
    /// the integer-division remainder is discarded.
    fn distribute_rewards(&mut self, block: &Block) -> Result<(), ChainError> {
        let pre_hash = block.pre_hash();
        let voters: Vec<Address> = block
            .vote_list
            .iter()
            .filter(|vote| vote.candidate_block_hash == pre_hash)
            .map(|vote| vote.creator.clone())
            .collect();
        if voters.is_empty() {
            return Ok(());
        }
        let reward = self.total_paid / voters.len() as u64;
        if reward == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        for voter in &voters {
            state.compute_balance(voter, reward as i128)?;
        }
        log::debug!(
            "rewarded {} voters with {} each of {} paid",
            voters.len(),
            reward,
            self.total_paid
        );
        Ok(())
    }

    /// Atomic commit: state, the three root tries, then the chain
    /// batch. A cache mismatch surfaces as a finalize error; transient
    /// state is cleared on every exit.
    pub fn finalize(&mut self, block: &Block) -> Result<(), ChainError> {
        let result = self.commit_block(block);
        self.clear();
        match result {
            Err(ChainError::Cache(msg)) => Err(ChainError::Finalize(msg)),
            other => other,
        }
    }

    fn commit_block(&mut self, block: &Block) -> Result<(), ChainError> {
        self.state.lock().unwrap().commit()?;

        let mut tx_trie = make_hash_root(&block.transaction_list)?;
        self.chain.set_trie(&mut tx_trie)?;
        if let Some(mut receipt_trie) = self.receipt_trie.take() {
            self.chain.set_trie(&mut receipt_trie)?;
        }
        let mut vote_trie = make_hash_root(&block.vote_list)?;
        self.chain.set_trie(&mut vote_trie)?;
        self.chain.commit(block)
    }

    pub fn clear(&mut self) {
        self.receipts.clear();
        self.receipt_trie = None;
        self.total_paid = 0;
        self.state.lock().unwrap().clear();
    }
}
