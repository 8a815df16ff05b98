#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use llfc::chain::Chain;
use llfc::chain_store::ChainStore;
use llfc::config::CHAIN_VERSION;
use llfc::crypto::{Address, Hash, Signer};
use llfc::genesis::{GenesisConfig, GenesisValidator};
use llfc::state::StateStore;
use llfc::storage::MemDb;
use llfc::types::{Block, BlockHeader, Transaction};

pub fn build_chain(signer: Signer) -> Arc<Chain> {
    let store = ChainStore::new(Arc::new(MemDb::new()));
    let state = Arc::new(Mutex::new(StateStore::new(
        Arc::new(MemDb::new()),
        Hash::none(),
    )));
    Arc::new(Chain::new(store, state, signer))
}

/// Genesis constants with the expected hashes solved on a scratch
/// chain, so boot-time validation passes.
pub fn solved_genesis(
    creator: &Address,
    validators: &[Address],
    minimum: u64,
    published_balance: u64,
) -> GenesisConfig {
    let mut config = GenesisConfig {
        chain_id: 7,
        version: CHAIN_VERSION,
        minimum,
        creator: creator.clone(),
        published_balance,
        validators: validators
            .iter()
            .enumerate()
            .map(|(index, address)| GenesisValidator {
                address: address.clone(),
                validator_id: format!("validator-{}", index),
                signature: String::new(),
            })
            .collect(),
        block_hash: Hash::none(),
        state_root: Hash::none(),
    };

    let scratch = build_chain(Signer::generate());
    let mut header = BlockHeader::empty();
    header.height = 0;
    header.version = config.version;
    header.chain_id = config.chain_id;
    let mut wagon = scratch.prepare_wagon(None);
    let mut genesis = wagon.genesis_declare(&Block::new(header), &config).unwrap();
    genesis.header.block_hash = genesis.hash();

    config.block_hash = genesis.header.block_hash.clone();
    config.state_root = genesis.header.state_root.clone();
    config
}

pub fn signed_transfer(
    signer: &Signer,
    recipient: Address,
    value: u64,
    fee: u64,
) -> Transaction {
    let mut tx = Transaction {
        version: CHAIN_VERSION,
        tx_type: "transfer".into(),
        sender: signer.nodebase(),
        recipient,
        value,
        fee,
        message: String::new(),
        timestamp: llfc::config::now_micros(),
        tx_hash: Hash::none(),
        signature: String::new(),
    };
    tx.tx_hash = tx.digest();
    tx.signature = signer.sign(&tx.tx_hash).unwrap();
    tx
}
