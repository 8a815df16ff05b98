mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use llfc::bus::{Bus, Exchange, LocalBus};
use llfc::chain::Chain;
use llfc::config::FEE_EXECUTE;
use llfc::crypto::{sha3_hex, Address, Hash, Signer};
use llfc::error::ChainError;
use llfc::events::{spawn_consumers, EventHub};
use llfc::genesis::GenesisConfig;
use llfc::node::{prepare_node, NoopSyncer};
use llfc::round;
use llfc::types::{BlockHeader, ReceiptStatus, Vote};

use common::{build_chain, signed_transfer, solved_genesis};

fn clone_signer(signer: &Signer) -> Signer {
    Signer::from_secret(&signer.secret_bytes()).unwrap()
}

fn launch_validators(
    keys: &[Signer],
    live: usize,
    config: &GenesisConfig,
    bus: Arc<dyn Bus>,
) -> Vec<Arc<Chain>> {
    let mut chains = Vec::new();
    for signer in keys.iter().take(live) {
        let chain = build_chain(clone_signer(signer));
        chain.block_from_genesis(config).unwrap();
        let hub = EventHub::new();
        let (count, faults) = chain.get_validator_count().unwrap();
        hub.set_info(count, count - faults);
        let node = prepare_node(chain.clone(), hub, bus.clone(), Arc::new(NoopSyncer)).unwrap();
        tokio::spawn(async move {
            let _ = node.run().await;
        });
        chains.push(chain);
    }
    chains
}

async fn wait_for_height(chains: &[Arc<Chain>], height: u64) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let reached = chains
            .iter()
            .all(|chain| chain.height().map(|h| h >= height).unwrap_or(false));
        if reached {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "cluster did not reach height {}",
            height
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[test]
fn empty_pool_suppresses_proposal() {
    let key = Signer::generate();
    let wallet = Signer::generate().nodebase();
    let config = solved_genesis(&wallet, &[key.nodebase()], 100, 1_000);
    let chain = build_chain(clone_signer(&key));
    chain.block_from_genesis(&config).unwrap();

    let hub = EventHub::new();
    let permit = chain.get_header_from_height(0).unwrap();
    let prepared = chain.prepare_candidate_from_header(&permit).unwrap();
    assert!(round::make_candidate(&chain, &hub, prepared)
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn four_validator_round_finalizes_transfer() {
    let keys: Vec<Signer> = (0..4).map(|_| Signer::generate()).collect();
    let wallet = Signer::generate();
    let recipient = Signer::generate().nodebase();
    let validators: Vec<Address> = keys.iter().map(|k| k.nodebase()).collect();
    let config = solved_genesis(&wallet.nodebase(), &validators, 100, 1_000);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());

    let chains = launch_validators(&keys, 4, &config, bus.clone());
    // one subscriber follows the finalize exchange only
    let subscriber_chain = build_chain(Signer::generate());
    subscriber_chain.block_from_genesis(&config).unwrap();
    {
        let hub = EventHub::new();
        let node = prepare_node(
            subscriber_chain.clone(),
            hub,
            bus.clone(),
            Arc::new(NoopSyncer),
        )
        .unwrap();
        tokio::spawn(async move {
            let _ = node.run().await;
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tx = signed_transfer(&wallet, recipient.clone(), 10, FEE_EXECUTE);
    bus.publish(Exchange::Transaction, tx.to_json().unwrap())
        .await
        .unwrap();

    wait_for_height(&chains, 1).await;

    // genesis moved 4 * 100 into validator stakes
    let wallet_after = 1_000 - 400 - 10 - FEE_EXECUTE;
    let block = chains[0].store().get_block_from_height(1).unwrap();
    assert_eq!(block.transaction_list.len(), 1);
    assert_eq!(block.vote_list.len(), 4);

    for chain in &chains {
        let agreed = chain.store().get_block_from_height(1).unwrap();
        assert_eq!(agreed.header.block_hash, block.header.block_hash);
        assert_eq!(agreed.header.state_root, block.header.state_root);

        assert_eq!(chain.get_balance(&wallet.nodebase()).unwrap(), wallet_after);
        assert_eq!(chain.get_balance(&recipient).unwrap(), 10);
        // creator nonce: one bump per genesis validator, one for the tx
        assert_eq!(chain.get_nonce(&wallet.nodebase()).unwrap(), 5);

        let receipt = chain.get_receipt(&tx.tx_hash).unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Completed);
        assert_eq!(receipt.paid_fee, FEE_EXECUTE);
        assert!(chain.has_transaction(&tx.tx_hash).unwrap());
    }

    // every voter got the same integer share of the paid fee
    let reward = FEE_EXECUTE / 4;
    for key in &keys {
        assert_eq!(chains[0].get_balance(&key.nodebase()).unwrap(), reward);
    }

    // the subscriber committed the identical block
    wait_for_height(&[subscriber_chain.clone()], 1).await;
    assert_eq!(
        subscriber_chain
            .store()
            .get_block_from_height(1)
            .unwrap()
            .header
            .block_hash,
        block.header.block_hash
    );
    assert_eq!(subscriber_chain.get_balance(&recipient).unwrap(), 10);
}

#[tokio::test(flavor = "current_thread")]
async fn quorum_of_three_finalizes_without_fourth_validator() {
    let keys: Vec<Signer> = (0..4).map(|_| Signer::generate()).collect();
    let wallet = Signer::generate();
    let recipient = Signer::generate().nodebase();
    let validators: Vec<Address> = keys.iter().map(|k| k.nodebase()).collect();
    let config = solved_genesis(&wallet.nodebase(), &validators, 100, 1_000);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());

    // the fourth validator never comes up
    let chains = launch_validators(&keys, 3, &config, bus.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tx = signed_transfer(&wallet, recipient.clone(), 10, FEE_EXECUTE);
    bus.publish(Exchange::Transaction, tx.to_json().unwrap())
        .await
        .unwrap();

    wait_for_height(&chains, 1).await;

    let block = chains[0].store().get_block_from_height(1).unwrap();
    assert_eq!(block.transaction_list.len(), 1);
    assert_eq!(block.vote_list.len(), 3);
    for chain in &chains {
        assert_eq!(chain.get_balance(&recipient).unwrap(), 10);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn byzantine_dissent_moves_round_to_existing_candidate() {
    let keys: Vec<Signer> = (0..4).map(|_| Signer::generate()).collect();
    let wallet = Signer::generate();
    let recipient = Signer::generate().nodebase();
    let validators: Vec<Address> = keys.iter().map(|k| k.nodebase()).collect();
    let honest: Vec<Address> = validators[..3].to_vec();
    let config = solved_genesis(&wallet.nodebase(), &validators, 100, 1_000);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());

    let chains = launch_validators(&keys, 3, &config, bus.clone());

    // the fourth validator is driven by hand and votes against the
    // deterministic selection
    let byz_chain = build_chain(clone_signer(&keys[3]));
    byz_chain.block_from_genesis(&config).unwrap();
    let byz_hub = EventHub::new();
    byz_hub.set_info(4, 3);
    spawn_consumers(byz_hub.clone(), bus.clone(), true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tx = signed_transfer(&wallet, recipient.clone(), 10, FEE_EXECUTE);
    bus.publish(Exchange::Transaction, tx.to_json().unwrap())
        .await
        .unwrap();

    byz_hub.transaction.exists().await;
    let permit = byz_chain.get_header_from_height(0).unwrap();
    let prepared = byz_chain.prepare_candidate_from_header(&permit).unwrap();
    let own = round::make_candidate(&byz_chain, &byz_hub, prepared)
        .unwrap()
        .unwrap();
    bus.publish(Exchange::Candidate, own.to_json().unwrap())
        .await
        .unwrap();
    byz_hub.candidate.exists().await.unwrap();

    let selected = round::select_candidate(&byz_chain, &byz_hub, &permit)
        .unwrap()
        .first_block()
        .unwrap();
    let context = byz_hub.candidate.get(1);
    let target = context
        .data
        .values()
        .find(|block| {
            block.pre_hash() != selected.pre_hash() && honest.contains(block.creator())
        })
        .cloned()
        .expect("an honest alternative candidate exists");

    let vote = round::make_vote(&byz_chain, &target).unwrap();
    bus.publish(Exchange::Vote, vote.to_json().unwrap())
        .await
        .unwrap();
    let confirm = round::make_confirm(&byz_chain, 1, &target.pre_hash()).unwrap();
    bus.publish(Exchange::Confirm, confirm.to_wire().unwrap())
        .await
        .unwrap();

    wait_for_height(&chains, 1).await;

    // one dissenting vote meets f = 1, so the round adopted the target
    let block = chains[0].store().get_block_from_height(1).unwrap();
    assert_eq!(block.header.candidate_block_hash, target.pre_hash());
    assert_eq!(block.creator(), target.creator());
    assert_eq!(block.vote_list.len(), 4);
    for chain in &chains {
        assert_eq!(chain.get_balance(&recipient).unwrap(), 10);
    }

    // only the dissenting vote matches the finalized candidate, so the
    // byzantine voter collects the whole fee share
    assert_eq!(
        chains[0].get_balance(&keys[3].nodebase()).unwrap(),
        FEE_EXECUTE
    );
}

#[test]
fn split_vote_groups_abort_the_round_instead_of_finalizing() {
    // seven validators: f = 2, so two dissenting pairs can qualify at once
    let keys: Vec<Signer> = (0..7).map(|_| Signer::generate()).collect();
    let wallet = Signer::generate().nodebase();
    let validators: Vec<Address> = keys.iter().map(|k| k.nodebase()).collect();
    let config = solved_genesis(&wallet, &validators, 100, 1_000);
    let chain = build_chain(clone_signer(&keys[0]));
    chain.block_from_genesis(&config).unwrap();

    let hub = EventHub::new();
    let (count, faults) = chain.get_validator_count().unwrap();
    assert_eq!((count, faults), (7, 2));
    hub.set_info(count, count - faults);

    let own = sha3_hex(b"selected-candidate");
    let left = sha3_hex(b"left-candidate");
    let right = sha3_hex(b"right-candidate");
    let mut select_header = BlockHeader::empty();
    select_header.height = 1;
    select_header.candidate_block_hash = own.clone();

    let ballot = |creator: &Address, hash: &Hash| Vote {
        version: 1,
        block_height: 1,
        candidate_block_hash: hash.clone(),
        creator: creator.clone(),
        vote_hash: Hash::none(),
        signature: String::new(),
    };
    // three voters stay on the selection, two pairs split across two
    // other candidates, each pair meeting the fault allowance
    for key in &keys[..3] {
        hub.vote.insert(ballot(&key.nodebase(), &own));
    }
    for key in &keys[3..5] {
        hub.vote.insert(ballot(&key.nodebase(), &left));
    }
    for key in &keys[5..7] {
        hub.vote.insert(ballot(&key.nodebase(), &right));
    }

    // ambiguous aggregation aborts the round; neither candidate wins
    let result = round::aggregate_vote(&chain, &hub, &select_header);
    assert!(matches!(result, Err(ChainError::Round(_))));
    assert_eq!(chain.height().unwrap(), 0);

    // the retry path drops the round buffers; a clean revote aggregates
    hub.reset();
    for key in &keys {
        hub.vote.insert(ballot(&key.nodebase(), &own));
    }
    let (aggregated, context) = round::aggregate_vote(&chain, &hub, &select_header).unwrap();
    assert_eq!(aggregated, own);
    assert_eq!(context.votes().len(), 7);
}

#[tokio::test(flavor = "current_thread")]
async fn fee_overrun_is_included_with_cancel_receipt() {
    let keys: Vec<Signer> = (0..4).map(|_| Signer::generate()).collect();
    let wallet = Signer::generate();
    let recipient = Signer::generate().nodebase();
    let validators: Vec<Address> = keys.iter().map(|k| k.nodebase()).collect();
    let config = solved_genesis(&wallet.nodebase(), &validators, 100, 1_000);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());

    let chains = launch_validators(&keys, 4, &config, bus.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fee = FEE_EXECUTE - 1;
    let tx = signed_transfer(&wallet, recipient.clone(), 10, fee);
    bus.publish(Exchange::Transaction, tx.to_json().unwrap())
        .await
        .unwrap();

    wait_for_height(&chains, 1).await;

    for chain in &chains {
        let receipt = chain.get_receipt(&tx.tx_hash).unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Cancel);
        assert_eq!(receipt.paid_fee, fee);
        assert!(!receipt.error_message.is_empty());

        // the fee was consumed, the value was not moved, the nonce moved
        assert_eq!(
            chain.get_balance(&wallet.nodebase()).unwrap(),
            1_000 - 400 - fee
        );
        assert_eq!(chain.get_balance(&recipient).unwrap(), 0);
        assert_eq!(chain.get_nonce(&wallet.nodebase()).unwrap(), 5);
    }
}
