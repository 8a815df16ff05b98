use std::collections::BTreeMap;

use crate::chain::Chain;
use crate::config::{now_micros, CANDIDATE_TIME_SLACK_US, TX_BATCH};
use crate::crypto::{Address, Hash};
use crate::error::ChainError;
use crate::events::{CandidateContext, EventHub, VoteContext};
use crate::trie::make_hash_root;
use crate::types::{Block, BlockHeader, Confirm, Transaction, Vote};
use crate::validation::validate_validator_set;

/// Build this node's candidate from the pending pool. Returns None when
/// every pending transaction is already on chain (the dead entries are
/// purged) or the node is not a validator.
pub fn make_candidate(
    chain: &Chain,
    hub: &EventHub,
    block: Block,
) -> Result<Option<Block>, ChainError> {
    if !chain.is_validator()? {
        return Ok(None);
    }
    let pending = hub.transaction.get_list(TX_BATCH);

    let mut fresh: Vec<Transaction> = Vec::with_capacity(pending.len());
    for transaction in &pending {
        if !chain.has_transaction(&transaction.tx_hash)? {
            fresh.push(transaction.clone());
        }
    }
    if fresh.is_empty() {
        let stale: Vec<Hash> = pending.iter().map(|tx| tx.tx_hash.clone()).collect();
        hub.transaction.remove_hashes(&stale);
        return Ok(None);
    }

    log::info!("build new height ({})", block.height());

    let tx_trie = make_hash_root(&fresh)?;
    let mut candidate = block;
    candidate.transaction_list = fresh;
    candidate.header.tx_root_hash = tx_trie.root().clone();
    candidate.header.timestamp = now_micros();
    candidate.header.candidate_block_hash = candidate.header.pre_digest();
    candidate.header.signature = chain.make_signature(&candidate.header.candidate_block_hash)?;
    Ok(Some(candidate))
}

/// P1: collect the candidate context for the next height, check the
/// senders and run the deterministic filters until one block remains.
pub fn select_candidate(
    chain: &Chain,
    hub: &EventHub,
    permit_header: &BlockHeader,
) -> Result<CandidateContext, ChainError> {
    let mut context = hub.candidate.get(permit_header.height + 1);
    if context.is_empty() {
        return Err(ChainError::Validation(
            "candidate context block: 0".to_string(),
        ));
    }
    let records = chain.get_validator_records()?;
    validate_validator_set(&context.creators, &records)?;

    filter_time_window(&mut context)?;
    filter_max_transactions(&mut context);
    if context.len() > 1 {
        filter_hash_distance(permit_header, &mut context)?;
    }
    Ok(context)
}

/// Accept only blocks inside `[t_min, datum + slack]` where `datum`
/// splits the observed timestamp spread in half.
fn filter_time_window(context: &mut CandidateContext) -> Result<(), ChainError> {
    if context.times.is_empty() {
        return Err(ChainError::Validation(
            "candidate context time: 0".to_string(),
        ));
    }
    let mut times = context.times.clone();
    times.sort_unstable();
    let t_min = times[0];
    let t_max = *times.last().unwrap();
    let datum = t_min + (t_max - t_min) / 2;
    let upper = datum + CANDIDATE_TIME_SLACK_US;

    let out: Vec<(u64, Address)> = context
        .data
        .iter()
        .filter(|(_, block)| {
            block.header.timestamp < t_min || block.header.timestamp > upper
        })
        .map(|(key, _)| key.clone())
        .collect();
    for key in out {
        context.remove(&key);
    }
    Ok(())
}

fn oldest_transaction(block: &Block) -> u64 {
    block
        .transaction_list
        .iter()
        .map(|tx| tx.timestamp)
        .min()
        .unwrap_or(u64::MAX)
}

/// Keep the blocks carrying the most transactions; among those, the
/// ones whose earliest transaction is oldest.
fn filter_max_transactions(context: &mut CandidateContext) {
    let max = context
        .data
        .values()
        .map(|block| block.transaction_list.len())
        .max()
        .unwrap_or(0);
    let thin: Vec<(u64, Address)> = context
        .data
        .iter()
        .filter(|(_, block)| block.transaction_list.len() < max)
        .map(|(key, _)| key.clone())
        .collect();
    for key in thin {
        context.remove(&key);
    }

    if context.len() > 1 {
        let best = context
            .data
            .values()
            .map(oldest_transaction)
            .min()
            .unwrap_or(u64::MAX);
        let late: Vec<(u64, Address)> = context
            .data
            .iter()
            .filter(|(_, block)| oldest_transaction(block) > best)
            .map(|(key, _)| key.clone())
            .collect();
        for key in late {
            context.remove(&key);
        }
    }
}

fn hash_distance(parent: &Hash, pre_hash: &Hash) -> u64 {
    parent
        .as_bytes()
        .iter()
        .zip(pre_hash.as_bytes())
        .map(|(a, b)| (*a as i64 - *b as i64).unsigned_abs())
        .sum()
}

/// Maximum distance wins; a distance tie resolves to the
/// lexicographically smallest pre-hash.
fn pick_winner(scored: &[((u64, Address), u64, Hash)]) -> Option<(u64, Address)> {
    let best = scored.iter().map(|(_, distance, _)| *distance).max()?;
    scored
        .iter()
        .filter(|(_, distance, _)| *distance == best)
        .min_by(|a, b| a.2.cmp(&b.2))
        .map(|(key, _, _)| key.clone())
}

/// Final tiebreak: byte distance from the parent hash.
fn filter_hash_distance(
    permit_header: &BlockHeader,
    context: &mut CandidateContext,
) -> Result<(), ChainError> {
    let parent = permit_header.digest();
    let scored: Vec<((u64, Address), u64, Hash)> = context
        .data
        .iter()
        .map(|(key, block)| {
            let pre_hash = block.pre_hash();
            (key.clone(), hash_distance(&parent, &pre_hash), pre_hash)
        })
        .collect();
    let winner = pick_winner(&scored)
        .ok_or_else(|| ChainError::Round("block is not selected".to_string()))?;

    let losers: Vec<(u64, Address)> = scored
        .iter()
        .map(|(key, _, _)| key.clone())
        .filter(|key| key != &winner)
        .collect();
    for key in losers {
        context.remove(&key);
    }
    Ok(())
}

/// P2: vote for the selected candidate.
pub fn make_vote(chain: &Chain, select_block: &Block) -> Result<Vote, ChainError> {
    let mut vote = Vote {
        version: chain.version(),
        block_height: select_block.height(),
        candidate_block_hash: select_block.pre_hash(),
        creator: chain.nodebase().clone(),
        vote_hash: Hash::none(),
        signature: String::new(),
    };
    vote.vote_hash = vote.digest();
    vote.signature = chain.make_signature(&vote.vote_hash)?;
    Ok(vote)
}

/// Aggregation rule over the collected votes: keep the own choice
/// unless exactly one dissenting hash reaches the fault allowance.
/// Two or more qualifying dissents leave no deterministic choice and
/// abort the round.
fn aggregate_vote_from_context(
    own: &Hash,
    context: &VoteContext,
    allowed_faults: usize,
) -> Result<Hash, ChainError> {
    let mut dissent: BTreeMap<Hash, usize> = BTreeMap::new();
    for vote in context.data.values() {
        if &vote.candidate_block_hash != own {
            *dissent.entry(vote.candidate_block_hash.clone()).or_insert(0) += 1;
        }
    }
    if dissent.is_empty() {
        return Ok(own.clone());
    }
    log::debug!("node-select: {}, diff-select: {:?}", own, dissent);

    let qualified: Vec<&Hash> = dissent
        .iter()
        .filter(|(_, count)| **count >= allowed_faults)
        .map(|(hash, _)| hash)
        .collect();
    match qualified.as_slice() {
        [] => Ok(own.clone()),
        [hash] => Ok((*hash).clone()),
        _ => Err(ChainError::Round(format!(
            "aggregate vote error: {:?}",
            dissent
        ))),
    }
}

/// P2 collection: check voters and aggregate.
pub fn aggregate_vote(
    chain: &Chain,
    hub: &EventHub,
    select_header: &BlockHeader,
) -> Result<(Hash, VoteContext), ChainError> {
    let context = hub.vote.get(select_header.height);
    let records = chain.get_validator_records()?;
    validate_validator_set(&context.creators, &records)?;

    let (_, allowed_faults) = chain.get_validator_count()?;
    let aggregated = aggregate_vote_from_context(
        &select_header.candidate_block_hash,
        &context,
        allowed_faults,
    )?;
    Ok((aggregated, context))
}

/// P3: signed confirm tuple for the aggregated hash.
pub fn make_confirm(
    chain: &Chain,
    height: u64,
    aggregated: &Hash,
) -> Result<Confirm, ChainError> {
    let digest = Confirm::digest(height, chain.nodebase(), aggregated);
    Ok(Confirm {
        height,
        sender: chain.nodebase().clone(),
        block_hash: aggregated.clone(),
        signature: chain.make_signature(&digest)?,
    })
}

/// P3 collection: quorum-checked confirm aggregation, then locate the
/// confirmed candidate in the local context.
pub fn aggregate_confirm(
    chain: &Chain,
    hub: &EventHub,
    confirm: &Confirm,
) -> Result<Block, ChainError> {
    let (block_hash, senders) = hub.confirm.get(confirm.height)?;
    let records = chain.get_validator_records()?;
    validate_validator_set(&senders, &records)?;

    if block_hash != confirm.block_hash {
        log::debug!(
            "confirm disagrees with own choice: {} vs {}",
            block_hash,
            confirm.block_hash
        );
    }

    let context = hub.candidate.get(confirm.height);
    context
        .data
        .values()
        .find(|block| block.pre_hash() == block_hash)
        .cloned()
        .ok_or_else(|| ChainError::Round("confirm error: confirm block not exists".to_string()))
}

/// P4: only the confirmed block's creator builds the finalize block.
pub async fn make_finalize_from_confirm(
    chain: &Chain,
    confirm_block: Block,
    context: &VoteContext,
) -> Result<Option<Block>, ChainError> {
    if confirm_block.creator() != chain.nodebase() {
        return Ok(None);
    }
    let finalized = chain
        .make_finalize_from_confirm(confirm_block, context.votes())
        .await?;
    Ok(Some(finalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha3_hex, Signer};

    fn context_of(blocks: Vec<Block>) -> CandidateContext {
        let mut data = BTreeMap::new();
        let mut creators = Vec::new();
        let mut times = Vec::new();
        let height = blocks.first().map(|b| b.height()).unwrap_or(0);
        for block in blocks {
            creators.push(block.creator().clone());
            times.push(block.header.timestamp);
            data.insert((block.height(), block.creator().clone()), block);
        }
        CandidateContext {
            height,
            creators,
            times,
            data,
        }
    }

    fn candidate(creator: &Address, timestamp: u64, tx_count: usize) -> Block {
        let mut header = BlockHeader::empty();
        header.height = 1;
        header.creator = creator.clone();
        header.timestamp = timestamp;
        let mut block = Block::new(header);
        for i in 0..tx_count {
            let mut tx = Transaction {
                version: 1,
                tx_type: "transfer".into(),
                sender: creator.clone(),
                recipient: creator.clone(),
                value: i as u64,
                fee: 1,
                message: String::new(),
                timestamp: timestamp + i as u64,
                tx_hash: Hash::none(),
                signature: String::new(),
            };
            tx.tx_hash = tx.digest();
            block.transaction_list.push(tx);
        }
        block
    }

    fn vote_for(creator: &Address, hash: &Hash) -> Vote {
        Vote {
            version: 1,
            block_height: 1,
            candidate_block_hash: hash.clone(),
            creator: creator.clone(),
            vote_hash: Hash::none(),
            signature: String::new(),
        }
    }

    fn vote_context(votes: Vec<Vote>) -> VoteContext {
        let mut data = BTreeMap::new();
        let mut creators = Vec::new();
        for vote in votes {
            creators.push(vote.creator.clone());
            data.insert((vote.block_height, vote.creator.clone()), vote);
        }
        VoteContext {
            height: 1,
            creators,
            data,
        }
    }

    #[test]
    fn time_window_excludes_slow_blocks() {
        let a = Signer::generate().nodebase();
        let b = Signer::generate().nodebase();
        // spread 2s: datum = t_min + 1s, upper = datum + 0.5s
        let mut context = context_of(vec![
            candidate(&a, 1_000_000, 1),
            candidate(&b, 3_000_000, 1),
        ]);
        filter_time_window(&mut context).unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(context.blocks()[0].creator(), &a);
    }

    #[test]
    fn time_window_boundary_is_exclusive_above_slack() {
        let a = Signer::generate().nodebase();
        let b = Signer::generate().nodebase();
        let c = Signer::generate().nodebase();
        let t_min = 1_000_000u64;
        let t_max = 2_000_000u64;
        let datum = t_min + (t_max - t_min) / 2;

        // exactly datum + slack stays in
        let mut context = context_of(vec![
            candidate(&a, t_min, 1),
            candidate(&b, t_max, 1),
            candidate(&c, datum + CANDIDATE_TIME_SLACK_US, 1),
        ]);
        filter_time_window(&mut context).unwrap();
        assert!(context
            .data
            .contains_key(&(1, c.clone())));

        // one microsecond above the slack is out
        let mut context = context_of(vec![
            candidate(&a, t_min, 1),
            candidate(&b, t_max, 1),
            candidate(&c, datum + CANDIDATE_TIME_SLACK_US + 1, 1),
        ]);
        filter_time_window(&mut context).unwrap();
        assert!(!context.data.contains_key(&(1, c)));
    }

    #[test]
    fn max_transactions_then_oldest_wins() {
        let a = Signer::generate().nodebase();
        let b = Signer::generate().nodebase();
        let c = Signer::generate().nodebase();
        let mut context = context_of(vec![
            candidate(&a, 1_000, 3),
            candidate(&b, 1_001, 2),
            candidate(&c, 999, 3),
        ]);
        filter_max_transactions(&mut context);
        // b dropped on count; c has the older first transaction
        assert_eq!(context.len(), 1);
        assert_eq!(context.blocks()[0].creator(), &c);
    }

    #[test]
    fn hash_distance_tiebreak_is_deterministic() {
        let a = Signer::generate().nodebase();
        let b = Signer::generate().nodebase();
        let mut parent = BlockHeader::empty();
        parent.height = 0;

        let one = candidate(&a, 1_000, 1);
        let two = candidate(&b, 1_000, 1);
        let mut context = context_of(vec![one.clone(), two.clone()]);
        filter_hash_distance(&parent, &mut context).unwrap();
        assert_eq!(context.len(), 1);

        let survivor = context.blocks()[0].clone();
        let parent_hash = parent.digest();
        let d_one = hash_distance(&parent_hash, &one.pre_hash());
        let d_two = hash_distance(&parent_hash, &two.pre_hash());
        let expected = if d_one != d_two {
            if d_one > d_two { one } else { two }
        } else if one.pre_hash() < two.pre_hash() {
            one
        } else {
            two
        };
        assert_eq!(survivor.pre_hash(), expected.pre_hash());
    }

    #[test]
    fn hash_distance_equal_resolves_to_smaller_pre_hash() {
        let a = Signer::generate().nodebase();
        let b = Signer::generate().nodebase();
        let low = sha3_hex(b"aaa");
        let high = sha3_hex(b"zzz");
        let (small, large) = if low < high { (low, high) } else { (high, low) };

        let scored = vec![
            ((1u64, a.clone()), 40u64, large),
            ((1u64, b.clone()), 40u64, small),
        ];
        assert_eq!(pick_winner(&scored), Some((1, b)));

        // a strictly larger distance beats the lexicographic rule
        let scored = vec![
            ((1u64, a.clone()), 41u64, sha3_hex(b"zzz")),
            ((1u64, b), 40u64, sha3_hex(b"aaa")),
        ];
        assert_eq!(pick_winner(&scored), Some((1, a)));
    }

    #[test]
    fn unanimous_votes_keep_own_choice() {
        let own = sha3_hex(b"own");
        let voters: Vec<Address> = (0..4).map(|_| Signer::generate().nodebase()).collect();
        let context =
            vote_context(voters.iter().map(|v| vote_for(v, &own)).collect());
        assert_eq!(
            aggregate_vote_from_context(&own, &context, 1).unwrap(),
            own
        );
    }

    #[test]
    fn dissent_at_allowance_is_adopted() {
        let own = sha3_hex(b"own");
        let other = sha3_hex(b"other");
        let voters: Vec<Address> = (0..4).map(|_| Signer::generate().nodebase()).collect();
        let mut votes: Vec<Vote> =
            voters[..3].iter().map(|v| vote_for(v, &own)).collect();
        votes.push(vote_for(&voters[3], &other));
        let context = vote_context(votes);

        // one dissenter meets f = 1 and flips the choice
        assert_eq!(
            aggregate_vote_from_context(&own, &context, 1).unwrap(),
            other
        );
        // below the allowance the own choice stands
        assert_eq!(
            aggregate_vote_from_context(&own, &context, 2).unwrap(),
            own
        );
    }

    #[test]
    fn competing_qualified_dissents_abort_the_round() {
        let own = sha3_hex(b"own");
        let left = sha3_hex(b"left");
        let right = sha3_hex(b"right");
        let voters: Vec<Address> = (0..7).map(|_| Signer::generate().nodebase()).collect();
        let mut votes: Vec<Vote> =
            voters[..3].iter().map(|v| vote_for(v, &own)).collect();
        votes.push(vote_for(&voters[3], &left));
        votes.push(vote_for(&voters[4], &left));
        votes.push(vote_for(&voters[5], &right));
        votes.push(vote_for(&voters[6], &right));
        let context = vote_context(votes);

        // both dissents reach f = 2: no deterministic winner
        assert!(matches!(
            aggregate_vote_from_context(&own, &context, 2),
            Err(ChainError::Round(_))
        ));
        // with neither dissent qualifying the own choice stands
        assert_eq!(
            aggregate_vote_from_context(&own, &context, 3).unwrap(),
            own
        );
    }
}
