use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::bus::{Bus, Exchange};
use crate::config::{
    now_micros, CANDIDATE_WAIT, CONFIRM_WAIT, TX_FRESH_WINDOW_US, VOTE_WAIT,
};
use crate::crypto::{verify, Address, Hash};
use crate::error::ChainError;
use crate::types::{Block, Confirm, Transaction, Vote};
use crate::validation::{
    validate_candidate, validate_finalize, validate_transaction, validate_vote,
};

/// Validator-set size and quorum shared by the timed queues.
struct QuorumGate {
    rep_count: AtomicUsize,
    terms_consent: AtomicUsize,
}

impl QuorumGate {
    fn new() -> Self {
        QuorumGate {
            rep_count: AtomicUsize::new(4),
            terms_consent: AtomicUsize::new(3),
        }
    }

    fn set(&self, count: usize, terms: usize) {
        self.rep_count.store(count, Ordering::Relaxed);
        self.terms_consent.store(terms, Ordering::Relaxed);
    }

    fn rep_count(&self) -> usize {
        self.rep_count.load(Ordering::Relaxed)
    }

    fn terms(&self) -> usize {
        self.terms_consent.load(Ordering::Relaxed)
    }
}

/// Wait until the full validator set reported in, or, once the phase
/// timeout passes, until the quorum is satisfied. Each insertion
/// notifies; no polling tick.
async fn wait_quorum(
    notify: &Notify,
    wait: Duration,
    len: impl Fn() -> usize,
    gate: &QuorumGate,
    what: &str,
) -> Result<(), ChainError> {
    let deadline = Instant::now() + wait;
    loop {
        if len() >= gate.rep_count() {
            return Ok(());
        }
        if timeout_at(deadline, notify.notified()).await.is_err() {
            if len() >= gate.terms() {
                return Ok(());
            }
            return Err(ChainError::Round(format!(
                "{}: is not terms of min {}",
                what,
                len()
            )));
        }
    }
}

// -----------------------------------------------------------------------------
// Per-height contexts handed to the selection / aggregation helpers
// -----------------------------------------------------------------------------

pub struct CandidateContext {
    pub height: u64,
    pub creators: Vec<Address>,
    pub times: Vec<u64>,
    pub data: BTreeMap<(u64, Address), Block>,
}

impl CandidateContext {
    pub fn blocks(&self) -> Vec<Block> {
        self.data.values().cloned().collect()
    }

    pub fn remove(&mut self, key: &(u64, Address)) {
        self.data.remove(key);
    }

    pub fn first_block(&self) -> Option<Block> {
        self.data.values().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct VoteContext {
    pub height: u64,
    pub creators: Vec<Address>,
    pub data: BTreeMap<(u64, Address), Vote>,
}

impl VoteContext {
    pub fn votes(&self) -> Vec<Vote> {
        self.data.values().cloned().collect()
    }
}

// -----------------------------------------------------------------------------
// Transaction queue (mempool)
// -----------------------------------------------------------------------------

#[derive(Default)]
struct TxStorage {
    map: HashMap<Hash, Transaction>,
    order: VecDeque<Hash>,
}

pub struct TxQueue {
    storage: Mutex<TxStorage>,
    notify: Notify,
}

impl TxQueue {
    fn new() -> Self {
        TxQueue {
            storage: Mutex::new(TxStorage::default()),
            notify: Notify::new(),
        }
    }

    pub fn insert(&self, transaction: Transaction) {
        let mut storage = self.storage.lock().unwrap();
        let hash = transaction.tx_hash.clone();
        if storage.map.insert(hash.clone(), transaction).is_none() {
            storage.order.push_back(hash);
        }
        drop(storage);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes once at least one transaction is pending.
    pub async fn exists(&self) {
        loop {
            if self.len() >= 1 {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// First `limit` pending transactions in arrival order, deep-copied.
    pub fn get_list(&self, limit: usize) -> Vec<Transaction> {
        let storage = self.storage.lock().unwrap();
        storage
            .order
            .iter()
            .filter_map(|hash| storage.map.get(hash))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn remove_hashes(&self, hashes: &[Hash]) {
        let mut storage = self.storage.lock().unwrap();
        let storage = &mut *storage;
        for hash in hashes {
            storage.map.remove(hash);
        }
        let map = &storage.map;
        storage.order.retain(|hash| map.contains_key(hash));
    }

    /// Purge transactions included in the finalized block.
    pub fn clear(&self, block: &Block) {
        let included: Vec<Hash> = block
            .transaction_list
            .iter()
            .map(|tx| tx.tx_hash.clone())
            .collect();
        self.remove_hashes(&included);
    }
}

// -----------------------------------------------------------------------------
// Candidate queue
// -----------------------------------------------------------------------------

pub struct CandidateQueue {
    storage: Mutex<HashMap<(u64, Address), Block>>,
    notify: Notify,
    gate: QuorumGate,
}

impl CandidateQueue {
    fn new() -> Self {
        CandidateQueue {
            storage: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            gate: QuorumGate::new(),
        }
    }

    pub fn set_info(&self, count: usize, terms: usize) {
        self.gate.set(count, terms);
    }

    /// Keyed by (height, creator); a second candidate from the same
    /// sender overwrites the first.
    pub fn insert(&self, block: Block) {
        let key = (block.height(), block.creator().clone());
        self.storage.lock().unwrap().insert(key, block);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub async fn exists(&self) -> Result<(), ChainError> {
        wait_quorum(
            &self.notify,
            CANDIDATE_WAIT,
            || self.len(),
            &self.gate,
            "candidate manager",
        )
        .await
    }

    pub fn get(&self, height: u64) -> CandidateContext {
        let storage = self.storage.lock().unwrap();
        let mut data = BTreeMap::new();
        let mut creators = Vec::new();
        let mut times = Vec::new();
        for ((h, creator), block) in storage.iter() {
            if *h == height {
                creators.push(creator.clone());
                times.push(block.header.timestamp);
                data.insert((*h, creator.clone()), block.clone());
            }
        }
        CandidateContext {
            height,
            creators,
            times,
            data,
        }
    }

    pub fn clear(&self, block: &Block) {
        self.storage
            .lock()
            .unwrap()
            .retain(|(height, _), _| *height > block.height());
    }

    pub fn reset(&self) {
        self.storage.lock().unwrap().clear();
    }
}

// -----------------------------------------------------------------------------
// Vote queue
// -----------------------------------------------------------------------------

pub struct VoteQueue {
    storage: Mutex<HashMap<(u64, Address), Vote>>,
    notify: Notify,
    gate: QuorumGate,
}

impl VoteQueue {
    fn new() -> Self {
        VoteQueue {
            storage: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            gate: QuorumGate::new(),
        }
    }

    pub fn set_info(&self, count: usize, terms: usize) {
        self.gate.set(count, terms);
    }

    pub fn insert(&self, vote: Vote) {
        let key = (vote.block_height, vote.creator.clone());
        self.storage.lock().unwrap().insert(key, vote);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub async fn exists(&self) -> Result<(), ChainError> {
        wait_quorum(
            &self.notify,
            VOTE_WAIT,
            || self.len(),
            &self.gate,
            "vote manager",
        )
        .await
    }

    pub fn get(&self, height: u64) -> VoteContext {
        let storage = self.storage.lock().unwrap();
        let mut data = BTreeMap::new();
        let mut creators = Vec::new();
        for ((h, creator), vote) in storage.iter() {
            if *h == height {
                creators.push(creator.clone());
                data.insert((*h, creator.clone()), vote.clone());
            }
        }
        VoteContext {
            height,
            creators,
            data,
        }
    }

    pub fn clear(&self, block: &Block) {
        self.storage
            .lock()
            .unwrap()
            .retain(|(height, _), _| *height > block.height());
    }

    pub fn reset(&self) {
        self.storage.lock().unwrap().clear();
    }
}

// -----------------------------------------------------------------------------
// Confirm queue
// -----------------------------------------------------------------------------

pub struct ConfirmQueue {
    storage: Mutex<HashMap<(u64, Address), Hash>>,
    notify: Notify,
    gate: QuorumGate,
}

impl ConfirmQueue {
    fn new() -> Self {
        ConfirmQueue {
            storage: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            gate: QuorumGate::new(),
        }
    }

    pub fn set_info(&self, count: usize, terms: usize) {
        self.gate.set(count, terms);
    }

    pub fn insert(&self, height: u64, sender: Address, block_hash: Hash) {
        self.storage
            .lock()
            .unwrap()
            .insert((height, sender), block_hash);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub async fn exists(&self) -> Result<(), ChainError> {
        wait_quorum(
            &self.notify,
            CONFIRM_WAIT,
            || self.len(),
            &self.gate,
            "confirm manager",
        )
        .await
    }

    /// Aggregate confirms for `height`: at least quorum distinct
    /// senders; a unanimous hash wins, otherwise any hash confirmed by
    /// at least quorum senders.
    pub fn get(&self, height: u64) -> Result<(Hash, Vec<Address>), ChainError> {
        let storage = self.storage.lock().unwrap();
        let mut senders = Vec::new();
        let mut hashes = Vec::new();
        for ((h, sender), hash) in storage.iter() {
            if *h == height {
                senders.push(sender.clone());
                hashes.push(hash.clone());
            }
        }
        drop(storage);

        if senders.len() < self.gate.terms() {
            return Err(ChainError::Round(format!(
                "confirm senders: {} below quorum {}",
                senders.len(),
                self.gate.terms()
            )));
        }

        let mut unique: Vec<Hash> = hashes.clone();
        unique.sort();
        unique.dedup();
        if unique.len() == 1 {
            return Ok((unique.remove(0), senders));
        }
        for hash in unique {
            let count = hashes.iter().filter(|h| **h == hash).count();
            if count >= self.gate.terms() {
                return Ok((hash, senders));
            }
        }
        Err(ChainError::Round(
            "confirm: all aggregate or nothing".to_string(),
        ))
    }

    pub fn clear(&self, block: &Block) {
        self.storage
            .lock()
            .unwrap()
            .retain(|(height, _), _| *height > block.height());
    }

    pub fn reset(&self) {
        self.storage.lock().unwrap().clear();
    }
}

// -----------------------------------------------------------------------------
// Finalize queue
// -----------------------------------------------------------------------------

pub struct FinalizeQueue {
    storage: Mutex<VecDeque<Block>>,
    notify: Notify,
}

impl FinalizeQueue {
    fn new() -> Self {
        FinalizeQueue {
            storage: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn insert(&self, block: Block) {
        self.storage.lock().unwrap().push_back(block);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    /// Completes with exactly one queued block; more than one is a
    /// backlog driving the catch-up path.
    pub async fn exists(&self) -> Result<(), ChainError> {
        loop {
            let len = self.len();
            if len == 1 {
                return Ok(());
            }
            if len > 1 {
                return Err(ChainError::Backlog);
            }
            self.notify.notified().await;
        }
    }

    /// Pop the block for `height`. A future block is a finality break;
    /// stale entries are purged before retrying the pop once.
    pub fn get(&self, height: u64) -> Result<Option<Block>, ChainError> {
        let mut storage = self.storage.lock().unwrap();
        let Some(block) = storage.pop_front() else {
            return Ok(None);
        };
        if block.height() == height {
            return Ok(Some(block));
        }
        if block.height() > height {
            return Err(ChainError::Finalize(format!(
                "expected height: {}, block height: {}",
                height,
                block.height()
            )));
        }
        let stale = block.height();
        storage.retain(|b| b.height() > stale);
        match storage.pop_front() {
            Some(next) if next.height() == height => Ok(Some(next)),
            Some(next) => Err(ChainError::Finalize(format!(
                "expected height: {}, block height: {}",
                height,
                next.height()
            ))),
            None => Ok(None),
        }
    }

    pub fn clear(&self, block: &Block) {
        self.storage
            .lock()
            .unwrap()
            .retain(|b| b.height() > block.height());
    }
}

// -----------------------------------------------------------------------------
// Hub
// -----------------------------------------------------------------------------

pub struct EventHub {
    pub transaction: TxQueue,
    pub candidate: CandidateQueue,
    pub vote: VoteQueue,
    pub confirm: ConfirmQueue,
    pub finalize: FinalizeQueue,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(EventHub {
            transaction: TxQueue::new(),
            candidate: CandidateQueue::new(),
            vote: VoteQueue::new(),
            confirm: ConfirmQueue::new(),
            finalize: FinalizeQueue::new(),
        })
    }

    pub fn set_info(&self, count: usize, terms: usize) {
        self.candidate.set_info(count, terms);
        self.vote.set_info(count, terms);
        self.confirm.set_info(count, terms);
    }

    /// Round completion: purge everything at or below the finalized
    /// height and the included transactions.
    pub fn clear(&self, block: &Block) {
        self.transaction.clear(block);
        self.candidate.clear(block);
        self.vote.clear(block);
        self.confirm.clear(block);
        self.finalize.clear(block);
    }

    /// Round retry: drop the in-flight round buffers.
    pub fn reset(&self) {
        self.candidate.reset();
        self.vote.reset();
        self.confirm.reset();
    }
}

/// Bind one consumer per exchange. Subscribers only follow the
/// transaction and finalize exchanges; validators all five. Every
/// stored object is followed by a yield to give the loop a tick.
pub fn spawn_consumers(hub: Arc<EventHub>, bus: Arc<dyn Bus>, validator_role: bool) {
    {
        let hub = hub.clone();
        let mut rx = bus.subscribe(Exchange::Transaction);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match Transaction::from_json(&body) {
                    Ok(tx) => {
                        if now_micros().saturating_sub(tx.timestamp) >= TX_FRESH_WINDOW_US {
                            log::debug!("stale transaction dropped: {}", tx.tx_hash);
                        } else if let Err(err) = validate_transaction(&tx) {
                            log::debug!("transaction dropped: {}", err);
                        } else {
                            hub.transaction.insert(tx);
                        }
                    }
                    Err(err) => log::debug!("transaction payload dropped: {}", err),
                }
                tokio::task::yield_now().await;
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = bus.subscribe(Exchange::Finalize);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match Block::from_json(&body) {
                    Ok(block) => {
                        if let Err(err) = validate_finalize(&block) {
                            log::debug!("finalize dropped: {}", err);
                        } else {
                            hub.finalize.insert(block);
                        }
                    }
                    Err(err) => log::debug!("finalize payload dropped: {}", err),
                }
                tokio::task::yield_now().await;
            }
        });
    }
    if !validator_role {
        return;
    }
    {
        let hub = hub.clone();
        let mut rx = bus.subscribe(Exchange::Candidate);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match Block::from_json(&body) {
                    Ok(block) => {
                        if let Err(err) = validate_candidate(&block) {
                            log::debug!("candidate dropped: {}", err);
                        } else {
                            hub.candidate.insert(block);
                        }
                    }
                    Err(err) => log::debug!("candidate payload dropped: {}", err),
                }
                tokio::task::yield_now().await;
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = bus.subscribe(Exchange::Vote);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match Vote::from_json(&body) {
                    Ok(vote) => {
                        if let Err(err) = validate_vote(&vote) {
                            log::debug!("vote dropped: {}", err);
                        } else {
                            hub.vote.insert(vote);
                        }
                    }
                    Err(err) => log::debug!("vote payload dropped: {}", err),
                }
                tokio::task::yield_now().await;
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = bus.subscribe(Exchange::Confirm);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match Confirm::from_wire(&body) {
                    Ok(confirm) => {
                        let digest =
                            Confirm::digest(confirm.height, &confirm.sender, &confirm.block_hash);
                        if let Err(err) = verify(&digest, &confirm.signature, &confirm.sender) {
                            log::debug!("confirm dropped: {}", err);
                        } else {
                            hub.confirm
                                .insert(confirm.height, confirm.sender, confirm.block_hash);
                        }
                    }
                    Err(err) => log::debug!("confirm payload dropped: {}", err),
                }
                tokio::task::yield_now().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha3_hex, Signer};
    use crate::types::BlockHeader;

    fn tx_with_hash(tag: &[u8]) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            tx_type: "transfer".into(),
            sender: Signer::generate().nodebase(),
            recipient: Signer::generate().nodebase(),
            value: 1,
            fee: 1,
            message: String::from_utf8_lossy(tag).to_string(),
            timestamp: now_micros(),
            tx_hash: Hash::none(),
            signature: String::new(),
        };
        tx.tx_hash = tx.digest();
        tx
    }

    fn candidate_at(height: u64, creator: &Address, timestamp: u64) -> Block {
        let mut header = BlockHeader::empty();
        header.height = height;
        header.creator = creator.clone();
        header.timestamp = timestamp;
        Block::new(header)
    }

    #[test]
    fn tx_queue_keeps_arrival_order_and_purges() {
        let queue = TxQueue::new();
        let first = tx_with_hash(b"a");
        let second = tx_with_hash(b"b");
        queue.insert(first.clone());
        queue.insert(second.clone());
        queue.insert(first.clone()); // dedupe by hash

        let list = queue.get_list(60);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].tx_hash, first.tx_hash);

        let mut block = Block::new(BlockHeader::empty());
        block.transaction_list.push(first);
        queue.clear(&block);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_list(60)[0].tx_hash, second.tx_hash);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_wait_completes_on_full_set() {
        let queue = CandidateQueue::new();
        queue.set_info(2, 2);
        let creator_a = Signer::generate().nodebase();
        let creator_b = Signer::generate().nodebase();
        queue.insert(candidate_at(1, &creator_a, 10));
        queue.insert(candidate_at(1, &creator_b, 11));
        queue.exists().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_wait_times_out_below_quorum() {
        let queue = CandidateQueue::new();
        queue.set_info(4, 3);
        queue.insert(candidate_at(1, &Signer::generate().nodebase(), 10));
        let result = queue.exists().await;
        assert!(matches!(result, Err(ChainError::Round(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_wait_accepts_quorum_after_timeout() {
        let queue = CandidateQueue::new();
        queue.set_info(4, 3);
        for _ in 0..3 {
            queue.insert(candidate_at(1, &Signer::generate().nodebase(), 10));
        }
        queue.exists().await.unwrap();
    }

    #[test]
    fn candidate_dedupe_is_last_write_wins() {
        let queue = CandidateQueue::new();
        let creator = Signer::generate().nodebase();
        queue.insert(candidate_at(1, &creator, 10));
        queue.insert(candidate_at(1, &creator, 99));
        let context = queue.get(1);
        assert_eq!(context.len(), 1);
        assert_eq!(context.blocks()[0].header.timestamp, 99);
    }

    #[test]
    fn confirm_aggregation_edges() {
        let queue = ConfirmQueue::new();
        queue.set_info(4, 3);
        let hash = sha3_hex(b"winner");

        // one short of quorum
        for _ in 0..2 {
            queue.insert(1, Signer::generate().nodebase(), hash.clone());
        }
        assert!(matches!(queue.get(1), Err(ChainError::Round(_))));

        // exactly quorum, unanimous
        queue.insert(1, Signer::generate().nodebase(), hash.clone());
        let (winner, senders) = queue.get(1).unwrap();
        assert_eq!(winner, hash);
        assert_eq!(senders.len(), 3);

        // split: three of four on one hash still confirms it
        let other = sha3_hex(b"loser");
        queue.insert(1, Signer::generate().nodebase(), other.clone());
        let (winner, senders) = queue.get(1).unwrap();
        assert_eq!(winner, hash);
        assert_eq!(senders.len(), 4);
    }

    #[test]
    fn confirm_split_without_quorum_fails() {
        let queue = ConfirmQueue::new();
        queue.set_info(4, 2);
        queue.insert(1, Signer::generate().nodebase(), sha3_hex(b"a"));
        queue.insert(1, Signer::generate().nodebase(), sha3_hex(b"b"));
        assert!(matches!(queue.get(1), Err(ChainError::Round(_))));
    }

    #[test]
    fn finalize_get_height_discipline() {
        let queue = FinalizeQueue::new();
        assert!(queue.get(5).unwrap().is_none());

        let mut stale = Block::new(BlockHeader::empty());
        stale.header.height = 4;
        let mut wanted = Block::new(BlockHeader::empty());
        wanted.header.height = 5;
        queue.insert(stale);
        queue.insert(wanted.clone());
        assert_eq!(queue.get(5).unwrap().unwrap().height(), 5);

        let mut future = Block::new(BlockHeader::empty());
        future.header.height = 9;
        queue.insert(future);
        assert!(matches!(queue.get(5), Err(ChainError::Finalize(_))));
    }

    #[tokio::test]
    async fn finalize_exists_flags_backlog() {
        let queue = FinalizeQueue::new();
        let mut one = Block::new(BlockHeader::empty());
        one.header.height = 1;
        let mut two = Block::new(BlockHeader::empty());
        two.header.height = 2;
        queue.insert(one);
        queue.insert(two);
        assert!(matches!(queue.exists().await, Err(ChainError::Backlog)));
    }

    #[test]
    fn hub_clear_purges_by_height() {
        let hub = EventHub::new();
        let creator = Signer::generate().nodebase();
        hub.candidate.insert(candidate_at(1, &creator, 10));
        hub.candidate.insert(candidate_at(2, &creator, 11));
        hub.confirm.insert(1, creator.clone(), sha3_hex(b"x"));

        let mut finalized = Block::new(BlockHeader::empty());
        finalized.header.height = 1;
        hub.clear(&finalized);

        assert_eq!(hub.candidate.get(1).len(), 0);
        assert_eq!(hub.candidate.get(2).len(), 1);
        assert!(matches!(hub.confirm.get(1), Err(ChainError::Round(_))));
    }
}
