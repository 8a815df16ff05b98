use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{CONSTANT_REP, MINIMUM_KEY};
use crate::crypto::{sha3_hex, Address, Hash};
use crate::error::ChainError;
use crate::storage::Database;
use crate::trie::{int_to_bytes32, trie_key, Trie, TrieError};
use crate::types::{Account, Delegation, ValidatorRecord, ACCOUNT_CONTRACT};
use crate::validation::{validate_address, validate_contract};

/// World state over one trie rooted at `state_root`, with decoded
/// account and code caches. `commit` checks every cached account
/// against the trie before flushing; `clear` rolls the trie back to the
/// last committed root.
pub struct StateStore {
    db: Arc<dyn Database>,
    trie: Trie,
    root: Hash,
    cache: HashMap<Address, Account>,
    code_cache: HashMap<Hash, Vec<u8>>,
}

impl StateStore {
    pub fn new(db: Arc<dyn Database>, root: Hash) -> Self {
        let trie = Trie::new(root.clone(), Some(db.clone()));
        StateStore {
            db,
            trie,
            root,
            cache: HashMap::new(),
            code_cache: HashMap::new(),
        }
    }

    pub fn state_root(&self) -> &Hash {
        &self.root
    }

    /// Root of the in-memory trie, including uncommitted writes.
    pub fn cache_trie_root(&self) -> Hash {
        self.trie.root().clone()
    }

    pub fn set_root(&mut self, root: Hash) {
        self.trie = Trie::new(root.clone(), Some(self.db.clone()));
        self.root = root;
        self.cache.clear();
        self.code_cache.clear();
    }

    fn load_account(&mut self, address: &Address) -> Result<Account, ChainError> {
        if let Some(account) = self.cache.get(address) {
            return Ok(account.clone());
        }
        let account = match self.trie.get(&trie_key(address.as_bytes())) {
            Ok(raw) => bincode::deserialize(&raw)?,
            Err(TrieError::NotFound) => Account::fresh(address.clone()),
            Err(err) => return Err(err.into()),
        };
        self.cache.insert(address.clone(), account.clone());
        Ok(account)
    }

    fn store_account(&mut self, account: Account) -> Result<(), ChainError> {
        let raw = bincode::serialize(&account)?;
        self.trie.put(&trie_key(account.address.as_bytes()), raw)?;
        self.cache.insert(account.address.clone(), account);
        Ok(())
    }

    pub fn get_account(&mut self, address: &Address) -> Result<Account, ChainError> {
        validate_address(address)?;
        self.load_account(address)
    }

    pub fn get_balance(&mut self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.get_account(address)?.balance)
    }

    pub fn get_nonce(&mut self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.get_account(address)?.nonce)
    }

    pub fn increase_nonce(&mut self, address: &Address) -> Result<(), ChainError> {
        validate_address(address)?;
        let mut account = self.load_account(address)?;
        account.nonce += 1;
        self.store_account(account)
    }

    /// Add a signed delta to the balance; a negative result is a
    /// validation error.
    pub fn compute_balance(&mut self, address: &Address, delta: i128) -> Result<(), ChainError> {
        validate_address(address)?;
        let mut account = self.load_account(address)?;
        let next = account.balance as i128 + delta;
        if next < 0 {
            return Err(ChainError::Validation(format!(
                "balance of {} would be negative: {} {:+}",
                address, account.balance, delta
            )));
        }
        account.balance = next as u64;
        self.store_account(account)
    }

    pub fn set_balance(&mut self, address: &Address, balance: u64) -> Result<(), ChainError> {
        validate_address(address)?;
        let mut account = self.load_account(address)?;
        account.balance = balance;
        self.store_account(account)
    }

    fn compute_stake_balance(&mut self, address: &Address, stake: u64) -> Result<(), ChainError> {
        validate_address(address)?;
        let mut account = self.load_account(address)?;
        account.delegated_balance += stake;
        self.store_account(account)
    }

    pub fn get_delegated_balance(&mut self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.get_account(address)?.delegated_balance)
    }

    pub fn get_minimum(&self) -> Result<u64, ChainError> {
        let raw = self
            .db
            .get(MINIMUM_KEY)?
            .ok_or_else(|| ChainError::Missing("minimum".into()))?;
        let tail: [u8; 8] = raw[raw.len() - 8..]
            .try_into()
            .map_err(|_| ChainError::Serialize("minimum width".into()))?;
        Ok(u64::from_be_bytes(tail))
    }

    pub fn set_minimum(&self, value: u64) -> Result<(), ChainError> {
        self.db.put(MINIMUM_KEY, &int_to_bytes32(value))?;
        Ok(())
    }

    pub fn get_code(&mut self, address: &Address) -> Result<Option<Vec<u8>>, ChainError> {
        if validate_contract(address).is_err() {
            return Ok(None);
        }
        let account = self.load_account(address)?;
        if account.code.is_none() {
            return Ok(None);
        }
        if let Some(code) = self.code_cache.get(&account.code) {
            return Ok(Some(code.clone()));
        }
        match self.db.get(account.code.as_bytes())? {
            Some(code) => {
                self.code_cache.insert(account.code.clone(), code.clone());
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Install code content-addressed and point the contract account at
    /// its hash.
    pub fn set_code(&mut self, address: &Address, code: &[u8]) -> Result<(), ChainError> {
        validate_contract(address)?;
        let code_hash = sha3_hex(code);
        self.code_cache.insert(code_hash.clone(), code.to_vec());
        self.db.put(code_hash.as_bytes(), code)?;
        let mut account = self.load_account(address)?;
        account.code = code_hash;
        account.account_type = ACCOUNT_CONTRACT.to_string();
        self.store_account(account)
    }

    fn delegation_key(from: &Address, to: &Address) -> Hash {
        let mut material = from.as_bytes().to_vec();
        material.extend_from_slice(to.as_bytes());
        sha3_hex(&material)
    }

    fn put_delegation(&mut self, key: &Hash, record: Delegation) -> Result<(), ChainError> {
        match self.db.get(key.as_bytes())? {
            None => {
                self.db.put(key.as_bytes(), &bincode::serialize(&record)?)?;
            }
            Some(raw) => {
                let old: Delegation = bincode::deserialize(&raw)?;
                if old.from != record.from {
                    return Err(ChainError::Validation(format!(
                        "delegation key collision: {} vs {}",
                        old.from, record.from
                    )));
                }
                let merged = Delegation {
                    amount: old.amount + record.amount,
                    ..record
                };
                self.db.put(key.as_bytes(), &bincode::serialize(&merged)?)?;
            }
        }
        Ok(())
    }

    /// Move `value` from the sender balance to the recipient's
    /// delegated-stake balance and record the delegation, accumulating
    /// on repeats.
    pub fn set_delegated(
        &mut self,
        from: &Address,
        to: &Address,
        value: u64,
    ) -> Result<(), ChainError> {
        let key = Self::delegation_key(from, to);

        let mut sender = self.load_account(from)?;
        if !sender.delegated.contains(&key) {
            sender.delegated.push(key.clone());
        }
        self.store_account(sender)?;

        let mut recipient = self.load_account(to)?;
        if !recipient.delegated.contains(&key) {
            recipient.delegated.push(key.clone());
        }
        self.store_account(recipient)?;

        self.compute_balance(from, -(value as i128))?;
        self.compute_stake_balance(to, value)?;
        self.put_delegation(
            &key,
            Delegation {
                from: from.clone(),
                to: to.clone(),
                amount: value,
            },
        )
    }

    pub fn get_delegated(&mut self, address: &Address) -> Result<Vec<Delegation>, ChainError> {
        let account = self.load_account(address)?;
        let mut records = Vec::with_capacity(account.delegated.len());
        for key in &account.delegated {
            let raw = self
                .db
                .get(key.as_bytes())?
                .ok_or_else(|| ChainError::Missing(format!("delegation {}", key)))?;
            records.push(bincode::deserialize(&raw)?);
        }
        Ok(records)
    }

    /// Sum of the address' self-delegated stake.
    pub fn get_account_delegate(&mut self, address: &Address) -> Result<u64, ChainError> {
        Ok(self
            .get_delegated(address)?
            .iter()
            .filter(|d| d.from == d.to)
            .map(|d| d.amount)
            .sum())
    }

    /// Register iff the self-delegated stake meets the genesis minimum;
    /// below the bar the call is a silent no-op.
    pub fn register_validator(
        &mut self,
        address: &Address,
        node_id: &str,
        signature: &str,
    ) -> Result<(), ChainError> {
        if self.get_account_delegate(address)? < self.get_minimum()? {
            log::debug!("{} does not qualify as validator", address);
            return Ok(());
        }
        let mut account = self.load_account(address)?;
        account.node_id = node_id.to_string();
        account.node_signature = signature.to_string();
        self.store_account(account)?;

        let record = ValidatorRecord {
            node_id: node_id.to_string(),
            account: address.clone(),
            delegated: self.get_delegated_balance(address)?,
        };
        let key = trie_key(CONSTANT_REP);
        let mut records = match self.trie.get(&key) {
            Ok(raw) => bincode::deserialize::<Vec<ValidatorRecord>>(&raw)?,
            Err(TrieError::NotFound) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        records.push(record);
        self.trie.put(&key, bincode::serialize(&records)?)?;
        Ok(())
    }

    pub fn get_validator_records(&mut self) -> Result<Vec<ValidatorRecord>, ChainError> {
        let key = trie_key(CONSTANT_REP);
        match self.trie.get(&key) {
            Ok(raw) => Ok(bincode::deserialize(&raw)?),
            Err(TrieError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_validator_ids(&mut self) -> Result<Vec<String>, ChainError> {
        Ok(self
            .get_validator_records()?
            .into_iter()
            .map(|rep| rep.node_id)
            .collect())
    }

    /// `(n, allowed_faults)` with `allowed_faults = (n - 1) / 3`.
    pub fn get_validator_count(&mut self) -> Result<(usize, usize), ChainError> {
        let count = self.get_validator_records()?.len();
        Ok((count, count.saturating_sub(1) / 3))
    }

    /// Assert every cached account agrees with the trie, then flush.
    pub fn commit(&mut self) -> Result<Hash, ChainError> {
        let cached: Vec<(Address, Account)> = self
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (address, account) in cached {
            match self.trie.get(&trie_key(address.as_bytes())) {
                Ok(raw) => {
                    if raw != bincode::serialize(&account)? {
                        log::debug!("state cache diverged for {}", address);
                        return Err(ChainError::Cache(format!(
                            "latest account state error, {}",
                            address
                        )));
                    }
                }
                Err(TrieError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.root = self.trie.commit()?;
        Ok(self.root.clone())
    }

    /// Drop caches and discard uncommitted trie nodes, rolling back to
    /// the last committed root.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.code_cache.clear();
        self.trie = Trie::new(self.root.clone(), Some(self.db.clone()));
    }
}
