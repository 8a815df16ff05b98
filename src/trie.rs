use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{sha3_hex, Hash};
use crate::storage::{Database, StorageError};

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("key not found")]
    NotFound,
    #[error("trie has no backing store")]
    NoStore,
    #[error("key is not hex: {0}")]
    BadKey(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("node codec: {0}")]
    Codec(#[from] bincode::Error),
}

/// Hex-nibble Merkle-Patricia node. Paths are nibble sequences carrying
/// the two-bit shape prefix packed into the leading nibble(s):
/// `[3, ..odd]` / `[2, 0, ..even]` for leaves, `[1, ..odd]` /
/// `[0, 0, ..even]` for extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Empty,
    Leaf { path: Vec<u8>, value: Vec<u8> },
    Extension { path: Vec<u8>, child: Hash },
    Branch { children: [Hash; 16], value: Option<Vec<u8>> },
}

fn empty_children() -> [Hash; 16] {
    Default::default()
}

fn add_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let mut out = if nibbles.len() % 2 == 1 {
        vec![if leaf { 3 } else { 1 }]
    } else {
        vec![if leaf { 2 } else { 0 }, 0]
    };
    out.extend_from_slice(nibbles);
    out
}

fn strip_prefix(path: &[u8]) -> &[u8] {
    match path.first().copied() {
        Some(1) | Some(3) => &path[1..],
        _ => &path[2..],
    }
}

fn common_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

pub fn hex_to_nibbles(key: &str) -> Result<Vec<u8>, TrieError> {
    key.chars()
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| TrieError::BadKey(key.to_string()))
        })
        .collect()
}

pub fn int_to_bytes32(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Uniform trie key: hex SHA3-256 of the raw key, so every key occupies
/// a fixed nibble length.
pub fn trie_key(raw: &[u8]) -> String {
    sha3_hex(raw).to_string()
}

pub fn index_key(index: u64) -> String {
    trie_key(&int_to_bytes32(index))
}

/// Content-addressed Merkle-Patricia trie. Mutated nodes land in an
/// in-memory write cache keyed by node hash; `commit` flushes the cache
/// to the backing store. A trie without a store is legal and used for
/// transient root computation.
pub struct Trie {
    root: Hash,
    db: Option<Arc<dyn Database>>,
    cache: HashMap<Hash, Vec<u8>>,
}

impl Trie {
    pub fn new(root: Hash, db: Option<Arc<dyn Database>>) -> Self {
        let mut trie = Trie {
            root,
            db,
            cache: HashMap::new(),
        };
        if trie.root.is_none() {
            let raw = bincode::serialize(&Node::Empty).expect("static node codec");
            trie.cache.insert(Hash::none(), raw);
        }
        trie
    }

    pub fn hash_only() -> Self {
        Trie::new(Hash::none(), None)
    }

    pub fn root(&self) -> &Hash {
        &self.root
    }

    pub fn cache(&self) -> &HashMap<Hash, Vec<u8>> {
        &self.cache
    }

    fn store_node(&mut self, node: &Node) -> Result<Hash, TrieError> {
        let raw = bincode::serialize(node)?;
        let key = sha3_hex(&raw);
        self.cache.insert(key.clone(), raw);
        Ok(key)
    }

    fn load_node(&mut self, key: &Hash) -> Result<Node, TrieError> {
        if key.is_none() {
            return Ok(Node::Empty);
        }
        if let Some(raw) = self.cache.get(key) {
            return Ok(bincode::deserialize(raw)?);
        }
        let Some(db) = &self.db else {
            return Ok(Node::Empty);
        };
        match db.get(key.as_bytes())? {
            Some(raw) => {
                let node = bincode::deserialize(&raw)?;
                self.cache.insert(key.clone(), raw);
                Ok(node)
            }
            None => Ok(Node::Empty),
        }
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Result<Hash, TrieError> {
        let nibbles = hex_to_nibbles(key)?;
        let root = self.root.clone();
        let root_node = self.load_node(&root)?;
        let next = self.add(root_node, &nibbles, value)?;
        let new_root = self.store_node(&next)?;
        self.root = new_root.clone();
        Ok(new_root)
    }

    fn add(&mut self, node: Node, key: &[u8], value: Vec<u8>) -> Result<Node, TrieError> {
        match node {
            Node::Empty => Ok(Node::Leaf {
                path: add_prefix(key, true),
                value,
            }),
            Node::Branch {
                mut children,
                value: slot,
            } => {
                if key.is_empty() {
                    Ok(Node::Branch {
                        children,
                        value: Some(value),
                    })
                } else {
                    let index = key[0] as usize;
                    let child = self.load_node(&children[index])?;
                    let next = self.add(child, &key[1..], value)?;
                    children[index] = self.store_node(&next)?;
                    Ok(Node::Branch {
                        children,
                        value: slot,
                    })
                }
            }
            encoded => self.add_encoded(encoded, key, value),
        }
    }

    fn add_encoded(&mut self, node: Node, key: &[u8], value: Vec<u8>) -> Result<Node, TrieError> {
        let path = match &node {
            Node::Leaf { path, .. } | Node::Extension { path, .. } => path.clone(),
            _ => unreachable!("add_encoded takes leaf or extension"),
        };
        let parent_full = strip_prefix(&path).to_vec();
        let common = common_len(&parent_full, key);
        let prefix = &parent_full[..common];
        let parent_rest = &parent_full[common..];
        let key_rest = &key[common..];

        let next = if parent_rest.is_empty() && key_rest.is_empty() {
            match node {
                Node::Leaf { path, .. } => Node::Leaf { path, value },
                Node::Extension { child, .. } => {
                    let inner = self.load_node(&child)?;
                    self.add(inner, &[], value)?
                }
                _ => unreachable!(),
            }
        } else if parent_rest.is_empty() {
            match node {
                Node::Extension { child, .. } => {
                    let inner = self.load_node(&child)?;
                    self.add(inner, key_rest, value)?
                }
                Node::Leaf { value: old, .. } => {
                    let mut children = empty_children();
                    let leaf = Node::Leaf {
                        path: add_prefix(&key_rest[1..], true),
                        value,
                    };
                    children[key_rest[0] as usize] = self.store_node(&leaf)?;
                    Node::Branch {
                        children,
                        value: Some(old),
                    }
                }
                _ => unreachable!(),
            }
        } else {
            self.split_branch(node, parent_rest, key_rest, value)?
        };

        if prefix.is_empty() {
            Ok(next)
        } else {
            let child = self.store_node(&next)?;
            Ok(Node::Extension {
                path: add_prefix(prefix, false),
                child,
            })
        }
    }

    /// Split a diverging leaf/extension into a branch carrying both the
    /// remainder of the old node and the new entry.
    fn split_branch(
        &mut self,
        node: Node,
        parent_rest: &[u8],
        key_rest: &[u8],
        value: Vec<u8>,
    ) -> Result<Node, TrieError> {
        let mut children = empty_children();

        match node {
            Node::Extension { child, .. } => {
                if parent_rest.len() == 1 {
                    children[parent_rest[0] as usize] = child;
                } else {
                    let tail = Node::Extension {
                        path: add_prefix(&parent_rest[1..], false),
                        child,
                    };
                    children[parent_rest[0] as usize] = self.store_node(&tail)?;
                }
            }
            Node::Leaf { value: old, .. } => {
                let tail = Node::Leaf {
                    path: add_prefix(&parent_rest[1..], true),
                    value: old,
                };
                children[parent_rest[0] as usize] = self.store_node(&tail)?;
            }
            _ => unreachable!("split takes leaf or extension"),
        }

        let mut slot = None;
        if key_rest.is_empty() {
            slot = Some(value);
        } else {
            let leaf = Node::Leaf {
                path: add_prefix(&key_rest[1..], true),
                value,
            };
            children[key_rest[0] as usize] = self.store_node(&leaf)?;
        }
        Ok(Node::Branch {
            children,
            value: slot,
        })
    }

    pub fn get(&mut self, key: &str) -> Result<Vec<u8>, TrieError> {
        let nibbles = hex_to_nibbles(key)?;
        let root = self.root.clone();
        let node = self.load_node(&root)?;
        self.get_node(node, &nibbles)?.ok_or(TrieError::NotFound)
    }

    fn get_node(&mut self, node: Node, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        match node {
            Node::Empty => Ok(None),
            Node::Branch { children, value } => {
                if key.is_empty() {
                    Ok(value)
                } else {
                    let child = self.load_node(&children[key[0] as usize])?;
                    self.get_node(child, &key[1..])
                }
            }
            Node::Leaf { path, value } => {
                if strip_prefix(&path) == key {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            Node::Extension { path, child } => {
                let parent = strip_prefix(&path).to_vec();
                if key.len() >= parent.len() && key[..parent.len()] == parent[..] {
                    let inner = self.load_node(&child)?;
                    self.get_node(inner, &key[parent.len()..])
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Flush the write cache to the backing store in one atomic batch
    /// and return the current root.
    pub fn commit(&mut self) -> Result<Hash, TrieError> {
        let db = self.db.as_ref().ok_or(TrieError::NoStore)?;
        let ops = self
            .cache
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect();
        db.write_batch(ops)?;
        Ok(self.root.clone())
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Root over `{i -> item_i}` keyed by `trie_key(i as 32 bytes)`, built
/// on a store-less trie. The root of an empty list is the none root.
pub fn make_hash_root<T: Serialize>(items: &[T]) -> Result<Trie, TrieError> {
    let mut trie = Trie::hash_only();
    for (index, item) in items.iter().enumerate() {
        trie.put(&index_key(index as u64), bincode::serialize(item)?)?;
    }
    Ok(trie)
}
