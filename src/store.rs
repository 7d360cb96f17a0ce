//! Content-addressed block storage.
//!
//! Every persistent object (signed entries, pollards, heads, the manifest) is
//! stored as an opaque block addressed by the hash of its bytes. The engine
//! only needs the [`BlockStore`] trait; [`MemoryBlockStore`] is the in-memory
//! implementation used by replicas and tests.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::hash::Hash;

/// Error returned from block store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No block is stored under the requested address.
    #[error("block not found")]
    NotFound,
    /// Any other storage failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A content-addressed block store.
///
/// `put` is idempotent and pins: storing the same bytes twice yields the same
/// address and keeps a single copy, and stored blocks stay retrievable.
pub trait BlockStore: Send + Sync + 'static {
    /// Store a block and return its content address.
    fn put(&self, data: Bytes) -> Result<Hash, StoreError>;

    /// Retrieve a block by content address.
    ///
    /// Fails with [`StoreError::NotFound`] if the block is absent locally and
    /// cannot be fetched.
    fn get(&self, hash: &Hash) -> Result<Bytes, StoreError>;

    /// Whether a block is stored under the given address.
    fn has(&self, hash: &Hash) -> Result<bool, StoreError>;
}

/// In-memory [`BlockStore`] backed by a hash map.
///
/// Cloning is cheap; clones share the same underlying map, so replicas on the
/// same process can exchange blocks through a shared store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Hash, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks stored.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the store holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, data: Bytes) -> Result<Hash, StoreError> {
        let hash = Hash::new(&data);
        self.blocks.write().entry(hash).or_insert(data);
        Ok(hash)
    }

    fn get(&self, hash: &Hash) -> Result<Bytes, StoreError> {
        self.blocks
            .read()
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.blocks.read().contains_key(hash))
    }
}

/// What a replica remembers about the latest write to a key.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    /// Address of the signed entry block.
    pub hash: Hash,
    /// The decoded value, if it has been resolved locally.
    pub value: Option<Bytes>,
    /// Timestamp of the entry, used to keep only the latest write per key.
    pub timestamp: u64,
}

/// Per-key cache mapping each key to its latest known entry.
///
/// Owned by a single replica and only ever touched from its worker thread, so
/// no locking. An insert with an older timestamp than the cached record is
/// ignored.
#[derive(Debug, Default)]
pub struct KeyCache {
    records: HashMap<String, CacheRecord>,
}

impl KeyCache {
    /// Look up the cached record for a key.
    pub fn get(&self, key: &str) -> Option<&CacheRecord> {
        self.records.get(key)
    }

    /// Record the latest entry for a key, keeping the newest timestamp.
    ///
    /// Returns whether the record was stored.
    pub fn insert(&mut self, key: String, record: CacheRecord) -> bool {
        match self.records.get(&key) {
            Some(existing) if existing.timestamp > record.timestamp => false,
            _ => {
                self.records.insert(key, record);
                true
            }
        }
    }

    /// Attach a resolved value to an already cached record, if the address
    /// still matches.
    pub fn resolve(&mut self, key: &str, hash: &Hash, value: Bytes) {
        if let Some(record) = self.records.get_mut(key) {
            if record.hash == *hash {
                record.value = Some(value);
            }
        }
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
