//! The replicated key-value database.
//!
//! A [`Database`] owns an entry index, a Merkle forest over it, and a per-key
//! cache. Writes append signed entries; reads resolve the latest entry per
//! key. Replicas reconcile by exchanging signed heads and merging whatever
//! entries the forest comparison proves missing.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::entry::{
    database_id, parse_database_id, Entry, Head, Manifest, SignedEntry, SignedHead,
    SignedManifest, HEAD_VERSION,
};
use crate::forest::{decode_sorted_entry, fetch_pollard, EntryIndex, Forest, IndexEntry};
use crate::hash::Hash;
use crate::keys::{Author, AuthorId};
use crate::pollard::{Comparison, LeafKind, Pollard};
use crate::store::{BlockStore, CacheRecord, KeyCache, StoreError};

/// Pollard order used when none is requested.
pub const DEFAULT_POLLARD_ORDER: u8 = 3;

/// A single replica of a key-value database.
#[derive(Debug)]
pub struct Database<S: BlockStore> {
    manifest: Manifest,
    manifest_address: Hash,
    author: Author,
    store: S,
    index: EntryIndex,
    forest: Forest,
    cache: KeyCache,
    /// Last published head, reused while the root is unchanged.
    current_head: Option<(Hash, SignedHead)>,
    /// Smallest sort key written since the forest was last rebuilt.
    dirty_since: Option<u64>,
}

impl<S: BlockStore> Database<S> {
    /// Create a new database, writing its signed manifest to the store.
    pub fn create(
        name: impl Into<String>,
        pollard_order: u8,
        author: Author,
        store: S,
    ) -> Result<Self> {
        let manifest = Manifest::new(name, pollard_order, author.id());
        let signed = manifest.clone().sign(&author)?;
        let manifest_address = store.put(signed.to_vec()?.into())?;
        Self::with_manifest(manifest, manifest_address, author, store)
    }

    /// Open an existing database from its textual id.
    ///
    /// The signed manifest must be present in the store; its signature is
    /// verified before anything else.
    pub fn open(id: &str, author: Author, store: S) -> Result<Self> {
        let manifest_address = parse_database_id(id)?;
        let bytes = store
            .get(&manifest_address)
            .context("manifest block not found")?;
        let signed = SignedManifest::from_bytes(&bytes)?;
        signed.verify().context("untrusted manifest")?;
        Self::with_manifest(signed.manifest().clone(), manifest_address, author, store)
    }

    fn with_manifest(
        manifest: Manifest,
        manifest_address: Hash,
        author: Author,
        store: S,
    ) -> Result<Self> {
        let forest = Forest::new(manifest.pollard_order)?;
        Ok(Database {
            manifest,
            manifest_address,
            author,
            store,
            index: EntryIndex::default(),
            forest,
            cache: KeyCache::default(),
            current_head: None,
            dirty_since: None,
        })
    }

    /// The textual database id, `forestdb/<manifest-address>`.
    pub fn id(&self) -> String {
        database_id(&self.manifest_address)
    }

    /// The database manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Content address of the signed manifest.
    pub fn manifest_address(&self) -> Hash {
        self.manifest_address
    }

    /// Id of the author this replica writes with.
    pub fn author_id(&self) -> AuthorId {
        self.author.id()
    }

    /// Number of entries known to this replica.
    pub fn size(&self) -> usize {
        self.index.len()
    }

    /// Number of layers in the forest.
    pub fn height(&self) -> usize {
        self.forest.height()
    }

    /// A shared reference to the block store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Write a value under a key, stamped with the current time.
    ///
    /// Returns the entry timestamp. The forest is rebuilt lazily; see
    /// [`Database::rebuild`].
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<u64> {
        self.insert_entry(Entry::new(key.into(), value.into(), self.author.id()))
    }

    /// Write a value with an explicit timestamp, for deterministic replay.
    pub fn set_at(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        timestamp: u64,
    ) -> Result<u64> {
        self.insert_entry(Entry::with_timestamp(
            key.into(),
            value.into(),
            self.author.id(),
            timestamp,
        ))
    }

    fn insert_entry(&mut self, entry: Entry) -> Result<u64> {
        let timestamp = entry.timestamp;
        let key = entry.key.clone();
        let value = entry.value.clone();
        let signed = entry.sign(&self.author)?;
        let hash = self.store.put(signed.to_vec()?.into())?;
        self.index.insert(IndexEntry {
            sort_key: timestamp,
            hash,
            key: key.clone(),
        });
        self.cache.insert(
            key,
            CacheRecord {
                hash,
                value: Some(value),
                timestamp,
            },
        );
        self.mark_dirty(timestamp);
        Ok(timestamp)
    }

    fn mark_dirty(&mut self, sort_key: u64) {
        self.dirty_since = Some(match self.dirty_since {
            Some(existing) => existing.min(sort_key),
            None => sort_key,
        });
    }

    /// Read the latest value written under a key.
    ///
    /// Returns `None` for unknown keys, and for entries whose block is
    /// missing or whose signature does not verify.
    pub fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        let Some(record) = self.cache.get(key) else {
            return Ok(None);
        };
        if let Some(value) = &record.value {
            return Ok(Some(value.clone()));
        }
        let hash = record.hash;
        match self.fetch_entry(&hash)? {
            Some(signed) => {
                let value = signed.value().clone();
                self.cache.resolve(key, &hash, value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fetch and verify a signed entry, skipping untrusted or missing ones.
    fn fetch_entry(&self, hash: &Hash) -> Result<Option<SignedEntry>> {
        let bytes = match self.store.get(hash) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => {
                debug!(entry = %hash.fmt_short(), "entry block not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let signed = SignedEntry::from_bytes(&bytes)?;
        if let Err(err) = signed.verify() {
            warn!(entry = %hash.fmt_short(), "skipping entry with invalid signature: {err}");
            return Ok(None);
        }
        Ok(Some(signed))
    }

    /// Iterate all entries in timestamp order.
    ///
    /// Snapshots the index at call time; writes that land during iteration
    /// do not surface. A key written twice yields once per entry. Entries
    /// that cannot be resolved or verified are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (String, Bytes)> + '_ {
        self.index
            .snapshot()
            .into_iter()
            .filter_map(move |entry| {
                let value = self.resolve_value(&entry)?;
                Some((entry.key, value))
            })
    }

    fn resolve_value(&self, entry: &IndexEntry) -> Option<Bytes> {
        if let Some(record) = self.cache.get(&entry.key) {
            if record.hash == entry.hash {
                if let Some(value) = &record.value {
                    return Some(value.clone());
                }
            }
        }
        match self.fetch_entry(&entry.hash) {
            Ok(Some(signed)) => Some(signed.value().clone()),
            Ok(None) => None,
            Err(err) => {
                warn!(entry = %entry.hash.fmt_short(), "failed to resolve entry: {err}");
                None
            }
        }
    }

    /// Rebuild the forest if any writes landed since the last rebuild.
    pub fn rebuild(&mut self) -> Result<()> {
        if let Some(sort_key) = self.dirty_since.take() {
            if let Err(err) = self.forest.update_layers(&self.index, &self.store, sort_key) {
                self.dirty_since = Some(sort_key);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Create a signed head for the current state, or fail on an empty
    /// database.
    ///
    /// While the forest root is unchanged the previously created head is
    /// returned instead of minting a new one.
    pub fn create_head(&mut self) -> Result<SignedHead> {
        match self.head_if_new()? {
            Some(head) => Ok(head),
            None => match &self.current_head {
                Some((_, head)) => Ok(head.clone()),
                None => bail!("empty database has no head"),
            },
        }
    }

    /// Create and store a signed head, unless the root is unchanged since
    /// the last one or the database is empty.
    pub fn head_if_new(&mut self) -> Result<Option<SignedHead>> {
        self.rebuild()?;
        if self.index.is_empty() {
            return Ok(None);
        }
        let root = self.forest.root_hash()?;
        if let Some((_, head)) = &self.current_head {
            if head.head().root == root {
                return Ok(None);
            }
        }
        let head = Head {
            version: HEAD_VERSION,
            manifest: self.manifest_address,
            root,
            timestamp: crate::entry::system_time_now(),
            author: self.author.id(),
            layers_count: self.forest.height() as u64,
            size: self.index.len() as u64,
        };
        let signed = head.sign(&self.author)?;
        let address = self.store.put(signed.to_vec()?.into())?;
        debug!(head = %address.fmt_short(), size = signed.head().size, "created head");
        self.current_head = Some((address, signed.clone()));
        Ok(Some(signed))
    }

    /// Content address of the last created head, if any.
    pub fn head_address(&self) -> Option<Hash> {
        self.current_head.as_ref().map(|(address, _)| *address)
    }

    /// Fetch and verify a signed head by address.
    pub fn fetch_head(&self, address: &Hash) -> Result<SignedHead> {
        let bytes = self.store.get(address)?;
        let signed = SignedHead::from_bytes(&bytes)?;
        signed.verify().context("untrusted head")?;
        if signed.head().manifest != self.manifest_address {
            bail!("head belongs to a different database");
        }
        Ok(signed)
    }

    /// Compare the local forest against a remote head.
    pub fn compare(&mut self, head: &Head) -> Result<Comparison> {
        if head.manifest != self.manifest_address {
            bail!("head belongs to a different database");
        }
        self.rebuild()?;
        Ok(self
            .forest
            .compare(&self.store, Some(head.root), head.layers_count)?)
    }

    /// Merge the entries a remote head proves this replica is missing.
    ///
    /// Re-admits every remote-only entry into the index and cache, then
    /// rebuilds the forest from the earliest re-admitted sort key. Returns
    /// the number of entries admitted. Commutative and idempotent over the
    /// entry set: merging the same head twice admits nothing new.
    pub fn merge(&mut self, head: &Head) -> Result<usize> {
        let comparison = self.compare(head)?;
        if comparison.is_equal {
            return Ok(0);
        }

        let mut admitted = 0usize;
        let mut rebuild_from = u64::MAX;
        for leaf in &comparison.remote_only {
            if leaf.kind() != LeafKind::SortedEntry {
                warn!(kind = ?leaf.kind(), "ignoring non-entry leaf in remote difference");
                continue;
            }
            let entry = decode_sorted_entry(leaf)?;
            if self.index.insert(entry.clone()) {
                rebuild_from = rebuild_from.min(entry.sort_key);
                self.cache.insert(
                    entry.key,
                    CacheRecord {
                        hash: entry.hash,
                        value: None,
                        timestamp: entry.sort_key,
                    },
                );
                admitted += 1;
            }
        }

        if admitted > 0 {
            self.forest
                .update_layers(&self.index, &self.store, rebuild_from)?;
        }
        debug!(admitted, "merged remote head");
        Ok(admitted)
    }

    /// Adopt a remote head wholesale by walking its forest top-down.
    ///
    /// Fetches every pollard reachable from the head's root, admits all
    /// entry leaves into the index and cache, and installs the fetched
    /// layers as the local forest. Only valid on a replica with no local
    /// entries; a populated replica must [`Database::merge`] instead, and
    /// loading one fails without touching its state.
    pub fn load(&mut self, signed: &SignedHead) -> Result<()> {
        let head = signed.head();
        if head.manifest != self.manifest_address {
            bail!("head belongs to a different database");
        }
        if !self.index.is_empty() {
            bail!("cannot load a head into a populated replica");
        }

        let mut layers_rev: Vec<Vec<Pollard>> = Vec::new();
        let mut current = vec![head.root];
        while !current.is_empty() {
            let mut row = Vec::with_capacity(current.len());
            let mut next = Vec::new();
            for hash in &current {
                let pollard = fetch_pollard(&self.store, hash)?
                    .ok_or(StoreError::NotFound)
                    .with_context(|| format!("pollard {} not found", hash.fmt_short()))?;
                for leaf in &pollard.leaves()[..pollard.len()] {
                    match leaf.kind() {
                        LeafKind::Pollard => {
                            next.push(
                                leaf.content_hash()
                                    .context("pollard leaf carries an invalid address")?,
                            );
                        }
                        LeafKind::SortedEntry => {
                            let entry = decode_sorted_entry(leaf)?;
                            self.index.insert(entry.clone());
                            self.cache.insert(
                                entry.key,
                                CacheRecord {
                                    hash: entry.hash,
                                    value: None,
                                    timestamp: entry.sort_key,
                                },
                            );
                        }
                        _ => {}
                    }
                }
                row.push(pollard);
            }
            layers_rev.push(row);
            current = next;
        }

        layers_rev.reverse();
        self.forest.set_layers(layers_rev);
        self.dirty_since = None;
        let address = Hash::new(signed.to_vec()?);
        self.current_head = Some((address, signed.clone()));
        debug!(size = self.index.len(), "loaded remote head");
        Ok(())
    }

    /// Drop all in-memory state. Stored blocks are untouched.
    pub fn close(&mut self) {
        self.cache.clear();
        self.index.clear();
        self.forest.clear();
        self.current_head = None;
        self.dirty_since = None;
    }
}
