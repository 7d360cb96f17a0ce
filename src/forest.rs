//! The layered Merkle forest over a sorted entry index.
//!
//! Layer 0 partitions the index into fixed-capacity pollards in sort order;
//! each layer above holds pollards over the content addresses of the layer
//! below, until a single root pollard remains. Rebuilds are incremental: only
//! the suffix of the forest at or after a changed sort key is recomputed.

use tracing::trace;

use crate::hash::Hash;
use crate::pollard::{self, Comparison, Leaf, LeafKind, Pollard};
use crate::store::{BlockStore, StoreError};

/// Errors raised by forest operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The forest is empty and has no root.
    #[error("forest has no layers")]
    NoLayers,
    /// A node coordinate does not exist in the current forest.
    #[error("node position out of bounds")]
    OutOfBounds,
    /// A sorted entry leaf is missing its sort field.
    #[error("sorted entry leaf is missing its sort field")]
    MissingSortField,
    /// A sorted entry leaf is missing its key.
    #[error("sorted entry leaf is missing its key")]
    MissingKey,
    /// A leaf payload is not a valid content address.
    #[error("leaf carries an invalid address")]
    InvalidAddress,
    /// A pollard operation failed.
    #[error(transparent)]
    Pollard(#[from] pollard::Error),
    /// A block store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One element of the [`EntryIndex`]: an entry address with its sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The sort key, an entry timestamp.
    pub sort_key: u64,
    /// Content address of the signed entry.
    pub hash: Hash,
    /// The logical key the entry was written under.
    pub key: String,
}

/// The sorted set of all entry addresses known to a replica.
///
/// Kept sorted by `sort_key`; entries with equal sort keys stay in insertion
/// order. The index only ever grows.
#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    entries: Vec<IndexEntry>,
}

impl EntryIndex {
    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, keeping sort order.
    ///
    /// Idempotent: re-inserting an address already present under the same
    /// sort key is a no-op. Returns whether the entry was inserted.
    pub fn insert(&mut self, entry: IndexEntry) -> bool {
        let upper = self
            .entries
            .partition_point(|e| e.sort_key <= entry.sort_key);
        // scan the run of equal sort keys for the same address
        let lower = self.entries[..upper].partition_point(|e| e.sort_key < entry.sort_key);
        if self.entries[lower..upper].iter().any(|e| e.hash == entry.hash) {
            return false;
        }
        self.entries.insert(upper, entry);
        true
    }

    /// Index of the last entry with a sort key strictly before `sort_key`.
    pub fn last_before(&self, sort_key: u64) -> Option<usize> {
        let lower = self.entries.partition_point(|e| e.sort_key < sort_key);
        lower.checked_sub(1)
    }

    /// The entry at `index`.
    pub fn get(&self, index: usize) -> Option<&IndexEntry> {
        self.entries.get(index)
    }

    /// Iterate all entries in sort order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Iterate entries starting at `index`.
    pub fn iter_from(&self, index: usize) -> impl Iterator<Item = &IndexEntry> {
        self.entries[index.min(self.entries.len())..].iter()
    }

    /// Clone the current contents, for snapshot iteration.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.entries.clone()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Coordinate of a pollard within the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    /// Layer index, 0 for the leaf layer.
    pub layer: usize,
    /// Position within the layer.
    pub position: usize,
}

/// Extract the entry reference carried by a `SortedEntry` leaf.
pub fn decode_sorted_entry(leaf: &Leaf) -> Result<IndexEntry, Error> {
    debug_assert_eq!(leaf.kind(), LeafKind::SortedEntry);
    let hash = leaf.content_hash().ok_or(Error::InvalidAddress)?;
    let sort_key = leaf.sort_key().ok_or(Error::MissingSortField)?;
    let key = leaf.key().ok_or(Error::MissingKey)?.to_string();
    Ok(IndexEntry {
        sort_key,
        hash,
        key,
    })
}

/// The layered Merkle forest of a replica.
#[derive(Debug, Clone)]
pub struct Forest {
    order: u8,
    max_length: usize,
    layers: Vec<Vec<Pollard>>,
}

impl Forest {
    /// Create an empty forest whose pollards all have the given order.
    pub fn new(order: u8) -> Result<Self, Error> {
        // validate the order once up front
        Pollard::new(order)?;
        Ok(Forest {
            order,
            max_length: 1 << order,
            layers: Vec::new(),
        })
    }

    /// The pollard order used throughout the forest.
    pub fn order(&self) -> u8 {
        self.order
    }

    /// The pollard capacity, `2^order`.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of layers.
    pub fn height(&self) -> usize {
        self.layers.len()
    }

    /// The root pollard.
    ///
    /// Fails with [`Error::NoLayers`] on an empty forest.
    pub fn root(&self) -> Result<&Pollard, Error> {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .ok_or(Error::NoLayers)
    }

    /// Content address of the root pollard.
    pub fn root_hash(&self) -> Result<Hash, Error> {
        Ok(self.root()?.cid()?)
    }

    /// The pollard at a coordinate, if present.
    pub fn node(&self, layer: usize, position: usize) -> Option<&Pollard> {
        self.layers.get(layer).and_then(|l| l.get(position))
    }

    /// Drop all layers.
    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Replace the layers wholesale, bottom layer first.
    ///
    /// Used when loading a forest fetched from a remote head.
    pub fn set_layers(&mut self, layers: Vec<Vec<Pollard>>) {
        self.layers = layers;
    }

    fn check_bounds(&self, node: NodeId) -> Result<(), Error> {
        let layer = self.layers.get(node.layer).ok_or(Error::OutOfBounds)?;
        if node.position >= layer.len() {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    /// Coordinate of the parent node.
    ///
    /// Fails if the given coordinate is outside the current forest.
    pub fn parent(&self, node: NodeId) -> Result<NodeId, Error> {
        self.check_bounds(node)?;
        Ok(NodeId {
            layer: node.layer + 1,
            position: node.position / self.max_length,
        })
    }

    /// Coordinates of the child nodes, empty for leaf-layer nodes.
    ///
    /// Fails if the given coordinate is outside the current forest.
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>, Error> {
        self.check_bounds(node)?;
        if node.layer == 0 {
            return Ok(Vec::new());
        }
        Ok((0..self.max_length)
            .map(|i| NodeId {
                layer: node.layer - 1,
                position: node.position * self.max_length + i,
            })
            .collect())
    }

    /// Coordinate of the left sibling.
    ///
    /// Fails if the node is leftmost or its coordinate is outside the
    /// current forest.
    pub fn left(&self, node: NodeId) -> Result<NodeId, Error> {
        self.check_bounds(node)?;
        if node.position == 0 {
            return Err(Error::OutOfBounds);
        }
        Ok(NodeId {
            layer: node.layer,
            position: node.position - 1,
        })
    }

    /// Rebuild the forest incrementally for a change at `sort_key`.
    ///
    /// Recomputes layer 0 from the pollard containing the last entry strictly
    /// before `sort_key` (stepping forward when that entry seals its pollard)
    /// to the end of the index, then propagates the affected suffix of every
    /// layer above. Every rebuilt pollard is persisted to `store`.
    pub fn update_layers<S: BlockStore>(
        &mut self,
        index: &EntryIndex,
        store: &S,
        sort_key: u64,
    ) -> Result<(), Error> {
        if index.is_empty() {
            self.layers.clear();
            return Ok(());
        }

        let max_length = self.max_length;
        let start = match index.last_before(sort_key) {
            None => 0,
            // an entry at the last slot of its pollard seals it; start with
            // the next one
            Some(pos) if pos % max_length == max_length - 1 => pos + 1,
            Some(pos) => pos,
        };
        let start_index = start - start % max_length;
        let start_position = start_index / max_length;
        trace!(sort_key, start_index, "rebuilding layers");

        // layer 0: sorted entry leaves
        let mut pollard = Pollard::new(self.order)?;
        let mut position = start_position;
        for entry in index.iter_from(start_index) {
            if !pollard.is_free() {
                self.seal_and_store(pollard, 0, position, store)?;
                pollard = Pollard::new(self.order)?;
                position += 1;
            }
            pollard.append_sorted_entry(&entry.hash, entry.sort_key, entry.key.clone());
        }
        self.seal_and_store(pollard, 0, position, store)?;

        // upper layers: pollards over the addresses of the layer below
        let mut layer = 1usize;
        while self.layers[layer - 1].len() > 1 {
            if self.layers.len() == layer {
                self.layers.push(Vec::new());
            }
            let mut position = start_position / max_length.pow(layer as u32);
            let start_lower = position * max_length;
            let child_hashes: Vec<Hash> = self.layers[layer - 1][start_lower..]
                .iter()
                .map(|p| p.cid())
                .collect::<Result<_, _>>()?;

            let mut pollard = Pollard::new(self.order)?;
            for hash in &child_hashes {
                if !pollard.is_free() {
                    self.seal_and_store(pollard, layer, position, store)?;
                    pollard = Pollard::new(self.order)?;
                    position += 1;
                }
                pollard.append_pollard(hash);
            }
            self.seal_and_store(pollard, layer, position, store)?;
            layer += 1;
        }

        Ok(())
    }

    fn seal_and_store<S: BlockStore>(
        &mut self,
        mut pollard: Pollard,
        layer: usize,
        position: usize,
        store: &S,
    ) -> Result<(), Error> {
        pollard.update_layers()?;
        store.put(pollard.encode()?.into())?;
        while self.layers.len() <= layer {
            self.layers.push(Vec::new());
        }
        let row = &mut self.layers[layer];
        if position < row.len() {
            row[position] = pollard;
        } else {
            debug_assert_eq!(position, row.len());
            row.push(pollard);
        }
        Ok(())
    }

    /// Compare this forest against a remote forest advertised by its root.
    ///
    /// See [`compare_forests`].
    pub fn compare<S: BlockStore>(
        &self,
        store: &S,
        remote_root: Option<Hash>,
        remote_layers: u64,
    ) -> Result<Comparison, Error> {
        compare_forests(self, store, remote_root, remote_layers)
    }
}

/// Read access to local pollards by forest coordinate.
///
/// The comparator only needs this capability from the local side, so it can
/// be exercised against synthetic providers as well as a full [`Forest`].
pub trait NodeProvider {
    /// Pollard order shared by all nodes.
    fn order(&self) -> u8;

    /// Number of layers.
    fn height(&self) -> usize;

    /// The pollard at a coordinate, if present.
    fn node(&self, layer: usize, position: usize) -> Option<&Pollard>;
}

impl NodeProvider for Forest {
    fn order(&self) -> u8 {
        self.order
    }

    fn height(&self) -> usize {
        self.layers.len()
    }

    fn node(&self, layer: usize, position: usize) -> Option<&Pollard> {
        self.layers.get(layer).and_then(|l| l.get(position))
    }
}

/// The remote side of one step of the comparison descent.
///
/// A shorter remote tree has no nodes at the local forest's upper layers;
/// its root anchors at the remote's own top layer, reachable only along the
/// position 0 spine.
#[derive(Debug, Clone, Copy)]
enum RemoteNode {
    /// The remote pollard at this coordinate.
    At(Hash),
    /// The remote root sits at layer `top`, position 0, below this coordinate.
    Anchored {
        /// Address of the remote root pollard.
        root: Hash,
        /// Layer the remote root lives at.
        top: usize,
    },
    /// Nothing on the remote side at or below this coordinate.
    Absent,
}

/// Compare a local forest against a remote forest advertised by its root.
///
/// Descends both trees from the top of the taller one; coordinates absent on
/// either side behave like empty pollards, and subtrees with equal addresses
/// are pruned without fetching. A remote tree shorter than the local forest
/// is anchored at its own top layer. The returned lists carry only the
/// leaves genuinely present on one side.
pub fn compare_forests<P: NodeProvider, S: BlockStore>(
    local: &P,
    store: &S,
    remote_root: Option<Hash>,
    remote_layers: u64,
) -> Result<Comparison, Error> {
    let remote_height = match remote_root {
        Some(_) => (remote_layers as usize).max(1),
        None => 0,
    };
    let layers_count = local.height().max(remote_height);
    let mut result = Comparison::default();
    if layers_count > 0 {
        let top = layers_count - 1;
        let remote = match remote_root {
            None => RemoteNode::Absent,
            Some(root) if remote_height - 1 == top => RemoteNode::At(root),
            Some(root) => RemoteNode::Anchored {
                root,
                top: remote_height - 1,
            },
        };
        compare_nodes(local, store, top, 0, remote, &mut result)?;
    }
    result.local_only.retain(|leaf| !leaf.is_empty());
    result.remote_only.retain(|leaf| !leaf.is_empty());
    result.is_equal = result.local_only.is_empty() && result.remote_only.is_empty();
    Ok(result)
}

fn compare_nodes<P: NodeProvider, S: BlockStore>(
    provider: &P,
    store: &S,
    layer: usize,
    position: usize,
    remote: RemoteNode,
    out: &mut Comparison,
) -> Result<(), Error> {
    let local = provider.node(layer, position);
    // prune by address before fetching anything
    if let (Some(local), RemoteNode::At(remote)) = (local, remote) {
        if local.cid()? == remote {
            return Ok(());
        }
    }
    let remote_pollard = match remote {
        RemoteNode::At(hash) => fetch_pollard(store, &hash)?,
        RemoteNode::Anchored { .. } | RemoteNode::Absent => None,
    };
    if local.is_none() && remote_pollard.is_none() {
        if let RemoteNode::Anchored { root, top } = remote {
            // nothing local this high up; drop straight to the remote root
            return compare_nodes(provider, store, top, 0, RemoteNode::At(root), out);
        }
        return Ok(());
    }

    let empty;
    let local = match local {
        Some(pollard) => pollard,
        None => {
            empty = Pollard::new(provider.order())?;
            &empty
        }
    };

    let comparison = local.compare(remote_pollard.as_ref())?;
    // an anchored remote always has a subtree further down; keep descending
    if comparison.is_equal && !matches!(remote, RemoteNode::Anchored { .. }) {
        return Ok(());
    }
    if layer == 0 {
        out.local_only.extend(comparison.local_only);
        out.remote_only.extend(comparison.remote_only);
        return Ok(());
    }

    let max_length = 1usize << provider.order();
    let span = local
        .len()
        .max(remote_pollard.as_ref().map_or(0, |p| p.len()))
        .max(1);
    for i in 0..span {
        let child = match remote {
            // the remote child address comes from the remote parent's leaf;
            // anything that is not a pollard reference means no child there
            RemoteNode::At(_) => remote_pollard
                .as_ref()
                .and_then(|p| p.leaf(i))
                .filter(|leaf| leaf.kind() == LeafKind::Pollard)
                .and_then(|leaf| leaf.content_hash())
                .map_or(RemoteNode::Absent, RemoteNode::At),
            // only the leftmost child leads down to the anchored root
            RemoteNode::Anchored { root, top } if position == 0 && i == 0 => {
                if layer - 1 == top {
                    RemoteNode::At(root)
                } else {
                    RemoteNode::Anchored { root, top }
                }
            }
            RemoteNode::Anchored { .. } | RemoteNode::Absent => RemoteNode::Absent,
        };
        compare_nodes(provider, store, layer - 1, position * max_length + i, child, out)?;
    }
    Ok(())
}

/// Fetch and decode a pollard by address.
///
/// An absent block means the coordinate lies beyond the remote's actual tree
/// and yields `None`; a present but undecodable block is an error.
pub fn fetch_pollard<S: BlockStore>(store: &S, hash: &Hash) -> Result<Option<Pollard>, Error> {
    match store.get(hash) {
        Ok(bytes) => Ok(Some(Pollard::decode(&bytes)?)),
        Err(StoreError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::store::MemoryBlockStore;

    fn entry(i: u64) -> IndexEntry {
        IndexEntry {
            sort_key: i * 10,
            hash: Hash::new(i.to_be_bytes()),
            key: format!("k{i}"),
        }
    }

    /// Insert entries one at a time, rebuilding after each, like live writes.
    fn build_incremental(
        order: u8,
        store: &MemoryBlockStore,
        entries: &[IndexEntry],
    ) -> (Forest, EntryIndex) {
        let mut forest = Forest::new(order).unwrap();
        let mut index = EntryIndex::default();
        for e in entries {
            assert!(index.insert(e.clone()));
            forest.update_layers(&index, store, e.sort_key).unwrap();
        }
        (forest, index)
    }

    /// Insert all entries, then rebuild once from the beginning.
    fn build_batch(
        order: u8,
        store: &MemoryBlockStore,
        entries: &[IndexEntry],
    ) -> (Forest, EntryIndex) {
        let mut forest = Forest::new(order).unwrap();
        let mut index = EntryIndex::default();
        for e in entries {
            index.insert(e.clone());
        }
        forest.update_layers(&index, store, 0).unwrap();
        (forest, index)
    }

    #[test]
    fn test_index_insert_sorted_and_idempotent() {
        let mut index = EntryIndex::default();
        assert!(index.insert(entry(3)));
        assert!(index.insert(entry(1)));
        assert!(index.insert(entry(2)));
        assert!(!index.insert(entry(2)));
        assert_eq!(index.len(), 3);
        let keys: Vec<u64> = index.iter().map(|e| e.sort_key).collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn test_index_duplicate_sort_keys_insertion_order() {
        let mut index = EntryIndex::default();
        let a = IndexEntry {
            sort_key: 10,
            hash: Hash::new(b"a"),
            key: "a".into(),
        };
        let b = IndexEntry {
            sort_key: 10,
            hash: Hash::new(b"b"),
            key: "b".into(),
        };
        assert!(index.insert(a.clone()));
        assert!(index.insert(b.clone()));
        assert!(!index.insert(a.clone()));
        assert_eq!(index.get(0).unwrap().key, "a");
        assert_eq!(index.get(1).unwrap().key, "b");
    }

    #[test]
    fn test_last_before() {
        let mut index = EntryIndex::default();
        for i in 1..=4 {
            index.insert(entry(i));
        }
        assert_eq!(index.last_before(5), None);
        assert_eq!(index.last_before(10), None);
        assert_eq!(index.last_before(11), Some(0));
        assert_eq!(index.last_before(35), Some(2));
        assert_eq!(index.last_before(1000), Some(3));
    }

    #[test]
    fn test_forest_shape() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=9).map(entry).collect();
        let (forest, _) = build_incremental(3, &store, &entries);

        assert_eq!(forest.height(), 2);
        assert_eq!(forest.layers[0].len(), 2);
        assert_eq!(forest.layers[0][0].len(), 8);
        assert_eq!(forest.layers[0][1].len(), 1);
        assert_eq!(forest.layers[1].len(), 1);
        assert_eq!(forest.layers[1][0].len(), 2);
        forest.root_hash().unwrap();
    }

    #[test]
    fn test_empty_forest_has_no_root() {
        let forest = Forest::new(3).unwrap();
        assert!(matches!(forest.root_hash(), Err(Error::NoLayers)));
    }

    #[test]
    fn test_incremental_matches_batch() {
        // the boundary step at the last slot of a pollard must behave
        // identically across orders
        for order in [2u8, 3] {
            for n in [1u64, 3, 4, 5, 8, 9, 16, 17, 40] {
                let store = MemoryBlockStore::new();
                let entries: Vec<_> = (1..=n).map(entry).collect();
                let (incremental, _) = build_incremental(order, &store, &entries);
                let (batch, _) = build_batch(order, &store, &entries);
                assert_eq!(
                    incremental.root_hash().unwrap(),
                    batch.root_hash().unwrap(),
                    "order {order}, {n} entries"
                );
            }
        }
    }

    #[test]
    fn test_rebuild_after_out_of_order_insert() {
        // merging admits an entry with a timestamp in the middle of the
        // index; rebuilding from that key must converge with a full rebuild
        let store = MemoryBlockStore::new();
        let mut entries: Vec<_> = (1..=20).map(entry).collect();
        let late = IndexEntry {
            sort_key: 95,
            hash: Hash::new(b"late"),
            key: "late".into(),
        };

        let (mut forest, mut index) = build_incremental(3, &store, &entries);
        index.insert(late.clone());
        forest.update_layers(&index, &store, late.sort_key).unwrap();

        entries.push(late);
        let (batch, _) = build_batch(3, &store, &entries);
        assert_eq!(forest.root_hash().unwrap(), batch.root_hash().unwrap());
    }

    #[test]
    fn test_navigation() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=9).map(entry).collect();
        let (forest, _) = build_incremental(3, &store, &entries);

        let leaf = NodeId {
            layer: 0,
            position: 1,
        };
        assert_eq!(
            forest.parent(leaf).unwrap(),
            NodeId {
                layer: 1,
                position: 0
            }
        );
        assert!(forest
            .parent(NodeId {
                layer: 0,
                position: 7
            })
            .is_err());
        assert_eq!(
            forest.left(leaf).unwrap(),
            NodeId {
                layer: 0,
                position: 0
            }
        );
        assert!(forest
            .left(NodeId {
                layer: 0,
                position: 0
            })
            .is_err());
        assert!(forest
            .left(NodeId {
                layer: 0,
                position: 7
            })
            .is_err());

        let children = forest
            .children(NodeId {
                layer: 1,
                position: 0,
            })
            .unwrap();
        assert_eq!(children.len(), 8);
        assert_eq!(children[3].position, 3);
        assert!(forest.children(leaf).unwrap().is_empty());
    }

    #[test]
    fn test_compare_equal_forests() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=9).map(entry).collect();
        let (a, _) = build_incremental(3, &store, &entries);
        let (b, _) = build_batch(3, &store, &entries);

        let comparison = a
            .compare(
                &store,
                Some(b.root_hash().unwrap()),
                b.height() as u64,
            )
            .unwrap();
        assert!(comparison.is_equal);
    }

    #[test]
    fn test_compare_against_nothing() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=9).map(entry).collect();
        let (forest, _) = build_incremental(3, &store, &entries);

        let comparison = forest.compare(&store, None, 0).unwrap();
        assert!(!comparison.is_equal);
        assert_eq!(comparison.local_only.len(), 9);
        assert!(comparison.remote_only.is_empty());
        for leaf in &comparison.local_only {
            assert_eq!(leaf.kind(), LeafKind::SortedEntry);
        }
    }

    #[test]
    fn test_compare_finds_remote_extra() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=9).map(entry).collect();
        let (a, _) = build_incremental(3, &store, &entries);

        let mut more = entries.clone();
        more.push(entry(10));
        let (b, _) = build_batch(3, &store, &more);

        let comparison = a
            .compare(&store, Some(b.root_hash().unwrap()), b.height() as u64)
            .unwrap();
        assert!(!comparison.is_equal);
        assert!(comparison.local_only.is_empty());
        assert_eq!(comparison.remote_only.len(), 1);
        let found = decode_sorted_entry(&comparison.remote_only[0]).unwrap();
        assert_eq!(found.sort_key, 100);
        assert_eq!(found.key, "k10");
    }

    #[test]
    fn test_compare_taller_local_sees_shorter_remote() {
        // ten entries of order 3 give a two-layer local forest; the remote
        // root is a single layer-0 pollard and must anchor at its own layer
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=10).map(entry).collect();
        let (a, _) = build_incremental(3, &store, &entries);
        assert_eq!(a.height(), 2);

        let remote_entries: Vec<_> = (100..=102).map(entry).collect();
        let (b, _) = build_batch(3, &store, &remote_entries);
        assert_eq!(b.height(), 1);

        let comparison = a
            .compare(&store, Some(b.root_hash().unwrap()), b.height() as u64)
            .unwrap();
        assert!(!comparison.is_equal);
        assert_eq!(comparison.local_only.len(), 10);
        assert_eq!(comparison.remote_only.len(), 3);
        let keys: Vec<u64> = comparison
            .remote_only
            .iter()
            .map(|leaf| decode_sorted_entry(leaf).unwrap().sort_key)
            .collect();
        assert_eq!(keys, vec![1000, 1010, 1020]);

        // the mirrored comparison descends into the taller tree
        let comparison = b
            .compare(&store, Some(a.root_hash().unwrap()), a.height() as u64)
            .unwrap();
        assert!(!comparison.is_equal);
        assert_eq!(comparison.local_only.len(), 3);
        assert_eq!(comparison.remote_only.len(), 10);
    }

    #[test]
    fn test_compare_shorter_remote_prefix_is_found() {
        // the remote holds a strict prefix of the local entries; everything
        // it has is local too, so only the surplus may surface
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=10).map(entry).collect();
        let (a, _) = build_incremental(3, &store, &entries);

        let (b, _) = build_batch(3, &store, &entries[..3]);
        assert_eq!(b.height(), 1);

        let comparison = a
            .compare(&store, Some(b.root_hash().unwrap()), b.height() as u64)
            .unwrap();
        assert!(!comparison.is_equal);
        assert!(comparison.remote_only.is_empty());
        assert_eq!(comparison.local_only.len(), 7);
    }

    #[derive(Debug, Clone)]
    struct CountingStore {
        inner: MemoryBlockStore,
        gets: Arc<AtomicUsize>,
    }

    impl BlockStore for CountingStore {
        fn put(&self, data: Bytes) -> Result<Hash, StoreError> {
            self.inner.put(data)
        }
        fn get(&self, hash: &Hash) -> Result<Bytes, StoreError> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            self.inner.get(hash)
        }
        fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
            self.inner.has(hash)
        }
    }

    #[test]
    fn test_compare_touches_bounded_subtrees() {
        let store = CountingStore {
            inner: MemoryBlockStore::new(),
            gets: Arc::new(AtomicUsize::new(0)),
        };
        let entries: Vec<_> = (1..=10_000).map(entry).collect();
        let (a, _) = build_batch(3, &store.inner, &entries);

        // the extra entry sorts after everything else, so only the pollards
        // along one root-to-leaf path differ
        let mut more = entries.clone();
        more.push(IndexEntry {
            sort_key: 100_005,
            hash: Hash::new(b"extra"),
            key: "extra".into(),
        });
        let (b, _) = build_batch(3, &store.inner, &more);

        store.gets.store(0, Ordering::Relaxed);
        let comparison = a
            .compare(&store, Some(b.root_hash().unwrap()), b.height() as u64)
            .unwrap();
        assert!(!comparison.is_equal);
        assert_eq!(comparison.remote_only.len(), 1);

        // only pollards along the differing path get fetched; equal siblings
        // are pruned by address without touching the store
        let gets = store.gets.load(Ordering::Relaxed);
        assert!(gets <= 16, "fetched {gets} pollards");
    }

    /// A provider over hand-built layers, no index or builder involved.
    struct RawLayers {
        order: u8,
        layers: Vec<Vec<Pollard>>,
    }

    impl NodeProvider for RawLayers {
        fn order(&self) -> u8 {
            self.order
        }
        fn height(&self) -> usize {
            self.layers.len()
        }
        fn node(&self, layer: usize, position: usize) -> Option<&Pollard> {
            self.layers.get(layer).and_then(|l| l.get(position))
        }
    }

    #[test]
    fn test_compare_synthetic_provider() {
        let store = MemoryBlockStore::new();
        let entries: Vec<_> = (1..=3).map(entry).collect();
        let (forest, _) = build_batch(2, &store, &entries);

        let raw = RawLayers {
            order: 2,
            layers: vec![vec![forest.node(0, 0).unwrap().clone()]],
        };
        let comparison =
            compare_forests(&raw, &store, Some(forest.root_hash().unwrap()), 1).unwrap();
        assert!(comparison.is_equal);

        let empty = RawLayers {
            order: 2,
            layers: Vec::new(),
        };
        let comparison =
            compare_forests(&empty, &store, Some(forest.root_hash().unwrap()), 1).unwrap();
        assert!(!comparison.is_equal);
        assert_eq!(comparison.remote_only.len(), 3);
    }

    /// Decode a leaf from hand-built wire fields, bypassing the constructors.
    ///
    /// A remote pollard arrives as untrusted bytes, so leaves with missing
    /// sort fields or keys are reachable even though no constructor builds
    /// them.
    fn leaf_from_wire(
        kind: LeafKind,
        data: &[u8],
        sort_fields: Option<Vec<u64>>,
        key: Option<String>,
    ) -> Leaf {
        let bytes =
            postcard::to_stdvec(&(kind, Bytes::copy_from_slice(data), sort_fields, key)).unwrap();
        postcard::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_decode_sorted_entry_structural_errors() {
        let hash = Hash::new(b"e");
        let good = Leaf::sorted_entry(&hash, 7, "k".into());
        let decoded = decode_sorted_entry(&good).unwrap();
        assert_eq!(decoded.hash, hash);
        assert_eq!(decoded.sort_key, 7);
        assert_eq!(decoded.key, "k");

        let no_sort = leaf_from_wire(
            LeafKind::SortedEntry,
            hash.as_bytes(),
            None,
            Some("k".into()),
        );
        assert!(matches!(
            decode_sorted_entry(&no_sort),
            Err(Error::MissingSortField)
        ));
        let empty_sort = leaf_from_wire(
            LeafKind::SortedEntry,
            hash.as_bytes(),
            Some(Vec::new()),
            Some("k".into()),
        );
        assert!(matches!(
            decode_sorted_entry(&empty_sort),
            Err(Error::MissingSortField)
        ));

        let no_key = leaf_from_wire(LeafKind::SortedEntry, hash.as_bytes(), Some(vec![7]), None);
        assert!(matches!(
            decode_sorted_entry(&no_key),
            Err(Error::MissingKey)
        ));

        let bad_address = leaf_from_wire(
            LeafKind::SortedEntry,
            b"short",
            Some(vec![7]),
            Some("k".into()),
        );
        assert!(matches!(
            decode_sorted_entry(&bad_address),
            Err(Error::InvalidAddress)
        ));
    }
}
