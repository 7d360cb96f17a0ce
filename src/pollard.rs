//! The fixed-capacity Merkle tree node ("pollard").
//!
//! A pollard holds up to `2^order` leaves and hashes them bottom-up into an
//! internal binary tree. Once sealed with [`Pollard::update_layers`] it is
//! addressable by the hash of its canonical encoding, and two pollards can be
//! compared recursively, pruning equal subtrees by hash.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Kind tag of a [`Leaf`]. The variant order is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafKind {
    /// Placeholder for an unoccupied slot.
    Empty,
    /// Internal node carrying a sibling-pair hash.
    Hash,
    /// Content address of a child pollard.
    Pollard,
    /// Content address of a raw entry.
    Entry,
    /// Content address of an identity descriptor.
    Identity,
    /// Content address of a signed entry, carrying its sort key and logical key.
    SortedEntry,
}

/// A single slot in a pollard.
///
/// Only [`LeafKind::SortedEntry`] leaves carry `sort_fields` and `key`.
/// `Empty` leaves compare equal to any other `Empty` leaf regardless of
/// payload or position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    kind: LeafKind,
    data: Bytes,
    sort_fields: Option<Vec<u64>>,
    key: Option<String>,
}

impl Leaf {
    /// Create an `Empty` placeholder leaf.
    pub fn empty() -> Self {
        Leaf {
            kind: LeafKind::Empty,
            data: Bytes::new(),
            sort_fields: None,
            key: None,
        }
    }

    /// Create an internal `Hash` leaf.
    pub fn hash(data: impl Into<Bytes>) -> Self {
        Leaf {
            kind: LeafKind::Hash,
            data: data.into(),
            sort_fields: None,
            key: None,
        }
    }

    /// Create a `Pollard` leaf referencing a child pollard by content address.
    pub fn pollard(hash: &Hash) -> Self {
        Leaf {
            kind: LeafKind::Pollard,
            data: Bytes::copy_from_slice(hash.as_bytes()),
            sort_fields: None,
            key: None,
        }
    }

    /// Create a `SortedEntry` leaf referencing a signed entry.
    pub fn sorted_entry(hash: &Hash, sort_key: u64, key: String) -> Self {
        Leaf {
            kind: LeafKind::SortedEntry,
            data: Bytes::copy_from_slice(hash.as_bytes()),
            sort_fields: Some(vec![sort_key]),
            key: Some(key),
        }
    }

    /// The kind tag of this leaf.
    pub fn kind(&self) -> LeafKind {
        self.kind
    }

    /// The payload bytes of this leaf.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Whether this is an `Empty` placeholder.
    pub fn is_empty(&self) -> bool {
        self.kind == LeafKind::Empty
    }

    /// The content address carried in the payload, if it is 32 bytes long.
    pub fn content_hash(&self) -> Option<Hash> {
        Hash::from_slice(&self.data)
    }

    /// The primary sort field, if present.
    pub fn sort_key(&self) -> Option<u64> {
        self.sort_fields.as_ref().and_then(|f| f.first().copied())
    }

    /// The logical key, if present.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl PartialEq for Leaf {
    fn eq(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.kind == LeafKind::Empty {
            return true;
        }
        self.data == other.data
    }
}

impl Eq for Leaf {}

/// Errors raised by pollard operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The order is outside the supported `1..=7` range.
    #[error("pollard order must be between 1 and 7, got {0}")]
    InvalidOrder(u8),
    /// Two pollards of different order were compared.
    #[error("pollard orders are different: {ours} != {theirs}")]
    OrderMismatch {
        /// Order of the local pollard.
        ours: u8,
        /// Order of the remote pollard.
        theirs: u8,
    },
    /// The pollard was mutated since it was last hashed.
    #[error("pollard is not sealed")]
    NotSealed,
    /// The canonical encoding failed or did not round-trip.
    #[error("invalid pollard encoding")]
    InvalidEncoding,
    /// Serialization failure.
    #[error(transparent)]
    Encode(#[from] postcard::Error),
}

/// Outcome of comparing two pollards or two forests.
///
/// At the pollard level the two lists stay offset-aligned: pruned subtrees
/// emit `Empty` padding on both sides so that unequal leaves appear at the
/// same relative offset. Forest-level comparison filters the padding out.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    /// Whether the two sides are equal.
    pub is_equal: bool,
    /// Leaves present only on the local side.
    pub local_only: Vec<Leaf>,
    /// Leaves present only on the remote side.
    pub remote_only: Vec<Leaf>,
}

/// Canonical wire representation of a pollard.
#[derive(Serialize, Deserialize)]
struct PollardRepr {
    order: u8,
    max_length: u64,
    length: u64,
    layers: Vec<Vec<Leaf>>,
}

/// A fixed-capacity Merkle tree node.
#[derive(Debug, Clone)]
pub struct Pollard {
    order: u8,
    max_length: usize,
    length: usize,
    /// `order` internal levels; level 0 are the leaves, each level above holds
    /// the pairwise hashes of the level below and is half its size.
    layers: Vec<Vec<Leaf>>,
    dirty: bool,
    cid: Option<Hash>,
}

impl Pollard {
    /// Create an empty, sealed pollard of the given order.
    pub fn new(order: u8) -> Result<Self, Error> {
        if order == 0 || order >= 8 {
            return Err(Error::InvalidOrder(order));
        }
        let max_length = 1usize << order;
        let layers = (0..order)
            .map(|i| vec![Leaf::empty(); max_length >> i])
            .collect();
        let mut pollard = Pollard {
            order,
            max_length,
            length: 0,
            layers,
            dirty: true,
            cid: None,
        };
        pollard.update_layers()?;
        Ok(pollard)
    }

    /// The tree height exponent.
    pub fn order(&self) -> u8 {
        self.order
    }

    /// The leaf capacity, `2^order`.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// The number of occupied leaf slots.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether no leaf slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether another leaf can still be appended.
    pub fn is_free(&self) -> bool {
        self.length < self.max_length
    }

    /// Append a leaf at the next free slot.
    ///
    /// Returns `false` without mutating the pollard if it is full.
    pub fn add_leaf(&mut self, leaf: Leaf) -> bool {
        if self.length >= self.max_length {
            return false;
        }
        self.layers[0][self.length] = leaf;
        self.length += 1;
        self.dirty = true;
        true
    }

    /// Append a `Pollard` leaf referencing a child pollard.
    pub fn append_pollard(&mut self, hash: &Hash) -> bool {
        self.add_leaf(Leaf::pollard(hash))
    }

    /// Append a `SortedEntry` leaf referencing a signed entry.
    pub fn append_sorted_entry(&mut self, hash: &Hash, sort_key: u64, key: String) -> bool {
        self.add_leaf(Leaf::sorted_entry(hash, sort_key, key))
    }

    /// Recompute every internal level bottom-up and derive the content address.
    ///
    /// Sibling payloads are concatenated left-to-right before hashing, so the
    /// scheme is order sensitive. Idempotent: calling twice without
    /// intervening appends yields the same address.
    pub fn update_layers(&mut self) -> Result<Hash, Error> {
        for i in 0..(self.order as usize).saturating_sub(1) {
            for j in (0..(self.max_length >> i)).step_by(2) {
                let mut combined = Vec::with_capacity(
                    self.layers[i][j].data.len() + self.layers[i][j + 1].data.len(),
                );
                combined.extend_from_slice(&self.layers[i][j].data);
                combined.extend_from_slice(&self.layers[i][j + 1].data);
                let hash = blake3::hash(&combined);
                self.layers[i + 1][j / 2] = Leaf::hash(hash.as_bytes().to_vec());
            }
        }

        self.dirty = false;

        let buf = self.encode()?;
        let cid = Hash::new(&buf);
        self.cid = Some(cid);

        Ok(cid)
    }

    /// The content address derived from the last [`Self::update_layers`] call.
    pub fn cid(&self) -> Result<Hash, Error> {
        if self.dirty {
            return Err(Error::NotSealed);
        }
        self.cid.ok_or(Error::NotSealed)
    }

    /// The internal node at `(layer_index, position)`.
    ///
    /// Out-of-range coordinates yield an `Empty` leaf; the top coordinate
    /// `(order, 0)` yields a `Pollard` leaf wrapping this node's own address.
    pub fn node(&self, layer_index: usize, position: usize) -> Result<Leaf, Error> {
        if self.dirty {
            return Err(Error::NotSealed);
        }
        let order = self.order as usize;
        if layer_index > order || position >= (self.max_length >> layer_index.min(order)) {
            if layer_index == order && position == 0 {
                return self.root();
            }
            return Ok(Leaf::empty());
        }
        if layer_index == order {
            return self.root();
        }
        Ok(self.layers[layer_index][position].clone())
    }

    /// The root as a `Pollard` leaf wrapping this node's own content address.
    pub fn root(&self) -> Result<Leaf, Error> {
        Ok(Leaf::pollard(&self.cid()?))
    }

    /// The leaf at `position`, if within capacity.
    pub fn leaf(&self, position: usize) -> Option<&Leaf> {
        self.layers[0].get(position)
    }

    /// All leaf slots, occupied or not.
    pub fn leaves(&self) -> &[Leaf] {
        &self.layers[0]
    }

    /// Encode the canonical representation.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let repr = PollardRepr {
            order: self.order,
            max_length: self.max_length as u64,
            length: self.length as u64,
            layers: self.layers.clone(),
        };
        Ok(postcard::to_stdvec(&repr)?)
    }

    /// Decode a pollard from its canonical encoding.
    ///
    /// The content address is the hash of the given bytes, so a decoded
    /// pollard addresses identically to the one that produced the encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let repr: PollardRepr = postcard::from_bytes(bytes)?;
        if repr.order == 0 || repr.order >= 8 {
            return Err(Error::InvalidOrder(repr.order));
        }
        let max_length = 1usize << repr.order;
        if repr.max_length as usize != max_length
            || repr.length as usize > max_length
            || repr.layers.len() != repr.order as usize
        {
            return Err(Error::InvalidEncoding);
        }
        for (i, level) in repr.layers.iter().enumerate() {
            if level.len() != max_length >> i {
                return Err(Error::InvalidEncoding);
            }
        }
        Ok(Pollard {
            order: repr.order,
            max_length,
            length: repr.length as usize,
            layers: repr.layers,
            dirty: false,
            cid: Some(Hash::new(bytes)),
        })
    }

    /// Compare this pollard against another, which may be absent.
    ///
    /// An absent `other` behaves like an all-`Empty` pollard of the same
    /// order. Fails with [`Error::OrderMismatch`] if the orders differ.
    /// Descends both internal trees from the root; wherever the two sides
    /// carry equal hashes the whole subtree is skipped and `Empty` padding is
    /// emitted to keep leaf offsets aligned. `is_equal` holds iff every
    /// emitted pair is `Empty` on both sides.
    pub fn compare(&self, other: Option<&Pollard>) -> Result<Comparison, Error> {
        if self.dirty {
            return Err(Error::NotSealed);
        }
        let empty;
        let other = match other {
            Some(other) => {
                if other.order != self.order {
                    return Err(Error::OrderMismatch {
                        ours: self.order,
                        theirs: other.order,
                    });
                }
                if other.dirty {
                    return Err(Error::NotSealed);
                }
                other
            }
            None => {
                empty = Pollard::new(self.order)?;
                &empty
            }
        };

        let mut result = Comparison::default();
        self.compare_nodes(other, self.order as usize, 0, &mut result)?;

        result.is_equal = result
            .local_only
            .iter()
            .zip(result.remote_only.iter())
            .all(|(a, b)| a.is_empty() && b.is_empty());

        Ok(result)
    }

    fn compare_nodes(
        &self,
        other: &Pollard,
        layer_index: usize,
        position: usize,
        out: &mut Comparison,
    ) -> Result<(), Error> {
        let ours = self.node(layer_index, position)?;
        let theirs = other.node(layer_index, position)?;

        if ours == theirs {
            // Equal subtree: emit aligned padding so offsets stay in step.
            let padding = 1usize << layer_index;
            out.local_only
                .extend(std::iter::repeat_with(Leaf::empty).take(padding));
            out.remote_only
                .extend(std::iter::repeat_with(Leaf::empty).take(padding));
            return Ok(());
        }

        if layer_index == 0 {
            out.local_only.push(ours);
            out.remote_only.push(theirs);
            return Ok(());
        }

        self.compare_nodes(other, layer_index - 1, position * 2, out)?;
        self.compare_nodes(other, layer_index - 1, position * 2 + 1, out)?;

        Ok(())
    }
}
