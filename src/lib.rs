//! Replicated append-biased key-value store reconciled over a Merkle forest.
//!
//! Every write becomes a signed, content-addressed entry. A replica keeps all
//! entry addresses in a timestamp-sorted index and builds a layered Merkle
//! tree of fixed-capacity nodes ("pollards") over it. Replicas announce
//! signed snapshots of their root ("heads") over a gossip topic; a receiving
//! replica compares the advertised tree against its own, pruning equal
//! subtrees by hash, and merges exactly the entries it is missing. Merging is
//! commutative and idempotent over the entry set, so replicas converge to the
//! same root without coordination.
//!
//! [`Database`] is the single-threaded core; [`DbHandle`] runs it on a
//! dedicated worker thread behind an async API.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod db;
pub mod entry;
pub mod forest;
pub mod hash;
pub mod keys;
pub mod net;
pub mod pollard;
pub mod store;

pub use self::actor::DbHandle;
pub use self::db::Database;
pub use self::entry::{Entry, Head, Manifest, SignedEntry, SignedHead};
pub use self::hash::Hash;
pub use self::keys::{Author, AuthorId};
pub use self::net::{Gossip, MemoryGossip};
pub use self::store::{BlockStore, MemoryBlockStore};
