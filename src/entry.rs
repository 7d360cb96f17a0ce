//! Signed records stored in a database: entries, heads and the manifest.
//!
//! Every record is encoded with postcard, signed by its author over the
//! encoded bytes, and addressed by the hash of the encoded *signed* record.

use std::time::SystemTime;

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::keys::{Author, AuthorId};

/// Wire format version of [`Entry`].
pub const ENTRY_VERSION: u8 = 1;
/// Wire format version of [`Head`].
pub const HEAD_VERSION: u8 = 1;
/// Wire format version of [`Manifest`].
pub const MANIFEST_VERSION: u8 = 1;

/// Database kind recorded in the [`Manifest`].
pub const KEY_VALUE_KIND: &str = "keyvalue";

/// Prefix of a textual database id, followed by the manifest address.
pub const DATABASE_PREFIX: &str = "forestdb";

/// Microseconds since the unix epoch.
///
/// Panics if the system time is before the unix epoch.
pub fn system_time_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}

/// A single key-value record before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Wire format version.
    pub version: u8,
    /// Creation time in microseconds since the unix epoch; the sort key.
    pub timestamp: u64,
    /// The key this record was written under.
    pub key: String,
    /// The value payload.
    pub value: Bytes,
    /// The author that created this record.
    pub author: AuthorId,
}

impl Entry {
    /// Create a new entry stamped with the current time.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, author: AuthorId) -> Self {
        Self::with_timestamp(key, value, author, system_time_now())
    }

    /// Create a new entry with an explicit timestamp.
    ///
    /// Useful for deterministic replay; normal writes go through
    /// [`Entry::new`].
    pub fn with_timestamp(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        author: AuthorId,
        timestamp: u64,
    ) -> Self {
        Entry {
            version: ENTRY_VERSION,
            timestamp,
            key: key.into(),
            value: value.into(),
            author,
        }
    }

    /// Serialize into the canonical byte representation that gets signed.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Sign this entry with the given author key.
    pub fn sign(self, author: &Author) -> Result<SignedEntry, postcard::Error> {
        debug_assert_eq!(self.author, author.id());
        let bytes = self.to_vec()?;
        let signature = author.sign(&bytes);
        Ok(SignedEntry {
            entry: self,
            signature,
        })
    }
}

/// An [`Entry`] together with its author's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    entry: Entry,
    signature: Signature,
}

impl SignedEntry {
    /// The signed entry.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The key of the signed entry.
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    /// The value of the signed entry.
    pub fn value(&self) -> &Bytes {
        &self.entry.value
    }

    /// The timestamp of the signed entry.
    pub fn timestamp(&self) -> u64 {
        self.entry.timestamp
    }

    /// Verify the signature against the author id recorded in the entry.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let bytes = self
            .entry
            .to_vec()
            .map_err(|_| SignatureError::new())?;
        self.entry.author.verify(&bytes, &self.signature)
    }

    /// Serialize into the canonical byte representation that gets stored.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Deserialize from the canonical byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// A snapshot of a database's Merkle forest root before signing.
///
/// Heads are what replicas publish to announce their current state; a
/// receiving replica compares the advertised root against its own forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Wire format version.
    pub version: u8,
    /// Address of the database manifest this head belongs to.
    pub manifest: Hash,
    /// Address of the forest's root pollard.
    pub root: Hash,
    /// Creation time in microseconds since the unix epoch.
    pub timestamp: u64,
    /// The author that published this head.
    pub author: AuthorId,
    /// Number of layers in the forest under `root`.
    pub layers_count: u64,
    /// Number of entries in the database at publication time.
    pub size: u64,
}

impl Head {
    /// Serialize into the canonical byte representation that gets signed.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Sign this head with the given author key.
    pub fn sign(self, author: &Author) -> Result<SignedHead, postcard::Error> {
        debug_assert_eq!(self.author, author.id());
        let bytes = self.to_vec()?;
        let signature = author.sign(&bytes);
        Ok(SignedHead {
            head: self,
            signature,
        })
    }
}

/// A [`Head`] together with its author's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHead {
    head: Head,
    signature: Signature,
}

impl SignedHead {
    /// The signed head.
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// Verify the signature against the author id recorded in the head.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let bytes = self
            .head
            .to_vec()
            .map_err(|_| SignatureError::new())?;
        self.head.author.verify(&bytes, &self.signature)
    }

    /// Serialize into the canonical byte representation that gets stored.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Deserialize from the canonical byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// The immutable description of a database before signing.
///
/// Its content address identifies the database: every replica of the same
/// database opens it from the same manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Wire format version.
    pub version: u8,
    /// Human-readable database name, also the pubsub topic.
    pub name: String,
    /// Database kind, [`KEY_VALUE_KIND`] for key-value databases.
    pub kind: String,
    /// Order of every pollard in the forest.
    pub pollard_order: u8,
    /// The author that created the database.
    pub author: AuthorId,
}

impl Manifest {
    /// Create a key-value manifest.
    pub fn new(name: impl Into<String>, pollard_order: u8, author: AuthorId) -> Self {
        Manifest {
            version: MANIFEST_VERSION,
            name: name.into(),
            kind: KEY_VALUE_KIND.to_string(),
            pollard_order,
            author,
        }
    }

    /// Serialize into the canonical byte representation that gets signed.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Sign this manifest with the given author key.
    pub fn sign(self, author: &Author) -> Result<SignedManifest, postcard::Error> {
        debug_assert_eq!(self.author, author.id());
        let bytes = self.to_vec()?;
        let signature = author.sign(&bytes);
        Ok(SignedManifest {
            manifest: self,
            signature,
        })
    }
}

/// A [`Manifest`] together with its author's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    manifest: Manifest,
    signature: Signature,
}

impl SignedManifest {
    /// The signed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Verify the signature against the author id recorded in the manifest.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let bytes = self
            .manifest
            .to_vec()
            .map_err(|_| SignatureError::new())?;
        self.manifest.author.verify(&bytes, &self.signature)
    }

    /// Serialize into the canonical byte representation that gets stored.
    pub fn to_vec(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Deserialize from the canonical byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Format the textual database id for a manifest address.
pub fn database_id(manifest: &Hash) -> String {
    format!("{DATABASE_PREFIX}/{manifest}")
}

/// Parse a textual database id back into the manifest address.
pub fn parse_database_id(id: &str) -> anyhow::Result<Hash> {
    let address = id
        .strip_prefix(DATABASE_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| anyhow::anyhow!("invalid database id: {id}"))?;
    address.parse()
}
