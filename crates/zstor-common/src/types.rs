//! Core data model for zstor
//!
//! An object is stored as an ordered list of [`Chunk`]s, each of which is
//! erasure coded (or replicated) over a set of shards. The placement of all
//! chunks, together with the links to neighbouring objects, is recorded in a
//! [`Metadata`] record kept in the metadata store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// One fixed-size slice of an object's payload
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Size of the plain (unprocessed) payload of this chunk
    pub size: i64,
    /// Key under which the chunk's pieces are stored on every shard
    pub key: Vec<u8>,
    /// Shard addresses holding the pieces, in distribution order
    /// (data pieces first, then parity pieces)
    pub shards: Vec<String>,
}

impl Chunk {
    /// Create a new chunk description
    #[must_use]
    pub fn new(size: i64, key: Vec<u8>, shards: Vec<String>) -> Self {
        Self { size, key, shards }
    }
}

/// Metadata of a stored object
///
/// `next` and `previous` are keys of neighbouring records, forming an
/// append-only doubly linked list. They are lookup keys, never owning
/// references: the metadata store owns every record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Key of the object
    pub key: Vec<u8>,
    /// Write time in nanoseconds since the Unix epoch
    pub epoch: i64,
    /// Chunks in stream order
    pub chunks: Vec<Chunk>,
    /// Key of the next object in the chain
    pub next: Option<Vec<u8>>,
    /// Key of the previous object in the chain
    pub previous: Option<Vec<u8>>,
}

impl Metadata {
    /// Create an unlinked metadata record stamped with the current epoch
    #[must_use]
    pub fn new(key: Vec<u8>, chunks: Vec<Chunk>) -> Self {
        Self {
            key,
            epoch: epoch_now(),
            chunks,
            next: None,
            previous: None,
        }
    }

    /// Total size of the plain payload
    #[must_use]
    pub fn size(&self) -> i64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// Current time as an epoch value (nanoseconds since the Unix epoch)
#[must_use]
pub fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Status of a single object stored on a shard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// The object is missing
    Missing,
    /// The object is stored and intact
    Ok,
    /// The object is stored but its data is corrupted
    Corrupted,
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Ok => write!(f, "ok"),
            Self::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// Health of a whole object, as reported by a check
///
/// Ordered from worst to best, so the health of an object is the minimum
/// over its chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckStatus {
    /// At least one chunk can no longer be reconstructed
    Invalid,
    /// Every chunk can be reconstructed, but some pieces are missing or corrupted
    Valid,
    /// Every piece of every chunk is stored and intact
    Optimal,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::Valid => write!(f, "valid"),
            Self::Optimal => write!(f, "optimal"),
        }
    }
}

/// Human readable rendering of an opaque key, for logs and error messages
#[must_use]
pub fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => hex::encode(key),
    }
}
