//! The sequencer core of an RFC 6962 Certificate Transparency log backed by
//! tiled object storage.
//!
//! Submitted (pre-)certificates collect in a pool ([`Log::add_leaf`]); a
//! periodic sequencing round ([`Log::sequence_pool`]) atomically promotes
//! the pool to a contiguous range of tree indices under a single timestamp,
//! computes the new Merkle hashes, uploads the changed tiles and a freshly
//! signed tree head to the backend, and releases the per-leaf futures with
//! their assigned indices.
//!
//! The log's persistent state is entirely in the [`Backend`]: the current
//! signed tree head under the `"sth"` key, hash tiles under
//! `tile/10/<level>/...`, and the serialized entries under
//! `tile/10/data/...`. At startup [`Log::load`] verifies the tree head and
//! rehydrates the right edge of the tree from the backend.
//!
//! At most one sequencer instance per log may run; rounds on a single
//! instance are serialized internally.

use thiserror::Error;
use tlog_tiles::{Hash, TlogError};

mod checkpoint;
mod entry;
mod log_ops;
mod util;

pub use checkpoint::{
    digitally_sign, rfc6962_signature_timestamp, sign_tree_head, KeyPair, Rfc6962Verifier,
    TreeWithTimestamp,
};
pub use entry::{read_tile_leaf, LogEntry, ParsedTileLeaf};
pub use log_ops::{Log, PendingLeaf, STH_KEY, TILE_HEIGHT, TILE_WIDTH};

/// Unix timestamp in milliseconds since the epoch, ignoring leap seconds.
pub type UnixTimestamp = u64;

/// Zero-based index of a leaf in the tree.
pub type LeafIndex = u64;

/// What a submitter learns once its leaf is sequenced: the assigned index
/// and the timestamp of the round, which is both the SCT and STH timestamp.
pub type SequenceMetadata = (LeafIndex, UnixTimestamp);

/// An error from the log core.
#[derive(Error, Debug)]
pub enum LogError {
    /// A backend operation failed or the round deadline expired.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    /// The wall clock did not advance past the previous tree head, which
    /// would violate STH timestamp monotonicity.
    #[error("time did not progress: {last} -> {now}")]
    TimeNotMonotonic { last: UnixTimestamp, now: UnixTimestamp },

    /// A signing operation or key encoding failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// The private key is neither ECDSA P-256 nor RSA.
    #[error("unsupported key type")]
    UnsupportedKeyType,

    /// A tile failed to parse.
    #[error("malformed tile: {0}")]
    MalformedTile(String),

    /// A tile contradicts the tree it claims to be part of.
    #[error("inconsistent tile: {0}")]
    TileInconsistent(String),

    /// The stored signed tree head failed verification at bootstrap.
    #[error("invalid signed tree head: {0}")]
    SthInvalid(String),

    /// A state invariant that the sequencer relies on does not hold.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

impl From<TlogError> for LogError {
    fn from(e: TlogError) -> Self {
        match e {
            TlogError::InconsistentTile => LogError::TileInconsistent(e.to_string()),
            _ => LogError::InternalInconsistency(e.to_string()),
        }
    }
}

/// An error from a [`Backend`] operation.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The object does not exist. Recoverable only at bootstrap.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The operation failed after the backend exhausted its own retries.
    #[error("{0}")]
    Unavailable(String),
}

/// A strongly consistent object store holding the log's persistent state.
pub trait Backend {
    /// Stores `data` under `key`. Implementations retry transient errors
    /// internally and return only unrecoverable failures; when `upload`
    /// returns, the object is fully persisted. May be called concurrently.
    #[allow(async_fn_in_trait)]
    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), BackendError>;

    /// Retrieves the object stored under `key`. May be called concurrently.
    #[allow(async_fn_in_trait)]
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BackendError>;
}

/// Formats the standard mismatch message for a data tile entry whose hash
/// does not match the hash tree.
pub(crate) fn tile_leaf_mismatch(index: LeafIndex, got: Hash, expected: Hash) -> LogError {
    LogError::TileInconsistent(format!(
        "tile leaf entry {index} hashes to {got}, level 0 hash is {expected}"
    ))
}
