// Ported from "mod" (https://pkg.go.dev/golang.org/x/mod)
// Copyright 2009 The Go Authors
// Licensed under the BSD-3-Clause license found in the LICENSE file or at
// https://opensource.org/licenses/BSD-3-Clause

//! Merkle tree hashing and stored-hash indexing for a tiled transparency log.
//!
//! Records are hashed per RFC 6962 section 2.1. All hashes ever produced by
//! the tree are kept, addressed by a dense "stored hash index" ordering in
//! which record `n`'s new hashes land immediately after record `n-1`'s (see
//! section 3.3 of Crosby and Wallach's paper). [`stored_hashes`] returns the
//! hashes a new record appends, and [`tree_hash`] recomputes the root of a
//! tree of any size from at most `1 + log2 n` stored hashes.

use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlogError {
    #[error("malformed hash")]
    MalformedHash,
    #[error("invalid tile")]
    InvalidTile,
    #[error("bad math")]
    BadMath,
    #[error("recorded but did not read tiles")]
    RecordedTilesOnly,
    #[error("downloaded inconsistent tile")]
    InconsistentTile,
    #[error("indexes not in tree")]
    IndexesNotInTree,
    #[error("missing tile {0}")]
    MissingTile(String),
}

/// Size of a [`Hash`] in bytes.
pub const HASH_SIZE: usize = 32;

/// A hash identifying a log record or tree root.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Hash {
    /// Decodes a hash from its base64 encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not base64 or does not decode to
    /// exactly [`HASH_SIZE`] bytes.
    pub fn parse_hash(s: &str) -> Result<Self, TlogError> {
        let data = BASE64_STANDARD
            .decode(s)
            .map_err(|_| TlogError::MalformedHash)?;
        Ok(Hash(data.try_into().map_err(|_| TlogError::MalformedHash)?))
    }
}

/// Hash of the empty tree: SHA-256 of the empty string (RFC 6962,
/// section 2.1).
pub const EMPTY_HASH: Hash = Hash([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Returns the content hash for the given record data:
/// `SHA-256(0x00 || data)`.
pub fn record_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Returns the hash of an interior node with the given children:
/// `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: Hash, right: Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

// Returns k, the maximum power of 2 strictly smaller than n, along with
// l = log2 k. Requires n >= 2.
fn maxpow2(n: u64) -> (u64, u8) {
    let l = u8::try_from((n - 1).ilog2()).unwrap();
    (1 << l, l)
}

/// Maps the tree coordinates `(level, n)` to the dense stored-hash ordering.
///
/// Level `level`'s `n`'th hash is stored right after level `level+1`'s
/// `2n+1`'th hash, and level 0's `n`'th hash is stored at
/// `n + n/2 + n/4 + ...`.
pub fn stored_hash_index(level: u8, n: u64) -> u64 {
    let mut n = n;
    for _ in 0..level {
        n = 2 * n + 1;
    }
    let mut i = 0;
    while n > 0 {
        i += n;
        n >>= 1;
    }
    i + u64::from(level)
}

/// The inverse of [`stored_hash_index`]:
/// `split_stored_hash_index(stored_hash_index(level, n)) == (level, n)`.
///
/// # Panics
///
/// Panics on internal math errors, which cannot happen for indexes produced
/// by [`stored_hash_index`].
pub fn split_stored_hash_index(index: u64) -> (u8, u64) {
    // Find the last record committed at or before index.
    // stored_hash_index(0, n) < 2n, so start the scan at index/2.
    let mut n = index / 2;
    let mut index_n = stored_hash_index(0, n);
    assert!(index_n <= index, "bad math");
    loop {
        // Record n+1 adds 1 + trailing_zeros(n+1) hashes.
        let x = index_n + 1 + u64::from((n + 1).trailing_zeros());
        if x > index {
            break;
        }
        n += 1;
        index_n = x;
    }
    // The hash was committed with record n, at one of
    // (0, n), (1, n/2), (2, n/4), ...
    let level = u8::try_from(index - index_n).unwrap();
    (level, n >> level)
}

/// Returns the number of stored hashes for a tree with `n` records.
pub fn stored_hash_count(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut count = stored_hash_index(0, n - 1) + 1;
    let mut i = n - 1;
    while i & 1 != 0 {
        count += 1;
        i >>= 1;
    }
    count
}

/// A `HashReader` serves hashes by stored-hash index (see
/// [`stored_hash_index`]). Indexes are requested in increasing order.
pub trait HashReader {
    /// Returns one hash per requested index.
    ///
    /// # Errors
    ///
    /// Implementations must either return exactly `indexes.len()` hashes or
    /// an error.
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError>;
}

/// Returns the hashes that must be stored when writing record `n` with the
/// given data, starting at `stored_hash_index(0, n)`. The first is the
/// record hash itself; the rest are the interior hashes of the subtrees this
/// record completes. Up to `log2 n` earlier hashes are read from `r`.
///
/// # Errors
///
/// Returns an error if `r` fails to produce the required hashes.
pub fn stored_hashes<R: HashReader>(n: u64, data: &[u8], r: &R) -> Result<Vec<Hash>, TlogError> {
    stored_hashes_for_record_hash(n, record_hash(data), r)
}

/// Like [`stored_hashes`], but takes `record_hash(data)` directly.
///
/// # Errors
///
/// Returns an error if `r` fails to produce the required hashes.
///
/// # Panics
///
/// Panics if `r` returns the wrong number of hashes.
pub fn stored_hashes_for_record_hash<R: HashReader>(
    n: u64,
    h: Hash,
    r: &R,
) -> Result<Vec<Hash>, TlogError> {
    let mut hashes = vec![h];

    // Each trailing 1 bit in n completes a subtree, consuming one hash from
    // the adjacent subtree on its left. Collect those sibling indexes in
    // increasing order.
    let m = u8::try_from((n + 1).trailing_zeros()).unwrap();
    let mut indexes = vec![0_u64; m.into()];
    for i in 0..m {
        // n >> i is always odd here.
        indexes[usize::from(m - 1 - i)] = stored_hash_index(i, (n >> i) - 1);
    }

    let old = r.read_hashes(&indexes)?;
    assert_eq!(old.len(), indexes.len(), "bad read_hashes implementation");

    let mut h = h;
    for i in 0..m {
        h = node_hash(old[usize::from(m - 1 - i)], h);
        hashes.push(h);
    }

    Ok(hashes)
}

/// Returns the stored-hash indexes needed to compute the root of a tree with
/// `n` records: the fringe decomposition of `[0, n)` into maximal complete
/// subtrees, left to right (RFC 6962's `MTH` recursion, unrolled).
pub fn tree_hash_indexes(n: u64) -> Vec<u64> {
    let mut need = Vec::new();
    let mut lo = 0;
    while lo < n {
        let (k, level) = maxpow2(n - lo + 1);
        debug_assert_eq!(lo & (k - 1), 0, "bad math in tree_hash_indexes");
        need.push(stored_hash_index(level, lo >> level));
        lo += k;
    }
    need
}

/// Computes the root hash of the tree with `n` records, reading previously
/// stored hashes (those returned by [`stored_hashes`]) from `r` with a
/// single `read_hashes` call of at most `1 + log2 n` indexes.
///
/// # Errors
///
/// Returns an error if `r` fails to produce the required hashes.
///
/// # Panics
///
/// Panics if `r` returns the wrong number of hashes.
pub fn tree_hash<R: HashReader>(n: u64, r: &R) -> Result<Hash, TlogError> {
    if n == 0 {
        return Ok(EMPTY_HASH);
    }
    let indexes = tree_hash_indexes(n);
    let hashes = r.read_hashes(&indexes)?;
    assert_eq!(hashes.len(), indexes.len(), "bad read_hashes implementation");

    // The fringe hashes are left to right; the root folds up from the
    // right edge.
    let root = hashes
        .into_iter()
        .rev()
        .reduce(|fringe, sibling| node_hash(sibling, fringe))
        .expect("non-empty fringe for n > 0");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Tile, TileHashReader, TileReader};
    use std::cell::Cell;
    use std::collections::HashMap;

    type TestHashStorage = Vec<Hash>;

    impl HashReader for TestHashStorage {
        fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
            // The HashReader contract doesn't require increasing order, but
            // everything in this crate asks in increasing order; verify it.
            let mut prev_index = 0;
            for (i, &index) in indexes.iter().enumerate() {
                if i != 0 && index <= prev_index {
                    return Err(TlogError::BadMath);
                }
                prev_index = index;
            }

            let mut out = Vec::with_capacity(indexes.len());
            for &index in indexes {
                out.push(self[usize::try_from(index).unwrap()]);
            }
            Ok(out)
        }
    }

    #[derive(Default)]
    struct TestTileStorage {
        unsaved: Cell<usize>,
        m: HashMap<Tile, Vec<u8>>,
    }

    impl TileReader for TestTileStorage {
        fn height(&self) -> u8 {
            2
        }

        fn save_tiles(&self, tiles: &[Tile], _data: &[Vec<u8>]) {
            self.unsaved.set(self.unsaved.get() - tiles.len());
        }

        fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError> {
            let mut out = Vec::with_capacity(tiles.len());
            for tile in tiles {
                match self.m.get(tile) {
                    Some(data) => out.push(data.clone()),
                    None => return Err(TlogError::MissingTile(tile.path())),
                }
            }
            self.unsaved.set(self.unsaved.get() + tiles.len());
            Ok(out)
        }
    }

    #[test]
    fn test_tree() {
        const TEST_H: u8 = 2;

        let mut trees = Vec::new();
        let mut leaf_hashes = Vec::new();
        let mut storage = Vec::new();
        let mut tiles = HashMap::<Tile, Vec<u8>>::new();

        for i in 0..100 {
            let data = format!("leaf {i}");
            let hashes = stored_hashes(i, data.as_bytes(), &storage).unwrap();

            leaf_hashes.push(record_hash(data.as_bytes()));
            let old_storage_len = storage.len();
            storage.extend(hashes);
            assert_eq!(stored_hash_count(i + 1), storage.len() as u64);

            let th = tree_hash(i + 1, &storage).unwrap();

            // Each new tile must extend the old tile at the same coordinates.
            for tile in Tile::new_tiles(TEST_H, i, i + 1) {
                let data = tile.read_data(&storage).unwrap();
                let default = Vec::new();
                let old_data = if tile.width() > 1 {
                    let old = Tile::new(
                        tile.height(),
                        tile.level(),
                        tile.level_index(),
                        tile.width() - 1,
                        false,
                    );
                    tiles.get(&old).unwrap_or(&default)
                } else {
                    &default
                };
                assert!(
                    old_data.len() == data.len() - HASH_SIZE && *old_data == data[..old_data.len()],
                    "tile {tile:?} not extending old tile"
                );
                tiles.insert(tile, data);
            }

            for tile in Tile::new_tiles(TEST_H, 0, i + 1) {
                let data = tile.read_data(&storage).unwrap();
                assert_eq!(tiles[&tile], data, "mismatch at {tile:?}");
            }
            for tile in Tile::new_tiles(TEST_H, i / 2, i + 1) {
                let data = tile.read_data(&storage).unwrap();
                assert_eq!(tiles[&tile], data, "mismatch at {tile:?}");
            }

            // All new hashes must be readable from their tiles.
            for (j, stored_hash) in storage.iter().enumerate().skip(old_storage_len) {
                let tile = Tile::from_index(TEST_H, j as u64);
                let data = tiles.get(&tile).cloned().unwrap();
                let h = tile.hash_at_index(&data, j as u64).unwrap();
                assert_eq!(h, *stored_hash);
            }

            trees.push(th);

            // Check that leaf hashes and old tree hashes are readable and
            // authenticated through the TileHashReader.
            let tile_storage = TestTileStorage {
                m: tiles.clone(),
                unsaved: Cell::new(0),
            };
            let thr = TileHashReader::new(i + 1, th, &tile_storage);
            for j in 0..=i {
                let h = thr.read_hashes(&[stored_hash_index(0, j)]).unwrap();
                assert_eq!(h.len(), 1, "bad read_hashes implementation");
                assert_eq!(h[0], leaf_hashes[usize::try_from(j).unwrap()], "wrong hash");
            }
            for j in 0..=i {
                let h = tree_hash(j + 1, &thr).unwrap();
                assert_eq!(h, trees[usize::try_from(j).unwrap()]);
            }
            assert_eq!(tile_storage.unsaved.get(), 0, "did not save tiles");

            // Out-of-tree indexes must be rejected.
            assert!(
                thr.read_hashes(&[(i + 1) * 2]).is_err(),
                "read_hashes returned non-err for index not in tree"
            );
        }
    }

    #[test]
    fn test_split_stored_hash_index() {
        for l in 0..10 {
            for n in 0..100 {
                let x = stored_hash_index(l, n);
                let (l1, n1) = split_stored_hash_index(x);
                assert_eq!(l1, l);
                assert_eq!(n1, n);
            }
        }
    }

    #[test]
    fn test_empty_tree() {
        assert_eq!(tree_hash(0, &TestHashStorage::new()).unwrap(), EMPTY_HASH);
        // EMPTY_HASH is the hash of the empty string, not of an empty
        // record (which would carry the 0x00 prefix).
        assert_ne!(record_hash(b""), EMPTY_HASH);
    }

    #[test]
    fn test_tree_hash_indexes() {
        // A power-of-two tree needs a single stored hash.
        assert_eq!(tree_hash_indexes(8).len(), 1);
        // 0b1101 records decompose into three complete subtrees.
        assert_eq!(tree_hash_indexes(13).len(), 3);
        assert_eq!(tree_hash_indexes(1), vec![stored_hash_index(0, 0)]);
    }
}
