// Ported from "mod" (https://pkg.go.dev/golang.org/x/mod)
// Copyright 2009 The Go Authors
// Licensed under the BSD-3-Clause license found in the LICENSE file or at
// https://opensource.org/licenses/BSD-3-Clause

//! Tile coordinates, paths, and authenticated tile reads.
//!
//! A tile of height `H` at level `L`, index `N` holds `W` consecutive hashes
//! from level `H*L` of the tree, starting at offset `N * 2^H`. A complete
//! tile holds `2^H` hashes; the right-most tile of a level may be partial.
//! A tile is equivalently the subtree of height `H` whose leaves are those
//! hashes, so levels between multiples of `H` are recomputed by hashing.
//!
//! Data tiles are a pseudo-level holding raw record bytes instead of hashes;
//! they parallel the level-0 tile with the same index and width and are
//! addressed with `data` in place of the level.

use crate::tlog::{
    node_hash, split_stored_hash_index, stored_hash_index, tree_hash_indexes, Hash, HashReader,
    TlogError, HASH_SIZE,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

// Large tile indexes are encoded three digits per path element
// (123456789 -> x123/x456/789) so no directory holds more than 3000 entries.
const PATH_BASE: u64 = 1000;

/// A tile coordinate: height, level, index within level, width, and whether
/// this is a data tile. The path encoding is `tile/<H>/<L>/<NNN...>[.p/<W>]`,
/// where the `.p/<W>` suffix marks a partial tile and `<L>` is `data` for
/// data tiles. For example, `Tile { h: 10, l: 0, n: 1234067, w: 1024 }` has
/// path `tile/10/0/x001/x234/067`.
#[derive(Debug, Eq, Hash, PartialEq, Default, Clone, Copy)]
pub struct Tile {
    h: u8,
    l: u8,
    n: u64,
    w: u32,
    is_data: bool,
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl Tile {
    /// Returns a new tile with the given coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are outside the valid ranges
    /// (`1 <= h <= 30`, `l < 64`, `1 <= w <= 2^h`).
    pub fn new(h: u8, l: u8, n: u64, w: u32, is_data: bool) -> Self {
        assert!(
            (1..=30).contains(&h) && l < 64 && (1..=(1 << h)).contains(&w),
            "invalid tile"
        );
        Self { h, l, n, w, is_data }
    }

    pub fn height(&self) -> u8 {
        self.h
    }

    pub fn level(&self) -> u8 {
        self.l
    }

    /// Returns the tile's index within its level.
    pub fn level_index(&self) -> u64 {
        self.n
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn is_data(&self) -> bool {
        self.is_data
    }

    /// Returns the same coordinates as a data tile.
    #[must_use]
    pub fn as_data(&self) -> Self {
        Self {
            is_data: true,
            ..*self
        }
    }

    /// Returns the coordinates of the tiles of height `h` that must be
    /// published when a tree of size `old_tree_size` grows to
    /// `new_tree_size`, in increasing level and index order. No tiles are
    /// needed for a tree of size zero.
    ///
    /// # Panics
    ///
    /// Panics if `h == 0`.
    pub fn new_tiles(h: u8, old_tree_size: u64, new_tree_size: u64) -> Vec<Self> {
        assert!(h != 0, "invalid height {h}");
        let mut tiles = Vec::new();
        let mut l = 0;
        while new_tree_size >> (h * l) > 0 {
            let old_n = old_tree_size >> (h * l);
            let new_n = new_tree_size >> (h * l);
            if old_n != new_n {
                for n in (old_n >> h)..(new_n >> h) {
                    tiles.push(Self::new(h, l, n, 1 << h, false));
                }
                let n = new_n >> h;
                let w = u32::try_from(new_n - (n << h)).unwrap();
                if w > 0 {
                    tiles.push(Self::new(h, l, n, w, false));
                }
            }
            l += 1;
        }
        tiles
    }

    /// Returns the tile of height `h` and least width covering the given
    /// stored-hash index.
    ///
    /// # Panics
    ///
    /// Panics if `h == 0`.
    pub fn from_index(h: u8, index: u64) -> Self {
        assert!(h != 0, "invalid height {h}");
        let (t, _, _) = Tile::from_index_internal(h, index);
        t
    }

    // Returns the tile covering the stored-hash index, along with the byte
    // range within the tile data whose subtree hash reconstructs that hash.
    fn from_index_internal(h: u8, index: u64) -> (Self, usize, usize) {
        let (mut level, mut n) = split_stored_hash_index(index);
        let t_l = level / h;
        level -= t_l * h; // level within the tile
        let t_n = n << level >> h;
        n -= t_n << h >> level; // n within the tile at that level
        let w = u32::try_from((n + 1) << level).unwrap();
        let start = usize::try_from(n << level).unwrap() * HASH_SIZE;
        let end = usize::try_from((n + 1) << level).unwrap() * HASH_SIZE;
        (Self::new(h, t_l, t_n, w, false), start, end)
    }

    /// Returns the hash at the given stored-hash index, reconstructed from
    /// the tile's data.
    ///
    /// # Errors
    ///
    /// Returns an error if this tile does not cover `index`, or `data` is
    /// shorter than the tile's width requires, or this is a data tile.
    pub fn hash_at_index(&self, data: &[u8], index: u64) -> Result<Hash, TlogError> {
        if self.is_data || data.len() < self.w as usize * HASH_SIZE {
            return Err(TlogError::InvalidTile);
        }
        let (t1, start, end) = Tile::from_index_internal(self.h, index);
        if self.l != t1.l || self.n != t1.n || self.w < t1.w {
            return Err(TlogError::InvalidTile);
        }
        Ok(Tile::subtree_hash(&data[start..end]))
    }

    /// Returns the tile coordinate path, e.g. `tile/10/data/001.p/5`.
    pub fn path(&self) -> String {
        let mut n = self.n;
        let mut n_str = format!("{:03}", n % PATH_BASE);
        while n >= PATH_BASE {
            n /= PATH_BASE;
            n_str = format!("x{:03}/{n_str}", n % PATH_BASE);
        }
        let p_str = if self.w == 1 << self.h {
            String::new()
        } else {
            format!(".p/{}", self.w)
        };
        let l_str = if self.is_data {
            "data".to_string()
        } else {
            self.l.to_string()
        };
        format!("tile/{}/{l_str}/{n_str}{p_str}", self.h)
    }

    /// Returns the tile's `k`'th tile parent in a tree of size `n`, with the
    /// parent's width clipped to the tree, or `None` if the tree does not
    /// reach the parent.
    ///
    /// # Panics
    ///
    /// Panics on internal integer conversion failures.
    pub fn parent(&self, k: u8, n: u64) -> Option<Self> {
        let mut t = *self;
        t.l += k;
        t.n >>= k * t.h;
        t.w = 1 << t.h;
        let max = n >> (t.l * t.h);
        if (t.n << t.h) + u64::from(t.w) >= max {
            if (t.n << t.h) >= max {
                return None;
            }
            t.w = u32::try_from(max - (t.n << t.h)).unwrap();
        }
        Some(t)
    }

    /// Reads this tile's hashes from `r` and returns the tile data.
    ///
    /// # Errors
    ///
    /// Returns an error if `r` fails to produce the hashes.
    ///
    /// # Panics
    ///
    /// Panics if `r` returns the wrong number of hashes.
    pub fn read_data<R: HashReader>(&self, r: &R) -> Result<Vec<u8>, TlogError> {
        let size = self.w as usize;
        let start = self.n << self.h;
        let mut indexes = Vec::with_capacity(size);
        for i in 0..size as u64 {
            indexes.push(stored_hash_index(self.h * self.l, start + i));
        }

        let hashes = r.read_hashes(&indexes)?;
        assert_eq!(hashes.len(), indexes.len(), "bad read_hashes implementation");

        let mut tile_data = vec![0u8; size * HASH_SIZE];
        for i in 0..size {
            tile_data[i * HASH_SIZE..(i + 1) * HASH_SIZE].copy_from_slice(&hashes[i].0);
        }
        Ok(tile_data)
    }

    /// Computes the subtree hash of the `2^k` hashes in `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty.
    pub fn subtree_hash(data: &[u8]) -> Hash {
        assert!(!data.is_empty(), "bad math in subtree_hash");
        if data.len() == HASH_SIZE {
            return Hash(data.try_into().unwrap());
        }
        let mid = data.len() / 2;
        node_hash(
            Self::subtree_hash(&data[..mid]),
            Self::subtree_hash(&data[mid..]),
        )
    }
}

/// A `TileReader` fetches tiles, typically from a backend object store.
pub trait TileReader {
    /// Returns the height of the available tiles.
    fn height(&self) -> u8;

    /// Returns the data for each requested tile. On success the result must
    /// hold one record per tile, each of length `tile.width() * HASH_SIZE`.
    ///
    /// Freshly downloaded tile data is unauthenticated; it must not be
    /// persisted until [`TileReader::save_tiles`] confirms it verified
    /// against the tree hash. See
    /// <https://research.swtch.com/tlog#authenticating_tiles>.
    ///
    /// # Errors
    ///
    /// Returns an error if any requested tile cannot be read.
    fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError>;

    /// Signals that the data returned by [`TileReader::read_tiles`] has been
    /// authenticated and may be persisted.
    fn save_tiles(&self, tiles: &[Tile], data: &[Vec<u8>]);
}

/// A [`HashReader`] that serves hashes from tiles of a specific tree,
/// authenticating every tile it touches against the tree hash before
/// returning anything from it.
pub struct TileHashReader<'a> {
    tree_size: u64,
    tree_hash: Hash,
    tr: &'a dyn TileReader,
}

impl<'a> TileHashReader<'a> {
    pub fn new<R: TileReader>(tree_size: u64, tree_hash: Hash, tr: &'a R) -> Self {
        Self {
            tree_size,
            tree_hash,
            tr,
        }
    }
}

impl HashReader for TileHashReader<'_> {
    /// Returns the hashes at the given stored-hash indexes, fetching
    /// whatever additional tiles are needed to authenticate them.
    ///
    /// # Errors
    ///
    /// Returns an error if a tile cannot be read, fails authentication, or
    /// an index lies outside the tree.
    ///
    /// # Panics
    ///
    /// Panics if a tile unexpectedly has no parent in the tree, which cannot
    /// happen for in-tree indexes.
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
        let h = self.tr.height();

        let mut tile_order = HashMap::new(); // tile -> position in tiles
        let mut tiles = Vec::new();

        // Plan the fetch of the tiles needed to recompute the tree hash.
        // Once it matches, those tiles are authenticated.
        let stx = tree_hash_indexes(self.tree_size);
        let mut stx_tile_order = vec![0; stx.len()];
        for (i, &x) in stx.iter().enumerate() {
            let tile = Tile::from_index(h, x).parent(0, self.tree_size).unwrap();
            if let Some(&j) = tile_order.get(&tile) {
                stx_tile_order[i] = j;
            } else {
                stx_tile_order[i] = tiles.len();
                tile_order.insert(tile, tiles.len());
                tiles.push(tile);
            }
        }

        // Plan the fetch of the tiles holding the requested indexes, plus
        // any parent tiles needed to authenticate them. Parents are usually
        // being fetched anyway.
        let mut index_tile_order = vec![0; indexes.len()];
        for (i, &x) in indexes.iter().enumerate() {
            if x >= stored_hash_index(0, self.tree_size) {
                return Err(TlogError::IndexesNotInTree);
            }
            let tile = Tile::from_index(h, x);

            // Walk up the parents until one that is already planned; that
            // one will be authenticated.
            let mut k = 0;
            loop {
                let p = tile.parent(k, self.tree_size).unwrap();
                if let Some(&j) = tile_order.get(&p) {
                    if k == 0 {
                        index_tile_order[i] = j;
                    }
                    break;
                }
                k += 1;
            }

            // Walk back down, recording children after their parents. This
            // revisits the tile for this index unless k == 0, in which case
            // the loop above already recorded it.
            for k in (0..k).rev() {
                let p = tile.parent(k, self.tree_size).unwrap();
                if p.w != (1 << p.h) {
                    // Only full tiles have parents, and this tile has one.
                    return Err(TlogError::BadMath);
                }
                tile_order.insert(p, tiles.len());
                if k == 0 {
                    index_tile_order[i] = tiles.len();
                }
                tiles.push(p);
            }
        }

        let data = self.tr.read_tiles(&tiles)?;
        if data.len() != tiles.len() {
            return Err(TlogError::BadMath);
        }
        for (i, tile) in tiles.iter().enumerate() {
            if data[i].len() != tile.w as usize * HASH_SIZE {
                return Err(TlogError::BadMath);
            }
        }

        // Authenticate the tree-hash tiles against the tree hash; they are
        // ordered so parents precede children.
        let mut th = tiles[stx_tile_order[stx.len() - 1]]
            .hash_at_index(&data[stx_tile_order[stx.len() - 1]], stx[stx.len() - 1])?;
        for i in (0..stx.len() - 1).rev() {
            let h = tiles[stx_tile_order[i]].hash_at_index(&data[stx_tile_order[i]], stx[i])?;
            th = node_hash(h, th);
        }
        if th != self.tree_hash {
            return Err(TlogError::InconsistentTile);
        }

        // Authenticate the remaining full tiles against their parents.
        for i in stx.len()..tiles.len() {
            let tile = tiles[i];
            let p = tile.parent(1, self.tree_size).unwrap();
            let Some(j) = tile_order.get(&p) else {
                return Err(TlogError::BadMath);
            };
            let h = p.hash_at_index(&data[*j], stored_hash_index(p.l * p.h, tile.n))?;
            if h != Tile::subtree_hash(&data[i]) {
                return Err(TlogError::InconsistentTile);
            }
        }

        // Every tile is authenticated against the trusted tree hash.
        self.tr.save_tiles(&tiles, &data);

        let mut hashes = Vec::with_capacity(indexes.len());
        for (i, &x) in indexes.iter().enumerate() {
            let j = index_tile_order[i];
            hashes.push(tiles[j].hash_at_index(&data[j], x)?);
        }
        Ok(hashes)
    }
}

/// A [`TileReader`] that records which tiles are requested without reading
/// them. Used to plan the backend fetches for an authenticated read before
/// performing any I/O.
pub struct TileRecorder {
    height: u8,
    pub tiles: RefCell<Vec<Tile>>,
}

impl TileRecorder {
    pub fn new(height: u8) -> Self {
        Self {
            height,
            tiles: RefCell::new(Vec::new()),
        }
    }
}

impl TileReader for TileRecorder {
    fn height(&self) -> u8 {
        self.height
    }

    /// Records the requested tiles and always fails with
    /// [`TlogError::RecordedTilesOnly`], since nothing was actually read.
    fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError> {
        self.tiles.borrow_mut().extend_from_slice(tiles);
        Err(TlogError::RecordedTilesOnly)
    }

    fn save_tiles(&self, _tiles: &[Tile], _data: &[Vec<u8>]) {}
}

/// A [`TileReader`] over an in-memory tile map, for running an authenticated
/// read against tiles that were fetched up front.
pub struct PreloadedTileReader {
    height: u8,
    pub tiles: HashMap<Tile, Vec<u8>>,
}

impl PreloadedTileReader {
    pub fn new(height: u8, tiles: HashMap<Tile, Vec<u8>>) -> Self {
        Self { height, tiles }
    }
}

impl TileReader for PreloadedTileReader {
    fn height(&self) -> u8 {
        self.height
    }

    /// Serves the requested tiles from the preloaded map.
    ///
    /// # Errors
    ///
    /// Returns [`TlogError::MissingTile`] if a tile was not preloaded.
    fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError> {
        let mut out = Vec::with_capacity(tiles.len());
        for tile in tiles {
            match self.tiles.get(tile) {
                Some(data) => out.push(data.clone()),
                None => return Err(TlogError::MissingTile(tile.path())),
            }
        }
        Ok(out)
    }

    fn save_tiles(&self, _tiles: &[Tile], _data: &[Vec<u8>]) {}
}
