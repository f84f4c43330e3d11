//! The log itself: the pending-leaf pool, the sequencer, and bootstrap.

use crate::checkpoint::{
    rfc6962_signature_timestamp, sign_tree_head, KeyPair, Rfc6962Verifier, TreeWithTimestamp,
};
use crate::entry::{read_tile_leaf, LogEntry};
use crate::util::now_millis;
use crate::{tile_leaf_mismatch, Backend, BackendError, LogError, SequenceMetadata};
use futures_util::future::try_join_all;
use log::{error, info, warn};
use signed_note::{Note, NoteVerifier, VerifierList};
use std::collections::HashMap;
use std::time::Duration;
use tlog_tiles::{
    record_hash, stored_hash_index, stored_hashes, Hash, HashReader, PreloadedTileReader, Tile,
    TileHashReader, TileRecorder, TlogError,
};
use tokio::sync::watch;
use tokio::time::timeout_at;

/// Height of the log's tiles: each full tile covers 2^10 = 1024 hashes.
pub const TILE_HEIGHT: u8 = 10;

/// Width of a full tile.
pub const TILE_WIDTH: u32 = 1 << TILE_HEIGHT;

/// Backend key of the current signed tree head.
pub const STH_KEY: &str = "sth";

// Tile levels fit in 0..=63, so this is a safe stand-in for the data tile's
// synthetic level (the Go tlog library uses -1).
const DATA_TILE_LEVEL: u8 = u8::MAX;

// Deadline for one sequencing round, including the STH upload.
const SEQUENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A tile descriptor along with its serialized contents.
#[derive(Clone, Debug, Default)]
struct TileWithBytes {
    tile: Tile,
    b: Vec<u8>,
}

// State owned by the sequencer: everything that one round reads and the
// commit step replaces.
#[derive(Debug)]
struct SequenceState {
    tree: TreeWithTimestamp,
    // Map from level to the right-most tile of that level, including the
    // data tile under DATA_TILE_LEVEL.
    edge_tiles: HashMap<u8, TileWithBytes>,
    // Set when an STH upload failed with unknown outcome. The backend may
    // hold a tree head this process never observed, so sequencing must not
    // continue until a restart re-reads it.
    poisoned: bool,
}

// A batch of pending leaves awaiting the next sequencing round. The watch
// channel is the completion gate: the round that captures this pool sends
// (first_leaf_index, timestamp) once the new STH is persisted.
#[derive(Debug)]
struct Pool {
    pending_leaves: Vec<LogEntry>,
    done: watch::Sender<SequenceMetadata>,
}

impl Pool {
    fn new() -> Self {
        let (done, _) = watch::channel((0, 0));
        Pool {
            pending_leaves: Vec::new(),
            done,
        }
    }
}

/// A leaf waiting to be sequenced, returned by [`Log::add_leaf`].
pub struct PendingLeaf {
    rx: watch::Receiver<SequenceMetadata>,
    offset: u64,
}

impl PendingLeaf {
    /// Waits until the leaf's pool has been sequenced and returns the
    /// assigned leaf index and the round's timestamp (the SCT timestamp).
    ///
    /// Returns `None` if the round that captured this pool failed: the leaf
    /// was not sequenced and the submission must be surfaced as failed or
    /// timed out.
    pub async fn resolve(mut self) -> Option<SequenceMetadata> {
        if self.rx.changed().await.is_err() {
            warn!("pool abandoned before sequencing completed");
            return None;
        }
        let (first_leaf_index, timestamp) = *self.rx.borrow();
        Some((first_leaf_index + self.offset, timestamp))
    }
}

/// A Certificate Transparency log bound to a name, a signing key, and a
/// backend. Obtained from [`Log::load`]; the empty log is first written
/// with [`Log::create`].
#[derive(Debug)]
pub struct Log<B: Backend> {
    name: String,
    log_id: [u8; 32],
    key: KeyPair,
    backend: B,
    // The sequencer's state. Held across a whole round, which also
    // serializes concurrent sequence_pool calls.
    state: tokio::sync::Mutex<SequenceState>,
    // Held for the entire duration of add_leaf, and by sequence_pool while
    // swapping the pool. This guarantees that add_leaf never appends to a
    // pool that already started sequencing. Never held across an await.
    pool: parking_lot::Mutex<Pool>,
}

impl<B: Backend> Log<B> {
    /// Signs an empty tree head at the current time and uploads it,
    /// initializing a new log.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unusable or the upload fails.
    pub async fn create(name: &str, key: &KeyPair, backend: &B) -> Result<(), LogError> {
        let log_id = key.log_id()?;
        let tree = TreeWithTimestamp::new(0, tlog_tiles::EMPTY_HASH, now_millis());
        let checkpoint = sign_tree_head(name, &log_id, key, &tree)?;
        backend.upload(STH_KEY, &checkpoint).await?;
        info!(
            "{name}: created log; log_id={}, timestamp={}",
            hex::encode(log_id),
            tree.time()
        );
        Ok(())
    }

    /// Loads a log from the backend: fetches and verifies the current STH,
    /// then rehydrates the right edge of the tree.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SthInvalid`] if the tree head fails verification
    /// (bad signature, wrong origin, timestamp in the future, or extension
    /// lines), [`LogError::TileInconsistent`] if the backend's tiles
    /// contradict it, and [`LogError::BackendUnavailable`] on fetch
    /// failures, including a missing STH.
    pub async fn load(name: &str, key: KeyPair, backend: B) -> Result<Self, LogError> {
        let log_id = key.log_id()?;

        let sth = backend.fetch(STH_KEY).await?;
        let verifier = Rfc6962Verifier::new(name, &key)?;
        let note =
            Note::from_bytes(&sth).map_err(|e| LogError::SthInvalid(e.to_string()))?;
        let (verified_sigs, _) = note
            .verify(&VerifierList::new(vec![Box::new(verifier.clone())]))
            .map_err(|e| LogError::SthInvalid(e.to_string()))?;
        let sig = verified_sigs
            .iter()
            .find(|s| s.id() == verifier.key_id())
            .ok_or_else(|| LogError::SthInvalid("missing log signature".to_string()))?;
        let timestamp = rfc6962_signature_timestamp(sig)?;

        let c = tlog_tiles::Checkpoint::from_bytes(note.text())
            .map_err(|e| LogError::SthInvalid(e.to_string()))?;
        let now = now_millis();
        if now < timestamp {
            return Err(LogError::SthInvalid(format!(
                "current time {now} is before STH time {timestamp}"
            )));
        }
        if c.origin() != name {
            return Err(LogError::SthInvalid(format!(
                "STH name is {:?}, not {name:?}",
                c.origin()
            )));
        }
        if !c.extension().is_empty() {
            return Err(LogError::SthInvalid(format!(
                "unexpected STH extension {:?}",
                c.extension()
            )));
        }

        let mut edge_tiles = HashMap::new();
        if c.size() > 0 {
            // Fetch and authenticate the right-most tree tiles.
            edge_tiles = read_edge_tiles(&backend, c.size(), *c.hash()).await?;

            // Fetch the data tile paralleling the level-0 edge tile, and
            // verify every entry in it against the hash tree.
            let (level0_tile, level0_bytes) = {
                let t = edge_tiles.get(&0).ok_or_else(|| {
                    LogError::InternalInconsistency("no level 0 edge tile".to_string())
                })?;
                (t.tile, t.b.clone())
            };
            let data_tile = level0_tile.as_data();
            let data = backend.fetch(&data_tile.path()).await?;

            let start = u64::from(TILE_WIDTH) * data_tile.level_index();
            let mut rest: &[u8] = &data;
            for i in 0..u64::from(data_tile.width()) {
                let parsed = read_tile_leaf(rest).map_err(|e| {
                    LogError::MalformedTile(format!("invalid data tile {data_tile}: {e}"))
                })?;
                rest = parsed.rest;

                let leaf = [&[0, 0][..], parsed.timestamped_entry].concat();
                let got = record_hash(&leaf);
                let expected =
                    level0_tile.hash_at_index(&level0_bytes, stored_hash_index(0, start + i))?;
                if got != expected {
                    return Err(tile_leaf_mismatch(start + i, got, expected));
                }
            }

            edge_tiles.insert(
                DATA_TILE_LEVEL,
                TileWithBytes {
                    tile: data_tile,
                    b: data,
                },
            );
        }

        info!(
            "{name}: loaded log; size={}, timestamp={timestamp}, log_id={}",
            c.size(),
            hex::encode(log_id)
        );

        Ok(Log {
            name: name.to_string(),
            log_id,
            key,
            backend,
            state: tokio::sync::Mutex::new(SequenceState {
                tree: TreeWithTimestamp::new(c.size(), *c.hash(), timestamp),
                edge_tiles,
                poisoned: false,
            }),
            pool: parking_lot::Mutex::new(Pool::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_id(&self) -> [u8; 32] {
        self.log_id
    }

    /// Returns the current tree head.
    pub async fn tree(&self) -> TreeWithTimestamp {
        self.state.lock().await.tree
    }

    /// Returns a note verifier for this log's checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be encoded.
    pub fn verifier(&self) -> Result<Rfc6962Verifier, LogError> {
        Rfc6962Verifier::new(&self.name, &self.key)
    }

    /// Adds a leaf to the current pool. The returned [`PendingLeaf`]
    /// resolves to the assigned index once the pool has been sequenced and
    /// the new tree head is persisted.
    pub fn add_leaf(&self, leaf: LogEntry) -> PendingLeaf {
        let mut pool = self.pool.lock();
        let offset = pool.pending_leaves.len() as u64;
        pool.pending_leaves.push(leaf);
        PendingLeaf {
            rx: pool.done.subscribe(),
            offset,
        }
    }

    /// Runs one sequencing round: captures the current pool, assigns
    /// indices, extends the tree, uploads the new tiles and the signed tree
    /// head, and releases the pool's waiters.
    ///
    /// Expected to be driven at a bounded cadence by an external ticker.
    /// On error, the log state is unchanged and the captured pool's waiters
    /// observe a failed submission; the ticker should log and try again on
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::TimeNotMonotonic`] if the clock has not advanced
    /// past the previous tree head, [`LogError::BackendUnavailable`] on
    /// upload failure or deadline expiry, and
    /// [`LogError::InternalInconsistency`] if a previous round left the
    /// tree head state unknown (restart required).
    pub async fn sequence_pool(&self) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(LogError::InternalInconsistency(
                "tree head upload previously failed with unknown outcome; restart required"
                    .to_string(),
            ));
        }

        // Swap in a fresh pool. The pool mutex is what keeps submitters off
        // the captured one.
        let p = {
            let mut pool = self.pool.lock();
            std::mem::replace(&mut *pool, Pool::new())
        };

        let deadline = tokio::time::Instant::now() + SEQUENCE_TIMEOUT;

        let timestamp = now_millis();
        if timestamp <= state.tree.time() {
            return Err(LogError::TimeNotMonotonic {
                last: state.tree.time(),
                now: timestamp,
            });
        }

        let old_size = state.tree.size();
        let mut edge_tiles = state.edge_tiles.clone();

        // Start from the current partial data tile, if any.
        let mut data_tile = Vec::new();
        if let Some(t) = edge_tiles.get(&DATA_TILE_LEVEL) {
            if t.tile.width() < TILE_WIDTH {
                data_tile.clone_from(&t.b);
            }
        }

        let mut overlay = HashMap::new();
        let mut tile_uploads: Vec<(String, Vec<u8>)> = Vec::new();
        let mut n = old_size;

        for leaf in &p.pending_leaves {
            let merkle_leaf = leaf.merkle_tree_leaf(timestamp);
            let hashes = stored_hashes(
                n,
                &merkle_leaf,
                &HashReaderWithOverlay {
                    edge_tiles: &edge_tiles,
                    overlay: &overlay,
                },
            )
            .map_err(|e| {
                LogError::InternalInconsistency(format!(
                    "couldn't fetch stored hashes for leaf {n}: {e}"
                ))
            })?;
            for (i, h) in hashes.iter().enumerate() {
                overlay.insert(stored_hash_index(0, n) + i as u64, *h);
            }

            data_tile.extend(leaf.tile_leaf(timestamp));
            n += 1;

            // Data tile is full.
            if n % u64::from(TILE_WIDTH) == 0 {
                stage_data_tile(
                    n,
                    &mut edge_tiles,
                    &mut tile_uploads,
                    std::mem::take(&mut data_tile),
                );
            }
        }

        // Stage the partial data tile.
        if n % u64::from(TILE_WIDTH) != 0 {
            stage_data_tile(
                n,
                &mut edge_tiles,
                &mut tile_uploads,
                std::mem::take(&mut data_tile),
            );
        }

        // Produce and stage the new tree tiles.
        for tile in Tile::new_tiles(TILE_HEIGHT, old_size, n) {
            let data = tile
                .read_data(&HashReaderWithOverlay {
                    edge_tiles: &edge_tiles,
                    overlay: &overlay,
                })
                .map_err(|e| {
                    LogError::InternalInconsistency(format!("couldn't generate tile {tile}: {e}"))
                })?;
            // new_tiles produces tiles left to right, so each should be
            // strictly newer than the stored edge; double check.
            if edge_tiles.get(&tile.level()).is_none_or(|t| {
                t.tile.level_index() < tile.level_index()
                    || (t.tile.level_index() == tile.level_index()
                        && t.tile.width() < tile.width())
            }) {
                edge_tiles.insert(
                    tile.level(),
                    TileWithBytes {
                        tile,
                        b: data.clone(),
                    },
                );
            }
            tile_uploads.push((tile.path(), data));
        }

        // Run the uploads concurrently, all-or-nothing, under the round
        // deadline. The first failure drops the remaining upload futures.
        let uploads = try_join_all(
            tile_uploads
                .iter()
                .map(|(key, data)| self.backend.upload(key, data)),
        );
        match timeout_at(deadline, uploads).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(LogError::BackendUnavailable(BackendError::Unavailable(
                    "tile uploads timed out".to_string(),
                )))
            }
        }

        // Compute the new tree head and sign it.
        let tree = TreeWithTimestamp::from_hash_reader(
            n,
            &HashReaderWithOverlay {
                edge_tiles: &edge_tiles,
                overlay: &overlay,
            },
            timestamp,
        )
        .map_err(|e| LogError::InternalInconsistency(format!("couldn't compute tree head: {e}")))?;
        let checkpoint = sign_tree_head(&self.name, &self.log_id, &self.key, &tree)?;

        match timeout_at(deadline, self.backend.upload(STH_KEY, &checkpoint)).await {
            Ok(Ok(())) => {}
            outcome => {
                // The STH may or may not have been persisted: the backend
                // can now advertise a tree this process never observed.
                // Refuse to sign anything else; a restart will reload from
                // whatever the backend holds.
                state.poisoned = true;
                error!(
                    "{}: tree head upload failed with unknown outcome; restart required",
                    self.name
                );
                return Err(match outcome {
                    Ok(Err(e)) => e.into(),
                    _ => LogError::BackendUnavailable(BackendError::Unavailable(
                        "tree head upload timed out".to_string(),
                    )),
                });
            }
        }

        // Commit: release the waiters, then publish the new state. The gate
        // must not open before the STH is persisted.
        let entries = p.pending_leaves.len();
        p.done.send_replace((old_size, timestamp));
        state.tree = tree;
        state.edge_tiles = edge_tiles;

        info!(
            "{}: sequenced pool; tree_size={n}, entries={entries}, tiles={}, timestamp={timestamp}",
            self.name,
            tile_uploads.len(),
        );
        Ok(())
    }
}

// Derives the data tile holding the record at index n-1 and stages it for
// upload, recording it as the new data edge tile.
fn stage_data_tile(
    n: u64,
    edge_tiles: &mut HashMap<u8, TileWithBytes>,
    tile_uploads: &mut Vec<(String, Vec<u8>)>,
    data_tile: Vec<u8>,
) {
    let tile = Tile::from_index(TILE_HEIGHT, stored_hash_index(0, n - 1)).as_data();
    edge_tiles.insert(
        DATA_TILE_LEVEL,
        TileWithBytes {
            tile,
            b: data_tile.clone(),
        },
    );
    tile_uploads.push((tile.path(), data_tile));
}

// Serves hashes from the in-progress round's overlay first, then from the
// edge tiles. Anything else is unreachable during sequencing and reports
// IndexesNotInTree, which the caller surfaces as an internal inconsistency.
struct HashReaderWithOverlay<'a> {
    edge_tiles: &'a HashMap<u8, TileWithBytes>,
    overlay: &'a HashMap<u64, Hash>,
}

impl HashReader for HashReaderWithOverlay<'_> {
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
        let mut list = Vec::with_capacity(indexes.len());
        for &id in indexes {
            if let Some(h) = self.overlay.get(&id) {
                list.push(*h);
                continue;
            }
            let Some(t) = self
                .edge_tiles
                .get(&Tile::from_index(TILE_HEIGHT, id).level())
            else {
                return Err(TlogError::IndexesNotInTree);
            };
            list.push(t.tile.hash_at_index(&t.b, id)?);
        }
        Ok(list)
    }
}

// Plans the tiles needed to read and authenticate the given stored-hash
// indexes, fetches them from the backend, and returns a reader over them.
async fn tile_reader_for_indexes<B: Backend>(
    tree_size: u64,
    indexes: &[u64],
    backend: &B,
) -> Result<PreloadedTileReader, LogError> {
    let recorder = TileRecorder::new(TILE_HEIGHT);
    // The tree hash is unused before the recorder short-circuits.
    let planner = TileHashReader::new(tree_size, Hash::default(), &recorder);
    match planner.read_hashes(indexes) {
        Err(TlogError::RecordedTilesOnly) => {}
        _ => {
            return Err(LogError::InternalInconsistency(
                "expected to only record tiles".to_string(),
            ))
        }
    }

    let mut tile_data = HashMap::new();
    for tile in recorder.tiles.into_inner() {
        let b = backend.fetch(&tile.path()).await?;
        tile_data.insert(tile, b);
    }
    Ok(PreloadedTileReader::new(TILE_HEIGHT, tile_data))
}

// Reads and authenticates the tiles on the right edge of the tree by
// resolving the last leaf, keeping the right-most tile seen per level.
async fn read_edge_tiles<B: Backend>(
    backend: &B,
    tree_size: u64,
    tree_hash: Hash,
) -> Result<HashMap<u8, TileWithBytes>, LogError> {
    let indexes = vec![stored_hash_index(0, tree_size - 1)];
    let tile_reader = tile_reader_for_indexes(tree_size, &indexes, backend).await?;

    let hash_reader = TileHashReader::new(tree_size, tree_hash, &tile_reader);
    hash_reader.read_hashes(&indexes)?;

    let mut edge_tiles: HashMap<u8, TileWithBytes> = HashMap::new();
    for (tile, b) in tile_reader.tiles {
        if edge_tiles.get(&tile.level()).is_none_or(|t| {
            t.tile.level_index() < tile.level_index()
                || (t.tile.level_index() == tile.level_index() && t.tile.width() < tile.width())
        }) {
            edge_tiles.insert(tile.level(), TileWithBytes { tile, b });
        }
    }
    Ok(edge_tiles)
}
