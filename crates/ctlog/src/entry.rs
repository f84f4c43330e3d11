//! Serialization of log entries: the RFC 6962 `MerkleTreeLeaf` and
//! `TimestampedEntry` structures that get hashed into the tree, and the
//! `TileLeaf` records persisted in data tiles.

use crate::{LogError, UnixTimestamp};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

const ENTRY_TYPE_X509: u8 = 0;
const ENTRY_TYPE_PRECERT: u8 = 1;

/// A leaf submitted to the log. Immutable after construction; the timestamp
/// is not part of the entry, since it is assigned by the sequencing round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    /// The DER-encoded leaf: an X.509 certificate for `x509_entry`, or the
    /// reconstructed TBSCertificate for `precert_entry`. At most 2^24-1
    /// bytes.
    pub cert: Vec<u8>,

    /// True for `precert_entry`. When false, the remaining fields are zero
    /// and ignored.
    pub is_precert: bool,

    /// SHA-256 of the issuing certificate's SubjectPublicKeyInfo.
    pub issuer_key_hash: [u8; 32],

    /// The original DER-encoded precertificate. At most 2^24-1 bytes.
    pub pre_certificate: Vec<u8>,

    /// The DER-encoded precertificate signing certificate, if one was used.
    /// May be empty. At most 2^24-1 bytes.
    pub precert_signing_cert: Vec<u8>,
}

impl LogEntry {
    // Appends the RFC 6962 TimestampedEntry to the buffer:
    //
    // struct {
    //     uint64 timestamp;
    //     LogEntryType entry_type;
    //     select(entry_type) {
    //         case x509_entry: ASN.1Cert;
    //         case precert_entry: PreCert;
    //     } signed_entry;
    //     CtExtensions extensions;
    // } TimestampedEntry;
    //
    // Extensions are always empty on write.
    fn timestamped_entry(&self, buffer: &mut Vec<u8>, timestamp: UnixTimestamp) {
        buffer.write_u64::<BigEndian>(timestamp).unwrap();
        if self.is_precert {
            buffer.write_u8(ENTRY_TYPE_PRECERT).unwrap();
            buffer.extend_from_slice(&self.issuer_key_hash);
        } else {
            buffer.write_u8(ENTRY_TYPE_X509).unwrap();
        }
        write_length_prefixed(buffer, &self.cert, 3).unwrap();
        write_length_prefixed(buffer, &[], 2).unwrap();
    }

    /// Returns a marshaled RFC 6962 `MerkleTreeLeaf` for this entry at the
    /// given timestamp. Its record hash is the entry's leaf hash.
    ///
    /// # Panics
    ///
    /// Panics if writing to the internal buffer fails, which cannot happen.
    pub fn merkle_tree_leaf(&self, timestamp: UnixTimestamp) -> Vec<u8> {
        let mut buffer = vec![
            0, // version = v1 (0)
            0, // leaf_type = timestamped_entry (0)
        ];
        self.timestamped_entry(&mut buffer, timestamp);
        buffer
    }

    /// Returns a marshaled `TileLeaf` for persistence in a data tile:
    ///
    /// ```text
    /// struct {
    ///     TimestampedEntry timestamped_entry;
    ///     select(entry_type) {
    ///         case x509_entry: Empty;
    ///         case precert_entry: PreCertExtraData;
    ///     } extra_data;
    /// } TileLeaf;
    ///
    /// struct {
    ///     ASN.1Cert pre_certificate;
    ///     opaque PrecertificateSigningCertificate<0..2^24-1>;
    /// } PreCertExtraData;
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if writing to the internal buffer fails, which cannot happen.
    pub fn tile_leaf(&self, timestamp: UnixTimestamp) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.timestamped_entry(&mut buffer, timestamp);
        if self.is_precert {
            write_length_prefixed(&mut buffer, &self.pre_certificate, 3).unwrap();
            write_length_prefixed(&mut buffer, &self.precert_signing_cert, 3).unwrap();
        }
        buffer
    }
}

/// One `TileLeaf` parsed out of a data tile.
#[derive(Debug)]
pub struct ParsedTileLeaf<'a> {
    /// The reconstructed entry.
    pub entry: LogEntry,

    /// The entry's sequencing timestamp.
    pub timestamp: UnixTimestamp,

    /// The raw `TimestampedEntry` bytes. The entry's leaf hash is the
    /// record hash of `0x00 0x00` (the `MerkleTreeLeaf` version and leaf
    /// type) followed by these bytes.
    pub timestamped_entry: &'a [u8],

    /// The unread remainder of the tile.
    pub rest: &'a [u8],
}

/// Reads a single `TileLeaf` from the front of `tile`.
///
/// # Errors
///
/// Returns [`LogError::MalformedTile`] if the buffer is truncated or the
/// entry type is unknown.
pub fn read_tile_leaf(tile: &[u8]) -> Result<ParsedTileLeaf<'_>, LogError> {
    let mut s = Cursor::new(tile);
    let timestamp = s.read_u64::<BigEndian>().map_err(|_| truncated())?;
    let entry_type = s.read_u8().map_err(|_| truncated())?;

    let mut entry = LogEntry::default();
    match entry_type {
        ENTRY_TYPE_X509 => {
            entry.cert = read_length_prefixed(&mut s, 3).map_err(|_| truncated())?;
        }
        ENTRY_TYPE_PRECERT => {
            entry.is_precert = true;
            s.read_exact(&mut entry.issuer_key_hash)
                .map_err(|_| truncated())?;
            entry.cert = read_length_prefixed(&mut s, 3).map_err(|_| truncated())?;
        }
        t => {
            return Err(LogError::MalformedTile(format!("unknown entry type {t}")));
        }
    }
    // Extensions are always empty on write; skip whatever is present.
    read_length_prefixed(&mut s, 2).map_err(|_| truncated())?;
    let timestamped_entry_end = usize::try_from(s.position()).unwrap_or(usize::MAX);

    if entry.is_precert {
        entry.pre_certificate = read_length_prefixed(&mut s, 3).map_err(|_| truncated())?;
        entry.precert_signing_cert = read_length_prefixed(&mut s, 3).map_err(|_| truncated())?;
    }
    let rest_start = usize::try_from(s.position()).unwrap_or(usize::MAX);

    Ok(ParsedTileLeaf {
        entry,
        timestamp,
        timestamped_entry: &tile[..timestamped_entry_end],
        rest: &tile[rest_start..],
    })
}

fn truncated() -> LogError {
    LogError::MalformedTile("truncated tile leaf".to_string())
}

// Reads a big-endian length-prefixed field.
fn read_length_prefixed<R: Read>(reader: &mut R, length_bytes: usize) -> std::io::Result<Vec<u8>> {
    let length = reader.read_uint::<BigEndian>(length_bytes)?;
    let mut buffer = vec![0; usize::try_from(length).unwrap_or(usize::MAX)];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

// Writes a big-endian length-prefixed field.
fn write_length_prefixed<W: Write>(
    writer: &mut W,
    data: &[u8],
    length_bytes: usize,
) -> std::io::Result<()> {
    writer.write_uint::<BigEndian>(data.len() as u64, length_bytes)?;
    writer.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x509_entry() -> LogEntry {
        LogEntry {
            cert: vec![0xAA, 0xBB, 0xCC],
            ..LogEntry::default()
        }
    }

    fn precert_entry() -> LogEntry {
        LogEntry {
            cert: vec![0x01; 40],
            is_precert: true,
            issuer_key_hash: [0x42; 32],
            pre_certificate: vec![0x02; 50],
            precert_signing_cert: vec![0x03; 10],
        }
    }

    #[test]
    fn test_merkle_tree_leaf_layout() {
        let leaf = x509_entry().merkle_tree_leaf(0x0102_0304);
        let mut want = vec![
            0, // version
            0, // leaf_type
            0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04, // timestamp
            0, // entry_type = x509_entry
            0, 0, 3, // cert length
        ];
        want.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        want.extend_from_slice(&[0, 0]); // empty extensions
        assert_eq!(leaf, want);
    }

    #[test]
    fn test_precert_leaf_layout() {
        let entry = precert_entry();
        let leaf = entry.merkle_tree_leaf(7);
        assert_eq!(leaf[0..2], [0, 0]);
        assert_eq!(leaf[2..10], 7u64.to_be_bytes());
        assert_eq!(leaf[10], 1); // entry_type = precert_entry
        assert_eq!(leaf[11..43], [0x42; 32]);
        assert_eq!(leaf[43..46], [0, 0, 40]); // tbs length
        assert_eq!(leaf[46..86], [0x01; 40]);
        assert_eq!(leaf[86..88], [0, 0]); // empty extensions
        assert_eq!(leaf.len(), 88);
    }

    #[test]
    fn test_tile_leaf_round_trip_x509() {
        let entry = x509_entry();
        let tile = entry.tile_leaf(1234);

        let parsed = read_tile_leaf(&tile).unwrap();
        assert_eq!(parsed.entry, entry);
        assert_eq!(parsed.timestamp, 1234);
        assert_eq!(parsed.timestamped_entry, &tile[..]);
        assert!(parsed.rest.is_empty());

        // The tile leaf of an x509 entry is its MerkleTreeLeaf without the
        // two-byte prefix.
        assert_eq!(entry.merkle_tree_leaf(1234)[2..], tile[..]);
    }

    #[test]
    fn test_tile_leaf_round_trip_precert() {
        let entry = precert_entry();
        let tile = entry.tile_leaf(u64::MAX);

        let parsed = read_tile_leaf(&tile).unwrap();
        assert_eq!(parsed.entry, entry);
        assert_eq!(parsed.timestamp, u64::MAX);
        assert!(parsed.rest.is_empty());

        // The TimestampedEntry stops before the extra data.
        assert_eq!(
            parsed.timestamped_entry,
            &entry.merkle_tree_leaf(u64::MAX)[2..]
        );
    }

    #[test]
    fn test_tile_leaf_empty_signing_cert() {
        let mut entry = precert_entry();
        entry.precert_signing_cert = Vec::new();
        let tile = entry.tile_leaf(1);
        let parsed = read_tile_leaf(&tile).unwrap();
        assert_eq!(parsed.entry, entry);
    }

    #[test]
    fn test_read_consecutive_leaves() {
        let a = x509_entry();
        let b = precert_entry();
        let mut tile = a.tile_leaf(10);
        tile.extend(b.tile_leaf(10));

        let first = read_tile_leaf(&tile).unwrap();
        assert_eq!(first.entry, a);
        let second = read_tile_leaf(first.rest).unwrap();
        assert_eq!(second.entry, b);
        assert!(second.rest.is_empty());
    }

    #[test]
    fn test_malformed_tile_leaf() {
        // Unknown entry type.
        let mut tile = x509_entry().tile_leaf(5);
        tile[8] = 2;
        assert!(matches!(
            read_tile_leaf(&tile).unwrap_err(),
            LogError::MalformedTile(_)
        ));

        // Truncations at every boundary.
        let tile = precert_entry().tile_leaf(5);
        for len in 0..tile.len() {
            assert!(
                read_tile_leaf(&tile[..len]).is_err(),
                "parse succeeded at length {len}"
            );
        }
        assert!(read_tile_leaf(&tile).is_ok());
    }
}
