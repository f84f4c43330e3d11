//! The checkpoint text format (c2sp.org/tlog-checkpoint).
//!
//! A checkpoint is the tree head a log commits to, as the text body of a
//! signed note:
//!
//! ```text
//! example.com/origin
//! 923748
//! nND/nri//U0xuHUrYSy0HtMeal2vzD9V4k/BO79C+QeI=
//! ```
//!
//! The three lines are the origin, the tree size in decimal, and the
//! base64-encoded root hash. They may be followed by extension lines, each
//! non-empty and newline-terminated.

use crate::tlog::Hash;
use std::fmt;
use thiserror::Error;

/// Maximum checkpoint size we are willing to parse.
const MAX_CHECKPOINT_SIZE: usize = 1_000_000;

/// A parsed or to-be-encoded checkpoint body.
#[derive(PartialEq, Debug)]
pub struct Checkpoint {
    origin: String,
    size: u64,
    hash: Hash,
    /// Empty, or a sequence of non-empty newline-terminated lines.
    extension: String,
}

#[derive(Error, Debug)]
#[error("malformed checkpoint")]
pub struct MalformedCheckpointError;

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{}\n{}",
            self.origin, self.size, self.hash, self.extension
        )
    }
}

impl Checkpoint {
    /// Returns a new checkpoint with the given fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is empty or the extension is not a
    /// sequence of non-empty newline-terminated lines.
    pub fn new(
        origin: &str,
        size: u64,
        hash: Hash,
        extension: &str,
    ) -> Result<Self, MalformedCheckpointError> {
        if origin.is_empty() {
            return Err(MalformedCheckpointError);
        }
        let mut rest = extension;
        while !rest.is_empty() {
            match rest.split_once('\n') {
                Some((line, after)) if !line.is_empty() => rest = after,
                _ => return Err(MalformedCheckpointError),
            }
        }
        Ok(Self {
            origin: origin.to_string(),
            size,
            hash,
            extension: extension.to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Parses a checkpoint body. The input must be exactly a checkpoint:
    /// origin, size, and hash lines, then zero or more non-empty extension
    /// lines, every line newline-terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if the body deviates from that shape, if the size is
    /// not canonical decimal, or if the hash does not decode.
    pub fn from_bytes(text: &[u8]) -> Result<Self, MalformedCheckpointError> {
        if text.len() > MAX_CHECKPOINT_SIZE {
            return Err(MalformedCheckpointError);
        }
        let text = std::str::from_utf8(text).map_err(|_| MalformedCheckpointError)?;
        let body = text.strip_suffix('\n').ok_or(MalformedCheckpointError)?;

        let mut lines = body.split('\n');
        let origin = lines.next().ok_or(MalformedCheckpointError)?;
        let size_str = lines.next().ok_or(MalformedCheckpointError)?;
        let hash_str = lines.next().ok_or(MalformedCheckpointError)?;
        let extension_lines: Vec<&str> = lines.collect();

        let size: u64 = size_str.parse().map_err(|_| MalformedCheckpointError)?;
        if size.to_string() != size_str {
            return Err(MalformedCheckpointError);
        }
        let hash = Hash::parse_hash(hash_str).map_err(|_| MalformedCheckpointError)?;

        let extension = if extension_lines.is_empty() {
            String::new()
        } else {
            extension_lines.join("\n") + "\n"
        };

        Self::new(origin, size, hash, &extension)
    }

    /// Returns the encoded checkpoint body.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlog::record_hash;

    #[test]
    fn test_checkpoint_round_trip() {
        let c = Checkpoint::new(
            "example.com/origin",
            123,
            record_hash(b"hello world"),
            "abc\ndef\n",
        )
        .unwrap();
        let c2 = Checkpoint::from_bytes(&c.to_bytes()).unwrap();
        assert_eq!(c, c2);
        assert_eq!(
            c.to_bytes(),
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\nabc\ndef\n"
        );
    }

    #[test]
    fn test_parse_checkpoint() {
        let good: Vec<&[u8]> = vec![
            // With extension.
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\nabc\ndef\n",
            // Without extension.
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
            // Short origin.
            b"e\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
        ];
        for text in good {
            let c = Checkpoint::from_bytes(text).unwrap();
            assert_eq!(c.to_bytes(), text);
        }

        let bad: Vec<&[u8]> = vec![
            // Empty origin.
            b"\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
            // Non-decimal tree size.
            b"example.com/origin\n0xabcdef\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
            // Tree size over u64::MAX.
            b"example.com/origin\n18446744073709551616\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
            // Non-canonical tree size.
            b"example.com/origin\n0123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\n",
            // Truncated base64 hash.
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0\n",
            // Hash that decodes to more than 32 bytes.
            b"example.com/origin\n123\nQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBCg==\n",
            // Empty extension line.
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\nabc\n\n",
            // Missing final newline.
            b"example.com/origin\n123\nTszzRgjTG6xce+z2AG31kAXYKBgQVtCSCE40HmuwBb0=\nabc",
            // Missing hash line.
            b"example.com/origin\n123\n",
        ];
        for (i, text) in bad.iter().enumerate() {
            assert!(
                Checkpoint::from_bytes(text).is_err(),
                "expected error at index {i}: {text:?}"
            );
        }
    }
}
