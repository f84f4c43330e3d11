// Ported from "mod" (https://pkg.go.dev/golang.org/x/mod)
// Copyright 2009 The Go Authors
// Licensed under the BSD-3-Clause license found in the LICENSE file or at
// https://opensource.org/licenses/BSD-3-Clause

//! Notes as specified by [C2SP signed-note](https://c2sp.org/signed-note).
//!
//! A note is a text signed by one or more server keys. The text must be
//! valid UTF-8 ending in a newline, with no ASCII control characters other
//! than newline. It is followed by a blank line and one or more signature
//! lines of the form: em dash (U+2014), space, server name, space,
//! base64-encoded signature, newline.
//!
//! A signature decodes to `4 + n` bytes: the big-endian 32-bit key ID,
//! then the `n`-byte signature of the note text (including the final
//! newline, excluding the separating blank line).
//!
//! A server key is identified by a name (non-empty, no Unicode spaces, no
//! `+`) and a 32-bit key ID. [`key_id`] computes the ID the way the spec
//! recommends:
//!
//! ```text
//! key ID = SHA-256(key name || 0x0A || signature type || public key)[:4]
//! ```
//!
//! Signature algorithms are pluggable through the [`NoteSigner`] and
//! [`NoteVerifier`] traits; this crate defines the envelope only. A
//! [`VerifierList`] resolves `(name, key ID)` pairs to verifiers when
//! opening a note with [`Note::verify`].

use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

const MAX_NOTE_SIZE: usize = 1_000_000;
const MAX_NOTE_SIGNATURES: usize = 100;

/// A `NoteVerifier` verifies messages signed with one specific key.
pub trait NoteVerifier {
    /// Returns the server name associated with the key. The name must be
    /// non-empty and contain no Unicode spaces or pluses.
    fn name(&self) -> &str;

    /// Returns the key ID.
    fn key_id(&self) -> u32;

    /// Reports whether `sig` is a valid signature of `msg`.
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool;
}

/// A `NoteSigner` signs messages with one specific key.
pub trait NoteSigner {
    /// Returns the server name associated with the key. The name must be
    /// non-empty and contain no Unicode spaces or pluses.
    fn name(&self) -> &str;

    /// Returns the key ID.
    fn key_id(&self) -> u32;

    /// Returns a signature over `msg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying signing operation fails.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, NoteError>;
}

/// Computes the key ID for the given server name and encoded public key,
/// as recommended at <https://c2sp.org/signed-note#signatures>. The `key`
/// argument carries the signature-type byte followed by the public key
/// material.
pub fn key_id(name: &str, key: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(key);
    let digest = hasher.finalize();
    u32::from_be_bytes(digest[..4].try_into().unwrap())
}

/// Reports whether `name` is a valid key name: non-empty, no Unicode
/// spaces, no `+`.
pub fn is_key_name_valid(name: &str) -> bool {
    !(name.is_empty() || name.chars().any(char::is_whitespace) || name.contains('+'))
}

/// A collection of known verifier keys, looked up by name and key ID.
pub trait Verifiers {
    /// Returns the verifier for the key identified by `(name, id)`.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::UnknownKey`] if the pair is unknown.
    fn verifier(&self, name: &str, id: u32) -> Result<&dyn NoteVerifier, VerificationError>;
}

/// An error returned when resolving a verifier.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("unknown key {name}+{id:08x}")]
    UnknownKey { name: String, id: u32 },
    #[error("ambiguous key {name}+{id:08x}")]
    AmbiguousKey { name: String, id: u32 },
}

/// A [`Verifiers`] implementation backed by a fixed list.
pub struct VerifierList {
    map: HashMap<(String, u32), Vec<Box<dyn NoteVerifier>>>,
}

impl VerifierList {
    pub fn new(list: Vec<Box<dyn NoteVerifier>>) -> Self {
        let mut map: HashMap<(String, u32), Vec<Box<dyn NoteVerifier>>> = HashMap::new();
        for verifier in list {
            map.entry((verifier.name().to_owned(), verifier.key_id()))
                .or_default()
                .push(verifier);
        }
        Self { map }
    }
}

impl Verifiers for VerifierList {
    fn verifier(&self, name: &str, id: u32) -> Result<&dyn NoteVerifier, VerificationError> {
        match self.map.get(&(name.to_owned(), id)) {
            Some(verifiers) if verifiers.len() == 1 => Ok(&*verifiers[0]),
            Some(_) => Err(VerificationError::AmbiguousKey {
                name: name.to_owned(),
                id,
            }),
            None => Err(VerificationError::UnknownKey {
                name: name.to_owned(),
                id,
            }),
        }
    }
}

/// An error returned when parsing, verifying, or signing notes.
#[derive(Error, Debug)]
pub enum NoteError {
    #[error("malformed note")]
    MalformedNote,
    #[error("invalid signer")]
    InvalidSigner,
    #[error("invalid signature for key {name}+{id:08x}")]
    InvalidSignature { name: String, id: u32 },
    #[error("verifier name or id doesn't match signature")]
    MismatchedVerifier,
    #[error("note has no verifiable signatures")]
    UnverifiedNote,
    #[error("signing failed")]
    SigningFailed,
    #[error(transparent)]
    VerificationError(#[from] VerificationError),
}

/// A single signature line of a note, verified or not.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NoteSignature {
    name: String,
    id: u32,
    sig: Vec<u8>,
}

impl NoteSignature {
    /// Returns a new signature from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::MalformedNote`] if the name is invalid.
    pub fn new(name: String, id: u32, sig: Vec<u8>) -> Result<Self, NoteError> {
        if !is_key_name_valid(&name) {
            return Err(NoteError::MalformedNote);
        }
        Ok(Self { name, id, sig })
    }

    /// Parses a single signature line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::MalformedNote`] if the line is not a valid
    /// signature line.
    ///
    /// # Panics
    ///
    /// Panics if slice conversion fails, which cannot happen.
    pub fn from_bytes(line: &[u8]) -> Result<Self, NoteError> {
        let line = std::str::from_utf8(line).map_err(|_| NoteError::MalformedNote)?;
        let line = line.strip_prefix("— ").ok_or(NoteError::MalformedNote)?;
        let (name, b64) = line.split_once(' ').ok_or(NoteError::MalformedNote)?;
        let sig = BASE64_STANDARD
            .decode(b64)
            .map_err(|_| NoteError::MalformedNote)?;
        if b64.is_empty() || sig.len() < 5 {
            return Err(NoteError::MalformedNote);
        }
        let id = u32::from_be_bytes(sig[..4].try_into().unwrap());
        NoteSignature::new(name.to_owned(), id, sig[4..].to_owned())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the raw signature bytes (without the key ID prefix).
    pub fn signature(&self) -> &[u8] {
        &self.sig
    }

    /// Encodes the signature line, trailing newline included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.id.to_be_bytes();
        let b64 = BASE64_STANDARD.encode([&id, self.sig.as_slice()].concat());
        format!("— {} {}\n", self.name, b64).into()
    }
}

/// A note: a text plus its signatures.
#[derive(Debug, PartialEq, Eq)]
pub struct Note {
    text: Vec<u8>,
    sigs: Vec<NoteSignature>,
}

impl Note {
    /// Returns a new note over `text` carrying the given signatures.
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::MalformedNote`] if the text is oversized, is not
    /// UTF-8, contains a non-newline control character, or does not end in a
    /// newline.
    pub fn new(text: &[u8], existing_sigs: &[NoteSignature]) -> Result<Self, NoteError> {
        if text.len() > MAX_NOTE_SIZE {
            return Err(NoteError::MalformedNote);
        }
        let text_str = std::str::from_utf8(text).map_err(|_| NoteError::MalformedNote)?;
        if text_str.chars().any(|ch| ch < '\u{0020}' && ch != '\n') {
            return Err(NoteError::MalformedNote);
        }
        if !text_str.ends_with('\n') {
            return Err(NoteError::MalformedNote);
        }
        Ok(Self {
            text: text.to_owned(),
            sigs: existing_sigs.into(),
        })
    }

    /// Parses an encoded note, validating the text and every signature line.
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::MalformedNote`] if the message is oversized,
    /// has no signature block, has too many signatures, or any part is
    /// syntactically invalid.
    pub fn from_bytes(msg: &[u8]) -> Result<Self, NoteError> {
        if msg.len() > MAX_NOTE_SIZE {
            return Err(NoteError::MalformedNote);
        }
        let msg_str = std::str::from_utf8(msg).map_err(|_| NoteError::MalformedNote)?;
        if msg_str.chars().any(|ch| ch < '\u{0020}' && ch != '\n') {
            return Err(NoteError::MalformedNote);
        }

        // The signature block is preceded by a blank line.
        let (text, sigs) = msg_str.rsplit_once("\n\n").ok_or(NoteError::MalformedNote)?;
        let text = format!("{text}\n");
        let sigs = sigs.strip_suffix('\n').ok_or(NoteError::MalformedNote)?;

        let mut parsed_sigs = Vec::new();
        for line in sigs.split('\n') {
            parsed_sigs.push(NoteSignature::from_bytes(line.as_bytes())?);
            if parsed_sigs.len() > MAX_NOTE_SIGNATURES {
                return Err(NoteError::MalformedNote);
            }
        }

        Self::new(text.as_bytes(), &parsed_sigs)
    }

    /// Checks the note's signatures against the known verifiers, returning
    /// the verified and unverified signatures. A signature whose key is
    /// unknown is unverified; duplicate signatures by the same key are
    /// dropped after the first.
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::InvalidSignature`] if a known key's signature
    /// fails to verify, [`NoteError::UnverifiedNote`] if no known key signed
    /// the note, and any error from the verifier lookup itself.
    pub fn verify(
        &self,
        known: &impl Verifiers,
    ) -> Result<(Vec<NoteSignature>, Vec<NoteSignature>), NoteError> {
        let mut verified_sigs = Vec::new();
        let mut unverified_sigs = Vec::new();
        let mut seen = BTreeSet::new();
        let mut seen_unverified = BTreeSet::new();
        for sig in &self.sigs {
            match known.verifier(&sig.name, sig.id) {
                Ok(verifier) => {
                    if verifier.name() != sig.name || verifier.key_id() != sig.id {
                        return Err(NoteError::MismatchedVerifier);
                    }
                    if !seen.insert((&sig.name, sig.id)) {
                        continue;
                    }
                    if !verifier.verify(&self.text, &sig.sig) {
                        return Err(NoteError::InvalidSignature {
                            name: sig.name.clone(),
                            id: sig.id,
                        });
                    }
                    verified_sigs.push(sig.clone());
                }
                Err(VerificationError::UnknownKey { .. }) => {
                    if !seen_unverified.insert(sig.to_bytes()) {
                        continue;
                    }
                    unverified_sigs.push(sig.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        if verified_sigs.is_empty() {
            return Err(NoteError::UnverifiedNote);
        }
        Ok((verified_sigs, unverified_sigs))
    }

    /// Signs the note with the given signers, appending the new signatures
    /// after the existing ones. A signer that shares a key with an existing
    /// signature replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`NoteError::InvalidSigner`] if a signer's name is invalid,
    /// or the signer's error if signing fails.
    pub fn add_sigs(&mut self, signers: &[&dyn NoteSigner]) -> Result<(), NoteError> {
        let mut new_sigs = Vec::new();
        let mut have = BTreeSet::new();
        for s in signers {
            let name = s.name();
            let id = s.key_id();
            have.insert((name, id));
            if !is_key_name_valid(name) {
                return Err(NoteError::InvalidSigner);
            }
            let sig = s.sign(&self.text)?;
            new_sigs.push(NoteSignature::new(name.to_owned(), id, sig)?);
        }

        self.sigs.retain(|sig| !have.contains(&(&sig.name, sig.id)));
        self.sigs.extend(new_sigs);
        Ok(())
    }

    /// Encodes the note: text, blank line, signature lines.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.text.clone();
        buf.push(b'\n');
        for sig in &self.sigs {
            buf.extend(sig.to_bytes());
        }
        buf
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }
}
