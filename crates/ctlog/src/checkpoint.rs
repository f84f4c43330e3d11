//! Tree head signing: the RFC 6962 `TreeHeadSignature` wrapped in a
//! note-format checkpoint (c2sp.org/checkpoint).
//!
//! The note format wants a signature over the note body, but RFC 6962
//! clients need a `TreeHeadSignature` over `(timestamp, size, root)`. The
//! signature is therefore computed up front, bound to the same tree head
//! that appears textually in the checkpoint, and injected into a fixed note
//! signer under algorithm tag `0x05`, avoiding a risky
//! serialize-deserialize loop and keeping control of the timestamp.

use crate::{LogError, UnixTimestamp};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{
    Signature as EcdsaSignature, SigningKey as EcdsaSigningKey, VerifyingKey as EcdsaVerifyingKey,
};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use signed_note::{Note, NoteError, NoteSignature, NoteSigner, NoteVerifier};
use std::io::Cursor;
use tlog_tiles::{tree_hash, Checkpoint, Hash, HashReader, TlogError};

/// Note signature algorithm tag for RFC 6962 tree head signatures.
const ALG_RFC6962_TREE_HEAD: u8 = 0x05;

const HASH_ALG_SHA256: u8 = 4;
const SIG_ALG_RSA: u8 = 1;
const SIG_ALG_ECDSA: u8 = 3;

/// The log's signing key: ECDSA P-256 or RSA. Both sign the SHA-256 digest
/// of the `TreeHeadSignature` input, ECDSA with deterministic (RFC 6979)
/// nonces and ASN.1 DER encoding, RSA with PKCS#1 v1.5.
#[derive(Clone, Debug)]
pub enum KeyPair {
    Ecdsa(EcdsaSigningKey),
    Rsa(RsaPrivateKey),
}

impl KeyPair {
    /// Parses a PKCS#8 private key.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnsupportedKeyType`] if the key is neither ECDSA
    /// P-256 nor RSA.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, LogError> {
        if let Ok(key) = EcdsaSigningKey::from_pkcs8_der(der) {
            return Ok(KeyPair::Ecdsa(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(KeyPair::Rsa(key));
        }
        Err(LogError::UnsupportedKeyType)
    }

    /// Returns the DER-encoded SubjectPublicKeyInfo of the public key.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SigningFailed`] if the key cannot be encoded.
    pub fn public_key_der(&self) -> Result<Vec<u8>, LogError> {
        let doc = match self {
            KeyPair::Ecdsa(key) => key.verifying_key().to_public_key_der(),
            KeyPair::Rsa(key) => key.to_public_key().to_public_key_der(),
        }
        .map_err(|e| LogError::SigningFailed(format!("encoding public key: {e}")))?;
        Ok(doc.into_vec())
    }

    /// Returns the log ID: the SHA-256 of the DER-encoded
    /// SubjectPublicKeyInfo (RFC 6962, section 3.2).
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SigningFailed`] if the key cannot be encoded.
    pub fn log_id(&self) -> Result<[u8; 32], LogError> {
        Ok(Sha256::digest(self.public_key_der()?).into())
    }

    // The TLS SignatureAlgorithm byte for this key.
    fn signature_algorithm(&self) -> u8 {
        match self {
            KeyPair::Ecdsa(_) => SIG_ALG_ECDSA,
            KeyPair::Rsa(_) => SIG_ALG_RSA,
        }
    }

    // Signs a SHA-256 digest.
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, LogError> {
        match self {
            KeyPair::Ecdsa(key) => {
                let sig: EcdsaSignature = key
                    .sign_prehash(digest)
                    .map_err(|e| LogError::SigningFailed(e.to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            KeyPair::Rsa(key) => key
                .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                .map_err(|e| LogError::SigningFailed(e.to_string())),
        }
    }
}

/// A tree head: size, root hash, and timestamp in Unix milliseconds.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct TreeWithTimestamp {
    size: u64,
    hash: Hash,
    time: UnixTimestamp,
}

impl TreeWithTimestamp {
    pub fn new(size: u64, hash: Hash, time: UnixTimestamp) -> Self {
        Self { size, hash, time }
    }

    /// Computes the root hash for a tree of `size` records from `r`.
    ///
    /// # Errors
    ///
    /// Returns an error if `r` cannot produce the required hashes.
    pub fn from_hash_reader<R: HashReader>(
        size: u64,
        r: &R,
        time: UnixTimestamp,
    ) -> Result<Self, TlogError> {
        Ok(Self {
            size,
            hash: tree_hash(size, r)?,
            time,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn time(&self) -> UnixTimestamp {
        self.time
    }
}

/// Serializes the RFC 6962 section 3.5 `TreeHeadSignature` input:
///
/// ```text
/// digitally-signed struct {
///     Version version;
///     SignatureType signature_type = tree_hash;
///     uint64 timestamp;
///     uint64 tree_size;
///     opaque sha256_root_hash[32];
/// } TreeHeadSignature;
/// ```
///
/// # Panics
///
/// Panics if writing to the internal buffer fails, which cannot happen.
fn serialize_sth_signature_input(timestamp: UnixTimestamp, tree_size: u64, root_hash: &Hash) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(2 + 8 + 8 + 32);
    buffer.write_u8(0).unwrap(); // version = v1 (0)
    buffer.write_u8(1).unwrap(); // signature_type = tree_hash (1)
    buffer.write_u64::<BigEndian>(timestamp).unwrap();
    buffer.write_u64::<BigEndian>(tree_size).unwrap();
    buffer.extend_from_slice(&root_hash.0);
    buffer
}

/// Produces the TLS `DigitallySigned` encoding of a signature over `msg`:
/// the SHA-256 and key algorithm bytes, then the u16-prefixed signature.
///
/// # Errors
///
/// Returns [`LogError::SigningFailed`] if the signing operation fails.
///
/// # Panics
///
/// Panics if writing to the internal buffer fails, which cannot happen.
pub fn digitally_sign(key: &KeyPair, msg: &[u8]) -> Result<Vec<u8>, LogError> {
    let digest: [u8; 32] = Sha256::digest(msg).into();
    let sig = key.sign_digest(&digest)?;

    let mut buffer = Vec::with_capacity(4 + sig.len());
    buffer.write_u8(HASH_ALG_SHA256).unwrap();
    buffer.write_u8(key.signature_algorithm()).unwrap();
    buffer
        .write_u16::<BigEndian>(u16::try_from(sig.len()).map_err(|_| {
            LogError::SigningFailed("oversized signature".to_string())
        })?)
        .unwrap();
    buffer.extend_from_slice(&sig);
    Ok(buffer)
}

/// Signs the tree head and returns a checkpoint according to
/// c2sp.org/checkpoint, with a single note signature carrying
///
/// ```text
/// struct {
///     uint64 timestamp;
///     TreeHeadSignature signature;
/// } RFC6962NoteSignature;
/// ```
///
/// # Errors
///
/// Returns an error if signing fails or the log name is not a valid note
/// key name.
pub fn sign_tree_head(
    name: &str,
    log_id: &[u8; 32],
    key: &KeyPair,
    tree: &TreeWithTimestamp,
) -> Result<Vec<u8>, LogError> {
    let sth_bytes = serialize_sth_signature_input(tree.time(), tree.size(), tree.hash());
    let tree_head_signature = digitally_sign(key, &sth_bytes)?;

    let mut sig = Vec::with_capacity(8 + tree_head_signature.len());
    sig.write_u64::<BigEndian>(tree.time()).unwrap();
    sig.extend_from_slice(&tree_head_signature);

    let signer = InjectedSigner {
        name: name.to_string(),
        id: rfc6962_key_id(name, log_id),
        sig,
    };

    let checkpoint = Checkpoint::new(name, tree.size(), *tree.hash(), "")
        .map_err(|e| LogError::SthInvalid(e.to_string()))?;
    let mut note = Note::new(&checkpoint.to_bytes(), &[])
        .map_err(|e| LogError::SthInvalid(e.to_string()))?;
    note.add_sigs(&[&signer])
        .map_err(|e| LogError::SigningFailed(e.to_string()))?;
    Ok(note.to_bytes())
}

// The note key ID for an RFC 6962 tree head key: derived from the key name
// and the log ID rather than the public key itself.
fn rfc6962_key_id(name: &str, log_id: &[u8; 32]) -> u32 {
    let mut key = Vec::with_capacity(1 + log_id.len());
    key.push(ALG_RFC6962_TREE_HEAD);
    key.extend_from_slice(log_id);
    signed_note::key_id(name, &key)
}

// A note signer that emits a precomputed signature, ignoring the body.
struct InjectedSigner {
    name: String,
    id: u32,
    sig: Vec<u8>,
}

impl NoteSigner for InjectedSigner {
    fn name(&self) -> &str {
        &self.name
    }
    fn key_id(&self) -> u32 {
        self.id
    }
    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, NoteError> {
        Ok(self.sig.clone())
    }
}

/// Reads the timestamp from an `RFC6962NoteSignature`.
///
/// # Errors
///
/// Returns [`LogError::SthInvalid`] if the signature is shorter than eight
/// bytes.
pub fn rfc6962_signature_timestamp(sig: &NoteSignature) -> Result<UnixTimestamp, LogError> {
    sig.signature()
        .read_u64::<BigEndian>()
        .map_err(|_| LogError::SthInvalid("truncated note signature".to_string()))
}

/// A [`NoteVerifier`] for checkpoints signed with [`sign_tree_head`]:
/// re-serializes the `TreeHeadSignature` input from the checkpoint body and
/// the signature's embedded timestamp, and verifies the inner
/// `DigitallySigned` under the log's public key.
#[derive(Clone)]
pub struct Rfc6962Verifier {
    name: String,
    id: u32,
    key: VerifyingKey,
}

#[derive(Clone)]
enum VerifyingKey {
    Ecdsa(EcdsaVerifyingKey),
    Rsa(RsaPublicKey),
}

impl Rfc6962Verifier {
    /// Returns a verifier bound to the log's name and key.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not a valid note key name or the key
    /// cannot be encoded.
    pub fn new(name: &str, key: &KeyPair) -> Result<Self, LogError> {
        if !signed_note::is_key_name_valid(name) {
            return Err(LogError::SthInvalid(format!("invalid log name {name:?}")));
        }
        let log_id = key.log_id()?;
        let verifying_key = match key {
            KeyPair::Ecdsa(key) => VerifyingKey::Ecdsa(*key.verifying_key()),
            KeyPair::Rsa(key) => VerifyingKey::Rsa(key.to_public_key()),
        };
        Ok(Self {
            name: name.to_string(),
            id: rfc6962_key_id(name, &log_id),
            key: verifying_key,
        })
    }

    fn expected_signature_algorithm(&self) -> u8 {
        match self.key {
            VerifyingKey::Ecdsa(_) => SIG_ALG_ECDSA,
            VerifyingKey::Rsa(_) => SIG_ALG_RSA,
        }
    }
}

impl NoteVerifier for Rfc6962Verifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_id(&self) -> u32 {
        self.id
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(checkpoint) = Checkpoint::from_bytes(msg) else {
            return false;
        };
        if !checkpoint.extension().is_empty() {
            return false;
        }

        let mut s = Cursor::new(sig);
        let Ok(timestamp) = s.read_u64::<BigEndian>() else {
            return false;
        };
        let Ok(hash_alg) = s.read_u8() else {
            return false;
        };
        if hash_alg != HASH_ALG_SHA256 {
            return false;
        }
        let Ok(sig_alg) = s.read_u8() else {
            return false;
        };
        if sig_alg != self.expected_signature_algorithm() {
            return false;
        }
        let Ok(sig_len) = s.read_u16::<BigEndian>() else {
            return false;
        };
        let start = usize::try_from(s.position()).unwrap_or(usize::MAX);
        let Some(signature) = sig.get(start..start + usize::from(sig_len)) else {
            return false;
        };
        if start + usize::from(sig_len) != sig.len() {
            return false;
        }

        let sth_bytes =
            serialize_sth_signature_input(timestamp, checkpoint.size(), checkpoint.hash());
        let digest: [u8; 32] = Sha256::digest(&sth_bytes).into();

        match &self.key {
            VerifyingKey::Ecdsa(key) => {
                let Ok(sig) = EcdsaSignature::from_der(signature) else {
                    return false;
                };
                key.verify_prehash(&digest, &sig).is_ok()
            }
            VerifyingKey::Rsa(key) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                .is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use signed_note::VerifierList;
    use tlog_tiles::EMPTY_HASH;

    fn ecdsa_key() -> KeyPair {
        KeyPair::Ecdsa(EcdsaSigningKey::random(&mut OsRng))
    }

    fn rsa_key() -> KeyPair {
        // Small modulus to keep test key generation fast.
        KeyPair::Rsa(RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
    }

    fn check_sign_and_open(name: &str, key: &KeyPair) {
        let log_id = key.log_id().unwrap();
        let tree = TreeWithTimestamp::new(42, tlog_tiles::record_hash(b"hi"), 1_700_000_000_123);
        let checkpoint = sign_tree_head(name, &log_id, key, &tree).unwrap();

        let note = Note::from_bytes(&checkpoint).unwrap();
        let verifier = Rfc6962Verifier::new(name, key).unwrap();
        let (verified, unverified) = note
            .verify(&VerifierList::new(vec![Box::new(verifier.clone())]))
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert!(unverified.is_empty());

        // The key ID is bound to the 0x05 algorithm tag and the log ID.
        assert_eq!(verified[0].id(), rfc6962_key_id(name, &log_id));

        // The embedded timestamp is the tree head's.
        assert_eq!(
            rfc6962_signature_timestamp(&verified[0]).unwrap(),
            1_700_000_000_123
        );

        // The body is the bare checkpoint.
        let c = Checkpoint::from_bytes(note.text()).unwrap();
        assert_eq!(c.origin(), name);
        assert_eq!(c.size(), 42);
        assert_eq!(c.hash(), &tlog_tiles::record_hash(b"hi"));
        assert_eq!(c.extension(), "");
    }

    #[test]
    fn test_sign_and_open_ecdsa() {
        check_sign_and_open("example.com/log", &ecdsa_key());
    }

    #[test]
    fn test_sign_and_open_rsa() {
        check_sign_and_open("example.com/log", &rsa_key());
    }

    #[test]
    fn test_digitally_signed_framing() {
        let key = ecdsa_key();
        let ds = digitally_sign(&key, b"message").unwrap();
        assert_eq!(ds[0], HASH_ALG_SHA256);
        assert_eq!(ds[1], SIG_ALG_ECDSA);
        let len = usize::from(u16::from_be_bytes([ds[2], ds[3]]));
        assert_eq!(ds.len(), 4 + len);

        let rsa = rsa_key();
        let ds = digitally_sign(&rsa, b"message").unwrap();
        assert_eq!(ds[1], SIG_ALG_RSA);
        // PKCS#1 v1.5 signatures are as long as the modulus.
        assert_eq!(usize::from(u16::from_be_bytes([ds[2], ds[3]])), 128);
    }

    #[test]
    fn test_verifier_rejects_tampering() {
        let key = ecdsa_key();
        let log_id = key.log_id().unwrap();
        let tree = TreeWithTimestamp::new(7, EMPTY_HASH, 1000);
        let checkpoint = sign_tree_head("example.com/log", &log_id, &key, &tree).unwrap();
        let verifier = Rfc6962Verifier::new("example.com/log", &key).unwrap();

        let note = Note::from_bytes(&checkpoint).unwrap();
        let good_sig = {
            let (verified, _) = note
                .verify(&VerifierList::new(vec![Box::new(verifier.clone())]))
                .unwrap();
            verified[0].clone()
        };
        assert!(verifier.verify(note.text(), good_sig.signature()));

        let mut tampered_body = note.text().to_vec();
        tampered_body[0] ^= 1;
        assert!(!verifier.verify(&tampered_body, good_sig.signature()));

        let mut tampered_sig = good_sig.signature().to_vec();
        let last = tampered_sig.len() - 1;
        tampered_sig[last] ^= 1;
        assert!(!verifier.verify(note.text(), &tampered_sig));

        // Trailing garbage after the DigitallySigned is rejected.
        let mut oversized = good_sig.signature().to_vec();
        oversized.push(0);
        assert!(!verifier.verify(note.text(), &oversized));

        // A different key does not verify.
        let other = Rfc6962Verifier::new("example.com/log", &ecdsa_key()).unwrap();
        assert!(!other.verify(note.text(), good_sig.signature()));
    }

    #[test]
    fn test_wrong_key_type_rejected() {
        let ecdsa = ecdsa_key();
        let rsa = rsa_key();
        let log_id = ecdsa.log_id().unwrap();
        let tree = TreeWithTimestamp::new(1, EMPTY_HASH, 5);
        let checkpoint = sign_tree_head("example.com/log", &log_id, &ecdsa, &tree).unwrap();
        let note = Note::from_bytes(&checkpoint).unwrap();

        // An RSA verifier rejects an ECDSA signature by algorithm byte.
        let rsa_verifier = Rfc6962Verifier::new("example.com/log", &rsa).unwrap();
        let ecdsa_verifier = Rfc6962Verifier::new("example.com/log", &ecdsa).unwrap();
        let (verified, _) = note
            .verify(&VerifierList::new(vec![Box::new(ecdsa_verifier)]))
            .unwrap();
        assert!(!rsa_verifier.verify(note.text(), verified[0].signature()));
    }

    #[test]
    fn test_from_pkcs8_der() {
        use p256::pkcs8::EncodePrivateKey;

        let KeyPair::Ecdsa(key) = ecdsa_key() else {
            unreachable!();
        };
        let der = key.to_pkcs8_der().unwrap();
        assert!(matches!(
            KeyPair::from_pkcs8_der(der.as_bytes()).unwrap(),
            KeyPair::Ecdsa(_)
        ));

        assert!(matches!(
            KeyPair::from_pkcs8_der(b"not a key").unwrap_err(),
            LogError::UnsupportedKeyType
        ));
    }

    #[test]
    fn test_log_id_matches_spki_digest() {
        let key = ecdsa_key();
        let spki = key.public_key_der().unwrap();
        assert_eq!(key.log_id().unwrap(), <[u8; 32]>::from(Sha256::digest(spki)));
    }
}
