//! Sealing of credential material at rest.
//!
//! Secrets are sealed with AES-256-GCM under a process-wide key that is fixed
//! at startup. Each sealed blob records the fingerprint of the key that
//! produced it so that a key mismatch is reported as such instead of as
//! corruption, and so that an external migration job can find blobs that
//! still need to be resealed after a rotation.
//!
//! Layout: `version(1) | fingerprint(8) | nonce(12) | ciphertext | tag(16)`.
//! The version byte and fingerprint are authenticated as associated data.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::{
    rand::rand_bytes,
    sha::sha256,
    symm::{decrypt_aead, encrypt_aead, Cipher},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const VERSION: u8 = 1;
const FINGERPRINT_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const AAD_LEN: usize = 1 + FINGERPRINT_LEN;
const HEADER_LEN: usize = AAD_LEN + NONCE_LEN;

/// A 256-bit sealing key.
#[derive(Clone)]
pub struct SecretKey {
    key: [u8; 32],
    fingerprint: Fingerprint,
}

/// Identifies a [`SecretKey`] without revealing it.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

#[derive(Clone, Debug)]
pub struct SecretStore {
    current: SecretKey,
    previous: Vec<SecretKey>,
}

/// An encrypted blob as it is persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret(Vec<u8>);

/// Decrypted secret material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Plaintext(Vec<u8>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("sealed secret is malformed")]
    Malformed,

    #[error("sealed secret was produced by key {found}, which is not configured")]
    KeyMismatch { found: Fingerprint },

    #[error("sealed secret failed authentication")]
    Corrupt,
}

// === impl SecretKey ===

impl SecretKey {
    /// Derives a key from an operator-supplied passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_bytes(sha256(passphrase.as_bytes()))
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        let digest = sha256(&key);
        let mut fp = [0; FINGERPRINT_LEN];
        fp.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self {
            key,
            fingerprint: Fingerprint(fp),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// === impl Fingerprint ===

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// === impl SecretStore ===

impl SecretStore {
    pub fn new(current: SecretKey) -> Self {
        Self {
            current,
            previous: Vec::new(),
        }
    }

    /// Adds keys that may still open existing secrets but are never used to
    /// seal new ones.
    pub fn with_previous(mut self, keys: impl IntoIterator<Item = SecretKey>) -> Self {
        self.previous.extend(keys);
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.current.fingerprint
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedSecret> {
        let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
        out.push(VERSION);
        out.extend_from_slice(&self.current.fingerprint.0);

        let mut nonce = [0; NONCE_LEN];
        rand_bytes(&mut nonce).map_err(Error::Seal)?;
        out.extend_from_slice(&nonce);

        let mut tag = [0; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.current.key,
            Some(&nonce),
            &out[..AAD_LEN],
            plaintext,
            &mut tag,
        )
        .map_err(Error::Seal)?;
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(SealedSecret(out))
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<Plaintext, DecryptionError> {
        let found = sealed.fingerprint().ok_or(DecryptionError::Malformed)?;
        let key = self
            .key_for(found)
            .ok_or(DecryptionError::KeyMismatch { found })?;

        let bytes = &sealed.0;
        let (aad, rest) = bytes.split_at(AAD_LEN);
        let (nonce, body) = rest.split_at(NONCE_LEN);
        let (ciphertext, tag) = body.split_at(body.len() - TAG_LEN);
        decrypt_aead(
            Cipher::aes_256_gcm(),
            &key.key,
            Some(nonce),
            aad,
            ciphertext,
            tag,
        )
        .map(Plaintext)
        .map_err(|_| DecryptionError::Corrupt)
    }

    /// Returns the fingerprint of the key that sealed `sealed`, if the blob
    /// is well-formed.
    pub fn sealed_by(&self, sealed: &SealedSecret) -> Option<Fingerprint> {
        sealed.fingerprint()
    }

    /// True when `sealed` was produced by a key other than the current one.
    pub fn needs_reseal(&self, sealed: &SealedSecret) -> bool {
        sealed
            .fingerprint()
            .map(|fp| fp != self.current.fingerprint)
            .unwrap_or(false)
    }

    /// Opens `sealed` with whichever configured key produced it and seals the
    /// plaintext under the current key.
    pub fn reseal(&self, sealed: &SealedSecret) -> Result<SealedSecret> {
        let plaintext = self.open(sealed)?;
        self.seal(plaintext.as_bytes())
    }

    fn key_for(&self, fingerprint: Fingerprint) -> Option<&SecretKey> {
        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find(|k| k.fingerprint == fingerprint)
    }
}

// === impl SealedSecret ===

impl SealedSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        if self.0.len() < HEADER_LEN + TAG_LEN || self.0[0] != VERSION {
            return None;
        }
        let mut fp = [0; FINGERPRINT_LEN];
        fp.copy_from_slice(&self.0[1..AAD_LEN]);
        Some(Fingerprint(fp))
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret({} bytes)", self.0.len())
    }
}

impl Serialize for SealedSecret {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SealedSecret {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

// === impl Plaintext ===

impl Plaintext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Plaintext(<redacted>)")
    }
}
