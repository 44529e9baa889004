//! Attribute blocks — an opaque, randomly-encrypted blob of filesystem
//! metadata (mode, uid/gid, mtimes, symlink target, xattrs) plus a
//! separate keyed fingerprint that lets a client detect attribute changes
//! without downloading and decrypting the blob.
//!
//! Two encodings of the same cleartext attributes differ byte-for-byte
//! (random IV), but decrypt back to equal cleartext and carry equal
//! fingerprints — see [`attr_fingerprint`] in the crypto module.

use crate::crypto::cipher::{self, CryptoError};
use crate::crypto::hash::attr_fingerprint;
use serde::{Deserialize, Serialize};

/// Cleartext filesystem attributes. Serialised to bytes with `serde_json`
/// before encryption — a portable, default codec; platform-specific
/// xattr/ACL encoding is a leaf concern layered on top of `xattrs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_us: u64,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

/// An encrypted attribute blob as it is stored in a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrBlock {
    ciphertext: Vec<u8>,
}

impl AttrBlock {
    pub fn as_bytes(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { ciphertext: bytes }
    }
}

/// Encrypt `attrs` under `key`. The result varies run to run even for
/// identical `attrs` (random IV); compare cleartexts, never raw bytes.
pub fn encode(key: &[u8], attrs: &Attributes) -> AttrBlock {
    let plaintext = serde_json::to_vec(attrs).expect("Attributes serialises infallibly");
    AttrBlock {
        ciphertext: cipher::encrypt_random(key, &plaintext),
    }
}

pub fn decode(key: &[u8], block: &AttrBlock) -> Result<Attributes, AttrBlockError> {
    let plaintext = cipher::decrypt_fixed_iv(key, &block.ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(AttrBlockError::Malformed)
}

/// `true` if both blocks decrypt to structurally equal attributes.
pub fn compare(key: &[u8], a: &AttrBlock, b: &AttrBlock) -> Result<bool, AttrBlockError> {
    Ok(decode(key, a)? == decode(key, b)?)
}

/// Non-reversible fingerprint over the cleartext, stable across
/// re-encodings of the same attributes.
pub fn hash(secret: &[u8], attrs: &Attributes) -> u64 {
    let plaintext = serde_json::to_vec(attrs).expect("Attributes serialises infallibly");
    attr_fingerprint(secret, &plaintext)
}

#[derive(thiserror::Error, Debug)]
pub enum AttrBlockError {
    #[error("attribute block decryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("decrypted attribute payload is malformed: {0}")]
    Malformed(serde_json::Error),
}
