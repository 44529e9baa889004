//! Encoded filenames — deterministic Blowfish-CBC encryption of cleartext
//! names so the server can compare and sort ciphertexts without ever
//! holding the key.
//!
//! # On-disk layout
//! ```text
//! Offset  Size  Field
//!    0      1   scheme byte   = SCHEME_BLOWFISH_CBC_DETERMINISTIC
//!    1      8   iv            deterministic, derived from the cleartext
//!    9      N   ciphertext    Blowfish-CBC/PKCS7 of the cleartext
//! ```
//!
//! Encoding the same cleartext under the same key always produces the same
//! bytes; this is the whole point of [`encode`] — the server matches
//! directory entries by comparing [`EncodedName`] byte strings.

use crate::crypto::cipher::{self, CryptoError, IV_LEN};

/// Currently the only scheme byte ever written. A future scheme would get
/// its own value; [`decode`] rejects anything else.
pub const SCHEME_BLOWFISH_CBC_DETERMINISTIC: u8 = 1;

/// An encrypted filename, opaque to everyone without the filename key.
/// Cheap to clone and compare — equality on the raw bytes is equality on
/// the cleartext (for names encoded under the same key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedName(Vec<u8>);

impl EncodedName {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Encrypt `cleartext` under `key`. Calling this twice with the same
/// cleartext and key returns byte-identical output.
pub fn encode(key: &[u8], cleartext: &str) -> EncodedName {
    let ciphertext = cipher::encrypt_deterministic(key, cleartext.as_bytes());
    let mut out = Vec::with_capacity(1 + ciphertext.len());
    out.push(SCHEME_BLOWFISH_CBC_DETERMINISTIC);
    out.extend_from_slice(&ciphertext);
    EncodedName(out)
}

/// Decrypt an [`EncodedName`], verifying the scheme byte and that the
/// recovered cleartext re-encodes to the same bytes (catches silent key
/// mismatches rather than returning garbage).
pub fn decode(key: &[u8], name: &EncodedName) -> Result<String, CryptoError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(CryptoError::TooShort);
    }
    let scheme = bytes[0];
    if scheme != SCHEME_BLOWFISH_CBC_DETERMINISTIC {
        return Err(CryptoError::BadEncoding(scheme));
    }
    if bytes.len() < 1 + IV_LEN {
        return Err(CryptoError::TooShort);
    }
    let plaintext = cipher::decrypt_fixed_iv(key, &bytes[1..])?;
    let cleartext = String::from_utf8(plaintext).map_err(|_| CryptoError::NotCanonical)?;
    if encode(key, &cleartext).as_bytes() != bytes {
        return Err(CryptoError::NotCanonical);
    }
    Ok(cleartext)
}
