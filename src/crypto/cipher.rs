//! Blowfish-CBC encode/decode helpers shared by the filename and attribute
//! codecs.
//!
//! Blowfish's block size is 8 bytes, so the IV and the deterministic-IV
//! derivation below are both 8 bytes — this falls out of the cipher, not an
//! arbitrary choice.

use blowfish::Blowfish;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type BfCbcEnc = cbc::Encryptor<Blowfish>;
type BfCbcDec = cbc::Decryptor<Blowfish>;

/// Blowfish's block size, and therefore the IV length used throughout.
pub const IV_LEN: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext too short to contain an IV")]
    TooShort,
    #[error("padding invalid or ciphertext corrupt")]
    BadPadding,
    #[error("unknown encoding scheme byte {0:#04x}")]
    BadEncoding(u8),
    #[error("decoded plaintext does not round-trip to the same ciphertext")]
    NotCanonical,
}

/// Encrypt `plaintext` under `key` with a random IV, prepended to the
/// returned ciphertext. Two calls with identical plaintext produce
/// different output.
pub fn encrypt_random(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut iv);
    encrypt_with_iv(key, &iv, plaintext)
}

/// Encrypt `plaintext` under `key` with an IV derived deterministically
/// from the plaintext itself (HMAC-SHA1 of `plaintext` under `key`,
/// truncated to the block size). Equal plaintexts under the same key
/// always produce equal ciphertexts, which is the whole point of
/// [`crate::name_codec`].
pub fn encrypt_deterministic(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let iv = deterministic_iv(key, plaintext);
    encrypt_with_iv(key, &iv, plaintext)
}

fn deterministic_iv(key: &[u8], plaintext: &[u8]) -> [u8; IV_LEN] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

fn encrypt_with_iv(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    let ciphertext = BfCbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a payload produced by [`encrypt_random`] or
/// [`encrypt_deterministic`]: the first [`IV_LEN`] bytes are the IV, the
/// rest is Blowfish-CBC/PKCS7 ciphertext.
pub fn decrypt_fixed_iv(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::TooShort);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    BfCbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}
