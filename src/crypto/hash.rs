//! Block identity hash and the keyed attribute-change fingerprint.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

/// A block's strong hash, stored on disk at 16 bytes (the lower 128 bits of
/// the underlying SHA-1-class digest). 128 bits of collision resistance is
/// ample for a value that is only ever consulted *after* a weak-checksum
/// match — it need not stand alone against a chosen-prefix attack.
pub type StrongHash = [u8; 16];

/// Strong hash of a block's plaintext, used to confirm a weak-checksum
/// match before accepting a diff reference, and to identify a block
/// uniquely within an object's index.
pub fn strong_hash(data: &[u8]) -> StrongHash {
    let digest = Sha1::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Lowercase hex rendering of a strong hash, used in log lines and CLI
/// output where the raw bytes aren't useful but a stable identifier is.
pub fn strong_hash_hex(hash: &StrongHash) -> String {
    hex::encode(hash)
}

/// Non-reversible 64-bit fingerprint of cleartext attributes, keyed so that
/// an observer without the secret cannot forge or search for collisions.
/// Stable across re-encodings of the same attributes: calling this twice
/// with equal `attrs` always returns the same value, independent of the IV
/// used to encrypt the attribute block that carries them.
pub fn attr_fingerprint(secret: &[u8], attrs: &[u8]) -> u64 {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(attrs);
    let digest = mac.finalize().into_bytes();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}
