//! Crypto primitives — role-separated Blowfish-448 keys, keyed hashing, a
//! SHA-1-class strong hash for block identity, and an O(1)-slide weak
//! rolling checksum for the diff engine.
//!
//! # Key separation
//! Four independent 448-bit (56-byte) Blowfish keys are carried in one key
//! material file, one per role: filenames, attributes, file data, and
//! block-index entries. A fifth field holds a 128-byte secret used only to
//! key the attribute-change hash. Using a single key for everything would
//! let an attacker who recovers one ciphertext class (e.g. filenames, which
//! are short and low-entropy) mount a related-key attack against another
//! class; role separation costs nothing since key material is generated
//! once and never transmitted.
//!
//! # Deterministic vs. random encoding
//! Filenames are encrypted with an IV *derived from the plaintext* (see
//! [`cipher::encrypt_deterministic`]) so equal cleartexts produce equal
//! ciphertexts within an account — the server can match and sort names
//! without holding the key. Attributes and file data use a random IV —
//! repeated encryption of the same bytes must not leak equality to the
//! server.

pub mod cipher;
pub mod hash;
pub mod keys;
pub mod rolling;

pub use cipher::{decrypt_fixed_iv, encrypt_deterministic, encrypt_random, CryptoError};
pub use hash::{attr_fingerprint, strong_hash, strong_hash_hex, StrongHash};
pub use keys::{KeyRole, KeySet, CRYPTO_KEYS_FILE_SIZE};
pub use rolling::RollingChecksum;
